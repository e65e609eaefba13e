//! Shared setup for the integration tests.
#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dbconnector::{ConnectionConfig, ConnectionFactory, ConnectorSettings, DriverRegistry, SessionManager};

pub const TEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Fails the test when `fut` runs past [`TEST_TIMEOUT`]
pub async fn bounded<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(TEST_TIMEOUT, fut)
        .await
        .expect("test exceeded its time limit")
}

/// Factory over the built-in drivers with default settings
pub fn factory() -> ConnectionFactory {
    dbconnector::observability::init_stderr_tracing();
    let registry = Arc::new(DriverRegistry::with_builtin_drivers());
    ConnectionFactory::new(Arc::new(SessionManager::new(registry, ConnectorSettings::default())))
}

/// Server config from `{prefix}_HOST`, `_PORT`, `_USER`, `_PASSWORD` and `_DATABASE`
///
/// Returns `None` when `{prefix}_HOST` is unset, so the caller can skip.
pub fn server_config(prefix: &str, default_port: u16) -> Option<ConnectionConfig> {
    let var = |name: &str| std::env::var(format!("{}_{}", prefix, name)).ok();
    let host = var("HOST")?;
    let port = var("PORT").and_then(|p| p.parse().ok()).unwrap_or(default_port);
    Some(ConnectionConfig::new(
        host,
        port,
        var("USER").unwrap_or_default(),
        var("PASSWORD").unwrap_or_default(),
        var("DATABASE").unwrap_or_default(),
    ))
}

/// Table name unlikely to clash between concurrent runs
pub fn scratch_table(stem: &str) -> String {
    format!("{}_{}", stem, uuid::Uuid::new_v4().simple())
}
