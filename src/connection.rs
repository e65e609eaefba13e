//! Connection handle
//!
//! A `Connection` pairs a config with a strategy and, once connected, one
//! session of the [`SessionManager`]. Every statement goes through that
//! session's pool, or through its pinned connection while a transaction is
//! open.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::instrument;

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::params::Params;
use crate::engine::session_manager::{ConnectionStrategy, SessionManager};
use crate::engine::types::{
    ConnectionConfig, ConnectionType, Dialect, PoolStatus, QueryResult, Record, SessionId,
};

pub struct Connection {
    manager: Arc<SessionManager>,
    config: ConnectionConfig,
    strategy: ConnectionStrategy,
    session: Mutex<Option<SessionId>>,
}

impl Connection {
    pub fn new(manager: Arc<SessionManager>, config: ConnectionConfig, strategy: ConnectionStrategy) -> Self {
        Self {
            manager,
            config,
            strategy,
            session: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn dialect(&self) -> Option<Dialect> {
        self.config.dialect()
    }

    pub fn strategy(&self) -> &ConnectionStrategy {
        &self.strategy
    }

    pub fn connection_type(&self) -> ConnectionType {
        self.strategy.connection_type()
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    pub async fn session_id(&self) -> Option<SessionId> {
        *self.session.lock().await
    }

    /// Opens the session; a no-op when one is already open
    #[instrument(skip(self), fields(db = %self.config))]
    pub async fn connect(&self) -> EngineResult<SessionId> {
        let mut session = self.session.lock().await;
        if let Some(id) = *session {
            return Ok(id);
        }

        tracing::debug!(
            url = %self.config.redacted_connection_string(),
            strategy = %self.strategy.connection_type(),
            "connecting"
        );
        let id = self.manager.connect(&self.config, &self.strategy).await?;
        *session = Some(id);
        Ok(id)
    }

    /// Closes the session; a no-op when none is open
    pub async fn disconnect(&self) -> EngineResult<()> {
        let Some(id) = self.session.lock().await.take() else {
            return Ok(());
        };
        self.manager.disconnect(id).await.map_err(|e| {
            tracing::error!(error = %e, "error disconnecting from database");
            e
        })
    }

    /// Checks the server without opening a session
    pub async fn test(&self) -> EngineResult<()> {
        self.manager.test_connection(&self.config, &self.strategy).await
    }

    /// True when a session is open and the server still answers
    pub async fn is_connected(&self) -> bool {
        match self.session_id().await {
            Some(id) => self.manager.is_alive(id).await,
            None => false,
        }
    }

    /// Fails with `NotConnected` unless [`is_connected`](Self::is_connected) holds
    pub async fn ensure_connected(&self) -> EngineResult<()> {
        if self.is_connected().await {
            Ok(())
        } else {
            Err(EngineError::NotConnected)
        }
    }

    async fn active_session(&self) -> EngineResult<SessionId> {
        self.session_id().await.ok_or(EngineError::NotConnected)
    }

    /// Executes one statement with `:name` parameters
    pub async fn execute(&self, sql: &str, params: &Params) -> EngineResult<QueryResult> {
        let session = self.active_session().await?;
        let driver = self.manager.get_driver(session).await?;
        tracing::debug!(sql, params = params.len(), "executing query");
        driver.execute(session, sql, params).await
    }

    /// Rows of a row-returning statement as column-name maps
    pub async fn fetch_records(&self, sql: &str, params: &Params) -> EngineResult<Vec<Record>> {
        Ok(self.execute(sql, params).await?.records())
    }

    pub async fn begin_transaction(&self) -> EngineResult<()> {
        let session = self.active_session().await?;
        let driver = self.manager.get_driver(session).await?;
        if !driver.supports_transactions() {
            return Err(EngineError::not_supported("Transactions are not supported by this driver"));
        }
        tracing::debug!("beginning transaction");
        driver.begin_transaction(session).await
    }

    pub async fn commit(&self) -> EngineResult<()> {
        let session = self.active_session().await?;
        tracing::debug!("committing transaction");
        self.manager.get_driver(session).await?.commit(session).await
    }

    pub async fn rollback(&self) -> EngineResult<()> {
        let session = self.active_session().await?;
        tracing::debug!("rolling back transaction");
        self.manager.get_driver(session).await?.rollback(session).await
    }

    pub async fn pool_status(&self) -> EngineResult<PoolStatus> {
        let session = self.active_session().await?;
        self.manager.get_driver(session).await?.pool_status(session).await
    }

    pub async fn in_transaction(&self) -> bool {
        self.pool_status()
            .await
            .map(|status| status.in_transaction)
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("config", &self.config)
            .field("strategy", &self.strategy.connection_type())
            .finish()
    }
}
