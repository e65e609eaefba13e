//! Session Manager
//!
//! Centralized management of all active database sessions.
//! This is the SINGLE SOURCE OF TRUTH for all connection state: which driver
//! serves a session and which tunnel lease it holds.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::time::{timeout, Duration};
use tracing::instrument;

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::registry::DriverRegistry;
use crate::engine::traits::DataEngine;
use crate::engine::tunnel_manager::{TunnelGuard, TunnelLease, TunnelManager};
use crate::engine::types::{ConnectionConfig, ConnectionType, Dialect, SessionId, SshTunnelConfig};
use crate::settings::ConnectorSettings;

/// How a session reaches its server
#[derive(Debug, Clone)]
pub enum ConnectionStrategy {
    Direct,
    Remote,
    SshTunnel(SshTunnelConfig),
}

impl ConnectionStrategy {
    /// Builds a strategy from its type; SSH needs tunnel parameters
    pub fn from_type(connection_type: ConnectionType, ssh: Option<SshTunnelConfig>) -> EngineResult<Self> {
        match connection_type {
            ConnectionType::Direct => Ok(ConnectionStrategy::Direct),
            ConnectionType::Remote => Ok(ConnectionStrategy::Remote),
            ConnectionType::SshTunnel => {
                let ssh = ssh.ok_or_else(|| {
                    EngineError::invalid_config("SSH tunnel configuration is required for SSH connections")
                })?;
                ssh.validate()?;
                Ok(ConnectionStrategy::SshTunnel(ssh))
            }
        }
    }

    pub fn connection_type(&self) -> ConnectionType {
        match self {
            ConnectionStrategy::Direct => ConnectionType::Direct,
            ConnectionStrategy::Remote => ConnectionType::Remote,
            ConnectionStrategy::SshTunnel(_) => ConnectionType::SshTunnel,
        }
    }
}

/// Runs `fut` under `limit`, mapping expiry to [`EngineError::Timeout`]
async fn bounded<T>(limit: Duration, fut: impl Future<Output = EngineResult<T>>) -> EngineResult<T> {
    match timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(EngineError::Timeout {
            timeout_ms: limit.as_millis() as u64,
        }),
    }
}

async fn release_quietly(guard: TunnelGuard) {
    if let Err(e) = guard.release().await {
        tracing::warn!(error = %e, "failed to release SSH tunnel");
    }
}

/// Active session with its driver and optional tunnel lease
struct ActiveSession {
    dialect: Dialect,
    display_name: String,
    tunnel: Option<TunnelLease>,
}

/// Manages all active database sessions
pub struct SessionManager {
    registry: Arc<DriverRegistry>,
    tunnels: Arc<TunnelManager>,
    settings: ConnectorSettings,
    sessions: RwLock<HashMap<SessionId, ActiveSession>>,
}

impl SessionManager {
    pub fn new(registry: Arc<DriverRegistry>, settings: ConnectorSettings) -> Self {
        let tunnels = Arc::new(TunnelManager::openssh(settings.tunnel_ready_timeout()));
        Self::with_tunnels(registry, tunnels, settings)
    }

    pub fn with_tunnels(
        registry: Arc<DriverRegistry>,
        tunnels: Arc<TunnelManager>,
        settings: ConnectorSettings,
    ) -> Self {
        Self {
            registry,
            tunnels,
            settings,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &ConnectorSettings {
        &self.settings
    }

    pub fn tunnels(&self) -> &Arc<TunnelManager> {
        &self.tunnels
    }

    fn connect_timeout(&self, config: &ConnectionConfig, strategy: &ConnectionStrategy) -> Duration {
        match (config.connect_timeout_secs(), strategy) {
            (Some(secs), _) => Duration::from_secs(secs),
            (None, ConnectionStrategy::Remote) => self.settings.remote_connect_timeout(),
            (None, _) => self.settings.connect_timeout(),
        }
    }

    fn resolve_driver(&self, config: &ConnectionConfig) -> EngineResult<(Dialect, Arc<dyn DataEngine>)> {
        let dialect = config
            .dialect()
            .ok_or_else(|| EngineError::invalid_config("Database dialect is not set"))?;
        Ok((dialect, self.registry.require(dialect)?))
    }

    /// Tests a connection without persisting it
    #[instrument(
        skip(self, config, strategy),
        fields(
            dialect = ?config.dialect(),
            host = %config.host(),
            port = config.port(),
            database = %config.database(),
            strategy = %strategy.connection_type()
        )
    )]
    pub async fn test_connection(&self, config: &ConnectionConfig, strategy: &ConnectionStrategy) -> EngineResult<()> {
        let (_, driver) = self.resolve_driver(config)?;
        let limit = self.settings.test_timeout();

        let ConnectionStrategy::SshTunnel(ssh) = strategy else {
            return bounded(limit, driver.test_connection(config)).await;
        };

        let guard = self.tunnels.acquire_guarded(ssh, config.host(), config.port()).await?;
        let tunneled = config.redirected("127.0.0.1", guard.local_port());
        let result = bounded(limit, driver.test_connection(&tunneled)).await;
        release_quietly(guard).await;
        result
    }

    /// Establishes a new connection and returns its session ID
    #[instrument(
        skip(self, config, strategy),
        fields(
            dialect = ?config.dialect(),
            host = %config.host(),
            port = config.port(),
            database = %config.database(),
            strategy = %strategy.connection_type()
        )
    )]
    pub async fn connect(&self, config: &ConnectionConfig, strategy: &ConnectionStrategy) -> EngineResult<SessionId> {
        let (dialect, driver) = self.resolve_driver(config)?;
        let limit = self.connect_timeout(config, strategy);

        let (effective_config, guard) = match strategy {
            ConnectionStrategy::SshTunnel(ssh) => {
                let guard = self.tunnels.acquire_guarded(ssh, config.host(), config.port()).await?;
                (config.redirected("127.0.0.1", guard.local_port()), Some(guard))
            }
            _ => (config.clone(), None),
        };

        let session_id = match bounded(limit, driver.connect(&effective_config, &self.settings.pool)).await {
            Ok(session_id) => session_id,
            Err(e) => {
                tracing::error!(error = %e, "driver connect failed");
                if let Some(guard) = guard {
                    release_quietly(guard).await;
                }
                return Err(e);
            }
        };

        let display_name = format!(
            "{}@{}:{}/{}{}",
            config.username(),
            config.host(),
            config.port(),
            config.database(),
            if guard.is_some() { " (SSH)" } else { "" }
        );

        tracing::info!(session_id = %session_id, %display_name, "session opened");

        let mut sessions = self.sessions.write().await;
        sessions.insert(
            session_id,
            ActiveSession {
                dialect,
                display_name,
                tunnel: guard.and_then(TunnelGuard::into_lease),
            },
        );

        Ok(session_id)
    }

    /// Disconnects a session and releases its tunnel lease
    #[instrument(skip(self), fields(session_id = %session_id.0))]
    pub async fn disconnect(&self, session_id: SessionId) -> EngineResult<()> {
        let session = {
            let mut sessions = self.sessions.write().await;
            sessions
                .remove(&session_id)
                .ok_or_else(|| EngineError::session_not_found(session_id.0.to_string()))?
        };

        let driver = self.registry.require(session.dialect)?;
        let disconnected = driver.disconnect(session_id).await;

        if let Some(lease) = session.tunnel {
            self.tunnels.release(lease).await?;
        }

        disconnected
    }

    /// Gets a driver for an existing session
    pub async fn get_driver(&self, session_id: SessionId) -> EngineResult<Arc<dyn DataEngine>> {
        let sessions = self.sessions.read().await;
        let session = sessions
            .get(&session_id)
            .ok_or_else(|| EngineError::session_not_found(session_id.0.to_string()))?;

        self.registry.require(session.dialect)
    }

    /// Session exists, its tunnel (if any) still runs and the server answers
    pub async fn is_alive(&self, session_id: SessionId) -> bool {
        let dialect = {
            let sessions = self.sessions.read().await;
            let Some(session) = sessions.get(&session_id) else {
                return false;
            };
            if let Some(ref lease) = session.tunnel {
                if !self.tunnels.is_running(lease).await {
                    return false;
                }
            }
            session.dialect
        };

        match self.registry.get(dialect) {
            Some(driver) => driver.ping(session_id).await.is_ok(),
            None => false,
        }
    }

    /// Lists all active sessions
    pub async fn list_sessions(&self) -> Vec<(SessionId, String)> {
        let sessions = self.sessions.read().await;
        sessions
            .iter()
            .map(|(id, session)| (*id, session.display_name.clone()))
            .collect()
    }

    /// Checks if a session exists
    pub async fn session_exists(&self, session_id: SessionId) -> bool {
        let sessions = self.sessions.read().await;
        sessions.contains_key(&session_id)
    }
}
