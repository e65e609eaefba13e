//! Connection Factory
//!
//! Builds dialect connections from a dialect name, a connection type and a
//! config. All connections made by one factory share its session manager,
//! and with it the driver registry and the SSH tunnel table.

use std::sync::Arc;

use tracing::instrument;

use crate::connection::Connection;
use crate::dialects::{
    DialectConnection, MsSqlConnection, MySqlConnection, OracleConnection, PostgresConnection,
    SqliteConnection,
};
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::registry::DriverRegistry;
use crate::engine::session_manager::{ConnectionStrategy, SessionManager};
use crate::engine::types::{ConnectionConfig, ConnectionType, Dialect, SshTunnelConfig};
use crate::settings::ConnectorSettings;

pub struct ConnectionFactory {
    manager: Arc<SessionManager>,
}

impl ConnectionFactory {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self { manager }
    }

    /// Factory over every built-in driver with settings from disk and environment
    pub fn with_defaults() -> Self {
        let registry = Arc::new(DriverRegistry::with_builtin_drivers());
        Self::new(Arc::new(SessionManager::new(registry, ConnectorSettings::load())))
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    /// Creates a connection from string identifiers
    ///
    /// `dialect` accepts `postgres`, `mysql`, `oracle`, `mssql` or `sqlite`
    /// (and their aliases); `connection_type` accepts `direct`/`local`,
    /// `remote` or `ssh_tunnel`/`ssh`.
    pub fn create_connection(
        &self,
        dialect: &str,
        connection_type: &str,
        config: &ConnectionConfig,
        ssh: Option<SshTunnelConfig>,
    ) -> EngineResult<DialectConnection> {
        let dialect: Dialect = dialect.parse()?;
        let connection_type: ConnectionType = connection_type.parse()?;
        self.create(dialect, connection_type, config, ssh)
    }

    /// Creates a connection; the connection is not opened yet
    #[instrument(skip(self, config, ssh), fields(db = %config))]
    pub fn create(
        &self,
        dialect: Dialect,
        connection_type: ConnectionType,
        config: &ConnectionConfig,
        ssh: Option<SshTunnelConfig>,
    ) -> EngineResult<DialectConnection> {
        if dialect == Dialect::Sqlite && connection_type != ConnectionType::Direct {
            return Err(EngineError::invalid_config(
                "SQLite only supports direct/local connections",
            ));
        }
        if let Some(configured) = config.dialect() {
            if configured != dialect {
                return Err(EngineError::invalid_config(format!(
                    "Configuration is for {}, not {}",
                    configured, dialect
                )));
            }
        }

        let config = config.or_dialect(dialect);
        config.validate()?;

        let ssh = match connection_type {
            ConnectionType::SshTunnel => Some(ssh.or_else(|| config.ssh_tunnel().cloned()).ok_or_else(
                || EngineError::invalid_config("SSH configuration is required for SSH tunnel connections"),
            )?),
            _ => None,
        };
        let strategy = ConnectionStrategy::from_type(connection_type, ssh)?;

        tracing::debug!(%dialect, strategy = %connection_type, "creating connection");
        let connection = Connection::new(self.manager.clone(), config, strategy);

        Ok(match dialect {
            Dialect::Postgres => DialectConnection::Postgres(PostgresConnection::new(connection)),
            Dialect::MySql => DialectConnection::MySql(MySqlConnection::new(connection)),
            Dialect::Oracle => DialectConnection::Oracle(OracleConnection::new(connection)),
            Dialect::MsSql => DialectConnection::MsSql(MsSqlConnection::new(connection)),
            Dialect::Sqlite => DialectConnection::Sqlite(SqliteConnection::new(connection)),
        })
    }

    pub fn create_postgres_connection(
        &self,
        connection_type: ConnectionType,
        config: &ConnectionConfig,
        ssh: Option<SshTunnelConfig>,
    ) -> EngineResult<PostgresConnection> {
        match self.create(Dialect::Postgres, connection_type, config, ssh)? {
            DialectConnection::Postgres(conn) => Ok(conn),
            other => Err(unexpected(Dialect::Postgres, other.kind())),
        }
    }

    pub fn create_mysql_connection(
        &self,
        connection_type: ConnectionType,
        config: &ConnectionConfig,
        ssh: Option<SshTunnelConfig>,
    ) -> EngineResult<MySqlConnection> {
        match self.create(Dialect::MySql, connection_type, config, ssh)? {
            DialectConnection::MySql(conn) => Ok(conn),
            other => Err(unexpected(Dialect::MySql, other.kind())),
        }
    }

    pub fn create_oracle_connection(
        &self,
        connection_type: ConnectionType,
        config: &ConnectionConfig,
        ssh: Option<SshTunnelConfig>,
    ) -> EngineResult<OracleConnection> {
        match self.create(Dialect::Oracle, connection_type, config, ssh)? {
            DialectConnection::Oracle(conn) => Ok(conn),
            other => Err(unexpected(Dialect::Oracle, other.kind())),
        }
    }

    pub fn create_mssql_connection(
        &self,
        connection_type: ConnectionType,
        config: &ConnectionConfig,
        ssh: Option<SshTunnelConfig>,
    ) -> EngineResult<MsSqlConnection> {
        match self.create(Dialect::MsSql, connection_type, config, ssh)? {
            DialectConnection::MsSql(conn) => Ok(conn),
            other => Err(unexpected(Dialect::MsSql, other.kind())),
        }
    }

    /// SQLite connection for a database file, or `:memory:`
    pub fn create_sqlite_connection(&self, path: &str) -> EngineResult<SqliteConnection> {
        let config = ConnectionConfig::sqlite(path);
        match self.create(Dialect::Sqlite, ConnectionType::Direct, &config, None)? {
            DialectConnection::Sqlite(conn) => Ok(conn),
            other => Err(unexpected(Dialect::Sqlite, other.kind())),
        }
    }
}

fn unexpected(wanted: Dialect, got: Dialect) -> EngineError {
    EngineError::invalid_config(format!("Expected a {} connection, got {}", wanted, got))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::MockEngine;
    use crate::engine::types::SshAuth;

    fn factory() -> ConnectionFactory {
        let mut registry = DriverRegistry::new();
        for dialect in Dialect::ALL {
            registry.register(Arc::new(MockEngine::new(dialect)));
        }
        let manager = SessionManager::new(Arc::new(registry), ConnectorSettings::default());
        ConnectionFactory::new(Arc::new(manager))
    }

    fn config() -> ConnectionConfig {
        ConnectionConfig::new("db.internal", 5432, "app", "secret", "orders")
    }

    fn ssh() -> SshTunnelConfig {
        SshTunnelConfig::new("bastion", 22, "deploy", SshAuth::Password { password: "pw".into() })
    }

    #[test]
    fn string_identifiers_pick_the_dialect() {
        let factory = factory();
        let conn = factory
            .create_connection("postgresql", "direct", &config(), None)
            .expect("postgres");
        assert!(conn.as_postgres().is_some());
        assert_eq!(conn.dialect(), Some(Dialect::Postgres));

        let conn = factory
            .create_connection("mariadb", "remote", &config(), None)
            .expect("mysql");
        assert_eq!(conn.kind(), Dialect::MySql);
        assert_eq!(conn.connection_type(), ConnectionType::Remote);
    }

    #[test]
    fn unknown_identifiers_are_config_errors() {
        let factory = factory();
        let err = factory
            .create_connection("db2", "direct", &config(), None)
            .unwrap_err();
        assert_eq!(err.to_string(), "Invalid configuration: Unsupported database type: db2");

        let err = factory
            .create_connection("postgres", "carrier_pigeon", &config(), None)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid configuration: Unsupported connection type: carrier_pigeon"
        );
    }

    #[test]
    fn ssh_connections_need_tunnel_parameters() {
        let factory = factory();
        let err = factory
            .create_postgres_connection(ConnectionType::SshTunnel, &config(), None)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid configuration: SSH configuration is required for SSH tunnel connections"
        );

        let conn = factory
            .create_postgres_connection(ConnectionType::SshTunnel, &config(), Some(ssh()))
            .expect("ssh connection");
        assert_eq!(conn.connection_type(), ConnectionType::SshTunnel);

        let embedded = config().with_ssh_tunnel(ssh());
        assert!(factory
            .create_mysql_connection(ConnectionType::SshTunnel, &embedded, None)
            .is_ok());
    }

    #[test]
    fn sqlite_is_direct_only() {
        let factory = factory();
        let err = factory
            .create_connection("sqlite", "remote", &ConnectionConfig::sqlite("app.db"), None)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid configuration: SQLite only supports direct/local connections"
        );

        let conn = factory.create_sqlite_connection(":memory:").expect("sqlite");
        assert_eq!(conn.connection_type(), ConnectionType::Direct);
        assert_eq!(conn.config().database(), ":memory:");
    }

    #[test]
    fn dialect_is_filled_without_touching_the_callers_config() {
        let factory = factory();
        let original = config();
        let conn = factory
            .create_oracle_connection(ConnectionType::Direct, &original, None)
            .expect("oracle");

        assert_eq!(original.dialect(), None);
        assert_eq!(conn.config().dialect(), Some(Dialect::Oracle));
    }

    #[test]
    fn mismatched_dialect_is_rejected() {
        let factory = factory();
        let mysql_config = config().with_dialect(Dialect::MySql);
        let err = factory
            .create_mssql_connection(ConnectionType::Direct, &mysql_config, None)
            .unwrap_err();
        assert!(err.to_string().contains("Configuration is for mysql, not mssql"));
    }

    #[tokio::test]
    async fn connections_share_the_factory_manager() {
        let factory = factory();
        let a = factory.create_connection("postgres", "local", &config(), None).expect("a");
        let b = factory.create_connection("mysql", "local", &config(), None).expect("b");

        a.connect().await.expect("connect a");
        b.connect().await.expect("connect b");
        assert_eq!(factory.manager().list_sessions().await.len(), 2);

        a.disconnect().await.expect("disconnect a");
        assert_eq!(factory.manager().list_sessions().await.len(), 1);
    }
}
