// dbconnector - Multi-dialect database connector
// Core library

pub mod connection;
pub mod connector;
pub mod dialects;
pub mod engine;
pub mod factory;
pub mod observability;
pub mod settings;

pub use connection::Connection;
pub use connector::DatabaseConnector;
pub use dialects::{
    DialectConnection, IndexOptions, MsSqlConnection, MySqlConnection, OracleConnection, PgTableInfo,
    PostgresConnection, SqliteConnection,
};
pub use engine::{
    ConnectionConfig, ConnectionStrategy, ConnectionType, Dialect, DriverRegistry, EngineError,
    EngineResult, ErrorKind, Params, PoolSettings, QueryResult, Record, SessionManager, SshAuth,
    SshHostKeyPolicy, SshTunnelConfig, Value,
};
pub use factory::ConnectionFactory;
pub use settings::ConnectorSettings;
