//! DataEngine trait definition
//!
//! This is the core abstraction that all database drivers must implement.
//! It provides a unified interface for connecting, querying, and running
//! transactions across every supported SQL dialect.

use async_trait::async_trait;

use crate::engine::error::EngineResult;
use crate::engine::params::Params;
use crate::engine::pool::PoolSettings;
use crate::engine::types::{ConnectionConfig, Dialect, PoolStatus, QueryResult, SessionId};

/// Core trait that all database drivers must implement
///
/// Each driver (PostgreSQL, MySQL, SQLite, SQL Server, Oracle) owns the pools
/// of its sessions. A session is created by `connect` and referenced by its
/// `SessionId` until `disconnect`.
#[async_trait]
pub trait DataEngine: Send + Sync {
    /// Dialect served by this driver; also its registry key
    fn dialect(&self) -> Dialect;

    /// Returns a human-readable name for this driver
    fn driver_name(&self) -> &'static str;

    /// Tests the connection without establishing a persistent session
    async fn test_connection(&self, config: &ConnectionConfig) -> EngineResult<()>;

    /// Opens a pool for `config` and returns the session identifier
    ///
    /// The session ID is used for all subsequent operations on this connection.
    async fn connect(&self, config: &ConnectionConfig, pool: &PoolSettings) -> EngineResult<SessionId>;

    /// Closes a session and releases associated resources
    ///
    /// A pending transaction is rolled back before the pool closes.
    async fn disconnect(&self, session: SessionId) -> EngineResult<()>;

    /// Round-trips a trivial statement on the session
    async fn ping(&self, session: SessionId) -> EngineResult<()>;

    /// Executes one statement with `:name` parameters
    ///
    /// Inside a transaction the statement runs on the pinned connection.
    async fn execute(&self, session: SessionId, sql: &str, params: &Params) -> EngineResult<QueryResult>;

    // ==================== Transaction Methods ====================

    /// Pins a pooled connection and starts a transaction on it
    async fn begin_transaction(&self, session: SessionId) -> EngineResult<()>;

    /// Commits the current transaction and returns its connection to the pool
    async fn commit(&self, session: SessionId) -> EngineResult<()>;

    /// Rolls back the current transaction and returns its connection to the pool
    async fn rollback(&self, session: SessionId) -> EngineResult<()>;

    fn supports_transactions(&self) -> bool {
        true
    }

    /// Pool occupancy for a session
    async fn pool_status(&self, session: SessionId) -> EngineResult<PoolStatus>;
}
