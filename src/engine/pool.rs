//! Connection pool settings
//!
//! One `PoolSettings` value drives every per-session pool: sqlx pools for
//! Postgres, MySQL and SQLite, deadpool for SQL Server and the Oracle client
//! session pool.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
    /// Idle connections are closed after this long; `None` keeps them forever
    pub idle_timeout_secs: Option<u64>,
    /// Connections are recycled after this long; `None` disables recycling
    pub max_lifetime_secs: Option<u64>,
    /// Ping a connection before handing it out
    pub test_before_acquire: bool,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 5,
            min_connections: 0,
            acquire_timeout_secs: 30,
            idle_timeout_secs: Some(600),
            max_lifetime_secs: Some(1800),
            test_before_acquire: true,
        }
    }
}

impl PoolSettings {
    /// Short-lived single connection used to probe a server
    pub fn probe() -> Self {
        Self {
            max_connections: 1,
            min_connections: 0,
            acquire_timeout_secs: 10,
            idle_timeout_secs: None,
            max_lifetime_secs: None,
            test_before_acquire: false,
        }
    }

    /// One connection that never expires (SQLite `:memory:` lives inside it)
    pub fn pinned(&self) -> Self {
        Self {
            max_connections: 1,
            min_connections: 1,
            acquire_timeout_secs: self.acquire_timeout_secs,
            idle_timeout_secs: None,
            max_lifetime_secs: None,
            test_before_acquire: self.test_before_acquire,
        }
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }

    pub fn max_lifetime(&self) -> Option<Duration> {
        self.max_lifetime_secs.map(Duration::from_secs)
    }

    /// sqlx pool options for any sqlx backend
    pub fn sqlx_options<DB: sqlx::Database>(&self) -> sqlx::pool::PoolOptions<DB> {
        sqlx::pool::PoolOptions::<DB>::new()
            .max_connections(self.max_connections.max(1))
            .min_connections(self.min_connections.min(self.max_connections.max(1)))
            .acquire_timeout(self.acquire_timeout())
            .idle_timeout(self.idle_timeout())
            .max_lifetime(self.max_lifetime())
            .test_before_acquire(self.test_before_acquire)
    }
}
