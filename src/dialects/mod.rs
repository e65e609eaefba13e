//! Dialect connections
//!
//! Thin wrappers over [`Connection`] that add the administrative helpers each
//! database offers. Every wrapper derefs to the plain connection, so the
//! generic operations stay available on all of them.

use std::collections::BTreeMap;
use std::ops::Deref;

use crate::connection::Connection;
use crate::engine::params::Params;
use crate::engine::types::{Dialect, QueryResult};

macro_rules! dialect_connection {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug)]
        pub struct $name(crate::connection::Connection);

        impl $name {
            pub fn new(connection: crate::connection::Connection) -> Self {
                Self(connection)
            }

            pub fn into_inner(self) -> crate::connection::Connection {
                self.0
            }
        }

        impl std::ops::Deref for $name {
            type Target = crate::connection::Connection;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl From<$name> for crate::connection::Connection {
            fn from(conn: $name) -> Self {
                conn.0
            }
        }
    };
}

pub mod mssql;
pub mod mysql;
pub mod oracle;
pub mod postgres;
pub mod sqlite;

pub use mssql::MsSqlConnection;
pub use mysql::MySqlConnection;
pub use oracle::OracleConnection;
pub use postgres::{IndexOptions, PgTableInfo, PostgresConnection};
pub use sqlite::SqliteConnection;

/// A connection of any supported dialect, as built by the factory
#[derive(Debug)]
pub enum DialectConnection {
    Postgres(PostgresConnection),
    MySql(MySqlConnection),
    Oracle(OracleConnection),
    MsSql(MsSqlConnection),
    Sqlite(SqliteConnection),
}

impl DialectConnection {
    pub fn kind(&self) -> Dialect {
        match self {
            DialectConnection::Postgres(_) => Dialect::Postgres,
            DialectConnection::MySql(_) => Dialect::MySql,
            DialectConnection::Oracle(_) => Dialect::Oracle,
            DialectConnection::MsSql(_) => Dialect::MsSql,
            DialectConnection::Sqlite(_) => Dialect::Sqlite,
        }
    }

    pub fn as_postgres(&self) -> Option<&PostgresConnection> {
        match self {
            DialectConnection::Postgres(conn) => Some(conn),
            _ => None,
        }
    }

    pub fn as_mysql(&self) -> Option<&MySqlConnection> {
        match self {
            DialectConnection::MySql(conn) => Some(conn),
            _ => None,
        }
    }

    pub fn as_oracle(&self) -> Option<&OracleConnection> {
        match self {
            DialectConnection::Oracle(conn) => Some(conn),
            _ => None,
        }
    }

    pub fn as_mssql(&self) -> Option<&MsSqlConnection> {
        match self {
            DialectConnection::MsSql(conn) => Some(conn),
            _ => None,
        }
    }

    pub fn as_sqlite(&self) -> Option<&SqliteConnection> {
        match self {
            DialectConnection::Sqlite(conn) => Some(conn),
            _ => None,
        }
    }
}

impl Deref for DialectConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        match self {
            DialectConnection::Postgres(conn) => &**conn,
            DialectConnection::MySql(conn) => &**conn,
            DialectConnection::Oracle(conn) => &**conn,
            DialectConnection::MsSql(conn) => &**conn,
            DialectConnection::Sqlite(conn) => &**conn,
        }
    }
}

impl From<DialectConnection> for Connection {
    fn from(conn: DialectConnection) -> Self {
        match conn {
            DialectConnection::Postgres(conn) => conn.into(),
            DialectConnection::MySql(conn) => conn.into(),
            DialectConnection::Oracle(conn) => conn.into(),
            DialectConnection::MsSql(conn) => conn.into(),
            DialectConnection::Sqlite(conn) => conn.into(),
        }
    }
}

/// Runs independent lookups, keyed by name
///
/// A failing lookup is logged and stored as `None`; the others still run.
pub(crate) async fn query_each(
    conn: &Connection,
    queries: &[(&str, &str)],
) -> BTreeMap<String, Option<QueryResult>> {
    let mut out = BTreeMap::new();
    for (key, sql) in queries {
        let result = match conn.execute(sql, &Params::new()).await {
            Ok(result) => Some(result),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "lookup failed");
                None
            }
        };
        out.insert(key.to_string(), result);
    }
    out
}


#[cfg(test)]
mod tests {
    use super::test_support::mock_connection;
    use super::*;

    #[tokio::test]
    async fn query_each_keeps_going_after_a_failure() {
        let (engine, conn) = mock_connection(Dialect::Oracle);
        engine.fail_statements_containing("broken");
        conn.connect().await.expect("connect");

        let results = query_each(&conn, &[("a", "SELECT 1"), ("b", "SELECT broken"), ("c", "SELECT 3")]).await;

        assert_eq!(results.len(), 3);
        assert!(results["a"].is_some());
        assert!(results["b"].is_none());
        assert!(results["c"].is_some());
    }

    #[tokio::test]
    async fn dialect_connection_derefs_to_connection() {
        let (_engine, conn) = mock_connection(Dialect::Sqlite);
        let wrapped = DialectConnection::Sqlite(SqliteConnection::new(conn));

        assert_eq!(wrapped.kind(), Dialect::Sqlite);
        assert!(wrapped.as_sqlite().is_some());
        assert!(wrapped.as_postgres().is_none());
        assert_eq!(wrapped.dialect(), Some(Dialect::Sqlite));

        let plain: Connection = wrapped.into();
        assert!(!plain.is_connected().await);
    }
}
