//! Database connector
//!
//! High-level facade over a [`Connection`]: plain execution, multi-statement
//! transactions, closures run inside a transaction and scoped use that always
//! closes the connection.

use futures::future::BoxFuture;
use tracing::instrument;

use crate::connection::Connection;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::params::Params;
use crate::engine::types::QueryResult;

const TRANSACTION_FAILED: &str = "Transaction failed";

pub struct DatabaseConnector {
    connection: Connection,
}

impl DatabaseConnector {
    pub fn new(connection: impl Into<Connection>) -> Self {
        Self {
            connection: connection.into(),
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn into_inner(self) -> Connection {
        self.connection
    }

    pub async fn connect(&self) -> EngineResult<()> {
        tracing::debug!("connecting to database using connector");
        self.connection.connect().await.map(|_| ())
    }

    pub async fn close(&self) -> EngineResult<()> {
        tracing::debug!("closing database connection");
        self.connection.disconnect().await
    }

    pub async fn is_connected(&self) -> bool {
        self.connection.is_connected().await
    }

    pub async fn execute_query(&self, sql: &str, params: &Params) -> EngineResult<QueryResult> {
        self.connection.execute(sql, params).await
    }

    /// Runs every statement in order inside one transaction
    ///
    /// Returns one result per statement. Any failure rolls the whole batch back.
    #[instrument(skip(self, statements), fields(statements = statements.len()))]
    pub async fn execute_transaction(&self, statements: &[(String, Params)]) -> EngineResult<Vec<QueryResult>> {
        self.with_transaction(|conn| {
            Box::pin(async move {
                let mut results = Vec::with_capacity(statements.len());
                for (sql, params) in statements {
                    tracing::debug!(sql = %sql, "transaction step");
                    results.push(conn.execute(sql, params).await?);
                }
                Ok(results)
            })
        })
        .await
    }

    /// Runs `f` inside a transaction
    ///
    /// Commits when `f` succeeds. On any failure the transaction is rolled
    /// back and the cause is wrapped in a transaction error.
    pub async fn with_transaction<'a, T, F>(&'a self, f: F) -> EngineResult<T>
    where
        F: FnOnce(&'a Connection) -> BoxFuture<'a, EngineResult<T>>,
    {
        if !self.connection.is_connected().await {
            return Err(EngineError::NotConnected);
        }

        if let Err(e) = self.connection.begin_transaction().await {
            tracing::error!(error = %e, "could not begin transaction");
            return Err(EngineError::transaction_failed(TRANSACTION_FAILED, e));
        }

        let outcome = match f(&self.connection).await {
            Ok(value) => self.connection.commit().await.map(|_| value),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(value) => {
                tracing::debug!("transaction committed");
                Ok(value)
            }
            Err(e) => {
                tracing::error!(error = %e, "transaction failed");
                if self.connection.in_transaction().await {
                    match self.connection.rollback().await {
                        Ok(()) => tracing::debug!("transaction rolled back"),
                        Err(rollback_err) => {
                            tracing::error!(error = %rollback_err, "error rolling back transaction")
                        }
                    }
                }
                Err(EngineError::transaction_failed(TRANSACTION_FAILED, e))
            }
        }
    }

    /// Connects, runs `f`, then closes whatever happened
    ///
    /// If `f` fails while a transaction is open the transaction is rolled
    /// back first. Rollback and close errors are logged and dropped; the
    /// result of `f` (or the connect error) is returned.
    pub async fn scoped<'a, T, F>(&'a self, f: F) -> EngineResult<T>
    where
        F: FnOnce(&'a Connection) -> BoxFuture<'a, EngineResult<T>>,
    {
        if let Err(e) = self.connect().await {
            self.close_quietly().await;
            return Err(e);
        }

        let result = f(&self.connection).await;

        if result.is_err() && self.connection.in_transaction().await {
            if let Err(e) = self.connection.rollback().await {
                tracing::warn!(error = %e, "rollback after failure in scoped block failed");
            }
        }

        self.close_quietly().await;
        result
    }

    async fn close_quietly(&self) {
        if let Err(e) = self.close().await {
            tracing::warn!(error = %e, "ignoring error while closing connection");
        }
    }
}
