//! Oracle Driver
//!
//! Implements the DataEngine trait for Oracle Database using the `oracle`
//! crate (ODPI-C). The client is blocking, so every call runs on the tokio
//! blocking pool. Sessions draw connections from an Oracle session pool.
//!
//! Oracle binds by name, so `:name` placeholders are passed through as-is.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use oracle::pool::{CloseMode, GetMode, Pool, PoolBuilder};
use oracle::sql_type::{OracleType, ToSql};
use oracle::{Connection, SqlValue};
use tokio::sync::{Mutex, RwLock};
use tracing::instrument;

use crate::engine::drivers::{elapsed_ms, statement_error};
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::params::{bind_named, BoundQuery, Params};
use crate::engine::pool::PoolSettings;
use crate::engine::statement::returns_rows;
use crate::engine::traits::DataEngine;
use crate::engine::types::{
    ColumnInfo, ConnectionConfig, Dialect, PoolStatus, QueryResult, Row as QRow, SessionId, Value,
};

const SYNTAX_MARKERS: &[&str] = &["ora-00900", "ora-00923", "ora-00933", "ora-00936", "pls-00103"];

pub struct OracleSession {
    pub pool: Arc<Pool>,
    /// Connection with autocommit off while a transaction is active
    pub transaction_conn: Mutex<Option<Connection>>,
}

impl OracleSession {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool: Arc::new(pool),
            transaction_conn: Mutex::new(None),
        }
    }

    pub fn has_active_transaction(&self) -> bool {
        match self.transaction_conn.try_lock() {
            Ok(guard) => guard.is_some(),
            Err(_) => true,
        }
    }
}

/// Oracle driver implementation
pub struct OracleDriver {
    sessions: Arc<RwLock<HashMap<SessionId, Arc<OracleSession>>>>,
}

/// Runs a blocking client call off the async runtime
async fn blocking<T, F>(f: F) -> EngineResult<T>
where
    F: FnOnce() -> EngineResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| EngineError::execution_error(format!("Oracle worker failed: {}", e)))?
}

impl OracleDriver {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn get_session(&self, session: SessionId) -> EngineResult<Arc<OracleSession>> {
        let sessions = self.sessions.read().await;
        sessions
            .get(&session)
            .cloned()
            .ok_or_else(|| EngineError::session_not_found(session.0.to_string()))
    }

    /// Easy Connect string, `//host:port/service`
    fn connect_string(config: &ConnectionConfig) -> String {
        format!("//{}:{}/{}", config.host(), config.port(), config.database())
    }

    fn connect_error(e: oracle::Error) -> EngineError {
        let message = e.to_string();
        if message.contains("ORA-01017") {
            EngineError::auth_failed(message)
        } else {
            EngineError::connection_failed(message)
        }
    }

    fn build_pool(config: &ConnectionConfig, settings: &PoolSettings) -> EngineResult<Pool> {
        let max = settings.max_connections.max(1);
        let mut builder = PoolBuilder::new(
            config.username().to_string(),
            config.password().to_string(),
            Self::connect_string(config),
        );
        builder
            .max_connections(max)
            .min_connections(settings.min_connections.min(max))
            .connection_increment(1)
            .get_mode(GetMode::TimedWait(settings.acquire_timeout()));
        builder.build().map_err(Self::connect_error)
    }

    fn checkout(pool: &Pool) -> EngineResult<Connection> {
        let mut conn = pool.get().map_err(Self::connect_error)?;
        conn.set_autocommit(true);
        Ok(conn)
    }

    fn to_sql(value: Value) -> Box<dyn ToSql> {
        match value {
            Value::Null => Box::new(Option::<String>::None),
            Value::Bool(b) => Box::new(if b { 1i64 } else { 0i64 }),
            Value::Int(i) => Box::new(i),
            Value::Float(f) => Box::new(f),
            Value::Text(s) => Box::new(s),
            Value::Bytes(b) => Box::new(b),
            Value::Json(j) => Box::new(j.to_string()),
            Value::Array(items) => Box::new(serde_json::to_string(&items).unwrap_or_default()),
        }
    }

    fn convert_value(value: &SqlValue) -> Value {
        if value.is_null().unwrap_or(true) {
            return Value::Null;
        }
        let oracle_type = match value.oracle_type() {
            Ok(t) => t.clone(),
            Err(_) => return Value::Null,
        };
        match oracle_type {
            OracleType::Int64 => value.get::<i64>().map(Value::Int).unwrap_or(Value::Null),
            OracleType::BinaryFloat | OracleType::BinaryDouble => {
                value.get::<f64>().map(Value::Float).unwrap_or(Value::Null)
            }
            // NUMBER keeps its exact text form unless it is integral
            OracleType::Number(_, scale) => match value.get::<String>() {
                Ok(text) if scale <= 0 => text.parse::<i64>().map(Value::Int).unwrap_or(Value::Text(text)),
                Ok(text) => Value::Text(text),
                Err(_) => Value::Null,
            },
            OracleType::Raw(_) | OracleType::LongRaw | OracleType::BLOB => {
                value.get::<Vec<u8>>().map(Value::Bytes).unwrap_or(Value::Null)
            }
            OracleType::Boolean => value.get::<bool>().map(Value::Bool).unwrap_or(Value::Null),
            _ => value.get::<String>().map(Value::Text).unwrap_or(Value::Null),
        }
    }

    /// Runs a bound statement on one connection
    fn run(conn: &Connection, bound: BoundQuery, wants_rows: bool) -> EngineResult<QueryResult> {
        let start = Instant::now();
        let owned: Vec<(String, Box<dyn ToSql>)> = bound
            .names
            .into_iter()
            .zip(bound.values)
            .map(|(name, value)| (name, Self::to_sql(value)))
            .collect();
        let params: Vec<(&str, &dyn ToSql)> = owned
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_ref()))
            .collect();

        if wants_rows {
            let result_set = conn
                .query_named(&bound.sql, &params)
                .map_err(|e| statement_error(e.to_string(), SYNTAX_MARKERS))?;

            let columns: Vec<ColumnInfo> = result_set
                .column_info()
                .iter()
                .map(|col| ColumnInfo {
                    name: col.name().to_string(),
                    data_type: col.oracle_type().to_string(),
                    nullable: col.nullable(),
                })
                .collect();

            let mut rows = Vec::new();
            for row in result_set {
                let row = row.map_err(|e| statement_error(e.to_string(), SYNTAX_MARKERS))?;
                rows.push(QRow {
                    values: row.sql_values().iter().map(Self::convert_value).collect(),
                });
            }
            Ok(QueryResult::with_rows(columns, rows, elapsed_ms(start)))
        } else {
            let statement = conn
                .execute_named(&bound.sql, &params)
                .map_err(|e| statement_error(e.to_string(), SYNTAX_MARKERS))?;
            let affected = statement
                .row_count()
                .map_err(|e| EngineError::execution_error(e.to_string()))?;
            Ok(QueryResult::with_affected_rows(affected, elapsed_ms(start)))
        }
    }
}

impl Default for OracleDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataEngine for OracleDriver {
    fn dialect(&self) -> Dialect {
        Dialect::Oracle
    }

    fn driver_name(&self) -> &'static str {
        "Oracle"
    }

    async fn test_connection(&self, config: &ConnectionConfig) -> EngineResult<()> {
        let username = config.username().to_string();
        let password = config.password().to_string();
        let connect_string = Self::connect_string(config);

        blocking(move || {
            let conn = Connection::connect(username, password, connect_string).map_err(Self::connect_error)?;
            conn.query_row("SELECT 1 FROM DUAL", &[])
                .map_err(|e| EngineError::execution_error(e.to_string()))?;
            conn.close().map_err(|e| EngineError::connection_failed(e.to_string()))
        })
        .await
    }

    #[instrument(skip(self, config, pool), fields(host = %config.host(), service = %config.database()))]
    async fn connect(&self, config: &ConnectionConfig, pool: &PoolSettings) -> EngineResult<SessionId> {
        let config = config.clone();
        let settings = pool.clone();

        let pool = blocking(move || {
            let pool = Self::build_pool(&config, &settings)?;
            // Fail fast on bad credentials or an unreachable listener
            let conn = Self::checkout(&pool)?;
            conn.ping().map_err(|e| EngineError::connection_failed(e.to_string()))?;
            Ok(pool)
        })
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "oracle connect failed");
            e
        })?;

        let session_id = SessionId::new();
        let session = Arc::new(OracleSession::new(pool));

        let mut sessions = self.sessions.write().await;
        sessions.insert(session_id, session);

        Ok(session_id)
    }

    async fn disconnect(&self, session: SessionId) -> EngineResult<()> {
        let session = {
            let mut sessions = self.sessions.write().await;
            sessions
                .remove(&session)
                .ok_or_else(|| EngineError::session_not_found(session.0.to_string()))?
        };

        let pinned = session.transaction_conn.lock().await.take();
        let pool = session.pool.clone();
        blocking(move || {
            if let Some(conn) = pinned {
                if let Err(e) = conn.rollback() {
                    tracing::warn!(error = %e, "rollback on disconnect failed");
                }
            }
            pool.close(&CloseMode::Force)
                .map_err(|e| EngineError::connection_failed(e.to_string()))
        })
        .await
    }

    async fn ping(&self, session: SessionId) -> EngineResult<()> {
        let oracle_session = self.get_session(session).await?;

        let mut tx_guard = oracle_session.transaction_conn.lock().await;
        if let Some(conn) = tx_guard.take() {
            let (conn, result) = tokio::task::spawn_blocking(move || {
                let result = conn.ping().map_err(|e| EngineError::connection_failed(e.to_string()));
                (conn, result)
            })
            .await
            .map_err(|e| EngineError::execution_error(format!("Oracle worker failed: {}", e)))?;
            *tx_guard = Some(conn);
            return result;
        }
        drop(tx_guard);

        let pool = oracle_session.pool.clone();
        blocking(move || {
            Self::checkout(&pool)?
                .ping()
                .map_err(|e| EngineError::connection_failed(e.to_string()))
        })
        .await
    }

    async fn execute(&self, session: SessionId, sql: &str, params: &Params) -> EngineResult<QueryResult> {
        let oracle_session = self.get_session(session).await?;
        let bound = bind_named(sql, params, Dialect::Oracle)?;
        let wants_rows = returns_rows(Dialect::Oracle, sql);

        let mut tx_guard = oracle_session.transaction_conn.lock().await;
        if let Some(conn) = tx_guard.take() {
            let (conn, result) = tokio::task::spawn_blocking(move || {
                let result = Self::run(&conn, bound, wants_rows);
                (conn, result)
            })
            .await
            .map_err(|e| EngineError::execution_error(format!("Oracle worker failed: {}", e)))?;
            *tx_guard = Some(conn);
            return result;
        }
        drop(tx_guard);

        let pool = oracle_session.pool.clone();
        blocking(move || {
            let conn = Self::checkout(&pool)?;
            Self::run(&conn, bound, wants_rows)
        })
        .await
    }

    // ==================== Transaction Methods ====================

    async fn begin_transaction(&self, session: SessionId) -> EngineResult<()> {
        let oracle_session = self.get_session(session).await?;
        let mut tx = oracle_session.transaction_conn.lock().await;

        if tx.is_some() {
            return Err(EngineError::transaction_error(
                "A transaction is already active on this session",
            ));
        }

        // Oracle opens a transaction implicitly; turning autocommit off pins it
        let pool = oracle_session.pool.clone();
        let conn = blocking(move || {
            let mut conn = Self::checkout(&pool).map_err(|e| {
                EngineError::connection_failed(format!("Failed to acquire connection for transaction: {}", e))
            })?;
            conn.set_autocommit(false);
            Ok(conn)
        })
        .await?;

        *tx = Some(conn);
        Ok(())
    }

    async fn commit(&self, session: SessionId) -> EngineResult<()> {
        let oracle_session = self.get_session(session).await?;
        let mut tx = oracle_session.transaction_conn.lock().await;

        let conn = tx
            .take()
            .ok_or_else(|| EngineError::transaction_error("No active transaction to commit"))?;

        blocking(move || {
            conn.commit()
                .map_err(|e| EngineError::transaction_error(format!("Failed to commit transaction: {}", e)))
        })
        .await
    }

    async fn rollback(&self, session: SessionId) -> EngineResult<()> {
        let oracle_session = self.get_session(session).await?;
        let mut tx = oracle_session.transaction_conn.lock().await;

        let conn = tx
            .take()
            .ok_or_else(|| EngineError::transaction_error("No active transaction to rollback"))?;

        blocking(move || {
            conn.rollback().map_err(|e| {
                EngineError::transaction_error(format!("Failed to rollback transaction: {}", e))
            })
        })
        .await
    }

    async fn pool_status(&self, session: SessionId) -> EngineResult<PoolStatus> {
        let oracle_session = self.get_session(session).await?;
        let open = oracle_session
            .pool
            .open_count()
            .map_err(|e| EngineError::execution_error(e.to_string()))?;
        let busy = oracle_session
            .pool
            .busy_count()
            .map_err(|e| EngineError::execution_error(e.to_string()))?;
        Ok(PoolStatus {
            size: open,
            idle: open.saturating_sub(busy),
            in_transaction: oracle_session.has_active_transaction(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn easy_connect_string() {
        let config = ConnectionConfig::new("ora.internal", 1521, "scott", "tiger", "ORCLPDB1")
            .with_dialect(Dialect::Oracle);
        assert_eq!(OracleDriver::connect_string(&config), "//ora.internal:1521/ORCLPDB1");
    }

    #[tokio::test]
    async fn unknown_session_is_reported() {
        let driver = OracleDriver::new();
        let err = driver.rollback(SessionId::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::SessionNotFound { .. }));
    }
}
