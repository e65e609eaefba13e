//! MySQL / MariaDB driver on sqlx
//!
//! Pool and transaction handling follow the PostgreSQL driver: a transaction
//! pins one pooled connection until it ends.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::mysql::{MySql, MySqlArguments, MySqlConnectOptions, MySqlConnection, MySqlPool, MySqlRow, MySqlSslMode};
use sqlx::pool::PoolConnection;
use sqlx::{Column, Connection, Row, TypeInfo};
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

const SYNTAX_MARKERS: &[&str] = &["error in your sql syntax"];

/// Pool plus the connection pinned by an open transaction
pub struct MySqlSession {
    pub pool: MySqlPool,
    /// Set between START TRANSACTION and COMMIT/ROLLBACK
    pub transaction_conn: Mutex<Option<PoolConnection<MySql>>>,
}

impl MySqlSession {
    pub fn new(pool: MySqlPool) -> Self {
        Self {
            pool,
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

/// MySQL driver implementation
pub struct MySqlDriver {
    sessions: Arc<RwLock<HashMap<SessionId, Arc<MySqlSession>>>>,
}

impl MySqlDriver {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn get_session(&self, session: SessionId) -> EngineResult<Arc<MySqlSession>> {
        let sessions = self.sessions.read().await;
        sessions
            .get(&session)
            .cloned()
            .ok_or_else(|| EngineError::session_not_found(session.0.to_string()))
    }

    /// Builds connect options from config
    ///
    /// Recognised options: `charset`, `collation`, `ssl_mode`.
    fn connect_options(config: &ConnectionConfig) -> EngineResult<MySqlConnectOptions> {
        let mut options = MySqlConnectOptions::new()
            .host(config.host())
            .port(config.port())
            .username(config.username())
            .password(config.password())
            .ssl_mode(if config.ssl() {
                MySqlSslMode::Required
            } else {
                MySqlSslMode::Disabled
            });
        if !config.database().is_empty() {
            options = options.database(config.database());
        }

        for (key, value) in config.options() {
            options = match key.as_str() {
                "charset" => options.charset(value),
                "collation" => options.collation(value),
                "ssl_mode" | "ssl-mode" => {
                    let mode = value.parse::<MySqlSslMode>().map_err(|e| {
                        EngineError::invalid_config(format!("Invalid ssl_mode '{}': {}", value, e))
                    })?;
                    options.ssl_mode(mode)
                }
                _ => {
                    tracing::warn!(option = %key, "ignoring unsupported MySQL option");
                    options
                }
            };
        }
        Ok(options)
    }

    fn connect_error(e: sqlx::Error) -> EngineError {
        let message = e.to_string();
        if message.contains("Access denied") {
            EngineError::auth_failed(message)
        } else {
            EngineError::connection_failed(message)
        }
    }

    /// Helper to bind a Value to a MySQL query
    fn bind_param<'q>(
        query: sqlx::query::Query<'q, MySql, MySqlArguments>,
        value: &'q Value,
    ) -> sqlx::query::Query<'q, MySql, MySqlArguments> {
        match value {
            Value::Null => query.bind(Option::<String>::None),
            Value::Bool(b) => query.bind(b),
            Value::Int(i) => query.bind(i),
            Value::Float(f) => query.bind(f),
            Value::Text(s) => query.bind(s.as_str()),
            Value::Bytes(b) => query.bind(b.as_slice()),
            Value::Json(j) => query.bind(j),
            Value::Array(items) => query.bind(serde_json::to_value(items).unwrap_or(serde_json::Value::Null)),
        }
    }

    /// Row values in column order
    fn convert_row(mysql_row: &MySqlRow) -> QRow {
        let values: Vec<Value> = mysql_row
            .columns()
            .iter()
            .map(|col| Self::extract_value(mysql_row, col.ordinal()))
            .collect();

        QRow { values }
    }

    /// Decodes column `idx`, trying the widest types first
    fn extract_value(row: &MySqlRow, idx: usize) -> Value {
        // Try u64 first for BIGINT UNSIGNED columns
        if let Ok(v) = row.try_get::<Option<u64>, _>(idx) {
            return v.map(unsigned_value).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
            return v.map(Value::Int).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
            return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<u32>, _>(idx) {
            return v.map(|u| Value::Int(u as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i16>, _>(idx) {
            return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<u16>, _>(idx) {
            return v.map(|u| Value::Int(u as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i8>, _>(idx) {
            return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<u8>, _>(idx) {
            return v.map(|u| Value::Int(u as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
            return v.map(Value::Bool).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
            return v.map(Value::Float).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<f32>, _>(idx) {
            return v.map(|f| Value::Float(f as f64)).unwrap_or(Value::Null);
        }
        // DECIMAL keeps its exact text form
        if let Ok(v) = row.try_get::<Option<Decimal>, _>(idx) {
            return v.map(|d| Value::Text(d.to_string())).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
            return v.map(Value::Text).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(idx) {
            return v.map(|dt| Value::Text(dt.to_rfc3339())).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::NaiveDateTime>, _>(idx) {
            return v
                .map(|dt| Value::Text(dt.format("%Y-%m-%d %H:%M:%S").to_string()))
                .unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::NaiveDate>, _>(idx) {
            return v
                .map(|d| Value::Text(d.format("%Y-%m-%d").to_string()))
                .unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::NaiveTime>, _>(idx) {
            return v
                .map(|t| Value::Text(t.format("%H:%M:%S").to_string()))
                .unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<serde_json::Value>, _>(idx) {
            return v.map(Value::Json).unwrap_or(Value::Null);
        }
        // SHOW statements return VARBINARY columns on some servers
        if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
            return v
                .map(|bytes| match String::from_utf8(bytes) {
                    Ok(text) => Value::Text(text),
                    Err(e) => Value::Bytes(e.into_bytes()),
                })
                .unwrap_or(Value::Null);
        }

        Value::Null
    }

    /// Column names and types, read from the first row
    fn get_column_info(row: &MySqlRow) -> Vec<ColumnInfo> {
        row.columns()
            .iter()
            .map(|col| ColumnInfo {
                name: col.name().to_string(),
                data_type: col.type_info().name().to_string(),
                nullable: true,
            })
            .collect()
    }

    /// Runs a bound statement on one connection
    async fn run(conn: &mut MySqlConnection, bound: &BoundQuery, wants_rows: bool) -> EngineResult<QueryResult> {
        let start = Instant::now();
        let query = bound
            .values
            .iter()
            .fold(sqlx::query(&bound.sql), |q, value| Self::bind_param(q, value));

        if wants_rows {
            let mysql_rows: Vec<MySqlRow> = query
                .fetch_all(&mut *conn)
                .await
                .map_err(|e| statement_error(e.to_string(), SYNTAX_MARKERS))?;

            let execution_time_ms = elapsed_ms(start);
            let columns = mysql_rows.first().map(Self::get_column_info).unwrap_or_default();
            let rows = mysql_rows.iter().map(Self::convert_row).collect();
            Ok(QueryResult::with_rows(columns, rows, execution_time_ms))
        } else {
            let result = query
                .execute(&mut *conn)
                .await
                .map_err(|e| statement_error(e.to_string(), SYNTAX_MARKERS))?;

            let mut out = QueryResult::with_affected_rows(result.rows_affected(), elapsed_ms(start));
            if result.last_insert_id() > 0 {
                out.last_insert_id = Some(result.last_insert_id() as i64);
            }
            Ok(out)
        }
    }
}

impl Default for MySqlDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataEngine for MySqlDriver {
    fn dialect(&self) -> Dialect {
        Dialect::MySql
    }

    fn driver_name(&self) -> &'static str {
        "MySQL / MariaDB"
    }

    async fn test_connection(&self, config: &ConnectionConfig) -> EngineResult<()> {
        let pool = PoolSettings::probe()
            .sqlx_options::<MySql>()
            .connect_with(Self::connect_options(config)?)
            .await
            .map_err(Self::connect_error)?;

        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(|e| EngineError::execution_error(e.to_string()))?;

        pool.close().await;
        Ok(())
    }

    #[instrument(skip(self, config, pool), fields(host = %config.host(), database = %config.database()))]
    async fn connect(&self, config: &ConnectionConfig, pool: &PoolSettings) -> EngineResult<SessionId> {
        let pool = pool
            .sqlx_options::<MySql>()
            .connect_with(Self::connect_options(config)?)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "mysql connect failed");
                Self::connect_error(e)
            })?;

        let session_id = SessionId::new();
        let session = Arc::new(MySqlSession::new(pool));

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

        {
            let mut tx = session.transaction_conn.lock().await;
            if let Some(mut conn) = tx.take() {
                if let Err(e) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                    tracing::warn!(error = %e, "rollback on disconnect failed");
                }
            }
        }

        session.pool.close().await;
        Ok(())
    }

    async fn ping(&self, session: SessionId) -> EngineResult<()> {
        let mysql_session = self.get_session(session).await?;

        let mut tx_guard = mysql_session.transaction_conn.lock().await;
        if let Some(conn) = tx_guard.as_mut() {
            return conn
                .ping()
                .await
                .map_err(|e| EngineError::connection_failed(e.to_string()));
        }
        drop(tx_guard);

        let mut conn = mysql_session
            .pool
            .acquire()
            .await
            .map_err(|e| EngineError::connection_failed(e.to_string()))?;
        conn.ping()
            .await
            .map_err(|e| EngineError::connection_failed(e.to_string()))
    }

    /// Executes a query and returns the result
    ///
    /// Routes to transaction connection if active, otherwise uses pool.
    async fn execute(&self, session: SessionId, sql: &str, params: &Params) -> EngineResult<QueryResult> {
        let mysql_session = self.get_session(session).await?;
        let bound = bind_named(sql, params, Dialect::MySql)?;
        let wants_rows = returns_rows(Dialect::MySql, sql);

        let mut tx_guard = mysql_session.transaction_conn.lock().await;
        if let Some(conn) = tx_guard.as_mut() {
            return Self::run(conn, &bound, wants_rows).await;
        }
        drop(tx_guard);

        let mut conn = mysql_session
            .pool
            .acquire()
            .await
            .map_err(|e| EngineError::connection_failed(e.to_string()))?;
        Self::run(&mut conn, &bound, wants_rows).await
    }


    async fn begin_transaction(&self, session: SessionId) -> EngineResult<()> {
        let mysql_session = self.get_session(session).await?;
        let mut tx = mysql_session.transaction_conn.lock().await;

        if tx.is_some() {
            return Err(EngineError::transaction_error(
                "A transaction is already active on this session",
            ));
        }

        let mut conn = mysql_session.pool.acquire().await.map_err(|e| {
            EngineError::connection_failed(format!("Failed to acquire connection for transaction: {}", e))
        })?;

        sqlx::query("START TRANSACTION")
            .execute(&mut *conn)
            .await
            .map_err(|e| EngineError::transaction_error(format!("Failed to begin transaction: {}", e)))?;

        *tx = Some(conn);
        Ok(())
    }

    async fn commit(&self, session: SessionId) -> EngineResult<()> {
        let mysql_session = self.get_session(session).await?;
        let mut tx = mysql_session.transaction_conn.lock().await;

        let mut conn = tx
            .take()
            .ok_or_else(|| EngineError::transaction_error("No active transaction to commit"))?;

        sqlx::query("COMMIT")
            .execute(&mut *conn)
            .await
            .map_err(|e| EngineError::transaction_error(format!("Failed to commit transaction: {}", e)))?;

        Ok(())
    }

    async fn rollback(&self, session: SessionId) -> EngineResult<()> {
        let mysql_session = self.get_session(session).await?;
        let mut tx = mysql_session.transaction_conn.lock().await;

        let mut conn = tx
            .take()
            .ok_or_else(|| EngineError::transaction_error("No active transaction to rollback"))?;

        sqlx::query("ROLLBACK")
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                EngineError::transaction_error(format!("Failed to rollback transaction: {}", e))
            })?;

        Ok(())
    }

    async fn pool_status(&self, session: SessionId) -> EngineResult<PoolStatus> {
        let mysql_session = self.get_session(session).await?;
        Ok(PoolStatus {
            size: mysql_session.pool.size(),
            idle: mysql_session.pool.num_idle() as u32,
            in_transaction: mysql_session.has_active_transaction(),
        })
    }
}

/// Values past `i64::MAX` are kept exact as text
fn unsigned_value(u: u64) -> Value {
    i64::try_from(u)
        .map(Value::Int)
        .unwrap_or_else(|_| Value::Text(u.to_string()))
}
