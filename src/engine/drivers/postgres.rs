//! PostgreSQL driver on sqlx
//!
//! Statements borrow a pooled connection for their own duration. Between
//! `begin_transaction` and `commit`/`rollback` the session keeps one
//! connection checked out and routes every statement through it.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgArguments, PgConnectOptions, PgConnection, PgPool, PgRow, PgSslMode, Postgres};
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

const SYNTAX_MARKERS: &[&str] = &["syntax error"];

/// Pool plus the connection pinned by an open transaction
pub struct PostgresSession {
    pub pool: PgPool,
    /// Set between BEGIN and COMMIT/ROLLBACK
    pub transaction_conn: Mutex<Option<PoolConnection<Postgres>>>,
}

impl PostgresSession {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            transaction_conn: Mutex::new(None),
        }
    }

    /// Returns true if a transaction is currently active
    pub fn has_active_transaction(&self) -> bool {
        match self.transaction_conn.try_lock() {
            Ok(guard) => guard.is_some(),
            Err(_) => true,
        }
    }
}

/// PostgreSQL driver implementation
pub struct PostgresDriver {
    sessions: Arc<RwLock<HashMap<SessionId, Arc<PostgresSession>>>>,
}

impl PostgresDriver {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn get_session(&self, session: SessionId) -> EngineResult<Arc<PostgresSession>> {
        let sessions = self.sessions.read().await;
        sessions
            .get(&session)
            .cloned()
            .ok_or_else(|| EngineError::session_not_found(session.0.to_string()))
    }

    /// Builds connect options from config
    ///
    /// `sslmode` in the options map overrides the ssl flag; every other
    /// option is sent as a server runtime parameter.
    fn connect_options(config: &ConnectionConfig) -> EngineResult<PgConnectOptions> {
        let database = if config.database().is_empty() {
            "postgres"
        } else {
            config.database()
        };

        let mut ssl_mode = if config.ssl() {
            PgSslMode::Require
        } else {
            PgSslMode::Disable
        };
        let mut runtime_params: Vec<(&str, &str)> = Vec::new();
        for (key, value) in config.options() {
            if key == "sslmode" {
                ssl_mode = PgSslMode::from_str(value).map_err(|e| {
                    EngineError::invalid_config(format!("Invalid sslmode '{}': {}", value, e))
                })?;
            } else {
                runtime_params.push((key.as_str(), value.as_str()));
            }
        }

        let mut options = PgConnectOptions::new()
            .host(config.host())
            .port(config.port())
            .username(config.username())
            .password(config.password())
            .database(database)
            .ssl_mode(ssl_mode);
        if !runtime_params.is_empty() {
            options = options.options(runtime_params);
        }
        Ok(options)
    }

    fn connect_error(e: sqlx::Error) -> EngineError {
        let message = e.to_string();
        if message.contains("password authentication failed") {
            EngineError::auth_failed(message)
        } else {
            EngineError::connection_failed(message)
        }
    }

    /// Row values in column order
    fn convert_row(pg_row: &PgRow) -> QRow {
        let values: Vec<Value> = pg_row
            .columns()
            .iter()
            .map(|col| Self::extract_value(pg_row, col.ordinal()))
            .collect();

        QRow { values }
    }

    /// Helper to bind a Value to a Postgres query
    fn bind_param<'q>(
        query: sqlx::query::Query<'q, Postgres, PgArguments>,
        value: &'q Value,
    ) -> sqlx::query::Query<'q, Postgres, PgArguments> {
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

    /// Decodes column `idx`, trying the widest types first
    fn extract_value(row: &PgRow, idx: usize) -> Value {
        // integers first; a bool probe would also accept them
        if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
            return v.map(Value::Int).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
            return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i16>, _>(idx) {
            return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
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
        // NUMERIC keeps its exact text form
        if let Ok(v) = row.try_get::<Option<rust_decimal::Decimal>, _>(idx) {
            return v.map(|d| Value::Text(d.to_string())).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
            return v.map(Value::Text).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<uuid::Uuid>, _>(idx) {
            return v.map(|u| Value::Text(u.to_string())).unwrap_or(Value::Null);
        }
        // temporal values travel as ISO 8601 text
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
        if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
            return v.map(Value::Bytes).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<serde_json::Value>, _>(idx) {
            return v.map(Value::Json).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<Vec<String>>, _>(idx) {
            return v
                .map(|items| Value::Array(items.into_iter().map(Value::Text).collect()))
                .unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<Vec<i64>>, _>(idx) {
            return v
                .map(|items| Value::Array(items.into_iter().map(Value::Int).collect()))
                .unwrap_or(Value::Null);
        }

        Value::Null
    }

    /// Column names and types, read from the first row
    fn get_column_info(row: &PgRow) -> Vec<ColumnInfo> {
        row.columns()
            .iter()
            .map(|col| ColumnInfo {
                name: col.name().to_string(),
                data_type: col.type_info().name().to_string(),
                nullable: true, // SQLx doesn't expose nullability easily at runtime
            })
            .collect()
    }

    /// Runs a bound statement on one connection
    async fn run(conn: &mut PgConnection, bound: &BoundQuery, wants_rows: bool) -> EngineResult<QueryResult> {
        let start = Instant::now();
        let query = bound
            .values
            .iter()
            .fold(sqlx::query(&bound.sql), |q, value| Self::bind_param(q, value));

        if wants_rows {
            let pg_rows: Vec<PgRow> = query
                .fetch_all(&mut *conn)
                .await
                .map_err(|e| statement_error(e.to_string(), SYNTAX_MARKERS))?;

            let execution_time_ms = elapsed_ms(start);
            let columns = pg_rows.first().map(Self::get_column_info).unwrap_or_default();
            let rows = pg_rows.iter().map(Self::convert_row).collect();
            Ok(QueryResult::with_rows(columns, rows, execution_time_ms))
        } else {
            let result = query
                .execute(&mut *conn)
                .await
                .map_err(|e| statement_error(e.to_string(), SYNTAX_MARKERS))?;

            Ok(QueryResult::with_affected_rows(result.rows_affected(), elapsed_ms(start)))
        }
    }
}

impl Default for PostgresDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataEngine for PostgresDriver {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    fn driver_name(&self) -> &'static str {
        "PostgreSQL"
    }

    async fn test_connection(&self, config: &ConnectionConfig) -> EngineResult<()> {
        let pool = PoolSettings::probe()
            .sqlx_options::<Postgres>()
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
            .sqlx_options::<Postgres>()
            .connect_with(Self::connect_options(config)?)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "postgres connect failed");
                Self::connect_error(e)
            })?;

        let session_id = SessionId::new();
        let session = Arc::new(PostgresSession::new(pool));

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
        let pg_session = self.get_session(session).await?;

        let mut tx_guard = pg_session.transaction_conn.lock().await;
        if let Some(conn) = tx_guard.as_mut() {
            return conn
                .ping()
                .await
                .map_err(|e| EngineError::connection_failed(e.to_string()));
        }
        drop(tx_guard);

        let mut conn = pg_session
            .pool
            .acquire()
            .await
            .map_err(|e| EngineError::connection_failed(e.to_string()))?;
        conn.ping()
            .await
            .map_err(|e| EngineError::connection_failed(e.to_string()))
    }

    async fn execute(&self, session: SessionId, sql: &str, params: &Params) -> EngineResult<QueryResult> {
        let pg_session = self.get_session(session).await?;
        let bound = bind_named(sql, params, Dialect::Postgres)?;
        let wants_rows = returns_rows(Dialect::Postgres, sql);

        let mut tx_guard = pg_session.transaction_conn.lock().await;
        if let Some(conn) = tx_guard.as_mut() {
            return Self::run(conn, &bound, wants_rows).await;
        }
        drop(tx_guard);

        let mut conn = pg_session
            .pool
            .acquire()
            .await
            .map_err(|e| EngineError::connection_failed(e.to_string()))?;
        Self::run(&mut conn, &bound, wants_rows).await
    }

    async fn begin_transaction(&self, session: SessionId) -> EngineResult<()> {
        let pg_session = self.get_session(session).await?;
        let mut tx = pg_session.transaction_conn.lock().await;

        // one transaction per session
        if tx.is_some() {
            return Err(EngineError::transaction_error(
                "A transaction is already active on this session",
            ));
        }

        // pin a connection for the whole transaction
        let mut conn = pg_session.pool.acquire().await.map_err(|e| {
            EngineError::connection_failed(format!("Failed to acquire connection for transaction: {}", e))
        })?;

        sqlx::query("BEGIN")
            .execute(&mut *conn)
            .await
            .map_err(|e| EngineError::transaction_error(format!("Failed to begin transaction: {}", e)))?;

        *tx = Some(conn);

        Ok(())
    }

    async fn commit(&self, session: SessionId) -> EngineResult<()> {
        let pg_session = self.get_session(session).await?;
        let mut tx = pg_session.transaction_conn.lock().await;

        let mut conn = tx
            .take()
            .ok_or_else(|| EngineError::transaction_error("No active transaction to commit"))?;

        sqlx::query("COMMIT")
            .execute(&mut *conn)
            .await
            .map_err(|e| EngineError::transaction_error(format!("Failed to commit transaction: {}", e)))?;

        // dropping the pinned connection hands it back to the pool
        Ok(())
    }

    async fn rollback(&self, session: SessionId) -> EngineResult<()> {
        let pg_session = self.get_session(session).await?;
        let mut tx = pg_session.transaction_conn.lock().await;

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
        let pg_session = self.get_session(session).await?;
        Ok(PoolStatus {
            size: pg_session.pool.size(),
            idle: pg_session.pool.num_idle() as u32,
            in_transaction: pg_session.has_active_transaction(),
        })
    }
}
