//! SQLite Driver
//!
//! Implements the DataEngine trait for SQLite databases using SQLx.
//!
//! File databases are created when missing, provided their directory exists.
//! `:memory:` databases live inside a single pinned connection, so the pool
//! for such a session never grows, idles out or recycles.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqliteConnectOptions, SqliteConnection, SqlitePool, SqliteRow};
use sqlx::{Column, Connection, Row, TypeInfo};
use tokio::sync::{Mutex, RwLock};
use tracing::instrument;

use crate::engine::drivers::{elapsed_ms, statement_error};
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::params::{bind_named, BoundQuery, Params};
use crate::engine::pool::PoolSettings;
use crate::engine::statement::{returns_rows, validate_plain, IdentifierKind};
use crate::engine::traits::DataEngine;
use crate::engine::types::{
    ColumnInfo, ConnectionConfig, Dialect, PoolStatus, QueryResult, Row as QRow, SessionId, Value,
};

const SYNTAX_MARKERS: &[&str] = &["syntax error", "incomplete input"];

pub const MEMORY_DATABASE: &str = ":memory:";

/// Returns true when `database` names an in-memory database
pub fn is_memory(database: &str) -> bool {
    let trimmed = database.trim();
    trimmed.is_empty() || trimmed == MEMORY_DATABASE
}

pub struct SqliteSession {
    pub pool: SqlitePool,
    pub transaction_conn: Mutex<Option<PoolConnection<Sqlite>>>,
}

impl SqliteSession {
    pub fn new(pool: SqlitePool) -> Self {
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

/// SQLite driver implementation
pub struct SqliteDriver {
    sessions: Arc<RwLock<HashMap<SessionId, Arc<SqliteSession>>>>,
}

impl SqliteDriver {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn get_session(&self, session: SessionId) -> EngineResult<Arc<SqliteSession>> {
        let sessions = self.sessions.read().await;
        sessions
            .get(&session)
            .cloned()
            .ok_or_else(|| EngineError::session_not_found(session.0.to_string()))
    }

    /// Builds connect options from config
    ///
    /// Every entry of the options map becomes a `PRAGMA` run on each new
    /// connection.
    fn connect_options(config: &ConnectionConfig) -> EngineResult<SqliteConnectOptions> {
        let database = config.database().trim();

        let mut options = if is_memory(database) {
            SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| EngineError::invalid_config(e.to_string()))?
        } else {
            let path = Path::new(database);
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() && !parent.is_dir() {
                    return Err(EngineError::invalid_config(format!(
                        "Directory for SQLite database does not exist: {}",
                        parent.display()
                    )));
                }
            }
            SqliteConnectOptions::new().filename(path).create_if_missing(true)
        };

        for (key, value) in config.options() {
            validate_plain(key, IdentifierKind::Pragma)?;
            options = options.pragma(key.clone(), value.clone());
        }
        Ok(options)
    }

    fn bind_param<'q>(
        query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
        value: &'q Value,
    ) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
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

    fn convert_row(sqlite_row: &SqliteRow) -> QRow {
        let values: Vec<Value> = sqlite_row
            .columns()
            .iter()
            .map(|col| Self::extract_value(sqlite_row, col.ordinal()))
            .collect();

        QRow { values }
    }

    /// SQLite stores five storage classes; declared types only steer the order
    fn extract_value(row: &SqliteRow, idx: usize) -> Value {
        if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
            return v.map(Value::Int).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
            return v.map(Value::Float).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
            return v.map(Value::Bool).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
            return v.map(Value::Text).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
            return v.map(Value::Bytes).unwrap_or(Value::Null);
        }

        Value::Null
    }

    fn get_column_info(row: &SqliteRow) -> Vec<ColumnInfo> {
        row.columns()
            .iter()
            .map(|col| ColumnInfo {
                name: col.name().to_string(),
                data_type: col.type_info().name().to_string(),
                nullable: true,
            })
            .collect()
    }

    async fn run(conn: &mut SqliteConnection, bound: &BoundQuery, wants_rows: bool) -> EngineResult<QueryResult> {
        let start = Instant::now();
        let query = bound
            .values
            .iter()
            .fold(sqlx::query(&bound.sql), |q, value| Self::bind_param(q, value));

        if wants_rows {
            let sqlite_rows: Vec<SqliteRow> = query
                .fetch_all(&mut *conn)
                .await
                .map_err(|e| statement_error(e.to_string(), SYNTAX_MARKERS))?;

            let execution_time_ms = elapsed_ms(start);
            let columns = sqlite_rows.first().map(Self::get_column_info).unwrap_or_default();
            let rows = sqlite_rows.iter().map(Self::convert_row).collect();
            Ok(QueryResult::with_rows(columns, rows, execution_time_ms))
        } else {
            let result = query
                .execute(&mut *conn)
                .await
                .map_err(|e| statement_error(e.to_string(), SYNTAX_MARKERS))?;

            let mut out = QueryResult::with_affected_rows(result.rows_affected(), elapsed_ms(start));
            if result.rows_affected() > 0 && result.last_insert_rowid() > 0 {
                out.last_insert_id = Some(result.last_insert_rowid());
            }
            Ok(out)
        }
    }
}

impl Default for SqliteDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataEngine for SqliteDriver {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn driver_name(&self) -> &'static str {
        "SQLite"
    }

    async fn test_connection(&self, config: &ConnectionConfig) -> EngineResult<()> {
        let pool = PoolSettings::probe()
            .sqlx_options::<Sqlite>()
            .connect_with(Self::connect_options(config)?)
            .await
            .map_err(|e| EngineError::connection_failed(e.to_string()))?;

        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(|e| EngineError::execution_error(e.to_string()))?;

        pool.close().await;
        Ok(())
    }

    #[instrument(skip(self, config, pool), fields(database = %config.database()))]
    async fn connect(&self, config: &ConnectionConfig, pool: &PoolSettings) -> EngineResult<SessionId> {
        let options = Self::connect_options(config)?;
        let settings = if is_memory(config.database()) {
            pool.pinned()
        } else {
            pool.clone()
        };

        let pool = settings.sqlx_options::<Sqlite>().connect_with(options).await.map_err(|e| {
            tracing::error!(error = %e, "sqlite open failed");
            EngineError::connection_failed(e.to_string())
        })?;

        let session_id = SessionId::new();
        let session = Arc::new(SqliteSession::new(pool));

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
        let sqlite_session = self.get_session(session).await?;

        let mut tx_guard = sqlite_session.transaction_conn.lock().await;
        if let Some(conn) = tx_guard.as_mut() {
            return conn
                .ping()
                .await
                .map_err(|e| EngineError::connection_failed(e.to_string()));
        }
        drop(tx_guard);

        let mut conn = sqlite_session
            .pool
            .acquire()
            .await
            .map_err(|e| EngineError::connection_failed(e.to_string()))?;
        conn.ping()
            .await
            .map_err(|e| EngineError::connection_failed(e.to_string()))
    }

    async fn execute(&self, session: SessionId, sql: &str, params: &Params) -> EngineResult<QueryResult> {
        let sqlite_session = self.get_session(session).await?;
        let bound = bind_named(sql, params, Dialect::Sqlite)?;
        let wants_rows = returns_rows(Dialect::Sqlite, sql);

        let mut tx_guard = sqlite_session.transaction_conn.lock().await;
        if let Some(conn) = tx_guard.as_mut() {
            return Self::run(conn, &bound, wants_rows).await;
        }
        drop(tx_guard);

        let mut conn = sqlite_session
            .pool
            .acquire()
            .await
            .map_err(|e| EngineError::connection_failed(e.to_string()))?;
        Self::run(&mut conn, &bound, wants_rows).await
    }

    // ==================== Transaction Methods ====================

    async fn begin_transaction(&self, session: SessionId) -> EngineResult<()> {
        let sqlite_session = self.get_session(session).await?;
        let mut tx = sqlite_session.transaction_conn.lock().await;

        if tx.is_some() {
            return Err(EngineError::transaction_error(
                "A transaction is already active on this session",
            ));
        }

        let mut conn = sqlite_session.pool.acquire().await.map_err(|e| {
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
        let sqlite_session = self.get_session(session).await?;
        let mut tx = sqlite_session.transaction_conn.lock().await;

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
        let sqlite_session = self.get_session(session).await?;
        let mut tx = sqlite_session.transaction_conn.lock().await;

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
        let sqlite_session = self.get_session(session).await?;
        Ok(PoolStatus {
            size: sqlite_session.pool.size(),
            idle: sqlite_session.pool.num_idle() as u32,
            in_transaction: sqlite_session.has_active_transaction(),
        })
    }
}
