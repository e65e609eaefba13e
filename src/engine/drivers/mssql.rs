//! SQL Server Driver
//!
//! Implements the DataEngine trait for Microsoft SQL Server using tiberius.
//! tiberius has no pool of its own, so each session owns a deadpool pool of
//! TDS clients.
//!
//! ## Transaction Handling
//!
//! Same architecture as the sqlx drivers: a pooled client is pinned on BEGIN
//! and handed back on COMMIT/ROLLBACK.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use deadpool::managed::{self, Metrics, Object, RecycleResult};
use deadpool::Runtime;
use tiberius::{AuthMethod, Client, ColumnData, Config, EncryptionLevel, FromSql, Query};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
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

const SYNTAX_MARKERS: &[&str] = &["incorrect syntax", "syntax error"];

pub type MssqlClient = Client<Compat<TcpStream>>;

async fn open_client(config: &Config) -> Result<MssqlClient, tiberius::error::Error> {
    let tcp = TcpStream::connect(config.get_addr()).await?;
    tcp.set_nodelay(true)?;
    Client::connect(config.clone(), tcp.compat_write()).await
}

/// deadpool manager creating and health-checking TDS clients
pub struct MssqlManager {
    config: Config,
}

impl managed::Manager for MssqlManager {
    type Type = MssqlClient;
    type Error = tiberius::error::Error;

    async fn create(&self) -> Result<MssqlClient, Self::Error> {
        open_client(&self.config).await
    }

    async fn recycle(&self, client: &mut MssqlClient, _: &Metrics) -> RecycleResult<Self::Error> {
        client.simple_query("SELECT 1").await?.into_results().await?;
        Ok(())
    }
}

pub type MssqlPool = managed::Pool<MssqlManager>;

pub struct MssqlSession {
    pub pool: MssqlPool,
    pub transaction_conn: Mutex<Option<Object<MssqlManager>>>,
}

impl MssqlSession {
    pub fn new(pool: MssqlPool) -> Self {
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

/// SQL Server driver implementation
pub struct MssqlDriver {
    sessions: Arc<RwLock<HashMap<SessionId, Arc<MssqlSession>>>>,
}

impl MssqlDriver {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn get_session(&self, session: SessionId) -> EngineResult<Arc<MssqlSession>> {
        let sessions = self.sessions.read().await;
        sessions
            .get(&session)
            .cloned()
            .ok_or_else(|| EngineError::session_not_found(session.0.to_string()))
    }

    /// Builds a tiberius config
    ///
    /// Recognised options: `trust_server_certificate`, `application_name`,
    /// `instance_name`.
    fn client_config(config: &ConnectionConfig) -> Config {
        let mut tds = Config::new();
        tds.host(config.host());
        tds.port(config.port());
        tds.authentication(AuthMethod::sql_server(config.username(), config.password()));
        if !config.database().is_empty() {
            tds.database(config.database());
        }
        tds.encryption(if config.ssl() {
            EncryptionLevel::Required
        } else {
            EncryptionLevel::NotSupported
        });

        for (key, value) in config.options() {
            match key.as_str() {
                "trust_server_certificate" if matches!(value.as_str(), "true" | "yes" | "1") => {
                    tds.trust_cert();
                }
                "trust_server_certificate" => {}
                "application_name" => tds.application_name(value),
                "instance_name" => tds.instance_name(value),
                _ => tracing::warn!(option = %key, "ignoring unsupported SQL Server option"),
            }
        }
        tds
    }

    fn connect_error(e: impl std::fmt::Display) -> EngineError {
        let message = e.to_string();
        if message.contains("Login failed") {
            EngineError::auth_failed(message)
        } else {
            EngineError::connection_failed(message)
        }
    }

    fn build_pool(config: &ConnectionConfig, settings: &PoolSettings) -> EngineResult<MssqlPool> {
        let manager = MssqlManager {
            config: Self::client_config(config),
        };
        managed::Pool::builder(manager)
            .max_size(settings.max_connections.max(1) as usize)
            .wait_timeout(Some(settings.acquire_timeout()))
            .create_timeout(Some(settings.acquire_timeout()))
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| EngineError::invalid_config(format!("Failed to build SQL Server pool: {}", e)))
    }

    async fn checkout(pool: &MssqlPool) -> EngineResult<Object<MssqlManager>> {
        pool.get().await.map_err(Self::connect_error)
    }

    fn bind_param<'a>(query: &mut Query<'a>, value: &'a Value) {
        match value {
            Value::Null => query.bind(Option::<&str>::None),
            Value::Bool(b) => query.bind(*b),
            Value::Int(i) => query.bind(*i),
            Value::Float(f) => query.bind(*f),
            Value::Text(s) => query.bind(s.as_str()),
            Value::Bytes(b) => query.bind(b.as_slice()),
            Value::Json(j) => query.bind(j.to_string()),
            Value::Array(items) => query.bind(serde_json::to_string(items).unwrap_or_default()),
        }
    }

    fn convert_data(data: ColumnData<'static>) -> Value {
        match data {
            ColumnData::U8(v) => v.map(|n| Value::Int(n as i64)).unwrap_or(Value::Null),
            ColumnData::I16(v) => v.map(|n| Value::Int(n as i64)).unwrap_or(Value::Null),
            ColumnData::I32(v) => v.map(|n| Value::Int(n as i64)).unwrap_or(Value::Null),
            ColumnData::I64(v) => v.map(Value::Int).unwrap_or(Value::Null),
            ColumnData::F32(v) => v.map(|f| Value::Float(f as f64)).unwrap_or(Value::Null),
            ColumnData::F64(v) => v.map(Value::Float).unwrap_or(Value::Null),
            ColumnData::Bit(v) => v.map(Value::Bool).unwrap_or(Value::Null),
            ColumnData::String(v) => v.map(|s| Value::Text(s.into_owned())).unwrap_or(Value::Null),
            ColumnData::Guid(v) => v.map(|g| Value::Text(g.to_string())).unwrap_or(Value::Null),
            ColumnData::Binary(v) => v.map(|b| Value::Bytes(b.into_owned())).unwrap_or(Value::Null),
            // DECIMAL/NUMERIC keep their exact text form
            ColumnData::Numeric(v) => v.map(|n| Value::Text(n.to_string())).unwrap_or(Value::Null),
            ColumnData::Xml(v) => v
                .map(|x| Value::Text(x.into_owned().into_string()))
                .unwrap_or(Value::Null),
            other => Self::convert_temporal(&other),
        }
    }

    fn convert_temporal(data: &ColumnData<'static>) -> Value {
        if let Ok(Some(dt)) = chrono::NaiveDateTime::from_sql(data) {
            return Value::Text(dt.format("%Y-%m-%d %H:%M:%S").to_string());
        }
        if let Ok(Some(dt)) = chrono::DateTime::<chrono::FixedOffset>::from_sql(data) {
            return Value::Text(dt.to_rfc3339());
        }
        if let Ok(Some(d)) = chrono::NaiveDate::from_sql(data) {
            return Value::Text(d.format("%Y-%m-%d").to_string());
        }
        if let Ok(Some(t)) = chrono::NaiveTime::from_sql(data) {
            return Value::Text(t.format("%H:%M:%S").to_string());
        }
        Value::Null
    }

    async fn run(client: &mut MssqlClient, bound: &BoundQuery, wants_rows: bool) -> EngineResult<QueryResult> {
        let start = Instant::now();
        let mut query = Query::new(bound.sql.as_str());
        for value in &bound.values {
            Self::bind_param(&mut query, value);
        }

        if wants_rows {
            let mut stream = query
                .query(client)
                .await
                .map_err(|e| statement_error(e.to_string(), SYNTAX_MARKERS))?;

            let columns: Vec<ColumnInfo> = stream
                .columns()
                .await
                .map_err(|e| statement_error(e.to_string(), SYNTAX_MARKERS))?
                .map(|cols| {
                    cols.iter()
                        .map(|col| ColumnInfo {
                            name: col.name().to_string(),
                            data_type: format!("{:?}", col.column_type()),
                            nullable: true,
                        })
                        .collect()
                })
                .unwrap_or_default();

            let tds_rows = stream
                .into_first_result()
                .await
                .map_err(|e| statement_error(e.to_string(), SYNTAX_MARKERS))?;

            let rows = tds_rows
                .into_iter()
                .map(|row| QRow {
                    values: row.into_iter().map(Self::convert_data).collect(),
                })
                .collect();
            Ok(QueryResult::with_rows(columns, rows, elapsed_ms(start)))
        } else {
            let result = query
                .execute(client)
                .await
                .map_err(|e| statement_error(e.to_string(), SYNTAX_MARKERS))?;

            Ok(QueryResult::with_affected_rows(result.total(), elapsed_ms(start)))
        }
    }

    async fn simple(client: &mut MssqlClient, sql: &str) -> Result<(), tiberius::error::Error> {
        client.simple_query(sql).await?.into_results().await?;
        Ok(())
    }
}

impl Default for MssqlDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataEngine for MssqlDriver {
    fn dialect(&self) -> Dialect {
        Dialect::MsSql
    }

    fn driver_name(&self) -> &'static str {
        "SQL Server"
    }

    async fn test_connection(&self, config: &ConnectionConfig) -> EngineResult<()> {
        let mut client = open_client(&Self::client_config(config))
            .await
            .map_err(Self::connect_error)?;

        Self::simple(&mut client, "SELECT 1")
            .await
            .map_err(|e| EngineError::execution_error(e.to_string()))?;

        client
            .close()
            .await
            .map_err(|e| EngineError::connection_failed(e.to_string()))
    }

    #[instrument(skip(self, config, pool), fields(host = %config.host(), database = %config.database()))]
    async fn connect(&self, config: &ConnectionConfig, pool: &PoolSettings) -> EngineResult<SessionId> {
        let pool = Self::build_pool(config, pool)?;

        // Open the first client eagerly so bad credentials fail here
        let probe = Self::checkout(&pool).await.map_err(|e| {
            tracing::error!(error = %e, "sql server connect failed");
            e
        })?;
        drop(probe);

        let session_id = SessionId::new();
        let session = Arc::new(MssqlSession::new(pool));

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
                if let Err(e) = Self::simple(&mut conn, "ROLLBACK TRANSACTION").await {
                    tracing::warn!(error = %e, "rollback on disconnect failed");
                }
            }
        }

        session.pool.close();
        Ok(())
    }

    async fn ping(&self, session: SessionId) -> EngineResult<()> {
        let mssql_session = self.get_session(session).await?;

        let mut tx_guard = mssql_session.transaction_conn.lock().await;
        if let Some(conn) = tx_guard.as_mut() {
            return Self::simple(conn, "SELECT 1")
                .await
                .map_err(|e| EngineError::connection_failed(e.to_string()));
        }
        drop(tx_guard);

        let mut conn = Self::checkout(&mssql_session.pool).await?;
        Self::simple(&mut conn, "SELECT 1")
            .await
            .map_err(|e| EngineError::connection_failed(e.to_string()))
    }

    async fn execute(&self, session: SessionId, sql: &str, params: &Params) -> EngineResult<QueryResult> {
        let mssql_session = self.get_session(session).await?;
        let bound = bind_named(sql, params, Dialect::MsSql)?;
        let wants_rows = returns_rows(Dialect::MsSql, sql);

        let mut tx_guard = mssql_session.transaction_conn.lock().await;
        if let Some(conn) = tx_guard.as_mut() {
            return Self::run(conn, &bound, wants_rows).await;
        }
        drop(tx_guard);

        let mut conn = Self::checkout(&mssql_session.pool).await?;
        Self::run(&mut conn, &bound, wants_rows).await
    }

    // ==================== Transaction Methods ====================

    async fn begin_transaction(&self, session: SessionId) -> EngineResult<()> {
        let mssql_session = self.get_session(session).await?;
        let mut tx = mssql_session.transaction_conn.lock().await;

        if tx.is_some() {
            return Err(EngineError::transaction_error(
                "A transaction is already active on this session",
            ));
        }

        let mut conn = Self::checkout(&mssql_session.pool).await?;

        Self::simple(&mut conn, "BEGIN TRANSACTION")
            .await
            .map_err(|e| EngineError::transaction_error(format!("Failed to begin transaction: {}", e)))?;

        *tx = Some(conn);
        Ok(())
    }

    async fn commit(&self, session: SessionId) -> EngineResult<()> {
        let mssql_session = self.get_session(session).await?;
        let mut tx = mssql_session.transaction_conn.lock().await;

        let mut conn = tx
            .take()
            .ok_or_else(|| EngineError::transaction_error("No active transaction to commit"))?;

        Self::simple(&mut conn, "COMMIT TRANSACTION")
            .await
            .map_err(|e| EngineError::transaction_error(format!("Failed to commit transaction: {}", e)))?;

        Ok(())
    }

    async fn rollback(&self, session: SessionId) -> EngineResult<()> {
        let mssql_session = self.get_session(session).await?;
        let mut tx = mssql_session.transaction_conn.lock().await;

        let mut conn = tx
            .take()
            .ok_or_else(|| EngineError::transaction_error("No active transaction to rollback"))?;

        Self::simple(&mut conn, "ROLLBACK TRANSACTION")
            .await
            .map_err(|e| {
                EngineError::transaction_error(format!("Failed to rollback transaction: {}", e))
            })?;

        Ok(())
    }

    async fn pool_status(&self, session: SessionId) -> EngineResult<PoolStatus> {
        let mssql_session = self.get_session(session).await?;
        let status = mssql_session.pool.status();
        Ok(PoolStatus {
            size: status.size as u32,
            idle: status.available as u32,
            in_transaction: mssql_session.has_active_transaction(),
        })
    }
}
