//! SQL Server helpers: stored procedures, catalog views and backups.

use std::collections::BTreeMap;

use tracing::instrument;

use super::query_each;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::params::Params;
use crate::engine::statement::{validate_identifier, validate_plain, IdentifierChars, IdentifierKind};
use crate::engine::types::{QueryResult, Record};

pub const DEFAULT_SCHEMA: &str = "dbo";

const LINKED_SERVERS_QUERY: &str = "SELECT name AS server_name, product AS product_name, \
     provider AS provider_name, data_source, catalog \
     FROM sys.servers WHERE is_linked = 1 ORDER BY name";

const DB_SETTINGS_QUERY: &str = "SELECT name, recovery_model_desc AS recovery_model, \
     compatibility_level, collation_name, user_access_desc AS user_access, state_desc AS state, \
     is_read_only, is_auto_shrink_on, is_auto_close_on \
     FROM sys.databases WHERE name = DB_NAME()";

const SERVER_SETTINGS_QUERY: &str = "SELECT SERVERPROPERTY('ProductVersion') AS version, \
     SERVERPROPERTY('Edition') AS edition, SERVERPROPERTY('ProductLevel') AS level, \
     SERVERPROPERTY('ServerName') AS server_name";

const TABLES_QUERY: &str = "SELECT t.name AS table_name, s.name AS schema_name, p.rows AS row_count, \
     CAST(ROUND((SUM(a.total_pages) * 8) / 1024.00, 2) AS DECIMAL(18,2)) AS size_mb \
     FROM sys.tables t \
     JOIN sys.schemas s ON t.schema_id = s.schema_id \
     JOIN sys.indexes i ON t.object_id = i.object_id \
     JOIN sys.partitions p ON i.object_id = p.object_id AND i.index_id = p.index_id \
     JOIN sys.allocation_units a ON p.partition_id = a.container_id \
     WHERE t.is_ms_shipped = 0 \
     GROUP BY t.name, s.name, p.rows \
     ORDER BY s.name, t.name";

const COLUMNS_QUERY: &str = "SELECT c.name AS column_name, t.name AS data_type, c.max_length, \
     c.precision, c.scale, c.is_nullable, c.is_identity, c.column_id \
     FROM sys.columns c \
     JOIN sys.types t ON c.user_type_id = t.user_type_id \
     JOIN sys.tables tbl ON c.object_id = tbl.object_id \
     JOIN sys.schemas s ON tbl.schema_id = s.schema_id \
     WHERE tbl.name = :table_name AND s.name = :schema_name \
     ORDER BY c.column_id";

const INDEXES_QUERY: &str = "SELECT i.name AS index_name, i.type_desc AS index_type, i.is_unique, \
     i.is_primary_key, i.is_disabled, \
     STRING_AGG(c.name, ', ') WITHIN GROUP (ORDER BY ic.key_ordinal) AS columns \
     FROM sys.indexes i \
     JOIN sys.index_columns ic ON i.object_id = ic.object_id AND i.index_id = ic.index_id \
     JOIN sys.columns c ON ic.object_id = c.object_id AND ic.column_id = c.column_id \
     JOIN sys.tables t ON i.object_id = t.object_id \
     JOIN sys.schemas s ON t.schema_id = s.schema_id \
     WHERE t.name = :table_name AND s.name = :schema_name \
     GROUP BY i.name, i.type_desc, i.is_unique, i.is_primary_key, i.is_disabled \
     ORDER BY i.name";

dialect_connection!(
    /// SQL Server connection with procedure, catalog and backup helpers
    MsSqlConnection
);

/// `EXEC name @a = :a, @b = :b` for the given parameters
pub fn exec_procedure_sql(name: &str, params: &Params) -> EngineResult<String> {
    validate_identifier(name, IdentifierKind::Procedure, IdentifierChars::Bracketed)?;
    if params.is_empty() {
        return Ok(format!("EXEC {}", name));
    }
    let mut assignments = Vec::with_capacity(params.len());
    for param in params.names() {
        validate_plain(param, IdentifierKind::Parameter)?;
        assignments.push(format!("@{} = :{}", param, param));
    }
    Ok(format!("EXEC {} {}", name, assignments.join(", ")))
}

/// Full backup of `database` to a file on the server
pub fn backup_sql(database: &str, path: &str) -> EngineResult<String> {
    if database.is_empty() {
        return Err(EngineError::invalid_config("No database selected for backup"));
    }
    Ok(format!(
        "BACKUP DATABASE [{}] TO DISK = '{}' WITH FORMAT, MEDIANAME = 'SQLServerBackup', NAME = 'Full Backup';",
        database.replace(']', "]]"),
        path.replace('\'', "''")
    ))
}

fn table_params(table: &str, schema: Option<&str>) -> Params {
    Params::new()
        .with("table_name", table)
        .with("schema_name", schema.unwrap_or(DEFAULT_SCHEMA))
}

impl MsSqlConnection {
    #[instrument(skip(self, params), fields(params = params.len()))]
    pub async fn execute_stored_procedure(&self, name: &str, params: &Params) -> EngineResult<QueryResult> {
        self.0.ensure_connected().await?;
        let sql = exec_procedure_sql(name, params)?;
        self.0.execute(&sql, params).await
    }

    pub async fn get_linked_servers(&self) -> EngineResult<Vec<Record>> {
        self.0.ensure_connected().await?;
        self.0.fetch_records(LINKED_SERVERS_QUERY, &Params::new()).await
    }

    /// Database options (`db_settings`) and server properties (`server_settings`)
    ///
    /// A group that cannot be read maps to `None`.
    pub async fn get_db_settings(&self) -> EngineResult<BTreeMap<String, Option<Record>>> {
        self.0.ensure_connected().await?;
        let results = query_each(
            &self.0,
            &[("db_settings", DB_SETTINGS_QUERY), ("server_settings", SERVER_SETTINGS_QUERY)],
        )
        .await;
        Ok(results
            .into_iter()
            .map(|(key, result)| {
                let record = result.and_then(|r| r.records().into_iter().next());
                (key, record)
            })
            .collect())
    }

    /// Backs up the configured database to `path` on the server host
    #[instrument(skip(self))]
    pub async fn backup_database(&self, path: &str) -> EngineResult<()> {
        self.0.ensure_connected().await?;
        let database = self.0.config().database();
        let sql = backup_sql(database, path)?;
        self.0.execute(&sql, &Params::new()).await?;
        tracing::info!(database, path, "database backed up");
        Ok(())
    }

    /// User tables with row counts and size in MB
    pub async fn get_tables(&self) -> EngineResult<Vec<Record>> {
        self.0.ensure_connected().await?;
        self.0.fetch_records(TABLES_QUERY, &Params::new()).await
    }

    /// `schema` defaults to `dbo`
    pub async fn get_table_columns(&self, table: &str, schema: Option<&str>) -> EngineResult<Vec<Record>> {
        self.0.ensure_connected().await?;
        self.0.fetch_records(COLUMNS_QUERY, &table_params(table, schema)).await
    }

    /// `schema` defaults to `dbo`
    pub async fn get_table_indexes(&self, table: &str, schema: Option<&str>) -> EngineResult<Vec<Record>> {
        self.0.ensure_connected().await?;
        self.0.fetch_records(INDEXES_QUERY, &table_params(table, schema)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialects::test_support::{mock_connection, statements};
    use crate::engine::types::{Dialect, Value};

    #[test]
    fn exec_assigns_each_parameter() {
        let params = Params::new().with("id", 3).with("active", true);
        assert_eq!(
            exec_procedure_sql("[dbo].[usp_touch]", &params).expect("sql"),
            "EXEC [dbo].[usp_touch] @active = :active, @id = :id"
        );
        assert_eq!(exec_procedure_sql("usp_nightly", &Params::new()).expect("sql"), "EXEC usp_nightly");
    }

    #[test]
    fn exec_rejects_unsafe_names() {
        let err = exec_procedure_sql("usp; DROP TABLE t", &Params::new()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid procedure name. Procedure names must contain only alphanumeric characters, underscores, dots, and square brackets."
        );
    }

    #[test]
    fn backup_escapes_quotes_in_path() {
        assert_eq!(
            backup_sql("sales", "C:\\backups\\o'neil.bak").expect("sql"),
            "BACKUP DATABASE [sales] TO DISK = 'C:\\backups\\o''neil.bak' WITH FORMAT, MEDIANAME = 'SQLServerBackup', NAME = 'Full Backup';"
        );
        assert!(backup_sql("", "x.bak").is_err());
    }

    #[tokio::test]
    async fn catalog_lookups_default_to_dbo() {
        let (engine, conn) = mock_connection(Dialect::MsSql);
        let mssql = MsSqlConnection::new(conn);
        mssql.connect().await.expect("connect");

        let columns = mssql.get_table_columns("orders", None).await.expect("columns");
        let indexes = mssql.get_table_indexes("orders", Some("sales")).await.expect("indexes");

        assert_eq!(columns[0].get("schema_name"), Some(&Value::Text("dbo".into())));
        assert_eq!(indexes[0].get("schema_name"), Some(&Value::Text("sales".into())));
        assert_eq!(statements(&engine).len(), 2);
    }

    #[tokio::test]
    async fn db_settings_keep_readable_groups() {
        let (engine, conn) = mock_connection(Dialect::MsSql);
        engine.fail_statements_containing("SERVERPROPERTY");
        let mssql = MsSqlConnection::new(conn);
        mssql.connect().await.expect("connect");

        let settings = mssql.get_db_settings().await.expect("settings");

        assert!(settings["db_settings"].is_some());
        assert!(settings["server_settings"].is_none());
    }

    #[tokio::test]
    async fn backup_targets_configured_database() {
        let (engine, conn) = mock_connection(Dialect::MsSql);
        let mssql = MsSqlConnection::new(conn);
        mssql.connect().await.expect("connect");

        mssql.backup_database("/var/opt/mssql/app.bak").await.expect("backup");

        let issued = statements(&engine);
        assert_eq!(issued.len(), 1);
        assert!(issued[0].starts_with("BACKUP DATABASE [app] TO DISK = '/var/opt/mssql/app.bak'"));
    }
}
