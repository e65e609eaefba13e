//! PostgreSQL helpers: schemas, table metadata, VACUUM and index creation.

use serde::Serialize;
use tracing::instrument;

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::params::Params;
use crate::engine::statement::{validate_plain, IdentifierKind};
use crate::engine::types::Record;

pub const DEFAULT_SCHEMA: &str = "public";

const TABLES_QUERY: &str = "SELECT tablename AS table_name, schemaname AS schema_name \
     FROM pg_catalog.pg_tables \
     WHERE schemaname != 'pg_catalog' AND schemaname != 'information_schema' \
     ORDER BY schemaname, tablename";

const COLUMNS_QUERY: &str = "SELECT column_name, data_type, is_nullable, column_default, \
     character_maximum_length, numeric_precision, numeric_scale \
     FROM information_schema.columns \
     WHERE table_name = :table_name AND table_schema = :schema_name \
     ORDER BY ordinal_position";

const PRIMARY_KEYS_QUERY: &str = "SELECT tc.constraint_name, kcu.column_name \
     FROM information_schema.table_constraints tc \
     JOIN information_schema.key_column_usage kcu ON tc.constraint_name = kcu.constraint_name \
     WHERE tc.constraint_type = 'PRIMARY KEY' \
     AND tc.table_name = :table_name AND tc.table_schema = :schema_name";

const INDEXES_QUERY: &str = "SELECT indexname AS index_name, indexdef AS index_definition \
     FROM pg_indexes \
     WHERE tablename = :table_name AND schemaname = :schema_name";

const FOREIGN_KEYS_QUERY: &str = "SELECT tc.constraint_name, kcu.column_name, \
     ccu.table_schema AS foreign_table_schema, \
     ccu.table_name AS foreign_table_name, \
     ccu.column_name AS foreign_column_name \
     FROM information_schema.table_constraints tc \
     JOIN information_schema.key_column_usage kcu ON tc.constraint_name = kcu.constraint_name \
     JOIN information_schema.constraint_column_usage ccu ON ccu.constraint_name = tc.constraint_name \
     WHERE tc.constraint_type = 'FOREIGN KEY' \
     AND tc.table_name = :table_name AND tc.table_schema = :schema_name";

dialect_connection!(
    /// PostgreSQL connection with schema and maintenance helpers
    PostgresConnection
);

/// Everything `get_table_info` learns about one table
#[derive(Debug, Clone, Serialize)]
pub struct PgTableInfo {
    pub table_name: String,
    pub schema_name: String,
    pub columns: Vec<Record>,
    pub primary_keys: Vec<Record>,
    pub indexes: Vec<Record>,
    pub foreign_keys: Vec<Record>,
}

/// Optional parts of `CREATE INDEX`
#[derive(Debug, Clone, Default)]
pub struct IndexOptions {
    /// Defaults to `idx_{table}_{columns}`
    pub name: Option<String>,
    /// Defaults to `public`
    pub schema: Option<String>,
    pub unique: bool,
}

impl IndexOptions {
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn in_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

pub fn create_schema_sql(name: &str) -> EngineResult<String> {
    validate_plain(name, IdentifierKind::Schema)?;
    Ok(format!("CREATE SCHEMA IF NOT EXISTS {}", name))
}

pub fn vacuum_sql(table: &str, schema: &str) -> EngineResult<String> {
    validate_plain(table, IdentifierKind::Table)?;
    validate_plain(schema, IdentifierKind::Schema)?;
    Ok(format!("VACUUM {}.{}", schema, table))
}

/// Returns the index name and its `CREATE INDEX` statement
pub fn create_index_sql(table: &str, columns: &[&str], options: &IndexOptions) -> EngineResult<(String, String)> {
    let schema = options.schema.as_deref().unwrap_or(DEFAULT_SCHEMA);
    validate_plain(table, IdentifierKind::Table)?;
    validate_plain(schema, IdentifierKind::Schema)?;
    if columns.is_empty() {
        return Err(EngineError::invalid_identifier(
            "An index needs at least one column.",
        ));
    }
    for column in columns {
        validate_plain(column, IdentifierKind::Column)?;
    }

    let name = match &options.name {
        Some(name) => name.clone(),
        None => format!("idx_{}_{}", table, columns.join("_")),
    };
    validate_plain(&name, IdentifierKind::Index)?;

    let unique = if options.unique { "UNIQUE " } else { "" };
    let sql = format!(
        "CREATE {}INDEX {} ON {}.{} ({})",
        unique,
        name,
        schema,
        table,
        columns.join(", ")
    );
    Ok((name, sql))
}

fn table_params(table: &str, schema: &str) -> Params {
    Params::new().with("table_name", table).with("schema_name", schema)
}

impl PostgresConnection {
    /// User tables outside the system schemas
    pub async fn get_tables(&self) -> EngineResult<Vec<Record>> {
        self.0.ensure_connected().await?;
        self.0.fetch_records(TABLES_QUERY, &Params::new()).await
    }

    #[instrument(skip(self))]
    pub async fn create_schema(&self, name: &str) -> EngineResult<()> {
        self.0.ensure_connected().await?;
        let sql = create_schema_sql(name)?;
        self.0.execute(&sql, &Params::new()).await?;
        tracing::info!(schema = name, "created schema");
        Ok(())
    }

    pub async fn get_schema_names(&self) -> EngineResult<Vec<String>> {
        self.0.ensure_connected().await?;
        let result = self
            .0
            .execute("SELECT schema_name FROM information_schema.schemata", &Params::new())
            .await?;
        Ok(result.column_texts("schema_name"))
    }

    /// Columns, primary keys, indexes and foreign keys of one table
    ///
    /// `schema` defaults to `public`.
    pub async fn get_table_info(&self, table: &str, schema: Option<&str>) -> EngineResult<PgTableInfo> {
        self.0.ensure_connected().await?;
        let schema = schema.unwrap_or(DEFAULT_SCHEMA);
        let params = table_params(table, schema);

        Ok(PgTableInfo {
            table_name: table.to_string(),
            schema_name: schema.to_string(),
            columns: self.0.fetch_records(COLUMNS_QUERY, &params).await?,
            primary_keys: self.0.fetch_records(PRIMARY_KEYS_QUERY, &params).await?,
            indexes: self.0.fetch_records(INDEXES_QUERY, &params).await?,
            foreign_keys: self.0.fetch_records(FOREIGN_KEYS_QUERY, &params).await?,
        })
    }

    #[instrument(skip(self))]
    pub async fn vacuum_table(&self, table: &str, schema: Option<&str>) -> EngineResult<()> {
        self.0.ensure_connected().await?;
        let schema = schema.unwrap_or(DEFAULT_SCHEMA);
        let sql = vacuum_sql(table, schema)?;
        self.0.execute(&sql, &Params::new()).await?;
        tracing::info!("vacuum performed on {}.{}", schema, table);
        Ok(())
    }

    /// Creates an index and returns its name
    #[instrument(skip(self, options))]
    pub async fn create_index(&self, table: &str, columns: &[&str], options: IndexOptions) -> EngineResult<String> {
        self.0.ensure_connected().await?;
        let (name, sql) = create_index_sql(table, columns, &options)?;
        self.0.execute(&sql, &Params::new()).await?;
        tracing::info!(index = %name, unique = options.unique, "created index on {}", table);
        Ok(name)
    }

    pub async fn get_server_version(&self) -> EngineResult<Option<String>> {
        self.0.ensure_connected().await?;
        let result = self.0.execute("SHOW server_version", &Params::new()).await?;
        Ok(result.first_text("server_version"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialects::test_support::{mock_connection, statements};
    use crate::engine::types::{Dialect, Value};

    #[test]
    fn index_name_defaults_to_table_and_columns() {
        let (name, sql) = create_index_sql("users", &["last_name", "first_name"], &IndexOptions::default())
            .expect("index sql");
        assert_eq!(name, "idx_users_last_name_first_name");
        assert_eq!(
            sql,
            "CREATE INDEX idx_users_last_name_first_name ON public.users (last_name, first_name)"
        );
    }

    #[test]
    fn unique_index_in_custom_schema() {
        let options = IndexOptions::default().named("users_email_key").in_schema("auth").unique();
        let (_, sql) = create_index_sql("users", &["email"], &options).expect("index sql");
        assert_eq!(sql, "CREATE UNIQUE INDEX users_email_key ON auth.users (email)");
    }

    #[test]
    fn injected_names_are_rejected() {
        let err = create_index_sql("users", &["email); DROP TABLE users; --"], &IndexOptions::default())
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid column name. Column names must contain only alphanumeric characters and underscores."
        );
        assert!(create_schema_sql("bad schema").is_err());
        assert!(vacuum_sql("users", "public; --").is_err());
        assert!(create_index_sql("users", &[], &IndexOptions::default()).is_err());
    }

    #[tokio::test]
    async fn helpers_require_a_connection() {
        let (_engine, conn) = mock_connection(Dialect::Postgres);
        let pg = PostgresConnection::new(conn);
        assert!(matches!(pg.get_tables().await.unwrap_err(), EngineError::NotConnected));
        assert!(matches!(pg.create_schema("app").await.unwrap_err(), EngineError::NotConnected));
    }

    #[tokio::test]
    async fn table_info_runs_four_lookups_with_default_schema() {
        let (engine, conn) = mock_connection(Dialect::Postgres);
        let pg = PostgresConnection::new(conn);
        pg.connect().await.expect("connect");

        let info = pg.get_table_info("orders", None).await.expect("table info");

        assert_eq!(info.schema_name, "public");
        assert_eq!(statements(&engine).len(), 4);
        for records in [&info.columns, &info.primary_keys, &info.indexes, &info.foreign_keys] {
            assert_eq!(records.len(), 1);
            assert_eq!(records[0].get("table_name"), Some(&Value::Text("orders".into())));
            assert_eq!(records[0].get("schema_name"), Some(&Value::Text("public".into())));
        }
        assert!(info.foreign_keys[0]["sql"].as_str().unwrap_or_default().contains("FOREIGN KEY"));
    }

    #[tokio::test]
    async fn maintenance_statements_are_issued() {
        let (engine, conn) = mock_connection(Dialect::Postgres);
        let pg = PostgresConnection::new(conn);
        pg.connect().await.expect("connect");

        pg.create_schema("reporting").await.expect("schema");
        pg.vacuum_table("orders", Some("sales")).await.expect("vacuum");
        let name = pg
            .create_index("orders", &["customer_id"], IndexOptions::default())
            .await
            .expect("index");

        assert_eq!(name, "idx_orders_customer_id");
        assert_eq!(
            statements(&engine),
            vec![
                "CREATE SCHEMA IF NOT EXISTS reporting",
                "VACUUM sales.orders",
                "CREATE INDEX idx_orders_customer_id ON public.orders (customer_id)",
            ]
        );
    }

    #[tokio::test]
    async fn invalid_schema_issues_no_statement() {
        let (engine, conn) = mock_connection(Dialect::Postgres);
        let pg = PostgresConnection::new(conn);
        pg.connect().await.expect("connect");

        let err = pg.create_schema("x; DROP SCHEMA public").await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidIdentifier { .. }));
        assert!(statements(&engine).is_empty());
    }
}
