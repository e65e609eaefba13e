//! MySQL / MariaDB helpers: SHOW statements and table maintenance.

use tracing::instrument;

use crate::engine::error::EngineResult;
use crate::engine::params::Params;
use crate::engine::statement::{validate_plain, IdentifierKind};
use crate::engine::types::Record;

dialect_connection!(
    /// MySQL connection with SHOW and table maintenance helpers
    MySqlConnection
);

/// `{statement} {table}` after checking the table name
fn table_statement(statement: &str, table: &str) -> EngineResult<String> {
    validate_plain(table, IdentifierKind::Table)?;
    Ok(format!("{} {}", statement, table))
}

impl MySqlConnection {
    async fn records(&self, sql: &str) -> EngineResult<Vec<Record>> {
        self.0.ensure_connected().await?;
        self.0.fetch_records(sql, &Params::new()).await
    }

    async fn maintain(&self, statement: &str, table: &str) -> EngineResult<()> {
        self.0.ensure_connected().await?;
        let sql = table_statement(statement, table)?;
        self.0.execute(&sql, &Params::new()).await?;
        tracing::info!(table, "{} done", statement.to_ascii_lowercase());
        Ok(())
    }

    pub async fn show_tables(&self) -> EngineResult<Vec<Record>> {
        self.records("SHOW TABLES").await
    }

    pub async fn get_server_version(&self) -> EngineResult<Option<String>> {
        self.0.ensure_connected().await?;
        let result = self.0.execute("SELECT VERSION() AS version", &Params::new()).await?;
        Ok(result.first_text("version"))
    }

    pub async fn show_databases(&self) -> EngineResult<Vec<Record>> {
        self.records("SHOW DATABASES").await
    }

    pub async fn show_table_status(&self) -> EngineResult<Vec<Record>> {
        self.records("SHOW TABLE STATUS").await
    }

    /// Column layout as reported by `DESCRIBE`
    pub async fn get_table_structure(&self, table: &str) -> EngineResult<Vec<Record>> {
        let sql = table_statement("DESCRIBE", table)?;
        self.records(&sql).await
    }

    pub async fn get_create_table(&self, table: &str) -> EngineResult<Option<String>> {
        self.0.ensure_connected().await?;
        let sql = table_statement("SHOW CREATE TABLE", table)?;
        let result = self.0.execute(&sql, &Params::new()).await?;
        Ok(result.first_text("Create Table"))
    }

    #[instrument(skip(self))]
    pub async fn optimize_table(&self, table: &str) -> EngineResult<()> {
        self.maintain("OPTIMIZE TABLE", table).await
    }

    #[instrument(skip(self))]
    pub async fn analyze_table(&self, table: &str) -> EngineResult<()> {
        self.maintain("ANALYZE TABLE", table).await
    }

    #[instrument(skip(self))]
    pub async fn repair_table(&self, table: &str) -> EngineResult<()> {
        self.maintain("REPAIR TABLE", table).await
    }

    pub async fn check_table(&self, table: &str) -> EngineResult<Vec<Record>> {
        let sql = table_statement("CHECK TABLE", table)?;
        self.records(&sql).await
    }

    /// System variables, optionally filtered with a `LIKE` pattern
    pub async fn get_variables(&self, pattern: Option<&str>) -> EngineResult<Vec<Record>> {
        self.0.ensure_connected().await?;
        match pattern {
            Some(pattern) => {
                self.0
                    .fetch_records("SHOW VARIABLES LIKE :pattern", &Params::new().with("pattern", pattern))
                    .await
            }
            None => self.0.fetch_records("SHOW VARIABLES", &Params::new()).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialects::test_support::{mock_connection, statements};
    use crate::engine::error::EngineError;
    use crate::engine::types::{ColumnInfo, Dialect, QueryResult, Row, Value};

    #[test]
    fn table_statements_check_the_name() {
        assert_eq!(table_statement("DESCRIBE", "users").expect("sql"), "DESCRIBE users");
        let err = table_statement("OPTIMIZE TABLE", "users; DROP TABLE users").unwrap_err();
        assert!(matches!(err, EngineError::InvalidIdentifier { .. }));
    }

    #[tokio::test]
    async fn maintenance_helpers_issue_table_statements() {
        let (engine, conn) = mock_connection(Dialect::MySql);
        let mysql = MySqlConnection::new(conn);
        mysql.connect().await.expect("connect");

        mysql.optimize_table("orders").await.expect("optimize");
        mysql.analyze_table("orders").await.expect("analyze");
        mysql.repair_table("orders").await.expect("repair");
        mysql.check_table("orders").await.expect("check");
        mysql.get_table_structure("orders").await.expect("describe");

        assert_eq!(
            statements(&engine),
            vec![
                "OPTIMIZE TABLE orders",
                "ANALYZE TABLE orders",
                "REPAIR TABLE orders",
                "CHECK TABLE orders",
                "DESCRIBE orders",
            ]
        );
    }

    #[tokio::test]
    async fn variables_pattern_is_bound_not_interpolated() {
        let (engine, conn) = mock_connection(Dialect::MySql);
        let mysql = MySqlConnection::new(conn);
        mysql.connect().await.expect("connect");

        mysql.get_variables(Some("max_%")).await.expect("filtered");
        mysql.get_variables(None).await.expect("all");

        assert_eq!(
            statements(&engine),
            vec!["SHOW VARIABLES LIKE :pattern", "SHOW VARIABLES"]
        );
    }

    #[tokio::test]
    async fn version_is_read_from_first_row() {
        let (engine, conn) = mock_connection(Dialect::MySql);
        let mysql = MySqlConnection::new(conn);
        mysql.connect().await.expect("connect");

        engine.respond_to(
            "VERSION()",
            QueryResult::with_rows(
                vec![ColumnInfo {
                    name: "version".to_string(),
                    data_type: "VARCHAR".to_string(),
                    nullable: false,
                }],
                vec![Row {
                    values: vec![Value::Text("8.0.36".into())],
                }],
                0.0,
            ),
        );

        assert_eq!(
            mysql.get_server_version().await.expect("version"),
            Some("8.0.36".to_string())
        );
        assert_eq!(statements(&engine), vec!["SELECT VERSION() AS version"]);
    }

    #[tokio::test]
    async fn helpers_require_a_connection() {
        let (engine, conn) = mock_connection(Dialect::MySql);
        let mysql = MySqlConnection::new(conn);
        assert!(matches!(mysql.show_tables().await.unwrap_err(), EngineError::NotConnected));
        assert!(matches!(mysql.optimize_table("t").await.unwrap_err(), EngineError::NotConnected));
        assert!(engine.calls().is_empty());
    }
}
