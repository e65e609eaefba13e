//! Oracle helpers: stored procedures, dictionary views and session context.
//!
//! Dictionary views store unquoted names upper-cased, so table and owner
//! filters are upper-cased before they are bound.

use std::collections::BTreeMap;

use tracing::instrument;

use super::query_each;
use crate::engine::error::EngineResult;
use crate::engine::params::Params;
use crate::engine::statement::{validate_identifier, IdentifierChars, IdentifierKind};
use crate::engine::types::{QueryResult, Record, Value};

const TAB_PRIVS_QUERY: &str =
    "SELECT GRANTEE, OWNER, TABLE_NAME, GRANTOR, PRIVILEGE, GRANTABLE, HIERARCHY FROM ALL_TAB_PRIVS";

const DBA_TABLESPACES_QUERY: &str = "SELECT TABLESPACE_NAME, STATUS, CONTENTS, LOGGING, \
     EXTENT_MANAGEMENT, ALLOCATION_TYPE, SEGMENT_SPACE_MANAGEMENT, BIGFILE \
     FROM DBA_TABLESPACES ORDER BY TABLESPACE_NAME";

const USER_TABLESPACES_QUERY: &str = "SELECT TABLESPACE_NAME, STATUS, CONTENTS, LOGGING, \
     EXTENT_MANAGEMENT, ALLOCATION_TYPE, SEGMENT_SPACE_MANAGEMENT \
     FROM USER_TABLESPACES ORDER BY TABLESPACE_NAME";

const ALL_TABLES_COLUMNS: &str =
    "SELECT OWNER, TABLE_NAME, TABLESPACE_NAME, STATUS, NUM_ROWS, BLOCKS, LAST_ANALYZED FROM ALL_TABLES";

const TAB_COLUMNS_SELECT: &str =
    "SELECT COLUMN_NAME, DATA_TYPE, DATA_LENGTH, DATA_PRECISION, DATA_SCALE, NULLABLE, COLUMN_ID";

/// Session attributes read by `get_session_info`, keyed by result column
const SESSION_QUERIES: [(&str, &str); 7] = [
    ("username", "SELECT SYS_CONTEXT('USERENV', 'SESSION_USER') AS username FROM DUAL"),
    ("instance", "SELECT SYS_CONTEXT('USERENV', 'INSTANCE_NAME') AS instance FROM DUAL"),
    ("host", "SELECT SYS_CONTEXT('USERENV', 'HOST') AS host FROM DUAL"),
    ("ip_address", "SELECT SYS_CONTEXT('USERENV', 'IP_ADDRESS') AS ip_address FROM DUAL"),
    ("os_user", "SELECT SYS_CONTEXT('USERENV', 'OS_USER') AS os_user FROM DUAL"),
    ("current_schema", "SELECT SYS_CONTEXT('USERENV', 'CURRENT_SCHEMA') AS current_schema FROM DUAL"),
    ("current_time", "SELECT TO_CHAR(SYSDATE, 'YYYY-MM-DD HH24:MI:SS') AS current_time FROM DUAL"),
];

dialect_connection!(
    /// Oracle connection with PL/SQL and data dictionary helpers
    OracleConnection
);

/// `BEGIN name(:a, :b); END;` for the given parameters
pub fn procedure_call_sql(name: &str, params: &Params) -> EngineResult<String> {
    validate_identifier(name, IdentifierKind::Procedure, IdentifierChars::Dotted)?;
    if params.is_empty() {
        return Ok(format!("BEGIN {}; END;", name));
    }
    let placeholders: Vec<String> = params.names().map(|p| format!(":{}", p)).collect();
    Ok(format!("BEGIN {}({}); END;", name, placeholders.join(", ")))
}

impl OracleConnection {
    #[instrument(skip(self, params), fields(params = params.len()))]
    pub async fn execute_procedure(&self, name: &str, params: &Params) -> EngineResult<QueryResult> {
        self.0.ensure_connected().await?;
        let sql = procedure_call_sql(name, params)?;
        self.0.execute(&sql, params).await
    }

    pub async fn get_table_privileges(&self, table: Option<&str>) -> EngineResult<Vec<Record>> {
        self.0.ensure_connected().await?;
        match table {
            Some(table) => {
                let sql = format!("{} WHERE TABLE_NAME = :table_name", TAB_PRIVS_QUERY);
                let params = Params::new().with("table_name", table.to_uppercase());
                self.0.fetch_records(&sql, &params).await
            }
            None => self.0.fetch_records(TAB_PRIVS_QUERY, &Params::new()).await,
        }
    }

    /// Current user, instance, host and time as seen by the server
    ///
    /// Each attribute is looked up on its own; one that cannot be read is
    /// `None` instead of failing the whole call.
    pub async fn get_session_info(&self) -> EngineResult<BTreeMap<String, Option<Value>>> {
        self.0.ensure_connected().await?;
        let results = query_each(&self.0, &SESSION_QUERIES).await;
        Ok(results
            .into_iter()
            .map(|(key, result)| {
                let value = result.and_then(|r| r.get(0, &key).cloned());
                (key, value)
            })
            .collect())
    }

    /// Tablespaces from `DBA_TABLESPACES`, or `USER_TABLESPACES` without DBA rights
    pub async fn get_tablespaces(&self) -> EngineResult<Vec<Record>> {
        self.0.ensure_connected().await?;
        match self.0.fetch_records(DBA_TABLESPACES_QUERY, &Params::new()).await {
            Ok(records) => Ok(records),
            Err(e) if e.is_query_error() => {
                tracing::warn!(error = %e, "DBA_TABLESPACES unavailable, falling back to USER_TABLESPACES");
                self.0.fetch_records(USER_TABLESPACES_QUERY, &Params::new()).await
            }
            Err(e) => Err(e),
        }
    }

    pub async fn get_all_tables(&self, owner: Option<&str>) -> EngineResult<Vec<Record>> {
        self.0.ensure_connected().await?;
        match owner {
            Some(owner) => {
                let sql = format!("{} WHERE OWNER = :owner ORDER BY OWNER, TABLE_NAME", ALL_TABLES_COLUMNS);
                let params = Params::new().with("owner", owner.to_uppercase());
                self.0.fetch_records(&sql, &params).await
            }
            None => {
                let sql = format!("{} ORDER BY OWNER, TABLE_NAME", ALL_TABLES_COLUMNS);
                self.0.fetch_records(&sql, &Params::new()).await
            }
        }
    }

    /// Columns of a table owned by `owner`, or by the current user when unset
    pub async fn get_table_columns(&self, table: &str, owner: Option<&str>) -> EngineResult<Vec<Record>> {
        self.0.ensure_connected().await?;
        let mut params = Params::new().with("table_name", table.to_uppercase());
        let sql = match owner {
            Some(owner) => {
                params.insert("owner", owner.to_uppercase());
                format!(
                    "{} FROM ALL_TAB_COLUMNS WHERE TABLE_NAME = :table_name AND OWNER = :owner ORDER BY COLUMN_ID",
                    TAB_COLUMNS_SELECT
                )
            }
            None => format!(
                "{} FROM USER_TAB_COLUMNS WHERE TABLE_NAME = :table_name ORDER BY COLUMN_ID",
                TAB_COLUMNS_SELECT
            ),
        };
        self.0.fetch_records(&sql, &params).await
    }
}
