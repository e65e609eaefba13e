//! SQLite helpers: PRAGMA access, VACUUM and schema listing.

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::params::Params;
use crate::engine::statement::{validate_plain, IdentifierKind};
use crate::engine::types::Record;

const ALL_TABLES_QUERY: &str = "SELECT name AS table_name, type AS table_type, sql \
     FROM sqlite_master \
     WHERE type = 'table' AND name NOT LIKE 'sqlite_%' \
     ORDER BY name";

dialect_connection!(
    /// SQLite connection with PRAGMA and maintenance helpers
    SqliteConnection
);

/// PRAGMA values are a bare word, a signed number, or a quoted string
fn validate_pragma_value(value: &str) -> EngineResult<()> {
    let bare = |s: &str| {
        !s.is_empty()
            && s.chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
    };
    let quoted = value.len() >= 2
        && value.starts_with('\'')
        && value.ends_with('\'')
        && !value[1..value.len() - 1].contains('\'');

    if bare(value) || quoted {
        Ok(())
    } else {
        Err(EngineError::invalid_identifier(
            "Invalid PRAGMA value. Values must be a keyword, a number, or a single-quoted string.",
        ))
    }
}

/// `PRAGMA name` or `PRAGMA name = value`
pub fn pragma_sql(name: &str, value: Option<&str>) -> EngineResult<String> {
    validate_plain(name, IdentifierKind::Pragma)?;
    match value {
        Some(value) => {
            validate_pragma_value(value)?;
            Ok(format!("PRAGMA {} = {}", name, value))
        }
        None => Ok(format!("PRAGMA {}", name)),
    }
}

impl SqliteConnection {
    /// Reads a PRAGMA, or sets it when `value` is given
    ///
    /// Setting returns `None`; reading returns the PRAGMA's rows.
    pub async fn pragma(&self, name: &str, value: Option<&str>) -> EngineResult<Option<Vec<Record>>> {
        self.0.ensure_connected().await?;
        let sql = pragma_sql(name, value)?;
        if value.is_some() {
            self.0.execute(&sql, &Params::new()).await?;
            tracing::debug!(pragma = name, "pragma set");
            return Ok(None);
        }
        self.0.fetch_records(&sql, &Params::new()).await.map(Some)
    }

    /// Column layout from `PRAGMA table_info`
    pub async fn get_table_info(&self, table: &str) -> EngineResult<Vec<Record>> {
        self.0.ensure_connected().await?;
        validate_plain(table, IdentifierKind::Table)?;
        self.0
            .fetch_records(&format!("PRAGMA table_info({})", table), &Params::new())
            .await
    }

    pub async fn vacuum(&self) -> EngineResult<()> {
        self.0.ensure_connected().await?;
        self.0.execute("VACUUM", &Params::new()).await?;
        tracing::info!(database = %self.0.config().database(), "database vacuumed");
        Ok(())
    }

    pub async fn get_sqlite_version(&self) -> EngineResult<Option<String>> {
        self.0.ensure_connected().await?;
        let result = self
            .0
            .execute("SELECT sqlite_version() AS version", &Params::new())
            .await?;
        Ok(result.first_text("version"))
    }

    /// User tables with their `CREATE` statements
    pub async fn get_all_tables(&self) -> EngineResult<Vec<Record>> {
        self.0.ensure_connected().await?;
        self.0.fetch_records(ALL_TABLES_QUERY, &Params::new()).await
    }
}
