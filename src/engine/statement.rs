//! Statement classification and identifier guards.

use sqlparser::{
    ast::{SetExpr, Statement},
    dialect::{self as sql_dialect, GenericDialect, MsSqlDialect, MySqlDialect, PostgreSqlDialect, SQLiteDialect},
    parser::Parser,
};

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::types::Dialect;

const ROW_KEYWORDS: &[&str] = &[
    "SELECT", "WITH", "SHOW", "EXPLAIN", "DESCRIBE", "DESC", "PRAGMA", "VALUES", "EXEC", "EXECUTE",
    "CALL", "CHECK",
];

/// Whether `sql` produces a row set when executed on `dialect`.
///
/// Statements the parser does not understand (vendor extensions, PL/SQL
/// blocks) are classified by their leading keyword.
pub fn returns_rows(dialect: Dialect, sql: &str) -> bool {
    let trimmed = sql.trim();
    if trimmed.is_empty() {
        return false;
    }

    let parser_dialect = parser_dialect(dialect);
    match Parser::parse_sql(&*parser_dialect, trimmed) {
        Ok(statements) => statements.last().map(statement_returns_rows).unwrap_or(false),
        Err(_) => leading_keyword_returns_rows(trimmed),
    }
}

fn parser_dialect(dialect: Dialect) -> Box<dyn sql_dialect::Dialect> {
    match dialect {
        Dialect::Postgres => Box::new(PostgreSqlDialect {}),
        Dialect::MySql => Box::new(MySqlDialect {}),
        Dialect::MsSql => Box::new(MsSqlDialect {}),
        Dialect::Sqlite => Box::new(SQLiteDialect {}),
        Dialect::Oracle => Box::new(GenericDialect {}),
    }
}

fn statement_returns_rows(statement: &Statement) -> bool {
    match statement {
        Statement::Query(query) => !matches!(*query.body, SetExpr::Insert(_) | SetExpr::Update(_) | SetExpr::Delete(_)),
        Statement::Insert(insert) => insert.returning.is_some(),
        Statement::Update(update) => update.returning.is_some(),
        Statement::Delete(delete) => delete.returning.is_some(),
        Statement::Pragma { is_eq, .. } => !is_eq,
        Statement::Explain { .. }
        | Statement::ExplainTable { .. }
        | Statement::ShowFunctions { .. }
        | Statement::ShowVariable { .. }
        | Statement::ShowStatus { .. }
        | Statement::ShowVariables { .. }
        | Statement::ShowCreate { .. }
        | Statement::ShowColumns { .. }
        | Statement::ShowDatabases { .. }
        | Statement::ShowSchemas { .. }
        | Statement::ShowCharset(_)
        | Statement::ShowObjects(_)
        | Statement::ShowTables { .. }
        | Statement::ShowViews { .. }
        | Statement::ShowCollation { .. }
        | Statement::Execute { .. }
        | Statement::Call(_) => true,
        _ => false,
    }
}

fn leading_keyword_returns_rows(sql: &str) -> bool {
    let first = sql
        .trim_start_matches('(')
        .split(|c: char| c.is_whitespace() || c == '(' || c == ';')
        .find(|word| !word.is_empty())
        .unwrap_or("")
        .to_ascii_uppercase();

    ROW_KEYWORDS.contains(&first.as_str())
}

/// What an identifier names, for error messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierKind {
    Table,
    Schema,
    Column,
    Index,
    Pragma,
    Procedure,
    Parameter,
}

impl IdentifierKind {
    fn label(&self) -> (&'static str, &'static str) {
        match self {
            IdentifierKind::Table => ("table", "Table"),
            IdentifierKind::Schema => ("schema", "Schema"),
            IdentifierKind::Column => ("column", "Column"),
            IdentifierKind::Index => ("index", "Index"),
            IdentifierKind::Pragma => ("PRAGMA", "PRAGMA"),
            IdentifierKind::Procedure => ("procedure", "Procedure"),
            IdentifierKind::Parameter => ("parameter", "Parameter"),
        }
    }
}

/// Extra characters an identifier may contain beyond `[A-Za-z0-9_]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierChars {
    Plain,
    /// Qualified names: `schema.proc`
    Dotted,
    /// SQL Server names: `[dbo].[proc]`
    Bracketed,
}

/// Rejects identifiers that cannot be safely interpolated into SQL text.
pub fn validate_identifier(name: &str, kind: IdentifierKind, chars: IdentifierChars) -> EngineResult<()> {
    let allowed = |c: char| {
        c.is_ascii_alphanumeric()
            || c == '_'
            || (chars != IdentifierChars::Plain && c == '.')
            || (chars == IdentifierChars::Bracketed && (c == '[' || c == ']'))
    };

    if !name.is_empty() && name.chars().all(allowed) {
        return Ok(());
    }

    let (lower, title) = kind.label();
    let extra = match chars {
        IdentifierChars::Plain => "alphanumeric characters and underscores",
        IdentifierChars::Dotted => "alphanumeric characters, underscores, and dots",
        IdentifierChars::Bracketed => {
            "alphanumeric characters, underscores, dots, and square brackets"
        }
    };
    Err(EngineError::invalid_identifier(format!(
        "Invalid {} name. {} names must contain only {}.",
        lower, title, extra
    )))
}

/// Shorthand for the common `[A-Za-z0-9_]` case
pub fn validate_plain(name: &str, kind: IdentifierKind) -> EngineResult<()> {
    validate_identifier(name, kind, IdentifierChars::Plain)
}
