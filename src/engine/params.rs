//! Named query parameters
//!
//! Statements are written with `:name` placeholders. Before execution they are
//! rewritten into the placeholder style of the target driver and the values
//! are collected in bind order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::types::{Dialect, Value};

/// Named parameters for a statement
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Params {
    values: BTreeMap<String, Value>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a value and returns the params, for chained construction
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Params {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = Params::new();
        for (k, v) in iter {
            params.insert(k, v);
        }
        params
    }
}

/// Placeholder syntax understood by a driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderStyle {
    /// `$1, $2, ...` (Postgres); repeated names reuse their index
    Dollar,
    /// `?` (MySQL, SQLite); every occurrence binds its own value
    Question,
    /// `@P1, @P2, ...` (SQL Server); repeated names reuse their index
    AtP,
    /// `:name` kept as-is (Oracle binds by name)
    Named,
}

impl PlaceholderStyle {
    pub fn for_dialect(dialect: Dialect) -> Self {
        match dialect {
            Dialect::Postgres => PlaceholderStyle::Dollar,
            Dialect::MySql | Dialect::Sqlite => PlaceholderStyle::Question,
            Dialect::MsSql => PlaceholderStyle::AtP,
            Dialect::Oracle => PlaceholderStyle::Named,
        }
    }
}

/// A statement rewritten for a driver together with its ordered bind values
#[derive(Debug, Clone, PartialEq)]
pub struct BoundQuery {
    pub sql: String,
    pub values: Vec<Value>,
    /// Parameter names in bind order (used by by-name drivers)
    pub names: Vec<String>,
}

/// Rewrites `:name` placeholders of `sql` into the placeholder style of `dialect`.
///
/// String literals, quoted identifiers, comments and `::` casts are copied
/// untouched. Backslash escapes inside `'...'` are honoured for MySQL only.
/// A placeholder without a value in `params` is an error.
pub fn bind_named(sql: &str, params: &Params, dialect: Dialect) -> EngineResult<BoundQuery> {
    let style = PlaceholderStyle::for_dialect(dialect);
    let backslash_escapes = dialect == Dialect::MySql;
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut values = Vec::new();
    let mut names: Vec<String> = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\'' | '"' | '`' => {
                let end = skip_quoted(&chars, i, c, backslash_escapes);
                out.extend(&chars[i..end]);
                i = end;
            }
            '[' if style == PlaceholderStyle::AtP => {
                let end = skip_until(&chars, i + 1, |ch| ch == ']');
                out.extend(&chars[i..end]);
                i = end;
            }
            '-' if chars.get(i + 1) == Some(&'-') => {
                let end = skip_until(&chars, i + 2, |ch| ch == '\n');
                out.extend(&chars[i..end]);
                i = end;
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                let end = skip_block_comment(&chars, i + 2);
                out.extend(&chars[i..end]);
                i = end;
            }
            ':' if chars.get(i + 1) == Some(&':') => {
                out.push_str("::");
                i += 2;
            }
            ':' if chars.get(i + 1).is_some_and(|ch| is_ident_start(*ch))
                && !prev_is_ident(&chars, i) =>
            {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && is_ident_char(chars[end]) {
                    end += 1;
                }
                let name: String = chars[start..end].iter().collect();
                let value = params
                    .get(&name)
                    .cloned()
                    .ok_or_else(|| EngineError::MissingParameter { name: name.clone() })?;

                match style {
                    PlaceholderStyle::Question => {
                        values.push(value);
                        names.push(name);
                        out.push('?');
                    }
                    PlaceholderStyle::Dollar | PlaceholderStyle::AtP | PlaceholderStyle::Named => {
                        let index = match names.iter().position(|n| *n == name) {
                            Some(existing) => existing + 1,
                            None => {
                                values.push(value);
                                names.push(name.clone());
                                names.len()
                            }
                        };
                        match style {
                            PlaceholderStyle::Dollar => out.push_str(&format!("${}", index)),
                            PlaceholderStyle::AtP => out.push_str(&format!("@P{}", index)),
                            _ => {
                                out.push(':');
                                out.push_str(&name);
                            }
                        }
                    }
                }
                i = end;
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    Ok(BoundQuery { sql: out, values, names })
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// `a:b` style tokens (e.g. time literals outside quotes) are not placeholders
fn prev_is_ident(chars: &[char], i: usize) -> bool {
    i > 0 && is_ident_char(chars[i - 1])
}

/// Returns the index just past the closing quote; doubled quotes are escapes
fn skip_quoted(chars: &[char], start: usize, quote: char, backslash_escapes: bool) -> usize {
    let mut i = start + 1;
    while i < chars.len() {
        if chars[i] == quote {
            if chars.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        if backslash_escapes && chars[i] == '\\' && quote == '\'' {
            i += 2;
            continue;
        }
        i += 1;
    }
    chars.len()
}

fn skip_until(chars: &[char], start: usize, stop: impl Fn(char) -> bool) -> usize {
    let mut i = start;
    while i < chars.len() {
        if stop(chars[i]) {
            return i + 1;
        }
        i += 1;
    }
    chars.len()
}

fn skip_block_comment(chars: &[char], start: usize) -> usize {
    let mut i = start;
    while i + 1 < chars.len() {
        if chars[i] == '*' && chars[i + 1] == '/' {
            return i + 2;
        }
        i += 1;
    }
    chars.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> Params {
        Params::new()
            .with("table_name", "users")
            .with("schema_name", "public")
            .with("id", 42)
    }

    #[test]
    fn dollar_style_reuses_indexes() {
        let bound = bind_named(
            "SELECT * FROM t WHERE a = :table_name AND b = :schema_name OR c = :table_name",
            &params(),
            Dialect::Postgres,
        )
        .expect("should bind");

        assert_eq!(bound.sql, "SELECT * FROM t WHERE a = $1 AND b = $2 OR c = $1");
        assert_eq!(bound.values, vec![Value::from("users"), Value::from("public")]);
    }

    #[test]
    fn question_style_binds_every_occurrence() {
        let bound = bind_named("SELECT :id, :id", &params(), Dialect::Sqlite).expect("should bind");

        assert_eq!(bound.sql, "SELECT ?, ?");
        assert_eq!(bound.values, vec![Value::Int(42), Value::Int(42)]);
    }

    #[test]
    fn at_p_and_named_styles() {
        let bound = bind_named("EXEC p @id = :id", &params(), Dialect::MsSql).expect("should bind");
        assert_eq!(bound.sql, "EXEC p @id = @P1");

        let bound = bind_named("BEGIN p(:id); END;", &params(), Dialect::Oracle).expect("should bind");
        assert_eq!(bound.sql, "BEGIN p(:id); END;");
        assert_eq!(bound.names, vec!["id".to_string()]);
    }

    #[test]
    fn literals_comments_and_casts_are_untouched() {
        let sql = "SELECT ':id', \"col:id\", x::text -- :id\n, /* :id */ :id";
        let bound = bind_named(sql, &params(), Dialect::Postgres).expect("should bind");

        assert_eq!(
            bound.sql,
            "SELECT ':id', \"col:id\", x::text -- :id\n, /* :id */ $1"
        );
        assert_eq!(bound.values.len(), 1);
    }

    #[test]
    fn escaped_quotes_stay_inside_literal() {
        let bound = bind_named("SELECT 'it''s :id' , :id", &params(), Dialect::Sqlite)
            .expect("should bind");
        assert_eq!(bound.sql, "SELECT 'it''s :id' , ?");
    }

    #[test]
    fn backslash_is_literal_outside_mysql() {
        let sql = r"SELECT 'C:\' AS p, :id AS id";
        for dialect in [Dialect::Postgres, Dialect::Sqlite, Dialect::MsSql] {
            let bound = bind_named(sql, &params(), dialect).expect("should bind");
            assert_eq!(bound.values, vec![Value::Int(42)], "{:?}", dialect);
        }
        let bound = bind_named(sql, &params(), Dialect::Sqlite).expect("should bind");
        assert_eq!(bound.sql, r"SELECT 'C:\' AS p, ? AS id");
    }

    #[test]
    fn mysql_backslash_escapes_the_quote() {
        let bound = bind_named(r"SELECT 'it\'s :id', :id", &params(), Dialect::MySql).expect("should bind");
        assert_eq!(bound.sql, r"SELECT 'it\'s :id', ?");
        assert_eq!(bound.values, vec![Value::Int(42)]);
    }

    #[test]
    fn missing_value_is_an_error() {
        let err = bind_named("SELECT :nope", &params(), Dialect::Sqlite).unwrap_err();
        assert!(matches!(err, EngineError::MissingParameter { ref name } if name == "nope"));
    }

    #[test]
    fn statement_without_placeholders_passes_through() {
        let bound = bind_named("SELECT 1", &Params::new(), Dialect::Postgres).expect("should bind");
        assert_eq!(bound.sql, "SELECT 1");
        assert!(bound.values.is_empty());
    }

    #[test]
    fn params_collect_from_pairs() {
        let params: Params = vec![("a", 1), ("b", 2)].into_iter().collect();
        assert_eq!(params.len(), 2);
        assert_eq!(params.get("b"), Some(&Value::Int(2)));
    }
}
