//! Database drivers
//!
//! Postgres, MySQL and SQLite run on sqlx and are always built. SQL Server
//! (`mssql` feature) and Oracle (`oracle` feature) need extra client stacks.

pub mod mysql;
pub mod postgres;
pub mod sqlite;

#[cfg(feature = "mssql")]
pub mod mssql;

#[cfg(feature = "oracle")]
pub mod oracle;

use std::time::Instant;

use crate::engine::error::EngineError;

/// Milliseconds since `start`, with microsecond precision
pub(crate) fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_micros() as f64 / 1000.0
}

/// Maps a driver error message to a syntax or execution error
pub(crate) fn statement_error(message: String, syntax_markers: &[&str]) -> EngineError {
    let lower = message.to_ascii_lowercase();
    if syntax_markers.iter().any(|marker| lower.contains(marker)) {
        tracing::warn!(error = %message, "syntax error");
        EngineError::syntax_error(message)
    } else {
        tracing::error!(error = %message, "statement failed");
        EngineError::execution_error(message)
    }
}
