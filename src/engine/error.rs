//! Engine errors
//!
//! A single error enum shared by every driver. Variants are grouped into
//! four kinds (connection, query, transaction, configuration) so callers can
//! react to the category without matching every variant.

use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

/// Broad category of an [`EngineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connection,
    Query,
    Transaction,
    Config,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Authentication failed: {message}")]
    AuthFailed { message: String },

    #[error("Not connected to database")]
    NotConnected,

    #[error("SSH tunnel error: {message}")]
    SshError { message: String },

    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Driver not found: {driver}")]
    DriverNotFound { driver: String },

    #[error("Session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("Error executing query: {message}")]
    ExecutionError { message: String },

    #[error("Syntax error: {message}")]
    SyntaxError { message: String },

    #[error("Missing value for query parameter :{name}")]
    MissingParameter { name: String },

    #[error("{message}")]
    TransactionError {
        message: String,
        #[source]
        source: Option<Box<EngineError>>,
    },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("{message}")]
    InvalidIdentifier { message: String },

    #[error("Not supported: {message}")]
    NotSupported { message: String },
}

impl EngineError {
    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            message: message.into(),
        }
    }

    pub fn auth_failed(message: impl Into<String>) -> Self {
        Self::AuthFailed {
            message: message.into(),
        }
    }

    pub fn ssh_error(message: impl Into<String>) -> Self {
        Self::SshError {
            message: message.into(),
        }
    }

    pub fn driver_not_found(driver: impl Into<String>) -> Self {
        Self::DriverNotFound {
            driver: driver.into(),
        }
    }

    pub fn session_not_found(session_id: impl Into<String>) -> Self {
        Self::SessionNotFound {
            session_id: session_id.into(),
        }
    }

    pub fn execution_error(message: impl Into<String>) -> Self {
        Self::ExecutionError {
            message: message.into(),
        }
    }

    pub fn syntax_error(message: impl Into<String>) -> Self {
        Self::SyntaxError {
            message: message.into(),
        }
    }

    pub fn transaction_error(message: impl Into<String>) -> Self {
        Self::TransactionError {
            message: message.into(),
            source: None,
        }
    }

    /// Wraps a failure that aborted a transaction.
    pub fn transaction_failed(context: &str, cause: EngineError) -> Self {
        Self::TransactionError {
            message: format!("{}: {}", context, cause),
            source: Some(Box::new(cause)),
        }
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    pub fn invalid_identifier(message: impl Into<String>) -> Self {
        Self::InvalidIdentifier {
            message: message.into(),
        }
    }

    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::NotSupported {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConnectionFailed { .. }
            | Self::AuthFailed { .. }
            | Self::NotConnected
            | Self::SshError { .. }
            | Self::Timeout { .. }
            | Self::DriverNotFound { .. }
            | Self::SessionNotFound { .. } => ErrorKind::Connection,
            Self::ExecutionError { .. }
            | Self::SyntaxError { .. }
            | Self::MissingParameter { .. } => ErrorKind::Query,
            Self::TransactionError { .. } => ErrorKind::Transaction,
            Self::InvalidConfig { .. }
            | Self::InvalidIdentifier { .. }
            | Self::NotSupported { .. } => ErrorKind::Config,
        }
    }

    pub fn is_connection_error(&self) -> bool {
        self.kind() == ErrorKind::Connection
    }

    pub fn is_query_error(&self) -> bool {
        self.kind() == ErrorKind::Query
    }

    pub fn is_transaction_error(&self) -> bool {
        self.kind() == ErrorKind::Transaction
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn kinds_follow_error_category() {
        assert_eq!(EngineError::NotConnected.kind(), ErrorKind::Connection);
        assert_eq!(EngineError::Timeout { timeout_ms: 5 }.kind(), ErrorKind::Connection);
        assert_eq!(EngineError::syntax_error("x").kind(), ErrorKind::Query);
        assert_eq!(
            EngineError::MissingParameter { name: "id".into() }.kind(),
            ErrorKind::Query
        );
        assert_eq!(EngineError::transaction_error("x").kind(), ErrorKind::Transaction);
        assert_eq!(EngineError::invalid_identifier("x").kind(), ErrorKind::Config);
    }

    #[test]
    fn transaction_failed_keeps_cause_as_source() {
        let err = EngineError::transaction_failed(
            "Transaction failed",
            EngineError::execution_error("duplicate key"),
        );

        assert!(err.is_transaction_error());
        assert_eq!(
            err.to_string(),
            "Transaction failed: Error executing query: duplicate key"
        );
        let source = err.source().expect("source should be kept");
        assert_eq!(source.to_string(), "Error executing query: duplicate key");
    }

    #[test]
    fn not_connected_message_matches_callers_expectation() {
        assert_eq!(EngineError::NotConnected.to_string(), "Not connected to database");
    }
}
