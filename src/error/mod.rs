//! Error types for the gatekeeper.
//!
//! Uses `thiserror` for ergonomic error definitions with automatic `From` conversions.
//! [`GatekeeperError`] is the caller-facing taxonomy; every variant maps to a
//! stable outcome code that is also written to the audit trail.

use crate::security::ReasonCode;
use std::borrow::Cow;
use std::time::Duration;
use thiserror::Error;

/// Umbrella error type for the server surfaces (protocol, tools, startup).
#[derive(Debug, Error)]
pub enum McpError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("{0}")]
    Gatekeeper(#[from] GatekeeperError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {message}")]
    Internal { message: Cow<'static, str> },
}

/// JSON-RPC 2.0 and MCP protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Parse error: invalid JSON")]
    ParseError,

    #[error("Invalid request: {0}")]
    InvalidRequest(Cow<'static, str>),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Invalid params: {0}")]
    InvalidParams(Cow<'static, str>),

    #[error("Internal error: {0}")]
    InternalError(Cow<'static, str>),

    /// A gatekeeper operation behind a protocol method refused the request.
    #[error("{0}")]
    Refused(GatekeeperError),
}

impl ProtocolError {
    /// Returns the JSON-RPC 2.0 error code.
    pub fn code(&self) -> i32 {
        match self {
            Self::ParseError => -32700,
            Self::InvalidRequest(_) => -32600,
            Self::MethodNotFound(_) => -32601,
            Self::InvalidParams(_) => -32602,
            Self::InternalError(_) => -32603,
            Self::Refused(_) => -32000,
        }
    }
}

/// Failures raised by the pool and the database driver.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection pool exhausted after waiting {0:?}")]
    PoolExhausted(Duration),

    #[error("Query execution failed: {0}")]
    QueryFailed(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Query timeout after {0}ms")]
    Timeout(u64),

    #[error("Table not found or not accessible: {0}")]
    TableNotFound(String),

    #[error("PostgreSQL error: {0}")]
    Postgres(String),
}

impl DatabaseError {
    /// The session itself is gone, as opposed to the statement failing.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, Self::ConnectionLost(_) | Self::ConnectionFailed(_))
    }
}

/// Caller-facing error taxonomy of the gatekeeper operations.
#[derive(Debug, Clone, Error)]
pub enum GatekeeperError {
    #[error("Invalid limit: {0}. Limit must be a non-negative integer")]
    InvalidLimit(String),

    #[error("Statement rejected: {0}")]
    Validation(ReasonCode),

    #[error("Rate limit exceeded. Try again in {} seconds", retry_after.as_secs().max(1))]
    RateLimited { retry_after: Duration },

    #[error("No database connection available after {}ms", waited.as_millis())]
    PoolExhausted { waited: Duration },

    #[error("Query exceeded the {}ms timeout and was cancelled", timeout.as_millis())]
    QueryTimeout { timeout: Duration },

    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),
}

impl GatekeeperError {
    /// Stable machine-readable outcome code, shared with the audit trail.
    pub fn code(&self) -> Cow<'static, str> {
        match self {
            Self::InvalidLimit(_) => "INVALID_LIMIT".into(),
            Self::Validation(reason) => format!("REJECTED:{}", reason.as_str()).into(),
            Self::RateLimited { .. } => "RATE_LIMITED".into(),
            Self::PoolExhausted { .. } => "POOL_EXHAUSTED".into(),
            Self::QueryTimeout { .. } => "QUERY_TIMEOUT".into(),
            Self::Execution(_) => "EXECUTION_ERROR".into(),
            Self::InvalidArguments(_) => "INVALID_ARGUMENTS".into(),
        }
    }

    /// Temporary conditions the caller may retry (with backoff).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::PoolExhausted { .. })
    }

    /// Rejections and rate limits are logged on the security target.
    pub fn is_security_event(&self) -> bool {
        matches!(
            self,
            Self::InvalidLimit(_)
                | Self::InvalidArguments(_)
                | Self::Validation(_)
                | Self::RateLimited { .. }
        )
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

impl From<DatabaseError> for GatekeeperError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::PoolExhausted(waited) => Self::PoolExhausted { waited },
            DatabaseError::Timeout(ms) => Self::QueryTimeout {
                timeout: Duration::from_millis(ms),
            },
            other => Self::Execution(other.to_string()),
        }
    }
}

/// Configuration errors. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required field: {0}")]
    MissingField(Cow<'static, str>),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue {
        field: Cow<'static, str>,
        message: Cow<'static, str>,
    },

    #[error("Invalid database URL: {0}")]
    InvalidDatabaseUrl(String),
}

/// Tool execution errors.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),
}

/// Result type alias for McpError.
pub type Result<T> = std::result::Result<T, McpError>;

/// Result type alias for DatabaseError.
pub type DbResult<T> = std::result::Result<T, DatabaseError>;

/// Result type alias for ProtocolError.
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;

/// Result type alias for ConfigError.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_codes() {
        assert_eq!(ProtocolError::ParseError.code(), -32700);
        assert_eq!(ProtocolError::MethodNotFound("test".into()).code(), -32601);
        assert_eq!(ProtocolError::InvalidParams("test".into()).code(), -32602);
        let refused = ProtocolError::Refused(GatekeeperError::PoolExhausted {
            waited: Duration::from_millis(5),
        });
        assert_eq!(refused.code(), -32000);
    }

    #[test]
    fn test_gatekeeper_codes() {
        assert_eq!(
            GatekeeperError::Validation(ReasonCode::ForbiddenKeyword).code(),
            "REJECTED:FORBIDDEN_KEYWORD"
        );
        assert_eq!(GatekeeperError::InvalidLimit("-1".into()).code(), "INVALID_LIMIT");
        let malformed = GatekeeperError::InvalidArguments("missing field `query`".into());
        assert_eq!(malformed.code(), "INVALID_ARGUMENTS");
        assert!(malformed.is_security_event());
        assert_eq!(
            GatekeeperError::QueryTimeout {
                timeout: Duration::from_secs(1)
            }
            .code(),
            "QUERY_TIMEOUT"
        );
    }

    #[test]
    fn test_database_error_conversion() {
        let err: GatekeeperError = DatabaseError::PoolExhausted(Duration::from_millis(50)).into();
        assert!(matches!(err, GatekeeperError::PoolExhausted { .. }));
        assert!(err.is_retryable());

        let err: GatekeeperError = DatabaseError::Timeout(250).into();
        assert_eq!(err.code(), "QUERY_TIMEOUT");

        let err: GatekeeperError = DatabaseError::QueryFailed("relation does not exist".into()).into();
        assert_eq!(err.code(), "EXECUTION_ERROR");
        assert!(!err.is_security_event());
    }

    #[test]
    fn test_connection_loss() {
        assert!(DatabaseError::ConnectionLost("eof".into()).is_connection_loss());
        assert!(!DatabaseError::QueryFailed("syntax".into()).is_connection_loss());
        assert!(!DatabaseError::Timeout(10).is_connection_loss());
    }

    #[test]
    fn test_error_conversion() {
        let err: McpError = DatabaseError::ConnectionFailed("test".into()).into();
        assert!(matches!(err, McpError::Database(_)));
    }
}
