//! Errors.

use std::io;

use uuid::Uuid;

/// Stable numeric error code carried on every `ErrorResponse` frame.
///
/// The numeric space is hierarchical: the high bytes select the error
/// class, so clients may match on prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode(pub u32);

impl ErrorCode {
    pub const INTERNAL_SERVER_ERROR: ErrorCode = ErrorCode(0x_01_00_00_00);
    pub const UNSUPPORTED_FEATURE: ErrorCode = ErrorCode(0x_02_00_00_00);
    pub const PROTOCOL: ErrorCode = ErrorCode(0x_03_00_00_00);
    pub const BINARY_PROTOCOL: ErrorCode = ErrorCode(0x_03_01_00_00);
    pub const UNSUPPORTED_PROTOCOL_VERSION: ErrorCode = ErrorCode(0x_03_01_00_01);
    pub const UNEXPECTED_MESSAGE: ErrorCode = ErrorCode(0x_03_01_00_03);
    pub const INPUT_DATA: ErrorCode = ErrorCode(0x_03_02_00_00);
    pub const PARAMETER_TYPE_MISMATCH: ErrorCode = ErrorCode(0x_03_02_01_00);
    pub const STATE_MISMATCH: ErrorCode = ErrorCode(0x_03_02_02_00);
    pub const CAPABILITY: ErrorCode = ErrorCode(0x_03_04_00_00);
    pub const UNSUPPORTED_CAPABILITY: ErrorCode = ErrorCode(0x_03_04_01_00);
    pub const DISABLED_CAPABILITY: ErrorCode = ErrorCode(0x_03_04_02_00);
    pub const QUERY: ErrorCode = ErrorCode(0x_04_00_00_00);
    pub const INVALID_SYNTAX: ErrorCode = ErrorCode(0x_04_01_00_00);
    pub const IDLE_SESSION_TIMEOUT: ErrorCode = ErrorCode(0x_04_06_01_00);
    pub const QUERY_TIMEOUT: ErrorCode = ErrorCode(0x_04_06_02_00);
    pub const IDLE_TRANSACTION_TIMEOUT: ErrorCode = ErrorCode(0x_04_06_0A_01);
    pub const EXECUTION: ErrorCode = ErrorCode(0x_05_00_00_00);
    pub const TRANSACTION: ErrorCode = ErrorCode(0x_05_03_00_00);
    pub const CONFIGURATION: ErrorCode = ErrorCode(0x_06_00_00_00);
    pub const AUTHENTICATION: ErrorCode = ErrorCode(0x_07_01_00_00);
    pub const AVAILABILITY: ErrorCode = ErrorCode(0x_08_00_00_00);
    pub const BACKEND_UNAVAILABLE: ErrorCode = ErrorCode(0x_08_00_00_01);
    pub const BACKEND: ErrorCode = ErrorCode(0x_09_00_00_00);

    pub fn name(&self) -> &'static str {
        match *self {
            ErrorCode::INTERNAL_SERVER_ERROR => "InternalServerError",
            ErrorCode::UNSUPPORTED_FEATURE => "UnsupportedFeatureError",
            ErrorCode::PROTOCOL => "ProtocolError",
            ErrorCode::BINARY_PROTOCOL => "BinaryProtocolError",
            ErrorCode::UNSUPPORTED_PROTOCOL_VERSION => "UnsupportedProtocolVersionError",
            ErrorCode::UNEXPECTED_MESSAGE => "UnexpectedMessageError",
            ErrorCode::INPUT_DATA => "InputDataError",
            ErrorCode::PARAMETER_TYPE_MISMATCH => "ParameterTypeMismatchError",
            ErrorCode::STATE_MISMATCH => "StateMismatchError",
            ErrorCode::CAPABILITY => "CapabilityError",
            ErrorCode::UNSUPPORTED_CAPABILITY => "UnsupportedCapabilityError",
            ErrorCode::DISABLED_CAPABILITY => "DisabledCapabilityError",
            ErrorCode::QUERY => "QueryError",
            ErrorCode::INVALID_SYNTAX => "InvalidSyntaxError",
            ErrorCode::IDLE_SESSION_TIMEOUT => "IdleSessionTimeoutError",
            ErrorCode::QUERY_TIMEOUT => "QueryTimeoutError",
            ErrorCode::IDLE_TRANSACTION_TIMEOUT => "IdleTransactionTimeoutError",
            ErrorCode::EXECUTION => "ExecutionError",
            ErrorCode::TRANSACTION => "TransactionError",
            ErrorCode::CONFIGURATION => "ConfigurationError",
            ErrorCode::AUTHENTICATION => "AuthenticationError",
            ErrorCode::AVAILABILITY => "AvailabilityError",
            ErrorCode::BACKEND_UNAVAILABLE => "BackendUnavailableError",
            ErrorCode::BACKEND => "BackendError",
            _ => "Error",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (0x{:08X})", self.name(), self.0)
    }
}

/// Severity byte on `ErrorResponse`.
pub const SEVERITY_ERROR: u8 = 120;
pub const SEVERITY_FATAL: u8 = 200;
pub const SEVERITY_PANIC: u8 = 255;

/// Well-known `ErrorResponse` attribute field codes.
pub const ATTR_HINT: u16 = 0x0001;
pub const ATTR_DETAILS: u16 = 0x0002;
pub const ATTR_LINE_START: u16 = 0xFFF3;
pub const ATTR_COLUMN_START: u16 = 0xFFF4;

/// Framing-level errors from the wire codec.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("bad frame: declared length {len} outside [4, {max}]")]
    BadFrame { len: u32, max: u32 },
    #[error("stream ended in the middle of a frame")]
    Truncated,
}

/// Protocol-level errors: well-framed bytes that do not form a valid message
/// or arrive in the wrong session state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown message tag 0x{0:02x}")]
    UnknownMessageTag(u8),
    #[error("unexpected {got} message while expecting {expected}")]
    UnexpectedMessage { expected: &'static str, got: char },
    #[error("unsupported protocol version {major}.{minor}")]
    UnsupportedVersion { major: u16, minor: u16 },
    #[error("malformed {message} message: {detail}")]
    Malformed {
        message: &'static str,
        detail: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("authentication failed for user {0:?}")]
    Failed(String),
    #[error("unsupported authentication method {0:?}")]
    UnsupportedMethod(String),
    #[error("branch {0:?} is not available on this instance")]
    UnknownBranch(String),
    #[error("SASL exchange failed: {0}")]
    Sasl(String),
}

/// A compile-time query error, as reported by the compiler gateway.
///
/// Cloneable so that coalesced cache lookups can all observe the same
/// failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct QueryError {
    pub code: ErrorCode,
    pub message: String,
    pub line: Option<u32>,
    pub col: Option<u32>,
}

impl QueryError {
    pub fn new(message: impl Into<String>) -> QueryError {
        QueryError {
            code: ErrorCode::QUERY,
            message: message.into(),
            line: None,
            col: None,
        }
    }

    pub fn syntax(message: impl Into<String>, line: u32, col: u32) -> QueryError {
        QueryError {
            code: ErrorCode::INVALID_SYNTAX,
            message: message.into(),
            line: Some(line),
            col: Some(col),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("query requires capabilities the session does not allow: {required:#x} & !{allowed:#x}")]
pub struct CapabilityError {
    pub required: u64,
    pub allowed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransactionError {
    #[error("current transaction is aborted, commands ignored until ROLLBACK")]
    InFailedTransaction,
    #[error("START TRANSACTION inside an open transaction")]
    AlreadyInTransaction,
    #[error("{0} outside a transaction")]
    NotInTransaction(&'static str),
}

/// Errors originating from the physical backend connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("backend rejected command [{}]: {message}", .sqlstate.as_deref().unwrap_or("XX000"))]
    Rejected {
        sqlstate: Option<String>,
        message: String,
    },
    #[error("backend connection lost: {0}")]
    Disconnected(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

impl BackendError {
    /// Well-known sqlstates describing query-level failures are upgraded to
    /// `QueryError` before reaching the client.
    pub fn as_query_error(&self) -> Option<QueryError> {
        match self {
            BackendError::Rejected {
                sqlstate: Some(state),
                message,
            } if state.starts_with("42") || state.starts_with("22") => Some(QueryError {
                code: ErrorCode::EXECUTION,
                message: message.clone(),
                line: None,
                col: None,
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("timed out waiting for a backend connection")]
    Timeout,
    #[error("no backend connection available and none can be created")]
    Exhausted,
    #[error("acquire cancelled")]
    Cancelled,
    #[error("pool is shut down")]
    Closed,
    #[error(transparent)]
    Backend(#[from] BackendError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("state descriptor mismatch: client sent {got}, server expects {expected}")]
    Mismatch { expected: Uuid, got: Uuid },
    #[error("malformed state data: {0}")]
    Malformed(&'static str),
}

/// Various errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("socket error occurred: {0}")]
    Socket(#[from] io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error(transparent)]
    Capability(#[from] CapabilityError),
    #[error(transparent)]
    Transaction(#[from] TransactionError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error("bad configuration: {0}")]
    BadConfig(String),
    #[error("feature not supported: {0}")]
    Unsupported(&'static str),
    #[error("session idle timeout")]
    SessionIdleTimeout,
    #[error("idle transaction timeout")]
    IdleTransactionTimeout,
    #[error("query execution timeout")]
    QueryTimeout,
    #[error("shutting down")]
    ShuttingDown,
    #[error("data directory is locked by another running instance: {0}")]
    DataDirLocked(String),
    #[error("internal server error: {0}")]
    Internal(String),
}

impl Error {
    /// The wire error code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Socket(_) => ErrorCode::AVAILABILITY,
            Error::Frame(_) => ErrorCode::BINARY_PROTOCOL,
            Error::Protocol(ProtocolError::UnsupportedVersion { .. }) => {
                ErrorCode::UNSUPPORTED_PROTOCOL_VERSION
            }
            Error::Protocol(ProtocolError::UnexpectedMessage { .. }) => {
                ErrorCode::UNEXPECTED_MESSAGE
            }
            Error::Protocol(_) => ErrorCode::PROTOCOL,
            Error::Auth(_) => ErrorCode::AUTHENTICATION,
            Error::Query(e) => e.code,
            Error::Capability(_) => ErrorCode::DISABLED_CAPABILITY,
            Error::Transaction(_) => ErrorCode::TRANSACTION,
            Error::Backend(BackendError::Unavailable(_)) => ErrorCode::BACKEND_UNAVAILABLE,
            Error::Backend(_) => ErrorCode::BACKEND,
            Error::Pool(PoolError::Backend(_)) => ErrorCode::BACKEND_UNAVAILABLE,
            Error::Pool(_) => ErrorCode::AVAILABILITY,
            Error::State(_) => ErrorCode::STATE_MISMATCH,
            Error::BadConfig(_) => ErrorCode::CONFIGURATION,
            Error::Unsupported(_) => ErrorCode::UNSUPPORTED_FEATURE,
            Error::SessionIdleTimeout => ErrorCode::IDLE_SESSION_TIMEOUT,
            Error::IdleTransactionTimeout => ErrorCode::IDLE_TRANSACTION_TIMEOUT,
            Error::QueryTimeout => ErrorCode::QUERY_TIMEOUT,
            Error::ShuttingDown => ErrorCode::AVAILABILITY,
            Error::DataDirLocked(_) => ErrorCode::AVAILABILITY,
            Error::Internal(_) => ErrorCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Severity of the corresponding `ErrorResponse`.
    pub fn severity(&self) -> u8 {
        match self {
            Error::Frame(_)
            | Error::Protocol(_)
            | Error::Auth(_)
            | Error::SessionIdleTimeout
            | Error::ShuttingDown
            | Error::Internal(_) => SEVERITY_FATAL,
            _ => SEVERITY_ERROR,
        }
    }

    /// Whether the session must be closed after reporting this error.
    pub fn is_fatal(&self) -> bool {
        self.severity() >= SEVERITY_FATAL
    }

    /// Attribute pairs for the `ErrorResponse` frame.
    pub fn attributes(&self) -> Vec<(u16, String)> {
        match self {
            Error::Query(e) => {
                let mut attrs = Vec::new();
                if let Some(line) = e.line {
                    attrs.push((ATTR_LINE_START, line.to_string()));
                }
                if let Some(col) = e.col {
                    attrs.push((ATTR_COLUMN_START, col.to_string()));
                }
                attrs
            }
            Error::Transaction(TransactionError::InFailedTransaction) => vec![(
                ATTR_HINT,
                "issue ROLLBACK, then retry the command".to_string(),
            )],
            _ => Vec::new(),
        }
    }
}
