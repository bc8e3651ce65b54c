use sfs_core::{ErrorCode, FileId, ShareError};
use std::fmt;

/// Errors surfaced to callers of the client transport and lease cache.
#[derive(Debug)]
pub enum ClientError {
    /// Failed to establish a connection to the server
    ConnectionFailed(std::io::Error),
    /// Connection was closed while a reply was outstanding
    ConnectionClosed,
    /// I/O error during communication
    IoError(std::io::Error),
    /// Malformed or unexpected message
    ProtocolError(String),
    /// No reply within the allowed time (`ETIME`)
    Timeout,
    /// A waited-for lease was not granted in time
    LeaseTimeout(FileId),
    /// The mount is frozen for failover; retry once it thaws
    Frozen,
    /// The operation was cancelled before it completed
    Interrupted,
    /// The server answered with an error
    Remote(ErrorCode),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionFailed(e) => write!(f, "Connection failed: {}", e),
            Self::ConnectionClosed => write!(f, "Connection closed by server"),
            Self::IoError(e) => write!(f, "I/O error: {}", e),
            Self::ProtocolError(msg) => write!(f, "Protocol error: {}", msg),
            Self::Timeout => write!(f, "Operation timed out"),
            Self::LeaseTimeout(ino) => write!(f, "Timed out waiting for a lease on {}", ino),
            Self::Frozen => write!(f, "Mount frozen for failover"),
            Self::Interrupted => write!(f, "Interrupted"),
            Self::Remote(code) => write!(f, "Server error: {}", code),
        }
    }
}

impl ClientError {
    /// Returns true if this error is transient and the operation may be
    /// retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ConnectionClosed | Self::ConnectionFailed(_) | Self::IoError(_) => true,
            Self::Timeout | Self::Frozen => true,
            Self::Remote(code) => {
                code.is_connection_loss()
                    || matches!(*code, ErrorCode::TRY_AGAIN | ErrorCode::NOT_MOUNTED)
            },
            // Non-retryable: ProtocolError, LeaseTimeout, Interrupted
            _ => false,
        }
    }

    /// Error code reported to the caller of a file operation.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::ConnectionFailed(_) | Self::ConnectionClosed => ErrorCode::NOT_CONNECTED,
            Self::IoError(_) => ErrorCode::IO,
            Self::ProtocolError(_) => ErrorCode::INVALID,
            Self::Timeout | Self::LeaseTimeout(_) => ErrorCode::TIMEOUT,
            Self::Frozen => ErrorCode::TRY_AGAIN,
            Self::Interrupted => ErrorCode::INTERRUPTED,
            Self::Remote(code) => *code,
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ConnectionFailed(e) | Self::IoError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err)
    }
}

impl From<ShareError> for ClientError {
    fn from(err: ShareError) -> Self {
        match err {
            ShareError::Io(e) => Self::IoError(e),
            ShareError::Remote(code) => Self::Remote(code),
            ShareError::Timeout(_) => Self::Timeout,
            ShareError::Interrupted => Self::Interrupted,
            other => Self::ProtocolError(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ClientError::ConnectionClosed.is_retryable());
        assert!(ClientError::Remote(ErrorCode::NOT_MOUNTED).is_retryable());
        assert!(ClientError::Remote(ErrorCode::CONNECTION_RESET).is_retryable());
        assert!(!ClientError::Remote(ErrorCode::NOT_FOUND).is_retryable());
        assert!(!ClientError::LeaseTimeout(FileId(1)).is_retryable());
    }

    #[test]
    fn test_lease_timeout_distinct_from_denial() {
        assert_eq!(ClientError::LeaseTimeout(FileId(3)).code(), ErrorCode::TIMEOUT);
        assert_eq!(
            ClientError::Remote(ErrorCode::NOT_PERMITTED).code(),
            ErrorCode::NOT_PERMITTED
        );
    }

    #[test]
    fn test_from_share_error() {
        let err: ClientError = ShareError::Timeout("reply").into();
        assert!(matches!(err, ClientError::Timeout));
        let err: ClientError = ShareError::Remote(ErrorCode::STALE).into();
        assert!(matches!(err, ClientError::Remote(ErrorCode::STALE)));
    }
}
