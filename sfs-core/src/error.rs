use crate::lease::LeaseType;
use std::fmt;
use thiserror::Error;

/// Wire error code carried in every reply header.
///
/// Values are Linux errno numbers so they survive a trip through the
/// collaborator layers unchanged. `MOUNT_OUT_OF_SYNC` lives above the errno
/// range and is private to this protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ErrorCode(i32);

impl ErrorCode {
    pub const OK: Self = Self(0);
    pub const NOT_PERMITTED: Self = Self(1);
    pub const NOT_FOUND: Self = Self(2);
    pub const INTERRUPTED: Self = Self(4);
    pub const IO: Self = Self(5);
    pub const TRY_AGAIN: Self = Self(11);
    pub const NO_MEMORY: Self = Self(12);
    /// A non-blocking record lock conflicts with another holder.
    pub const ACCESS: Self = Self(13);
    pub const BUSY: Self = Self(16);
    pub const EXISTS: Self = Self(17);
    /// Server role is not active on the target node yet.
    pub const NOT_MOUNTED: Self = Self(18);
    pub const NOT_DIRECTORY: Self = Self(20);
    pub const INVALID: Self = Self(22);
    pub const NO_SPACE: Self = Self(28);
    pub const BROKEN_PIPE: Self = Self(32);
    pub const NOT_EMPTY: Self = Self(39);
    /// Stale filesystem identity or generation.
    pub const STALE: Self = Self(53);
    pub const TIMEOUT: Self = Self(62);
    pub const CONNECTION_RESET: Self = Self(104);
    pub const NOT_CONNECTED: Self = Self(107);
    pub const QUOTA_EXCEEDED: Self = Self(122);
    pub const CANCELED: Self = Self(125);
    /// The server does not know this client; it must re-introduce itself.
    pub const MOUNT_OUT_OF_SYNC: Self = Self(1001);

    #[inline]
    #[must_use]
    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn as_raw(self) -> i32 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_ok(self) -> bool {
        self.0 == 0
    }

    /// Transport-down errors: the peer is unreachable rather than refusing.
    #[inline]
    #[must_use]
    pub const fn is_connection_loss(self) -> bool {
        matches!(self.0, 32 | 104 | 107)
    }

    #[must_use]
    pub const fn class(self) -> ErrorClass {
        match self.0 {
            0 => ErrorClass::None,
            5 | 11 | 18 | 32 | 62 | 104 | 107 => ErrorClass::TransientTransport,
            53 | 1001 => ErrorClass::ProtocolDesync,
            28 | 122 => ErrorClass::ResourceExhaustion,
            12 => ErrorClass::FatalLocal,
            _ => ErrorClass::Application,
        }
    }

    const fn name(self) -> Option<&'static str> {
        Some(match self.0 {
            0 => "OK",
            1 => "EPERM",
            2 => "ENOENT",
            4 => "EINTR",
            5 => "EIO",
            11 => "EAGAIN",
            12 => "ENOMEM",
            13 => "EACCES",
            16 => "EBUSY",
            17 => "EEXIST",
            18 => "EXDEV",
            20 => "ENOTDIR",
            22 => "EINVAL",
            28 => "ENOSPC",
            32 => "EPIPE",
            39 => "ENOTEMPTY",
            53 => "EBADR",
            62 => "ETIME",
            104 => "ECONNRESET",
            107 => "ENOTCONN",
            122 => "EDQUOT",
            125 => "ECANCELED",
            1001 => "MOUNT_OUT_OF_SYNC",
            _ => return None,
        })
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name}"),
            None => write!(f, "errno {}", self.0),
        }
    }
}

/// Coarse classification that decides who absorbs an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    None,
    /// Retried by the transport until a bounded timeout.
    TransientTransport,
    /// Logged and the single message dropped; the peer recovers by resync.
    ProtocolDesync,
    /// Surfaced to the caller; any doomed lease reservation is removed.
    ResourceExhaustion,
    /// Returned to the immediate caller.
    Application,
    FatalLocal,
}

#[derive(Error, Debug)]
pub enum ShareError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid magic {0:#010x}")]
    InvalidMagic(u32),

    #[error("CRC mismatch: expected {expected:#x}, got {actual:#x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Remote error: {0}")]
    Remote(ErrorCode),

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Interrupted")]
    Interrupted,

    #[error("Stale {ltype} generation: attempted {attempted}, current {current}")]
    StaleGeneration {
        ltype: LeaseType,
        attempted: u32,
        current: u32,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ShareError {
    /// Error code to place on the wire when this error answers a request.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Io(_) | Self::Internal(_) => ErrorCode::IO,
            Self::InvalidMagic(_) | Self::CrcMismatch { .. } | Self::Protocol(_) => {
                ErrorCode::INVALID
            },
            Self::Config(_) => ErrorCode::INVALID,
            Self::Remote(code) => *code,
            Self::Timeout(_) => ErrorCode::TIMEOUT,
            Self::Interrupted => ErrorCode::INTERRUPTED,
            Self::StaleGeneration { .. } => ErrorCode::STALE,
            Self::NotFound(_) => ErrorCode::NOT_FOUND,
        }
    }

    #[must_use]
    pub fn class(&self) -> ErrorClass {
        self.code().class()
    }
}

impl From<ErrorCode> for ShareError {
    fn from(code: ErrorCode) -> Self {
        Self::Remote(code)
    }
}

pub type Result<T> = std::result::Result<T, ShareError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_classes() {
        assert_eq!(ErrorCode::OK.class(), ErrorClass::None);
        assert_eq!(
            ErrorCode::CONNECTION_RESET.class(),
            ErrorClass::TransientTransport
        );
        assert_eq!(
            ErrorCode::MOUNT_OUT_OF_SYNC.class(),
            ErrorClass::ProtocolDesync
        );
        assert_eq!(
            ErrorCode::QUOTA_EXCEEDED.class(),
            ErrorClass::ResourceExhaustion
        );
        assert_eq!(ErrorCode::EXISTS.class(), ErrorClass::Application);
    }

    #[test]
    fn test_connection_loss() {
        assert!(ErrorCode::NOT_CONNECTED.is_connection_loss());
        assert!(ErrorCode::BROKEN_PIPE.is_connection_loss());
        assert!(!ErrorCode::TIMEOUT.is_connection_loss());
    }

    #[test]
    fn test_error_code_display() {
        assert_eq!(ErrorCode::NOT_MOUNTED.to_string(), "EXDEV");
        assert_eq!(ErrorCode::from_raw(9999).to_string(), "errno 9999");
    }

    #[test]
    fn test_share_error_code() {
        let err = ShareError::Timeout("reply");
        assert_eq!(err.code(), ErrorCode::TIMEOUT);
        let err: ShareError = ErrorCode::NO_SPACE.into();
        assert_eq!(err.class(), ErrorClass::ResourceExhaustion);
    }
}
