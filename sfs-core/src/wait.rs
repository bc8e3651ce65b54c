/// How the sender of a message waits for its reply.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaitMode {
    /// Block with a single bounded timeout; no retransmission.
    WaitOnce = 1,
    /// Block for the reply and retransmit on failure.
    Wait = 2,
    /// No reply is expected at all.
    NoThread = 3,
    /// Fire and forget; a reply may arrive but is discarded.
    NoWait = 4,
}

impl WaitMode {
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::WaitOnce),
            2 => Some(Self::Wait),
            3 => Some(Self::NoThread),
            4 => Some(Self::NoWait),
            _ => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// The caller blocks until a reply or a timeout.
    #[inline]
    #[must_use]
    pub const fn blocks(self) -> bool {
        matches!(self, Self::WaitOnce | Self::Wait)
    }

    /// The server answers this message.
    #[inline]
    #[must_use]
    pub const fn expects_reply(self) -> bool {
        self.blocks()
    }
}

impl std::fmt::Display for WaitMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WaitOnce => write!(f, "WAIT_ONCE"),
            Self::Wait => write!(f, "WAIT"),
            Self::NoThread => write!(f, "NO_THREAD"),
            Self::NoWait => write!(f, "NO_WAIT"),
        }
    }
}
