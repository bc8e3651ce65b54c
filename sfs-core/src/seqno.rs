//! Message sequence numbers.
//!
//! Sequence numbers are 32-bit and wrap. Zero is reserved to mean "no
//! sequence number" (an ack of zero carries no acknowledgment), so the
//! successor of `u32::MAX` is 1.

/// Per-(client, mount) request number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Seqno(u32);

impl Seqno {
    pub const NONE: Self = Self(0);

    #[inline]
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Next sequence number, skipping zero on wrap.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        match self.0.wrapping_add(1) {
            0 => Self(1),
            n => Self(n),
        }
    }

    /// True when `self` was issued after `other`, modulo wrap.
    #[inline]
    #[must_use]
    pub const fn is_later_than(self, other: Self) -> bool {
        (self.0.wrapping_sub(other.0) as i32) > 0
    }

    /// True when `self` was issued before `other`, modulo wrap.
    #[inline]
    #[must_use]
    pub const fn is_earlier_than(self, other: Self) -> bool {
        other.is_later_than(self)
    }
}

impl std::fmt::Display for Seqno {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
