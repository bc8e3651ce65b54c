//! Bit-flag sets carried on the wire and in mount state.

use std::fmt;

macro_rules! flag_set {
    (
        $(#[$meta:meta])*
        $name:ident($repr:ty) {
            $( $(#[$fmeta:meta])* $flag:ident = $value:expr => $label:literal, )+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name($repr);

        impl $name {
            pub const EMPTY: Self = Self(0);
            $( $(#[$fmeta])* pub const $flag: Self = Self($value); )+

            #[inline]
            #[must_use]
            pub const fn from_bits(bits: $repr) -> Self {
                Self(bits)
            }

            #[inline]
            #[must_use]
            pub const fn bits(self) -> $repr {
                self.0
            }

            #[inline]
            #[must_use]
            pub const fn is_empty(self) -> bool {
                self.0 == 0
            }

            #[inline]
            #[must_use]
            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            #[inline]
            #[must_use]
            pub const fn intersects(self, other: Self) -> bool {
                self.0 & other.0 != 0
            }

            #[inline]
            #[must_use]
            pub const fn union(self, other: Self) -> Self {
                Self(self.0 | other.0)
            }

            #[inline]
            #[must_use]
            pub const fn difference(self, other: Self) -> Self {
                Self(self.0 & !other.0)
            }

            #[inline]
            pub fn insert(&mut self, other: Self) {
                self.0 |= other.0;
            }

            #[inline]
            pub fn remove(&mut self, other: Self) {
                self.0 &= !other.0;
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self {
                self.union(rhs)
            }
        }

        impl std::ops::BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: Self) {
                self.insert(rhs);
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                if self.is_empty() {
                    return write!(f, "-");
                }
                let mut sep = "";
                $(
                    if self.contains(Self::$flag) {
                        write!(f, "{sep}{}", $label)?;
                        sep = "|";
                    }
                )+
                let _ = sep;
                Ok(())
            }
        }
    };
}

flag_set! {
    /// Directives the server attaches to a lease reply or callout.
    ActionFlags(u32) {
        STALE_INDIRECT = 0x0001 => "STALE_INDIRECT",
        DIRECTIO_ON = 0x0002 => "DIRECTIO_ON",
        SYNC_PAGES = 0x0004 => "SYNC_PAGES",
        INVAL_PAGES = 0x0008 => "INVAL_PAGES",
        /// Request conflicted; wait for a lease notification and retry.
        WAIT_LEASE = 0x0010 => "WAIT_LEASE",
        WAIT_FRLOCK = 0x0020 => "WAIT_FRLOCK",
        SET_SIZE = 0x0040 => "SET_SIZE",
        NOTIFY_FRLOCK = 0x0080 => "NOTIFY_FRLOCK",
        /// Caller becomes the size owner and must push its size.
        FORCE_SIZE = 0x0100 => "FORCE_SIZE",
        ABR_ON = 0x0200 => "ABR_ON",
    }
}

flag_set! {
    /// Per-mount status flags shared by every subsystem of one mount.
    MountStatus(u32) {
        MOUNTED = 0x0001 => "MOUNTED",
        FAILOVER = 0x0002 => "FAILOVER",
        RESYNCING = 0x0004 => "RESYNCING",
        SERVER_DOWN = 0x0008 => "SERVER_DOWN",
        FROZEN = 0x0010 => "FROZEN",
        /// This node currently holds the server role.
        SERVER = 0x0020 => "SERVER",
        /// Operations hold until the server answers again.
        HARD_LOCK = 0x0040 => "HARD_LOCK",
    }
}

flag_set! {
    /// What an open intends to do with the file.
    OpenIntent(u32) {
        WRITE = 0x1 => "WRITE",
        CREATE = 0x2 => "CREATE",
        TRUNCATE = 0x4 => "TRUNCATE",
    }
}

flag_set! {
    /// Mount introduction flags sent with `Mount.init`.
    MountFlags(u32) {
        /// Sender's native order differs from the server's.
        BYTE_SWAP = 0x1 => "BYTE_SWAP",
        MULTIHOST_WRITE = 0x2 => "MULTIHOST_WRITE",
    }
}

/// How a truncate lease was requested.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TruncateKind {
    #[default]
    Truncate = 0,
    Reduce = 1,
    /// Releasing archived data; may proceed while the file is busy.
    Release = 2,
    Purge = 3,
}

impl TruncateKind {
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Truncate),
            1 => Some(Self::Reduce),
            2 => Some(Self::Release),
            3 => Some(Self::Purge),
            _ => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_flags_contains() {
        let actions = ActionFlags::WAIT_LEASE | ActionFlags::DIRECTIO_ON;
        assert!(actions.contains(ActionFlags::WAIT_LEASE));
        assert!(!actions.contains(ActionFlags::INVAL_PAGES));
        assert_eq!(actions.bits(), 0x12);
    }

    #[test]
    fn test_mount_status_display() {
        let status = MountStatus::MOUNTED | MountStatus::FAILOVER;
        assert_eq!(status.to_string(), "MOUNTED|FAILOVER");
        assert_eq!(MountStatus::EMPTY.to_string(), "-");
    }

    #[test]
    fn test_flag_remove() {
        let mut status = MountStatus::MOUNTED | MountStatus::RESYNCING;
        status.remove(MountStatus::RESYNCING);
        assert_eq!(status, MountStatus::MOUNTED);
    }

    #[test]
    fn test_truncate_kind_roundtrip() {
        for kind in [
            TruncateKind::Truncate,
            TruncateKind::Reduce,
            TruncateKind::Release,
            TruncateKind::Purge,
        ] {
            assert_eq!(TruncateKind::from_u8(kind.as_u8()), Some(kind));
        }
        assert_eq!(TruncateKind::from_u8(9), None);
    }
}
