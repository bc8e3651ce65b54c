#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]

mod checksum;
mod error;
mod flags;
mod inode;
mod lease;
mod policy;
mod seqno;
mod wait;

pub use checksum::payload_crc;
pub use error::{ErrorClass, ErrorCode, Result, ShareError};
pub use flags::{ActionFlags, MountFlags, MountStatus, OpenIntent, TruncateKind};
pub use inode::{FsStats, InodeSnapshot};
pub use lease::{FileId, Generation, GenerationSet, LeaseMask, LeaseType};
pub use policy::LeasePolicy;
pub use seqno::Seqno;
pub use wait::WaitMode;

/// Byte-order tag at the start of every message header.
pub const SFS_MAGIC: u32 = 0x0102_0304;
/// Number of distinct lease types; one mask bit each.
pub const MAX_LEASE_TYPES: usize = 10;
/// Server ordinal meaning "no server known".
pub const NO_SERVER: u32 = 0;

/// Cluster-wide ordinal identifying a client node.
pub type ClientOrd = u32;
