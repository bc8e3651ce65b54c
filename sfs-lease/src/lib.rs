#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![allow(clippy::module_name_repetitions)]

mod conflict;
mod frlock;
mod manager;
mod reclaim;
mod record;
mod store;
mod table;

pub use conflict::{ConflictInput, Decision, evaluate};
pub use frlock::{FrlockOutcome, RecordLocks};
pub use manager::{LeaseConfig, LeaseManager, LeaseOutcome};
pub use record::{LeaseRecord, LeaseState};
pub use store::{
    ArchiveEvent, ArchiveHook, InodePin, InodeStore, LeaseEvents, MemoryInodeStore, NoArchive,
};
pub use table::LeaseTable;
