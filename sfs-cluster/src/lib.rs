#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![allow(clippy::module_name_repetitions)]

mod client_table;
mod dispatch;
mod mount;
mod namespace;
mod session;

pub use client_table::{Admission, ClientEntry, ClientTable, EntryState, OutstandingEntry, OutstandingQueue};
pub use dispatch::{ServerConfig, ServerDispatcher};
pub use mount::{FailoverPhase, MountState};
pub use namespace::{MemoryNamespace, Namespace, ROOT_MODE, SYMLINK_MODE, is_dir};
pub use session::{
    ClientRegistry, SESSION_QUEUE, SessionConfig, serve_connection, serve_connection_with,
};
