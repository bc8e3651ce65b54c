//! Client side of the sfs lease protocol.
//!
//! [`ClientTransport`] delivers requests to the current server with
//! at-most-once semantics, retransmitting across lost connections and
//! holding back ordinary traffic while a failover is in progress.
//! [`ClientLeases`] sits on top of it and caches the leases this mount holds.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![allow(clippy::module_name_repetitions)]

mod config;
mod error;
mod leases;
mod pending;
mod transport;

pub use config::{ClientConfig, TransportConfig};
pub use error::{ClientError, Result};
pub use leases::{ClientLeases, HeldLeases};
pub use pending::{PendingRequest, PendingRequests, SliceOutcome};
pub use transport::{AsyncStream, BoxStream, ClientTransport, Connector};
