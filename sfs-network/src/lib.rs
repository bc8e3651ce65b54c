#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![allow(clippy::module_name_repetitions)]

mod codec;
mod connection;
mod frame;
mod message;
mod protocol;

pub use codec::{ByteOrder, WireReader, WireWriter};
pub use connection::ConnectionBuffer;
pub use frame::{encode_message, parse_message};
pub use message::{
    BlockReply, BlockRequest, Callout, InodeRequest, LeaseArgs, LeaseReply, LeaseRequest,
    LockKind, Message, MountReply, MountRequest, NameReply, NameRequest, Notify, Payload,
    RecordLock, Reply, Request, SetAttr,
};
pub use protocol::{
    BlockOp, CalloutOp, Command, InodeOp, LeaseOp, MessageHeader, MountOp, NameOp, NotifyOp,
};

pub const HEADER_SIZE: usize = MessageHeader::SIZE;
/// Largest payload accepted from a peer.
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;
/// Largest block buffer one reply carries, leaving room for reply framing.
pub const MAX_BUFFER_LEN: usize = MAX_PAYLOAD_SIZE - 64;
