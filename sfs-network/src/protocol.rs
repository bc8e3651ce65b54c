use crate::codec::{ByteOrder, WireReader, WireWriter};
use sfs_core::{ErrorCode, Result, SFS_MAGIC, Seqno, ShareError, WaitMode};

macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $value:literal, )+
        }
    ) => {
        $(#[$meta])*
        #[repr(u16)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $( $(#[$vmeta])* $variant = $value, )+
        }

        impl $name {
            #[must_use]
            pub const fn from_u16(value: u16) -> Option<Self> {
                match value {
                    $( $value => Some(Self::$variant), )+
                    _ => None,
                }
            }

            #[inline]
            #[must_use]
            pub const fn as_u16(self) -> u16 {
                self as u16
            }
        }
    };
}

wire_enum! {
    /// Top-level message command.
    Command {
        Mount = 1,
        Lease = 2,
        Name = 3,
        Inode = 4,
        Block = 5,
        /// Server to client, no reply expected.
        Callout = 7,
        /// Server to client or client to all, no reply expected.
        Notify = 8,
    }
}

wire_enum! {
    MountOp {
        Init = 1,
        Status = 2,
        FailInit = 3,
        Resync = 4,
        Failover = 5,
        FailDone = 6,
        Config = 7,
    }
}

wire_enum! {
    LeaseOp {
        Get = 1,
        Remove = 2,
        Reset = 3,
        Relinquish = 4,
        Extend = 5,
    }
}

wire_enum! {
    /// Namespace operations. Everything ordered before `Lookup` mutates the
    /// namespace and must not be executed twice.
    NameOp {
        Create = 1,
        Remove = 2,
        Mkdir = 3,
        Rmdir = 4,
        Link = 5,
        Rename = 6,
        Symlink = 7,
        Acl = 8,
        Lookup = 9,
    }
}

impl NameOp {
    #[inline]
    #[must_use]
    pub const fn is_idempotent(self) -> bool {
        self.as_u16() >= Self::Lookup.as_u16()
    }
}

wire_enum! {
    InodeOp {
        GetIno = 1,
        FsyncWait = 2,
        FsyncNoWait = 3,
        SetAbr = 4,
        SetAttr = 5,
        Stage = 6,
        CancelStage = 7,
    }
}

wire_enum! {
    BlockOp {
        GetBuffer = 1,
        GetInode = 2,
        GetSuperblock = 3,
        Statfs = 4,
        Wakeup = 5,
        Panic = 6,
        Quota = 7,
    }
}

wire_enum! {
    CalloutOp {
        Action = 1,
        Stage = 2,
        RelinquishLease = 3,
    }
}

wire_enum! {
    NotifyOp {
        Lease = 1,
        LeaseExpire = 2,
        Dnlc = 3,
        GetIno = 4,
        Panic = 5,
    }
}

const FLAG_RESET_SEQNO: u8 = 0x01;
const FLAG_REPLY: u8 = 0x02;

/// Fixed message header.
///
/// ```text
///  0  magic          u32   byte-order tag
///  4  command        u16
///  6  operation      u16
///  8  payload_len    u32
/// 12  out_len        u32   expected reply payload size
/// 16  seqno          u32
/// 20  ack            u32   lowest outstanding seqno of the sender
/// 24  wait_mode      u8
/// 25  flags          u8    RESET_SEQNO | REPLY
/// 26  reserved       u16
/// 28  client_ord     u32
/// 32  error          i32
/// 36  server_ord     u32
/// 40  fsid           u32
/// 44  fs_generation  u32
/// 48  payload_crc    u32
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub command: Command,
    pub operation: u16,
    pub payload_len: u32,
    pub out_len: u32,
    pub seqno: Seqno,
    pub ack: Seqno,
    pub wait_mode: WaitMode,
    /// The sender restarted its numbering; `ack` is the new floor.
    pub reset_seqno: bool,
    pub is_reply: bool,
    pub client_ord: u32,
    pub error: ErrorCode,
    pub server_ord: u32,
    pub fsid: u32,
    pub fs_generation: u32,
    pub payload_crc: u32,
}

impl MessageHeader {
    pub const SIZE: usize = 52;

    #[must_use]
    pub fn new(command: Command, operation: u16, wait_mode: WaitMode) -> Self {
        Self {
            command,
            operation,
            payload_len: 0,
            out_len: 0,
            seqno: Seqno::NONE,
            ack: Seqno::NONE,
            wait_mode,
            reset_seqno: false,
            is_reply: false,
            client_ord: 0,
            error: ErrorCode::OK,
            server_ord: 0,
            fsid: 0,
            fs_generation: 0,
            payload_crc: 0,
        }
    }

    /// Header for the reply to `self`, echoing its identity fields.
    #[must_use]
    pub fn reply(&self, error: ErrorCode) -> Self {
        Self {
            payload_len: 0,
            out_len: 0,
            reset_seqno: false,
            is_reply: true,
            error,
            payload_crc: 0,
            ..*self
        }
    }

    pub fn encode(&self, order: ByteOrder) -> [u8; Self::SIZE] {
        let mut w = WireWriter::with_capacity(order, Self::SIZE);
        w.put_u32(SFS_MAGIC);
        w.put_u16(self.command.as_u16());
        w.put_u16(self.operation);
        w.put_u32(self.payload_len);
        w.put_u32(self.out_len);
        w.put_u32(self.seqno.get());
        w.put_u32(self.ack.get());
        w.put_u8(self.wait_mode.as_u8());
        let mut flags = 0u8;
        if self.reset_seqno {
            flags |= FLAG_RESET_SEQNO;
        }
        if self.is_reply {
            flags |= FLAG_REPLY;
        }
        w.put_u8(flags);
        w.put_u16(0);
        w.put_u32(self.client_ord);
        w.put_i32(self.error.as_raw());
        w.put_u32(self.server_ord);
        w.put_u32(self.fsid);
        w.put_u32(self.fs_generation);
        w.put_u32(self.payload_crc);

        let bytes = w.finish();
        let mut buf = [0u8; Self::SIZE];
        buf.copy_from_slice(&bytes);
        buf
    }

    /// Parse a header, returning it with the sender's byte order.
    pub fn parse(buf: &[u8]) -> Result<(Self, ByteOrder)> {
        if buf.len() < Self::SIZE {
            return Err(ShareError::Protocol(
                "Buffer too small for message header".into(),
            ));
        }

        let order = ByteOrder::detect([buf[0], buf[1], buf[2], buf[3]])?;
        let mut r = WireReader::new(&buf[4..Self::SIZE], order);

        let raw_command = r.get_u16()?;
        let command = Command::from_u16(raw_command)
            .ok_or_else(|| ShareError::Protocol(format!("Unknown command {raw_command}")))?;
        let operation = r.get_u16()?;
        let payload_len = r.get_u32()?;
        let out_len = r.get_u32()?;
        let seqno = Seqno::new(r.get_u32()?);
        let ack = Seqno::new(r.get_u32()?);
        let raw_wait = r.get_u8()?;
        let wait_mode = WaitMode::from_u8(raw_wait)
            .ok_or_else(|| ShareError::Protocol(format!("Unknown wait mode {raw_wait}")))?;
        let flags = r.get_u8()?;
        let _reserved = r.get_u16()?;

        Ok((
            Self {
                command,
                operation,
                payload_len,
                out_len,
                seqno,
                ack,
                wait_mode,
                reset_seqno: flags & FLAG_RESET_SEQNO != 0,
                is_reply: flags & FLAG_REPLY != 0,
                client_ord: r.get_u32()?,
                error: ErrorCode::from_raw(r.get_i32()?),
                server_ord: r.get_u32()?,
                fsid: r.get_u32()?,
                fs_generation: r.get_u32()?,
                payload_crc: r.get_u32()?,
            },
            order,
        ))
    }
}
