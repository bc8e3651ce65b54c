use crate::codec::ByteOrder;
use crate::frame::{frame_len, parse_message};
use crate::message::Message;
use bytes::BytesMut;
use sfs_core::Result;

const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Accumulates bytes read from a stream and yields whole messages.
pub struct ConnectionBuffer {
    buffer: BytesMut,
    /// Byte order of the last message the peer sent.
    peer_order: Option<ByteOrder>,
}

impl ConnectionBuffer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
            peer_order: None,
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn consume(&mut self, len: usize) {
        if len >= self.buffer.len() {
            self.buffer.clear();
        } else {
            let _ = self.buffer.split_to(len);
        }
    }

    /// Pop the next complete message, if one is buffered.
    ///
    /// A frame that fails to decode is discarded before the error is
    /// returned. When even the header is unreadable the whole buffer is
    /// dropped.
    pub fn next_message(&mut self) -> Result<Option<Message>> {
        match parse_message(&self.buffer) {
            Ok(Some((message, order, used))) => {
                self.consume(used);
                self.peer_order = Some(order);
                self.compact();
                Ok(Some(message))
            },
            Ok(None) => Ok(None),
            Err(e) => {
                match frame_len(&self.buffer) {
                    Ok(Some(len)) => self.consume(len),
                    _ => self.clear(),
                }
                Err(e)
            },
        }
    }

    /// Shrink an oversized buffer once it has drained.
    pub fn compact(&mut self) {
        if self.buffer.capacity() > DEFAULT_BUFFER_SIZE * 4
            && self.buffer.len() < DEFAULT_BUFFER_SIZE
        {
            let mut new_buffer = BytesMut::with_capacity(DEFAULT_BUFFER_SIZE);
            new_buffer.extend_from_slice(&self.buffer);
            self.buffer = new_buffer;
        }
    }

    #[inline]
    #[must_use]
    pub fn peer_order(&self) -> Option<ByteOrder> {
        self.peer_order
    }

    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.buffer[..]
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for ConnectionBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::frame::encode_message;
    use crate::message::{MountRequest, Request};
    use sfs_core::{Seqno, WaitMode};

    fn status(seqno: u32) -> Message {
        let mut msg = Message::request(Request::Mount(MountRequest::Status), WaitMode::Wait);
        msg.header.seqno = Seqno::new(seqno);
        msg
    }

    #[test]
    fn test_connection_buffer_consume() {
        let mut buf = ConnectionBuffer::new();
        buf.extend(b"hello world");
        buf.consume(6);
        assert_eq!(buf.as_slice(), b"world");
        assert_eq!(buf.len(), 5);
    }

    #[test]
    fn test_messages_split_across_reads() {
        let mut wire = encode_message(&status(1), ByteOrder::Big).to_vec();
        wire.extend_from_slice(&encode_message(&status(2), ByteOrder::Big));

        let mut buf = ConnectionBuffer::new();
        buf.extend(&wire[..10]);
        assert!(buf.next_message().unwrap().is_none());
        buf.extend(&wire[10..]);

        let first = buf.next_message().unwrap().unwrap();
        let second = buf.next_message().unwrap().unwrap();
        assert_eq!(first.header.seqno, Seqno::new(1));
        assert_eq!(second.header.seqno, Seqno::new(2));
        assert!(buf.next_message().unwrap().is_none());
        assert!(buf.is_empty());
        assert_eq!(buf.peer_order(), Some(ByteOrder::Big));
    }

    #[test]
    fn test_corrupt_frame_skipped() {
        let init = Message::request(
            Request::Mount(MountRequest::Init {
                host: "node-a".to_string(),
                fs_name: "sfs0".to_string(),
                flags: sfs_core::MountFlags::EMPTY,
            }),
            WaitMode::Wait,
        );
        let mut wire = encode_message(&init, ByteOrder::Little).to_vec();
        let last = wire.len() - 1;
        wire[last] ^= 0xff;
        wire.extend_from_slice(&encode_message(&status(9), ByteOrder::Little));

        let mut buf = ConnectionBuffer::new();
        buf.extend(&wire);
        assert!(matches!(
            buf.next_message(),
            Err(sfs_core::ShareError::CrcMismatch { .. })
        ));
        let next = buf.next_message().unwrap().unwrap();
        assert_eq!(next.header.seqno, Seqno::new(9));
    }

    #[test]
    fn test_garbage_clears_buffer() {
        let mut buf = ConnectionBuffer::new();
        buf.extend(&[0xAB; 64]);
        assert!(buf.next_message().is_err());
        assert!(buf.is_empty());
    }
}
