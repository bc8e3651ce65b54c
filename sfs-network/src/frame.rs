use crate::MAX_PAYLOAD_SIZE;
use crate::codec::{ByteOrder, WireReader, WireWriter};
use crate::message::Message;
use crate::protocol::MessageHeader;
use bytes::{BufMut, Bytes, BytesMut};
use sfs_core::{Result, ShareError, payload_crc};

/// Encode `message` in `order`, filling in the header's payload length
/// and CRC.
#[must_use]
pub fn encode_message(message: &Message, order: ByteOrder) -> Bytes {
    let mut w = WireWriter::new(order);
    message.encode_payload(&mut w);
    let payload = w.finish();

    let mut header = message.header;
    header.payload_len = payload.len() as u32;
    header.payload_crc = payload_crc(&payload);

    let mut buf = BytesMut::with_capacity(MessageHeader::SIZE + payload.len());
    buf.put_slice(&header.encode(order));
    buf.put_slice(&payload);
    buf.freeze()
}

/// Parse one message from the front of `buf`.
///
/// Returns `Ok(None)` when `buf` does not yet hold a complete message,
/// otherwise the message, the sender's byte order and the number of bytes
/// consumed.
pub fn parse_message(buf: &[u8]) -> Result<Option<(Message, ByteOrder, usize)>> {
    if buf.len() < MessageHeader::SIZE {
        return Ok(None);
    }

    let (header, order) = MessageHeader::parse(buf)?;
    let payload_len = header.payload_len as usize;
    if payload_len > MAX_PAYLOAD_SIZE {
        return Err(ShareError::Protocol(format!(
            "Payload too large: {payload_len} bytes"
        )));
    }

    let total_len = MessageHeader::SIZE + payload_len;
    if buf.len() < total_len {
        return Ok(None);
    }

    let payload = &buf[MessageHeader::SIZE..total_len];
    let actual = payload_crc(payload);
    if actual != header.payload_crc {
        return Err(ShareError::CrcMismatch {
            expected: header.payload_crc,
            actual,
        });
    }

    let mut r = WireReader::new(payload, order);
    let body = Message::decode_payload(&header, &mut r)?;
    if r.remaining() != 0 {
        return Err(ShareError::Protocol(format!(
            "{} trailing bytes after {:?} payload",
            r.remaining(),
            header.command
        )));
    }

    Ok(Some((
        Message {
            header,
            payload: body,
        },
        order,
        total_len,
    )))
}

/// Length of the frame at the front of `buf`, once it is fully buffered.
pub(crate) fn frame_len(buf: &[u8]) -> Result<Option<usize>> {
    if buf.len() < MessageHeader::SIZE {
        return Ok(None);
    }
    let (header, _) = MessageHeader::parse(buf)?;
    let total_len = MessageHeader::SIZE + header.payload_len as usize;
    Ok((buf.len() >= total_len).then_some(total_len))
}
