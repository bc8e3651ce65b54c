use crc32fast::Hasher;

/// CRC-32 of a message payload as carried in the header's `payload_crc`.
#[inline]
#[must_use]
pub fn payload_crc(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_crc_empty() {
        assert_eq!(payload_crc(&[]), 0);
    }

    #[test]
    fn test_payload_crc_detects_change() {
        let crc = payload_crc(b"lease grant");
        assert_ne!(crc, 0);
        assert_eq!(crc, payload_crc(b"lease grant"));
        assert_ne!(crc, payload_crc(b"lease grunt"));
    }
}
