use sha2::{Digest, Sha256};

/// Short hex digest over chunk bytes. 16 hex chars keeps parity with the
/// checksum strings browser clients already exchange.
pub fn chunk_checksum(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    hex::encode(&digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_16_hex_chars_and_stable() {
        let a = chunk_checksum(b"hello world");
        let b = chunk_checksum(b"hello world");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn checksum_differs_for_different_bytes() {
        assert_ne!(chunk_checksum(b"a"), chunk_checksum(b"b"));
    }
}
