//! Integrity: whole-file SHA-256 digest carried in FILE_OFFER, verified after reassembly.

use sha2::{Digest, Sha256};

/// Hash a payload. Returns 32-byte digest.
pub fn hash_bytes(payload: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.finalize().into()
}

/// Lowercase hex digest, as sent in `FILEHASH`.
pub fn hash_hex(payload: &[u8]) -> String {
    hash_bytes(payload)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Verify payload against an announced hex digest. Case-insensitive.
pub fn verify_hex(payload: &[u8], expected: &str) -> bool {
    hash_hex(payload).eq_ignore_ascii_case(expected.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_digest_known_value() {
        assert_eq!(
            hash_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn verify_roundtrip() {
        let payload = b"hello file";
        let hex = hash_hex(payload);
        assert!(verify_hex(payload, &hex));
        assert!(verify_hex(payload, &hex.to_uppercase()));
    }

    #[test]
    fn verify_rejects_tampered() {
        let hex = hash_hex(b"hello file");
        assert!(!verify_hex(b"tampered", &hex));
        assert!(!verify_hex(b"hello file", "not-a-digest"));
    }
}
