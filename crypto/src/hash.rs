//! Various hash functions

use sha2::{Digest, Sha256 as Sha256Hasher};

/// Secure hashing algorithm v2
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub struct Sha256(pub [u8; 32]);

/// Calculate the SHA256 hash
pub fn calculate_sha256(bytes: &[u8]) -> Sha256 {
    let mut hasher = Sha256Hasher::new();
    hasher.update(bytes);
    Sha256(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::calculate_sha256;

    #[test]
    fn sha256_empty_input() {
        let hash = calculate_sha256(b"");

        assert_eq!(
            hash.0[..4],
            [0xe3, 0xb0, 0xc4, 0x42],
            "SHA256 of the empty string should start with e3b0c442"
        );
    }

    #[test]
    fn sha256_is_deterministic() {
        assert_eq!(calculate_sha256(b"harbor"), calculate_sha256(b"harbor"));
        assert_ne!(calculate_sha256(b"harbor"), calculate_sha256(b"harbour"));
    }
}
