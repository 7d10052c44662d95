//! SHA-256 content hashes
//!
//! Hashes are lowercase hex digests. The collector keys its in-memory
//! deduplication index on them, so two downloads of an unchanged export file
//! always produce the same string.

use sha2::{Digest, Sha256};

/// Hash an in-memory buffer
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO_WORLD: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn test_sha256_hex_known_vector() {
        assert_eq!(sha256_hex(b"hello world"), HELLO_WORLD);
    }

    #[test]
    fn test_sha256_hex_is_content_addressed() {
        let export = "01/03/2024;07:30;FormulaX;5;9;100\n";
        assert_eq!(sha256_hex(export.as_bytes()), sha256_hex(export.to_string().as_bytes()));
        assert_ne!(sha256_hex(export.as_bytes()), sha256_hex(b"01/03/2024;07:31;FormulaX;5;9;100\n"));
        assert_eq!(sha256_hex(b"").len(), 64);
    }
}
