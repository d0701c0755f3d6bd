//! Content tokens for staged files
//!
//! A staged file's token is the SHA-256 of its bytes. The merge engine uses it
//! to recognise a physical file it has already loaded.

use sha2::{Digest, Sha256};

/// Hex SHA-256 of an in-memory buffer
pub fn content_token(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_content_token_sha256() {
        assert_eq!(
            content_token(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }
}
