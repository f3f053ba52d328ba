use sha2::{Digest, Sha256};

/// Calculates the SHA256 hash of the given text.
///
/// # Arguments
/// * `input` - The text to hash.
///
/// # Returns
/// * `String` - The SHA256 hash as a hex string.
pub fn create_sha256_hash(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    format!("{digest:x}")
}
