use sha2::{Digest, Sha256};

/// short stable identifier: first 8 bytes of sha256, hex encoded
pub fn hash_id(value: &str) -> String {
    hash_id_parts(&[value])
}

/// hashes several parts in sequence, used for composite keys like
/// channel id + source url
pub fn hash_id_parts(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
    }
    hex::encode(&hasher.finalize()[..8])
}
