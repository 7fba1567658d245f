//! Content hashing.
//!
//! All hashes in the store are lowercase hex SHA-256 digests. Documents are
//! hashed after [`normalize_content`] so that line-ending churn does not
//! register as a change; chunks are hashed over their exact text.

use sha2::{Digest, Sha256};

/// Hex SHA-256 of `text`.
pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Hex SHA-256 over several parts, each length-prefixed so that part
/// boundaries cannot collide (`"ab" + "c"` differs from `"a" + "bc"`).
pub fn hash_parts(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Normalize line endings and strip trailing whitespace from every line and
/// from the end of the document.
pub fn normalize_content(content: &str) -> String {
    content
        .replace("\r\n", "\n")
        .replace('\r', "\n")
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
        .trim_end()
        .to_string()
}

/// Hash of the normalized form of `content`.
pub fn content_hash(content: &str) -> String {
    hash_text(&normalize_content(content))
}
