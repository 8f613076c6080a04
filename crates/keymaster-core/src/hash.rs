//! C3 — content normalization and the stable fingerprint used both as the
//! per-account dirty-bit oracle and the audit drift oracle.

use sha2::{Digest, Sha256};

/// Normalize an authorized_keys blob per §4.3:
/// - CRLF -> LF
/// - trim trailing horizontal whitespace per line
/// - drop blank lines and comment lines (first non-whitespace char `#`)
/// - join surviving lines with `\n`, no trailing newline
pub fn normalize(content: &str) -> String {
    content
        .replace("\r\n", "\n")
        .lines()
        .map(|line| line.trim_end_matches([' ', '\t']))
        .filter(|line| {
            let trimmed = line.trim_start();
            !trimmed.is_empty() && !trimmed.starts_with('#')
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// SHA-256 hex digest of the normalized content.
pub fn content_hash(content: &str) -> String {
    let normalized = normalize(content);
    let digest = Sha256::digest(normalized.as_bytes());
    hex::encode(digest)
}
