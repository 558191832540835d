//! ACL canonicalization and content hash.
//!
//! Devices report the SHA-1 of the newline-joined list they hold; the server
//! hashes the same canonical form, so retrieval order must never matter.

use sha1::{Digest, Sha1};

/// Sort and de-duplicate an access list
pub fn canonical_acl(mut acl: Vec<String>) -> Vec<String> {
    acl.sort();
    acl.dedup();
    acl
}

/// Lowercase hex SHA-1 over the newline-joined list. Callers pass a canonical
/// list; the hash of an empty list is the hash of the empty string.
pub fn acl_hash(canonical: &[String]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(canonical.join("\n").as_bytes());
    hex::encode(hasher.finalize())
}

/// Reported hashes from older firmware carry stray whitespace or uppercase
pub fn same_hash(reported: &str, expected: &str) -> bool {
    reported.trim().eq_ignore_ascii_case(expected)
}
