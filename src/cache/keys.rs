//! Cache key derivation.
//!
//! A cache key is the flat file name an entry is stored under:
//! the first 128 bits of the SHA-256 digest of the canonical URL, hex encoded,
//! followed by [`PRETTY_SUFFIX`].

use std::fmt;

use sha2::{Digest, Sha256};

use crate::codec::PRETTY_SUFFIX;

const DIGEST_BYTES: usize = 16;
const DIGEST_HEX_LEN: usize = DIGEST_BYTES * 2;

/// File name identifying a cached page.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive the key for the exact URL string given.
    pub fn for_url(url: &str) -> Self {
        let digest = Sha256::digest(url.as_bytes());
        let mut name = hex::encode(&digest.as_slice()[..DIGEST_BYTES]);
        name.push_str(PRETTY_SUFFIX);
        Self(name)
    }

    /// Accept a file name only if it has the exact shape of a derived key.
    pub fn parse(file_name: &str) -> Option<Self> {
        let hex_part = file_name.strip_suffix(PRETTY_SUFFIX)?;
        let well_formed = hex_part.len() == DIGEST_HEX_LEN
            && hex_part
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        well_formed.then(|| Self(file_name.to_string()))
    }

    pub fn file_name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_url_same_key() {
        assert_eq!(CacheKey::for_url("/a?x=1"), CacheKey::for_url("/a?x=1"));
    }

    #[test]
    fn different_urls_different_keys() {
        let keys = ["/a?x=1", "/a?x=2", "/a", "/b?x=1", "/a?x=1&y=2", "/a?y=2&x=1"]
            .map(CacheKey::for_url);
        for (i, left) in keys.iter().enumerate() {
            for right in &keys[i + 1..] {
                assert_ne!(left, right);
            }
        }
    }

    #[test]
    fn key_shape_is_filesystem_safe() {
        let key = CacheKey::for_url("/weird path/../?q=<script>&x=\\");
        let name = key.file_name();
        assert_eq!(name.len(), DIGEST_HEX_LEN + PRETTY_SUFFIX.len());
        assert!(name.ends_with("_xs.html"));
        assert!(!name.contains('/') && !name.contains('\\'));
        assert_eq!(CacheKey::parse(name), Some(key.clone()));
    }

    #[test]
    fn parse_rejects_foreign_names() {
        assert!(CacheKey::parse("../etc/passwd").is_none());
        assert!(CacheKey::parse("index_xs.html").is_none());
        assert!(CacheKey::parse("0123456789ABCDEF0123456789abcdef_xs.html").is_none());
        assert!(CacheKey::parse("0123456789abcdef0123456789abcdef_xs.html").is_some());
    }
}
