//! Session-scoped duplicate detection.
//!
//! The same file is often attached twice in one conversation (re-uploads,
//! the same deck sent to two prompts). A [`DedupIndex`] remembers the
//! fingerprints of documents that completed, and the pipeline short-circuits
//! any later job with a fingerprint it has seen.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use xxhash_rust::xxh3::xxh3_64;

/// Fingerprint of a document's leading bytes.
///
/// Only a prefix is hashed, so it is cheap for large files; two different
/// files with an identical prefix are treated as the same document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub u64);

impl ContentHash {
    pub fn of_bytes(bytes: &[u8]) -> Self {
        ContentHash(xxh3_64(bytes))
    }

    /// Hash the first `prefix_bytes` bytes of a file (all of it if shorter).
    pub fn of_file(path: &Path, prefix_bytes: usize) -> std::io::Result<Self> {
        let file = File::open(path)?;
        let mut buf = Vec::with_capacity(prefix_bytes.min(1 << 20));
        file.take(prefix_bytes as u64).read_to_end(&mut buf)?;
        Ok(Self::of_bytes(&buf))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Fingerprints of documents fully processed in this session.
///
/// Owned by the caller and passed to each run, so its lifetime is whatever
/// the caller's session is. A document is recorded only once its run
/// completes; a run that returned a fatal error can be retried.
#[derive(Debug, Clone, Default)]
pub struct DedupIndex {
    seen: HashSet<ContentHash>,
}

impl DedupIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// False when a document with this fingerprint already completed.
    pub fn should_process(&self, hash: ContentHash) -> bool {
        !self.seen.contains(&hash)
    }

    /// Record a completed document. Returns false if it was already known.
    pub fn mark_processed(&mut self, hash: ContentHash) -> bool {
        self.seen.insert(hash)
    }

    pub fn contains(&self, hash: ContentHash) -> bool {
        self.seen.contains(&hash)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Forget everything, e.g. when the conversation is reset.
    pub fn clear(&mut self) {
        self.seen.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_sighting_is_skipped() {
        let mut index = DedupIndex::new();
        let h = ContentHash::of_bytes(b"same deck");
        assert!(index.should_process(h));
        assert!(index.mark_processed(h));
        assert!(!index.should_process(h));
        assert!(!index.mark_processed(h));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn prefix_hash_ignores_tail() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.bin");
        let b = dir.path().join("b.bin");
        std::fs::write(&a, b"0123456789AAAA").unwrap();
        std::fs::write(&b, b"0123456789BBBB").unwrap();
        assert_eq!(
            ContentHash::of_file(&a, 10).unwrap(),
            ContentHash::of_file(&b, 10).unwrap()
        );
        assert_ne!(
            ContentHash::of_file(&a, 64).unwrap(),
            ContentHash::of_file(&b, 64).unwrap()
        );
    }

    #[test]
    fn display_is_fixed_width_hex() {
        assert_eq!(ContentHash(0xab).to_string(), "00000000000000ab");
    }
}
