//! Parsed-source cache: an LRU keyed by SHA-256 hashes of learner source.
//!
//! Learners resubmit the same code often (re-running after reading a hint),
//! so the engine keeps the static facts of recent submissions. A parse
//! failure is cached too.
//!
//! The cache belongs to one engine instance and is only touched through
//! `&mut self`, so it needs no lock.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use sha2::{Digest, Sha256};

use crate::structure::{ParseFailure, SourceFacts};

/// A 32-byte SHA-256 digest used as a cache key.
pub type CacheKey = [u8; 32];

/// Result of parsing one source, shared between the cache and a batch.
pub type ParsedSource = Result<Arc<SourceFacts>, ParseFailure>;

pub fn cache_key(source: &str) -> CacheKey {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.finalize().into()
}

/// Produces the facts of one source on a cache miss.
pub type Parser = fn(&str) -> Result<SourceFacts, ParseFailure>;

pub struct FactsCache {
    inner: LruCache<CacheKey, ParsedSource>,
    parser: Parser,
    hits: u64,
    misses: u64,
}

impl FactsCache {
    /// `capacity` is clamped to a minimum of `1`.
    pub fn new(capacity: usize) -> Self {
        Self::with_parser(capacity, SourceFacts::parse)
    }

    pub fn with_parser(capacity: usize, parser: Parser) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: LruCache::new(cap),
            parser,
            hits: 0,
            misses: 0,
        }
    }

    /// Returns the cached parse of `source`, parsing and storing it on a miss.
    pub fn get_or_parse(&mut self, source: &str) -> ParsedSource {
        let key = cache_key(source);
        if let Some(parsed) = self.inner.get(&key) {
            self.hits += 1;
            return parsed.clone();
        }
        self.misses += 1;
        let parsed = (self.parser)(source).map(Arc::new);
        self.inner.put(key, parsed.clone());
        parsed
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.cap().get()
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }
}
