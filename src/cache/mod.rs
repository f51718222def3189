//! In-memory sweep cache.
//!
//! The [`LruCache`] maps sweep keys (the basename of the requested path) to the
//! serialized payload produced by a reader. It holds at most `capacity` entries and
//! evicts the least recently used one whenever an insertion pushes it over.
//! Recency is refreshed by both [`LruCache::get`] and [`LruCache::put`].
//!
//! Blobs may be stored compressed (see [`Compression`]). Compression only changes
//! what is held in memory and what [`LruCache::size`] reports; it never affects
//! which entry is evicted.
//!
//! The cache is shared by every concierge and publisher thread, so all operations
//! take `&self` and serialize on one internal mutex.
mod compression;
mod lru;

use std::{fmt, io};

use thiserror::Error;

pub use compression::Compression;
pub use lru::LruCache;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to compress blob: {0}")]
    Compress(#[source] io::Error),
}

/// Entry count and stored byte total, reported by the `stats` request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheSize {
    pub count: usize,
    pub bytes: usize,
}

impl fmt::Display for CacheSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} item(s)   {} B", self.count, self.bytes)
    }
}
