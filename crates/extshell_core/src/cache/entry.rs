//! Cached asset handles and entry bookkeeping.

use crate::cache::fetch::AssetFetcher;
use bytes::Bytes;
use std::sync::Arc;
use tokio::time::Instant;

/// Shared, cheaply clonable reference to fetched asset bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetHandle {
    key: Arc<str>,
    bytes: Bytes,
}

impl AssetHandle {
    pub fn new(key: &str, bytes: Bytes) -> Self {
        Self {
            key: Arc::from(key),
            bytes,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

pub(crate) struct AssetCacheEntry {
    pub handle: AssetHandle,
    pub size_bytes: u64,
    pub created_at: Instant,
    pub last_accessed_at: Instant,
    /// Tie-break for accesses sharing one clock reading.
    pub access_seq: u64,
    pub expires_at: Option<Instant>,
    /// Backend that produced the handle and must release it.
    pub fetcher: Arc<dyn AssetFetcher>,
}

impl AssetCacheEntry {
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }

    pub fn touch(&mut self, now: Instant, seq: u64) {
        self.last_accessed_at = now;
        self.access_seq = seq;
    }

    pub fn release(&self) {
        self.fetcher.release(&self.handle);
    }
}
