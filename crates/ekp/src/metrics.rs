//! Monotonic cache counters.
//!
//! Increments use relaxed ordering; the counters are advisory and only read
//! for logging.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

/// Counter collection for all three cache views.
#[derive(Debug, Default)]
pub struct EkpMetrics {
    pub cipher_key_id_cache_hits: AtomicU64,
    pub cipher_key_id_cache_misses: AtomicU64,
    pub cipher_domain_cache_hits: AtomicU64,
    pub cipher_domain_cache_misses: AtomicU64,
    pub cipher_keys_refreshed: AtomicU64,
    pub responses_with_errors: AtomicU64,
    pub cipher_key_refresh_errors: AtomicU64,
    pub blob_metadata_cache_hits: AtomicU64,
    pub blob_metadata_cache_misses: AtomicU64,
    pub blob_metadata_refreshed: AtomicU64,
    pub blob_metadata_refresh_errors: AtomicU64,
}

/// Bump a counter by `n`.
pub fn bump(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

/// Read a counter.
pub fn read(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

impl EkpMetrics {
    /// Emit the current counter values as a single debug event.
    pub fn log_snapshot(&self) {
        debug!(
            cipher_key_id_cache_hits = read(&self.cipher_key_id_cache_hits),
            cipher_key_id_cache_misses = read(&self.cipher_key_id_cache_misses),
            cipher_domain_cache_hits = read(&self.cipher_domain_cache_hits),
            cipher_domain_cache_misses = read(&self.cipher_domain_cache_misses),
            cipher_keys_refreshed = read(&self.cipher_keys_refreshed),
            responses_with_errors = read(&self.responses_with_errors),
            cipher_key_refresh_errors = read(&self.cipher_key_refresh_errors),
            blob_metadata_cache_hits = read(&self.blob_metadata_cache_hits),
            blob_metadata_cache_misses = read(&self.blob_metadata_cache_misses),
            blob_metadata_refreshed = read(&self.blob_metadata_refreshed),
            blob_metadata_refresh_errors = read(&self.blob_metadata_refresh_errors),
            "ekp cache metrics"
        );
    }
}
