//! Shared proxy state handed to handlers and refreshers.

use parking_lot::Mutex;

use crate::cache::{BlobMetadataCache, CipherKeyCache};
use crate::config::Config;
use crate::metrics::EkpMetrics;
use crate::retry::RetryPolicy;

/// State shared across handler tasks and refreshers.
///
/// The caches sit behind short-lived mutexes; guards are taken between
/// suspension points only, never across an await.
pub struct ProxyState {
    pub cipher_cache: Mutex<CipherKeyCache>,
    pub blob_cache: Mutex<BlobMetadataCache>,
    pub metrics: EkpMetrics,
    /// Default TTL for cipher keys without a KMS-advertised refresh interval.
    pub default_ttl: i64,
    pub cipher_refresh_interval: i64,
    pub blob_refresh_interval: i64,
    pub retry_policy: RetryPolicy,
    pub max_debug_trace_ids: usize,
    pub fault_injection_prob: f64,
}

impl ProxyState {
    pub fn new(cfg: &Config) -> Self {
        let id_cache_capacity = std::num::NonZeroUsize::new(cfg.cipher_key_id_cache_capacity)
            .unwrap_or(std::num::NonZeroUsize::MIN);
        Self {
            cipher_cache: Mutex::new(CipherKeyCache::new(id_cache_capacity)),
            blob_cache: Mutex::new(BlobMetadataCache::new(cfg.blob_metadata_cache_ttl_secs)),
            metrics: EkpMetrics::default(),
            default_ttl: cfg.cipher_key_cache_ttl_secs,
            cipher_refresh_interval: cfg.cipher_key_refresh_interval_secs,
            blob_refresh_interval: cfg.blob_metadata_refresh_interval_secs,
            retry_policy: RetryPolicy::from_config(cfg),
            max_debug_trace_ids: cfg.max_debug_trace_ids,
            fault_injection_prob: cfg.refresh_fault_injection_prob,
        }
    }
}
