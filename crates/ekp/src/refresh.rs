//! Recurring refreshers for both caches.
//!
//! Each cycle scans its cache for entries that will cross a validity
//! horizon before the next cycle, batches the candidates into one KMS
//! request, updates the cache from the reply, and garbage-collects expired
//! entries in the same pass. Client-reportable failures are swallowed and
//! counted; the next cycle retries. Anything else propagates to the server
//! loop, which treats the refresher's loss as an invariant violation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, info, warn};

use ekp_common::EkpResult;

use crate::kms::{KmsBlobMetadataRequest, KmsConnector, KmsLookupByDomainIdsRequest};
use crate::metrics::bump;
use crate::retry::with_backoff;
use crate::server::ProxyState;
use crate::validity::{compute_validity, now_ts};

/// Fault-injection hook: force an entry into the candidate set with the
/// configured probability.
fn fault_injected(prob: f64) -> bool {
    prob > 0.0 && rand::thread_rng().gen_bool(prob)
}

/// Recurring cipher key refresher.
///
/// The cadence is strictly shorter than the cache TTL (enforced by config
/// validation) so entries are re-fetched before their refresh horizon fires
/// on the serving path.
pub async fn cipher_refresh_task(
    state: Arc<ProxyState>,
    connector: Arc<dyn KmsConnector>,
) -> EkpResult<()> {
    let mut ticker =
        tokio::time::interval(Duration::from_secs(state.cipher_refresh_interval as u64));
    // The first tick fires immediately; the cache starts empty, so skip it.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        refresh_cipher_keys_once(&state, &connector, now_ts()).await?;
        state.metrics.log_snapshot();
    }
}

/// One refresh cycle over the latest-per-domain cipher cache.
///
/// # Errors
///
/// Returns only non-client-reportable errors.
pub async fn refresh_cipher_keys_once(
    state: &ProxyState,
    connector: &Arc<dyn KmsConnector>,
    now: i64,
) -> EkpResult<()> {
    let candidates = {
        let mut cache = state.cipher_cache.lock();
        cache.collect_refresh_candidates(now, state.cipher_refresh_interval, || {
            fault_injected(state.fault_injection_prob)
        })
    };
    if candidates.is_empty() {
        return Ok(());
    }

    let debug_id = rand::random::<u64>();
    debug!(debug_id, n_candidates = candidates.len(), "refreshing cipher keys");

    let kms_req = KmsLookupByDomainIdsRequest {
        domain_ids: candidates,
        debug_id: Some(debug_id),
    };
    let start = Instant::now();
    let result = with_backoff(
        state.retry_policy,
        || connector.lookup_by_domain_ids(kms_req.clone()),
        || debug!(debug_id, "retrying cipher key refresh"),
        "RefreshCipherKeys",
    )
    .await;

    match result {
        Ok(kms_reply) => {
            debug!(
                debug_id,
                elapsed_ms = start.elapsed().as_millis() as u64,
                n_details = kms_reply.cipher_key_details.len(),
                "cipher key refresh fetched"
            );
            let mut refreshed = 0u64;
            {
                let mut cache = state.cipher_cache.lock();
                for details in kms_reply.cipher_key_details {
                    // The id raced with eviction since the scan; do not
                    // resurrect it.
                    if !cache.contains_latest(details.domain_id) {
                        info!(
                            debug_id,
                            domain_id = details.domain_id,
                            "refreshed domain no longer cached; skipping"
                        );
                        continue;
                    }
                    let validity = compute_validity(
                        details.refresh_after_secs,
                        details.expire_after_secs,
                        now,
                        state.default_ttl,
                    );
                    cache.insert_latest(
                        details.domain_id,
                        details.base_cipher_id,
                        details.material,
                        validity.refresh_at,
                        validity.expire_at,
                    );
                    refreshed += 1;
                }
            }
            bump(&state.metrics.cipher_keys_refreshed, refreshed);
            Ok(())
        }
        Err(e) if e.is_client_reportable() => {
            warn!(debug_id, error = %e, "cipher key refresh failed; next cycle will retry");
            bump(&state.metrics.cipher_key_refresh_errors, 1);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Recurring blob metadata refresher.
pub async fn blob_refresh_task(
    state: Arc<ProxyState>,
    connector: Arc<dyn KmsConnector>,
) -> EkpResult<()> {
    let mut ticker =
        tokio::time::interval(Duration::from_secs(state.blob_refresh_interval as u64));
    ticker.tick().await;
    loop {
        ticker.tick().await;
        refresh_blob_metadata_once(&state, &connector, now_ts()).await?;
    }
}

/// One refresh cycle over the blob metadata cache.
///
/// # Errors
///
/// Returns only non-client-reportable errors.
pub async fn refresh_blob_metadata_once(
    state: &ProxyState,
    connector: &Arc<dyn KmsConnector>,
    now: i64,
) -> EkpResult<()> {
    let candidates = {
        let mut cache = state.blob_cache.lock();
        cache.collect_refresh_candidates(now, state.blob_refresh_interval, || {
            fault_injected(state.fault_injection_prob)
        })
    };
    if candidates.is_empty() {
        return Ok(());
    }

    let debug_id = rand::random::<u64>();
    debug!(debug_id, n_candidates = candidates.len(), "refreshing blob metadata");

    let kms_req = KmsBlobMetadataRequest {
        domain_ids: candidates,
        debug_id: Some(debug_id),
    };
    let start = Instant::now();
    let result = with_backoff(
        state.retry_policy,
        || connector.blob_metadata(kms_req.clone()),
        || debug!(debug_id, "retrying blob metadata refresh"),
        "RefreshBlobMetadata",
    )
    .await;

    match result {
        Ok(kms_reply) => {
            debug!(
                debug_id,
                elapsed_ms = start.elapsed().as_millis() as u64,
                n_details = kms_reply.metadata_details.len(),
                "blob metadata refresh fetched"
            );
            let mut refreshed = 0u64;
            {
                let mut cache = state.blob_cache.lock();
                for details in kms_reply.metadata_details {
                    if !cache.contains(details.domain_id) {
                        info!(
                            debug_id,
                            domain_id = details.domain_id,
                            "refreshed blob domain no longer cached; skipping"
                        );
                        continue;
                    }
                    cache.insert(details, now);
                    refreshed += 1;
                }
            }
            bump(&state.metrics.blob_metadata_refreshed, refreshed);
            Ok(())
        }
        Err(e) if e.is_client_reportable() => {
            warn!(debug_id, error = %e, "blob metadata refresh failed; next cycle will retry");
            bump(&state.metrics.blob_metadata_refresh_errors, 1);
            Ok(())
        }
        Err(e) => Err(e),
    }
}
