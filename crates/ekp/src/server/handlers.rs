//! Request handlers for the three lookup endpoints.
//!
//! Shared skeleton: dedup the request, partition into cache hits and
//! misses, batch all misses into a single KMS call through the retry
//! wrapper, reply with the merged result set, then warm the cache. The
//! reply is sent before the warm-up insertions to keep inline latency low;
//! the warm-up is best-effort.
//!
//! Client-reportable KMS failures are embedded in the reply envelope so the
//! caller can react (for instance by evicting its own entries); all other
//! errors escape to the server loop and terminate the handler task.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, warn};

use ekp_common::protocol::{
    BaseCipherDetails, BaseCipherId, BlobDomainId, BlobMetadataDetails, DomainId,
    GetBlobMetadataReply, GetBlobMetadataRequest, GetByIdsReply, GetByIdsRequest, GetLatestReply,
    GetLatestRequest,
};
use ekp_common::{EkpError, EkpResult};

use crate::kms::{
    KmsBlobMetadataRequest, KmsCipherKeyDetails, KmsConnector, KmsLookupByDomainIdsRequest,
    KmsLookupByKeyIdsRequest,
};
use crate::metrics::bump;
use crate::retry::with_backoff;
use crate::validity::{compute_validity, now_ts, CipherKeyValidity};

use super::state::ProxyState;

/// Render up to `cap` ids for a debug trace event.
fn trace_ids<T: std::fmt::Debug>(ids: &[T], cap: usize) -> String {
    if ids.len() <= cap {
        format!("{ids:?}")
    } else {
        format!("{:?} (+{} more)", &ids[..cap], ids.len() - cap)
    }
}

// ---------------------------------------------------------------------------
// Lookup by (domain, key id) pairs
// ---------------------------------------------------------------------------

/// Handle a `GetByIds` request.
///
/// # Errors
///
/// Returns only non-client-reportable errors; reportable ones are embedded
/// in the reply envelope.
pub async fn get_cipher_keys_by_ids(
    state: &Arc<ProxyState>,
    connector: &Arc<dyn KmsConnector>,
    req: GetByIdsRequest,
) -> EkpResult<()> {
    let GetByIdsRequest {
        cipher_ids,
        debug_id,
        reply,
    } = req;
    let now = now_ts();

    let deduped: HashSet<(DomainId, BaseCipherId)> = cipher_ids.into_iter().collect();

    let mut cached_details = Vec::new();
    let mut lookup_ids = Vec::new();
    {
        let mut cache = state.cipher_cache.lock();
        for &(domain_id, base_cipher_id) in &deduped {
            match cache.probe_by_id(domain_id, base_cipher_id, now) {
                Some(entry) => cached_details.push(BaseCipherDetails {
                    domain_id,
                    base_cipher_id,
                    material: entry.material,
                    refresh_at: None,
                    expire_at: None,
                }),
                None => lookup_ids.push((domain_id, base_cipher_id)),
            }
        }
    }
    bump(
        &state.metrics.cipher_key_id_cache_hits,
        cached_details.len() as u64,
    );
    bump(
        &state.metrics.cipher_key_id_cache_misses,
        lookup_ids.len() as u64,
    );

    if let Some(debug_id) = debug_id {
        debug!(
            debug_id,
            n_keys = deduped.len(),
            hits = cached_details.len(),
            misses = %trace_ids(&lookup_ids, state.max_debug_trace_ids),
            "get cipher keys by key ids"
        );
    }

    let mut fetched: Vec<(KmsCipherKeyDetails, CipherKeyValidity)> = Vec::new();
    if !lookup_ids.is_empty() {
        let requested: HashSet<(DomainId, BaseCipherId)> = lookup_ids.iter().copied().collect();
        let kms_req = KmsLookupByKeyIdsRequest {
            cipher_ids: lookup_ids,
            debug_id,
        };
        match fetch_cipher_keys_by_ids(state, connector, kms_req, &requested, now).await {
            Ok(details) => fetched = details,
            Err(e) if e.is_client_reportable() => {
                warn!(error = %e, "cipher key lookup by key ids failed");
                bump(&state.metrics.responses_with_errors, 1);
                let _ = reply.send(GetByIdsReply {
                    error: Some(e),
                    ..Default::default()
                });
                return Ok(());
            }
            Err(e) => {
                error!(error = %e, "cipher key lookup by key ids failed unexpectedly");
                return Err(e);
            }
        }
    }

    let num_hits = cached_details.len();
    let mut base_cipher_details: Vec<BaseCipherDetails> = fetched
        .iter()
        .map(|(d, _)| BaseCipherDetails {
            domain_id: d.domain_id,
            base_cipher_id: d.base_cipher_id,
            material: d.material.clone(),
            refresh_at: None,
            expire_at: None,
        })
        .collect();
    base_cipher_details.extend(cached_details);

    let _ = reply.send(GetByIdsReply {
        base_cipher_details,
        num_hits,
        error: None,
    });

    // Cache warm-up happens after responding to the caller.
    if !fetched.is_empty() {
        let mut cache = state.cipher_cache.lock();
        for (d, validity) in fetched {
            cache.insert_by_id(
                d.domain_id,
                d.base_cipher_id,
                d.material,
                validity.refresh_at,
                validity.expire_at,
            );
        }
    }
    Ok(())
}

async fn fetch_cipher_keys_by_ids(
    state: &ProxyState,
    connector: &Arc<dyn KmsConnector>,
    kms_req: KmsLookupByKeyIdsRequest,
    requested: &HashSet<(DomainId, BaseCipherId)>,
    now: i64,
) -> EkpResult<Vec<(KmsCipherKeyDetails, CipherKeyValidity)>> {
    let retried = kms_req.cipher_ids.clone();
    let trace_cap = state.max_debug_trace_ids;
    let start = Instant::now();
    let kms_reply = with_backoff(
        state.retry_policy,
        || connector.lookup_by_key_ids(kms_req.clone()),
        || debug!(ids = %trace_ids(&retried, trace_cap), "retrying KMS lookup by key ids"),
        "GetCipherKeysByKeyIds",
    )
    .await?;
    debug!(
        elapsed_ms = start.elapsed().as_millis() as u64,
        n_details = kms_reply.cipher_key_details.len(),
        "KMS lookup by key ids finished"
    );

    let mut fetched = Vec::with_capacity(kms_reply.cipher_key_details.len());
    for details in kms_reply.cipher_key_details {
        if !requested.contains(&(details.domain_id, details.base_cipher_id)) {
            // Protocol violation: the KMS may answer a subset of the
            // request, never a superset.
            error!(
                domain_id = details.domain_id,
                base_cipher_id = details.base_cipher_id,
                "KMS returned a key that was not requested"
            );
            return Err(EkpError::KeysFetchFailed);
        }
        // A specific key version never rotates; only the expiry interval
        // applies.
        let validity = compute_validity(Some(-1), details.expire_after_secs, now, state.default_ttl);
        fetched.push((details, validity));
    }
    Ok(fetched)
}

// ---------------------------------------------------------------------------
// Latest key per domain
// ---------------------------------------------------------------------------

/// Handle a `GetLatest` request.
///
/// # Errors
///
/// Returns only non-client-reportable errors; reportable ones are embedded
/// in the reply envelope.
pub async fn get_latest_cipher_keys(
    state: &Arc<ProxyState>,
    connector: &Arc<dyn KmsConnector>,
    req: GetLatestRequest,
) -> EkpResult<()> {
    let GetLatestRequest {
        domain_ids,
        debug_id,
        reply,
    } = req;
    let now = now_ts();

    let deduped: HashSet<DomainId> = domain_ids.into_iter().collect();

    let mut cached_details = Vec::new();
    let mut lookup_ids = Vec::new();
    {
        let cache = state.cipher_cache.lock();
        for &domain_id in &deduped {
            match cache.probe_latest(domain_id, now) {
                Some(entry) => cached_details.push(BaseCipherDetails {
                    domain_id,
                    base_cipher_id: entry.base_cipher_id,
                    material: entry.material,
                    refresh_at: Some(entry.refresh_at),
                    expire_at: Some(entry.expire_at),
                }),
                None => lookup_ids.push(domain_id),
            }
        }
    }
    bump(
        &state.metrics.cipher_domain_cache_hits,
        cached_details.len() as u64,
    );
    bump(
        &state.metrics.cipher_domain_cache_misses,
        lookup_ids.len() as u64,
    );

    if let Some(debug_id) = debug_id {
        debug!(
            debug_id,
            n_keys = deduped.len(),
            hits = cached_details.len(),
            misses = %trace_ids(&lookup_ids, state.max_debug_trace_ids),
            "get latest cipher keys"
        );
    }

    let mut fetched: Vec<(KmsCipherKeyDetails, CipherKeyValidity)> = Vec::new();
    if !lookup_ids.is_empty() {
        let requested: HashSet<DomainId> = lookup_ids.iter().copied().collect();
        let kms_req = KmsLookupByDomainIdsRequest {
            domain_ids: lookup_ids,
            debug_id,
        };
        match fetch_latest_cipher_keys(state, connector, kms_req, &requested, now).await {
            Ok(details) => fetched = details,
            Err(e) if e.is_client_reportable() => {
                warn!(error = %e, "latest cipher key lookup failed");
                bump(&state.metrics.responses_with_errors, 1);
                let _ = reply.send(GetLatestReply {
                    error: Some(e),
                    ..Default::default()
                });
                return Ok(());
            }
            Err(e) => {
                error!(error = %e, "latest cipher key lookup failed unexpectedly");
                return Err(e);
            }
        }
    }

    let num_hits = cached_details.len();
    let mut base_cipher_details: Vec<BaseCipherDetails> = fetched
        .iter()
        .map(|(d, validity)| BaseCipherDetails {
            domain_id: d.domain_id,
            base_cipher_id: d.base_cipher_id,
            material: d.material.clone(),
            refresh_at: Some(validity.refresh_at),
            expire_at: Some(validity.expire_at),
        })
        .collect();
    base_cipher_details.extend(cached_details);

    let _ = reply.send(GetLatestReply {
        base_cipher_details,
        num_hits,
        error: None,
    });

    // Cache warm-up happens after responding to the caller.
    if !fetched.is_empty() {
        let mut cache = state.cipher_cache.lock();
        for (d, validity) in fetched {
            cache.insert_latest(
                d.domain_id,
                d.base_cipher_id,
                d.material,
                validity.refresh_at,
                validity.expire_at,
            );
        }
    }
    Ok(())
}

async fn fetch_latest_cipher_keys(
    state: &ProxyState,
    connector: &Arc<dyn KmsConnector>,
    kms_req: KmsLookupByDomainIdsRequest,
    requested: &HashSet<DomainId>,
    now: i64,
) -> EkpResult<Vec<(KmsCipherKeyDetails, CipherKeyValidity)>> {
    let retried = kms_req.domain_ids.clone();
    let trace_cap = state.max_debug_trace_ids;
    let start = Instant::now();
    let kms_reply = with_backoff(
        state.retry_policy,
        || connector.lookup_by_domain_ids(kms_req.clone()),
        || debug!(ids = %trace_ids(&retried, trace_cap), "retrying KMS lookup by domain ids"),
        "GetLatestCipherKeys",
    )
    .await?;
    debug!(
        elapsed_ms = start.elapsed().as_millis() as u64,
        n_details = kms_reply.cipher_key_details.len(),
        "KMS lookup by domain ids finished"
    );

    let mut fetched = Vec::with_capacity(kms_reply.cipher_key_details.len());
    for details in kms_reply.cipher_key_details {
        if !requested.contains(&details.domain_id) {
            error!(
                domain_id = details.domain_id,
                "KMS returned a domain that was not requested"
            );
            return Err(EkpError::KeysFetchFailed);
        }
        let validity = compute_validity(
            details.refresh_after_secs,
            details.expire_after_secs,
            now,
            state.default_ttl,
        );
        fetched.push((details, validity));
    }
    Ok(fetched)
}

// ---------------------------------------------------------------------------
// Blob metadata
// ---------------------------------------------------------------------------

/// Handle a `GetBlobMetadata` request. KMS records are inserted verbatim;
/// their validity horizons come embedded in the record.
///
/// # Errors
///
/// Returns only non-client-reportable errors; reportable ones are sent as
/// the reply.
pub async fn get_latest_blob_metadata(
    state: &Arc<ProxyState>,
    connector: &Arc<dyn KmsConnector>,
    req: GetBlobMetadataRequest,
) -> EkpResult<()> {
    let GetBlobMetadataRequest {
        domain_ids,
        debug_id,
        reply,
    } = req;
    let now = now_ts();

    let deduped: HashSet<BlobDomainId> = domain_ids.into_iter().collect();

    let mut cached_details = Vec::new();
    let mut lookup_ids = Vec::new();
    {
        let cache = state.blob_cache.lock();
        for &domain_id in &deduped {
            match cache.probe(domain_id, now) {
                Some(details) => cached_details.push(details),
                None => lookup_ids.push(domain_id),
            }
        }
    }
    bump(
        &state.metrics.blob_metadata_cache_hits,
        cached_details.len() as u64,
    );
    bump(
        &state.metrics.blob_metadata_cache_misses,
        lookup_ids.len() as u64,
    );

    if let Some(debug_id) = debug_id {
        debug!(
            debug_id,
            n_keys = deduped.len(),
            hits = cached_details.len(),
            misses = %trace_ids(&lookup_ids, state.max_debug_trace_ids),
            "get latest blob metadata"
        );
    }

    let mut fetched: Vec<BlobMetadataDetails> = Vec::new();
    if !lookup_ids.is_empty() {
        let retried = lookup_ids.clone();
        let trace_cap = state.max_debug_trace_ids;
        let kms_req = KmsBlobMetadataRequest {
            domain_ids: lookup_ids,
            debug_id,
        };
        let start = Instant::now();
        let result = with_backoff(
            state.retry_policy,
            || connector.blob_metadata(kms_req.clone()),
            || debug!(ids = %trace_ids(&retried, trace_cap), "retrying KMS blob metadata lookup"),
            "GetLatestBlobMetadata",
        )
        .await;
        match result {
            Ok(kms_reply) => {
                debug!(
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    n_details = kms_reply.metadata_details.len(),
                    "KMS blob metadata lookup finished"
                );
                fetched = kms_reply.metadata_details;
            }
            Err(e) if e.is_client_reportable() => {
                warn!(error = %e, "blob metadata lookup failed");
                let _ = reply.send(Err(e));
                return Ok(());
            }
            Err(e) => {
                error!(error = %e, "blob metadata lookup failed unexpectedly");
                return Err(e);
            }
        }
    }

    let mut metadata_details = fetched.clone();
    metadata_details.extend(cached_details);
    let _ = reply.send(Ok(GetBlobMetadataReply { metadata_details }));

    // Cache warm-up happens after responding to the caller.
    if !fetched.is_empty() {
        let mut cache = state.blob_cache.lock();
        for details in fetched {
            cache.insert(details, now);
        }
    }
    Ok(())
}
