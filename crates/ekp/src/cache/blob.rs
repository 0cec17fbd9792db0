//! Blob storage metadata cache, keyed by blob domain id.
//!
//! Unlike cipher keys there is no historical index; the KMS embeds the
//! validity horizons in the metadata record itself and the cache adds a
//! local TTL on top.

use std::collections::HashMap;

use ekp_common::protocol::{BlobDomainId, BlobMetadataDetails};

/// A cached blob metadata record plus its local creation time.
#[derive(Debug, Clone)]
pub struct BlobMetadataEntry {
    pub details: BlobMetadataDetails,
    pub created_at: i64,
}

impl BlobMetadataEntry {
    /// Servable right now: inside the local TTL *and* the KMS-declared
    /// expiry. Both gates must hold.
    pub fn is_valid(&self, now: i64, ttl: i64) -> bool {
        now - self.created_at < ttl && now <= self.details.expire_at
    }

    /// Past the KMS-declared expiry; must be purged.
    pub fn is_expired(&self, now: i64) -> bool {
        now > self.details.expire_at
    }

    /// Will cross either KMS horizon before the next refresh cycle.
    pub fn needs_refresh(&self, now: i64, refresh_interval: i64) -> bool {
        let next_cycle = now.saturating_add(refresh_interval);
        next_cycle > self.details.expire_at || next_cycle > self.details.refresh_at
    }
}

/// In-memory blob metadata cache. Access is serialised by the owner.
pub struct BlobMetadataCache {
    by_domain: HashMap<BlobDomainId, BlobMetadataEntry>,
    ttl: i64,
}

impl BlobMetadataCache {
    /// Create an empty cache with the given local TTL in seconds.
    pub fn new(ttl: i64) -> Self {
        Self {
            by_domain: HashMap::new(),
            ttl,
        }
    }

    /// Look up a blob domain, returning its metadata only while servable.
    pub fn probe(&self, domain_id: BlobDomainId, now: i64) -> Option<BlobMetadataDetails> {
        self.by_domain
            .get(&domain_id)
            .filter(|entry| entry.is_valid(now, self.ttl))
            .map(|entry| entry.details.clone())
    }

    /// Record a metadata record verbatim, stamping the local creation time.
    pub fn insert(&mut self, details: BlobMetadataDetails, now: i64) {
        self.by_domain.insert(
            details.domain_id,
            BlobMetadataEntry {
                details,
                created_at: now,
            },
        );
    }

    /// Whether a blob domain currently has an entry, servable or not.
    pub fn contains(&self, domain_id: BlobDomainId) -> bool {
        self.by_domain.contains_key(&domain_id)
    }

    /// One refresher pass: collect domains whose entries will cross a KMS
    /// horizon within the next `refresh_interval` seconds, evicting expired
    /// entries along the way.
    pub fn collect_refresh_candidates(
        &mut self,
        now: i64,
        refresh_interval: i64,
        mut force: impl FnMut() -> bool,
    ) -> Vec<BlobDomainId> {
        let mut candidates = Vec::new();
        self.by_domain.retain(|domain_id, entry| {
            if force() || entry.needs_refresh(now, refresh_interval) {
                candidates.push(*domain_id);
            }
            !entry.is_expired(now)
        });
        candidates
    }

    /// Number of cached blob domains.
    pub fn len(&self) -> usize {
        self.by_domain.len()
    }

    /// Returns `true` if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.by_domain.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_000;
    const TTL: i64 = 100;

    fn details(domain_id: BlobDomainId, refresh_at: i64, expire_at: i64) -> BlobMetadataDetails {
        BlobMetadataDetails {
            domain_id,
            locations: vec![format!("blobstore://bucket/{domain_id}")],
            refresh_at,
            expire_at,
        }
    }

    #[test]
    fn probe_requires_both_gates() {
        let mut c = BlobMetadataCache::new(TTL);
        c.insert(details(1, NOW + 50, NOW + 500), NOW);

        assert!(c.probe(1, NOW + 10).is_some());
        // Local TTL elapsed even though the KMS expiry is far out.
        assert!(c.probe(1, NOW + TTL).is_none());

        // KMS expiry passed even though the local TTL has not.
        let mut c = BlobMetadataCache::new(TTL);
        c.insert(details(2, NOW + 5, NOW + 10), NOW);
        assert!(c.probe(2, NOW + 11).is_none());
    }

    #[test]
    fn insert_replaces_wholesale() {
        let mut c = BlobMetadataCache::new(TTL);
        c.insert(details(3, NOW + 50, NOW + 500), NOW);
        let replacement = BlobMetadataDetails {
            locations: vec!["blobstore://bucket/other".into()],
            ..details(3, NOW + 80, NOW + 800)
        };
        c.insert(replacement.clone(), NOW + 10);

        assert_eq!(c.len(), 1);
        assert_eq!(c.probe(3, NOW + 20).unwrap(), replacement);
    }

    #[test]
    fn refresh_pass_evicts_only_expired() {
        let mut c = BlobMetadataCache::new(TTL);
        // Expired: candidate and evicted.
        c.insert(details(1, NOW - 20, NOW - 10), NOW - 30);
        // Crosses refresh horizon next cycle: candidate, kept.
        c.insert(details(2, NOW + 30, NOW + 500), NOW);
        // Healthy: kept, not a candidate.
        c.insert(details(3, NOW + 400, NOW + 500), NOW);

        let mut candidates = c.collect_refresh_candidates(NOW, 60, || false);
        candidates.sort_unstable();
        assert_eq!(candidates, vec![1, 2]);
        assert!(!c.contains(1));
        assert!(c.contains(2));
        assert!(c.contains(3));
    }

    #[test]
    fn unexpired_entries_survive_the_refresh_pass() {
        // An entry inside both horizons must never be erased by the pass.
        let mut c = BlobMetadataCache::new(TTL);
        c.insert(details(4, NOW + 400, NOW + 500), NOW);
        let candidates = c.collect_refresh_candidates(NOW, 60, || false);
        assert!(candidates.is_empty());
        assert!(c.contains(4));
        assert!(!c.is_empty());
    }
}
