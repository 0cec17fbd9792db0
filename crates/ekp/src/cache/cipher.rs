//! The two base cipher key maps: latest-per-domain and historical by
//! `(domain, key id)`.
//!
//! Coherence rule: a fresh latest-per-domain key is written into *both*
//! maps, with the historical copy carrying a never-refresh horizon (a
//! specific key version never rotates; only the latest-per-domain view
//! does). Historical-only inserts never touch the latest map.

use std::collections::HashMap;
use std::num::NonZeroUsize;

use lru::LruCache;

use ekp_common::protocol::{BaseCipherId, DomainId, KeyMaterial};

use crate::validity::NEVER_TS;

/// A cached base cipher key with its validity horizons.
#[derive(Debug, Clone)]
pub struct BaseCipherKey {
    pub domain_id: DomainId,
    pub base_cipher_id: BaseCipherId,
    pub material: KeyMaterial,
    /// Wall-clock seconds after which the entry is stale for serving and
    /// eligible for a KMS refresh.
    pub refresh_at: i64,
    /// Wall-clock seconds after which the entry must not be served.
    /// Revocable keys carry a finite value; non-revocable keys carry
    /// [`NEVER_TS`] and may keep being served through a missed refresh.
    pub expire_at: i64,
}

impl BaseCipherKey {
    /// Servable right now: neither horizon has passed.
    ///
    /// The conjunction matters: once `refresh_at` is reached the entry is
    /// stale for serving even if not yet expired, which forces a miss-path
    /// re-fetch.
    pub fn is_valid(&self, now: i64) -> bool {
        self.expire_at > now && self.refresh_at > now
    }

    /// Past the expire horizon; must be purged.
    pub fn is_expired(&self, now: i64) -> bool {
        now > self.expire_at
    }

    /// Will cross either horizon before the next refresh cycle.
    pub fn needs_refresh(&self, now: i64, refresh_interval: i64) -> bool {
        let next_cycle = now.saturating_add(refresh_interval);
        next_cycle > self.expire_at || next_cycle > self.refresh_at
    }
}

/// In-memory cache of base cipher keys.
///
/// Not internally synchronised; the owner serialises access behind a single
/// mutex, held only between suspension points.
pub struct CipherKeyCache {
    latest_by_domain: HashMap<DomainId, BaseCipherKey>,
    /// Bounded LRU; evicting a live entry only costs a re-fetch on the next
    /// miss.
    by_domain_and_key: LruCache<(DomainId, BaseCipherId), BaseCipherKey>,
}

impl CipherKeyCache {
    /// Create an empty cache with the given bound on the historical map.
    pub fn new(id_cache_capacity: NonZeroUsize) -> Self {
        Self {
            latest_by_domain: HashMap::new(),
            by_domain_and_key: LruCache::new(id_cache_capacity),
        }
    }

    /// Look up a specific key version, returning it only while servable.
    pub fn probe_by_id(
        &mut self,
        domain_id: DomainId,
        base_cipher_id: BaseCipherId,
        now: i64,
    ) -> Option<BaseCipherKey> {
        self.by_domain_and_key
            .get(&(domain_id, base_cipher_id))
            .filter(|entry| entry.is_valid(now))
            .cloned()
    }

    /// Look up the latest key for a domain, returning it only while servable.
    pub fn probe_latest(&self, domain_id: DomainId, now: i64) -> Option<BaseCipherKey> {
        self.latest_by_domain
            .get(&domain_id)
            .filter(|entry| entry.is_valid(now))
            .cloned()
    }

    /// Whether a domain currently has a latest entry, servable or not.
    pub fn contains_latest(&self, domain_id: DomainId) -> bool {
        self.latest_by_domain.contains_key(&domain_id)
    }

    /// Record the latest key for a domain, updating both maps.
    pub fn insert_latest(
        &mut self,
        domain_id: DomainId,
        base_cipher_id: BaseCipherId,
        material: KeyMaterial,
        refresh_at: i64,
        expire_at: i64,
    ) {
        // The historical copy never rotates but still abides by the
        // KMS-governed expiry.
        self.insert_by_id(domain_id, base_cipher_id, material.clone(), NEVER_TS, expire_at);

        self.latest_by_domain.insert(
            domain_id,
            BaseCipherKey {
                domain_id,
                base_cipher_id,
                material,
                refresh_at,
                expire_at,
            },
        );
    }

    /// Record a specific key version in the historical map only.
    pub fn insert_by_id(
        &mut self,
        domain_id: DomainId,
        base_cipher_id: BaseCipherId,
        material: KeyMaterial,
        refresh_at: i64,
        expire_at: i64,
    ) {
        self.by_domain_and_key.put(
            (domain_id, base_cipher_id),
            BaseCipherKey {
                domain_id,
                base_cipher_id,
                material,
                refresh_at,
                expire_at,
            },
        );
    }

    /// Remove expired entries from the latest-per-domain map, returning how
    /// many were dropped.
    pub fn gc_expired(&mut self, now: i64) -> usize {
        let before = self.latest_by_domain.len();
        self.latest_by_domain.retain(|_, entry| !entry.is_expired(now));
        before - self.latest_by_domain.len()
    }

    /// One refresher pass over the latest-per-domain map: collect the
    /// domains whose entries will cross a horizon within the next
    /// `refresh_interval` seconds, and evict expired entries along the way.
    ///
    /// `force` is the fault-injection hook; when it returns `true` the entry
    /// becomes a candidate regardless of its horizons.
    pub fn collect_refresh_candidates(
        &mut self,
        now: i64,
        refresh_interval: i64,
        mut force: impl FnMut() -> bool,
    ) -> Vec<DomainId> {
        let mut candidates = Vec::new();
        self.latest_by_domain.retain(|domain_id, entry| {
            if force() || entry.needs_refresh(now, refresh_interval) {
                candidates.push(*domain_id);
            }
            !entry.is_expired(now)
        });
        candidates
    }

    /// Number of domains with a latest entry.
    pub fn latest_len(&self) -> usize {
        self.latest_by_domain.len()
    }

    /// Number of historical entries.
    pub fn by_id_len(&self) -> usize {
        self.by_domain_and_key.len()
    }
}
