//! Validity horizon computation for fetched cipher keys.
//!
//! The KMS advertises optional refresh and expiry *intervals*; the cache
//! stores absolute *timestamps*. Two horizons with distinct semantics:
//!
//! - `refresh_at`: the entry is stale for serving once this passes, which
//!   forces a miss-path re-fetch. Rotation only applies to the
//!   latest-per-domain view, so historical entries carry [`NEVER_TS`] here.
//! - `expire_at`: the entry must not be served past this point. Revocable
//!   keys have a finite expiry; non-revocable keys carry [`NEVER_TS`] and
//!   may keep being used through a KMS outage, which is why the two horizons
//!   are kept separate.

use std::time::{SystemTime, UNIX_EPOCH};

/// Sentinel timestamp for a horizon that never arrives.
pub const NEVER_TS: i64 = i64::MAX;

/// Absolute validity horizons for a cached cipher key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CipherKeyValidity {
    pub refresh_at: i64,
    pub expire_at: i64,
}

/// Current wall-clock time in whole seconds since the Unix epoch.
pub fn now_ts() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs() as i64)
}

/// Translate KMS-advertised intervals into absolute horizons.
///
/// Interval policy, in seconds relative to `now`:
///
/// | interval | refresh_at          | expire_at        |
/// |----------|---------------------|------------------|
/// | absent   | `now + default_ttl` | `= refresh_at`   |
/// | negative | never               | never            |
/// | zero     | `now + default_ttl` | `= refresh_at`   |
/// | positive | `now + n`           | `now + n`        |
///
/// Both results are strictly positive and `expire_at >= refresh_at` holds
/// whenever the KMS supplies consistent intervals.
pub fn compute_validity(
    refresh_interval: Option<i64>,
    expiry_interval: Option<i64>,
    now: i64,
    default_ttl: i64,
) -> CipherKeyValidity {
    let refresh_at = compute_refresh_at(refresh_interval, now, default_ttl);
    let expire_at = compute_expire_at(expiry_interval, now, refresh_at);
    CipherKeyValidity {
        refresh_at,
        expire_at,
    }
}

fn compute_refresh_at(refresh_interval: Option<i64>, now: i64, default_ttl: i64) -> i64 {
    let refresh_at = match refresh_interval {
        // Never refresh the key.
        Some(n) if n < 0 => NEVER_TS,
        Some(n) if n > 0 => now + n,
        // Zero or absent: fall back to the default TTL.
        _ => now + default_ttl,
    };

    assert!(refresh_at > 0, "computed refresh_at must be positive");

    refresh_at
}

fn compute_expire_at(expiry_interval: Option<i64>, now: i64, refresh_at: i64) -> i64 {
    assert!(refresh_at > 0, "refresh_at must be computed first");

    let expire_at = match expiry_interval {
        // Non-revocable key, never expires.
        Some(n) if n < 0 => NEVER_TS,
        Some(n) if n > 0 => now + n,
        // Zero or absent: match expiry to the refresh horizon.
        _ => refresh_at,
    };

    assert!(expire_at > 0, "computed expire_at must be positive");

    expire_at
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_000;
    const TTL: i64 = 600;

    #[test]
    fn absent_intervals_fall_back_to_default_ttl() {
        let v = compute_validity(None, None, NOW, TTL);
        assert_eq!(v.refresh_at, NOW + TTL);
        assert_eq!(v.expire_at, v.refresh_at);
    }

    #[test]
    fn zero_intervals_behave_like_absent() {
        let v = compute_validity(Some(0), Some(0), NOW, TTL);
        assert_eq!(v.refresh_at, NOW + TTL);
        assert_eq!(v.expire_at, v.refresh_at);
    }

    #[test]
    fn positive_intervals_are_relative_to_now() {
        let v = compute_validity(Some(300), Some(900), NOW, TTL);
        assert_eq!(v.refresh_at, 1_300);
        assert_eq!(v.expire_at, 1_900);
    }

    #[test]
    fn negative_refresh_means_never_refresh() {
        let v = compute_validity(Some(-1), Some(900), NOW, TTL);
        assert_eq!(v.refresh_at, NEVER_TS);
        assert_eq!(v.expire_at, 1_900);
    }

    #[test]
    fn negative_expiry_means_non_revocable() {
        let v = compute_validity(Some(300), Some(-1), NOW, TTL);
        assert_eq!(v.refresh_at, 1_300);
        assert_eq!(v.expire_at, NEVER_TS);
    }

    #[test]
    fn results_are_strictly_positive() {
        for refresh in [None, Some(-5), Some(0), Some(7)] {
            for expiry in [None, Some(-5), Some(0), Some(7)] {
                let v = compute_validity(refresh, expiry, NOW, TTL);
                assert!(v.refresh_at > 0);
                assert!(v.expire_at > 0);
            }
        }
    }

    #[test]
    fn now_ts_is_sane() {
        // Well past 2020-01-01.
        assert!(now_ts() > 1_577_836_800);
    }
}
