//! Deterministic in-process KMS for simulation, perf runs, and tests.
//!
//! Key material is a pure function of `(domain id, base cipher id)`, so any
//! two simulator instances agree on every key and replies are reproducible
//! across runs.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use ekp_common::protocol::{
    BaseCipherId, BlobDomainId, BlobMetadataDetails, DomainId, KeyMaterial,
};
use ekp_common::EkpResult;

use crate::validity::now_ts;

use super::{
    KmsBlobMetadataReply, KmsBlobMetadataRequest, KmsCipherKeyDetails, KmsConnector,
    KmsLookupByDomainIdsReply, KmsLookupByDomainIdsRequest, KmsLookupByKeyIdsReply,
    KmsLookupByKeyIdsRequest,
};

/// Symmetric key size served by the simulator.
const SIM_KEY_LEN: usize = 32;

/// Refresh interval advertised on latest-key replies.
const SIM_REFRESH_AFTER_SECS: i64 = 600;

/// Expiry interval advertised on all replies; negative marks the keys
/// non-revocable.
const SIM_EXPIRE_AFTER_SECS: i64 = -1;

/// Blob metadata horizons, relative to the reply time.
const SIM_BLOB_REFRESH_AFTER_SECS: i64 = 600;
const SIM_BLOB_EXPIRE_AFTER_SECS: i64 = 3_600;

/// In-process simulated KMS.
pub struct SimKmsConnector {
    connector_type: &'static str,
}

impl SimKmsConnector {
    pub fn new(connector_type: &'static str) -> Self {
        Self { connector_type }
    }
}

/// The current latest key version for a domain.
fn latest_base_cipher_id(domain_id: DomainId) -> BaseCipherId {
    domain_id.unsigned_abs().wrapping_add(1)
}

/// Derive the key material for a specific `(domain, key id)` pair.
fn sim_material(domain_id: DomainId, base_cipher_id: BaseCipherId) -> KeyMaterial {
    let seed = (domain_id as u64).rotate_left(32) ^ base_cipher_id;
    let mut rng = StdRng::seed_from_u64(seed);
    let mut buf = vec![0u8; SIM_KEY_LEN];
    rng.fill_bytes(&mut buf);
    KeyMaterial::new(buf)
}

#[async_trait]
impl KmsConnector for SimKmsConnector {
    fn connector_type(&self) -> &'static str {
        self.connector_type
    }

    async fn lookup_by_key_ids(
        &self,
        req: KmsLookupByKeyIdsRequest,
    ) -> EkpResult<KmsLookupByKeyIdsReply> {
        let cipher_key_details = req
            .cipher_ids
            .into_iter()
            .map(|(domain_id, base_cipher_id)| KmsCipherKeyDetails {
                domain_id,
                base_cipher_id,
                material: sim_material(domain_id, base_cipher_id),
                refresh_after_secs: None,
                expire_after_secs: Some(SIM_EXPIRE_AFTER_SECS),
            })
            .collect();
        Ok(KmsLookupByKeyIdsReply { cipher_key_details })
    }

    async fn lookup_by_domain_ids(
        &self,
        req: KmsLookupByDomainIdsRequest,
    ) -> EkpResult<KmsLookupByDomainIdsReply> {
        let cipher_key_details = req
            .domain_ids
            .into_iter()
            .map(|domain_id| {
                let base_cipher_id = latest_base_cipher_id(domain_id);
                KmsCipherKeyDetails {
                    domain_id,
                    base_cipher_id,
                    material: sim_material(domain_id, base_cipher_id),
                    refresh_after_secs: Some(SIM_REFRESH_AFTER_SECS),
                    expire_after_secs: Some(SIM_EXPIRE_AFTER_SECS),
                }
            })
            .collect();
        Ok(KmsLookupByDomainIdsReply { cipher_key_details })
    }

    async fn blob_metadata(
        &self,
        req: KmsBlobMetadataRequest,
    ) -> EkpResult<KmsBlobMetadataReply> {
        let now = now_ts();
        let metadata_details = req
            .domain_ids
            .into_iter()
            .map(|domain_id| sim_blob_details(domain_id, now))
            .collect();
        Ok(KmsBlobMetadataReply { metadata_details })
    }
}

fn sim_blob_details(domain_id: BlobDomainId, now: i64) -> BlobMetadataDetails {
    BlobMetadataDetails {
        domain_id,
        locations: vec![format!("blobstore://sim/{domain_id}/0")],
        refresh_at: now + SIM_BLOB_REFRESH_AFTER_SECS,
        expire_at: now + SIM_BLOB_EXPIRE_AFTER_SECS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kms::SIM_KMS_CONNECTOR_TYPE;

    #[test]
    fn material_is_deterministic() {
        assert_eq!(sim_material(7, 42), sim_material(7, 42));
        assert_ne!(sim_material(7, 42), sim_material(7, 43));
        assert_ne!(sim_material(7, 42), sim_material(8, 42));
        assert_eq!(sim_material(7, 42).len(), SIM_KEY_LEN);
    }

    #[tokio::test]
    async fn latest_lookup_agrees_with_by_id_lookup() {
        let sim = SimKmsConnector::new(SIM_KMS_CONNECTOR_TYPE);

        let latest = sim
            .lookup_by_domain_ids(KmsLookupByDomainIdsRequest {
                domain_ids: vec![7],
                debug_id: None,
            })
            .await
            .unwrap();
        assert_eq!(latest.cipher_key_details.len(), 1);
        let detail = &latest.cipher_key_details[0];
        assert_eq!(detail.refresh_after_secs, Some(SIM_REFRESH_AFTER_SECS));

        let by_id = sim
            .lookup_by_key_ids(KmsLookupByKeyIdsRequest {
                cipher_ids: vec![(detail.domain_id, detail.base_cipher_id)],
                debug_id: None,
            })
            .await
            .unwrap();
        assert_eq!(by_id.cipher_key_details[0].material, detail.material);
    }

    #[tokio::test]
    async fn blob_metadata_covers_every_requested_domain() {
        let sim = SimKmsConnector::new(SIM_KMS_CONNECTOR_TYPE);
        let reply = sim
            .blob_metadata(KmsBlobMetadataRequest {
                domain_ids: vec![1, 2, 3],
                debug_id: None,
            })
            .await
            .unwrap();
        assert_eq!(reply.metadata_details.len(), 3);
        for d in &reply.metadata_details {
            assert!(d.expire_at > d.refresh_at);
            assert!(!d.locations.is_empty());
        }
    }
}
