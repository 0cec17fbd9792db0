//! End-to-end scenarios through the server loop, driven by a scripted KMS
//! connector that records the exact id sets it is asked for.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use ekp::config::Config;
use ekp::kms::{
    KmsBlobMetadataReply, KmsBlobMetadataRequest, KmsCipherKeyDetails, KmsConnector,
    KmsLookupByDomainIdsReply, KmsLookupByDomainIdsRequest, KmsLookupByKeyIdsReply,
    KmsLookupByKeyIdsRequest,
};
use ekp::server::spawn_with_connector;
use ekp::validity::{now_ts, NEVER_TS};
use ekp_common::protocol::{BaseCipherId, DomainId, KeyMaterial};
use ekp_common::{EkpError, EkpResult};

/// Scripted KMS: serves a fixed latest-key table and records every request.
#[derive(Default)]
struct ScriptedKms {
    latest: Vec<KmsCipherKeyDetails>,
    fail_with: Option<EkpError>,
    domain_calls: Mutex<Vec<Vec<DomainId>>>,
    key_id_calls: Mutex<Vec<Vec<(DomainId, BaseCipherId)>>>,
}

impl ScriptedKms {
    fn with_latest(latest: Vec<KmsCipherKeyDetails>) -> Arc<Self> {
        Arc::new(Self {
            latest,
            ..Default::default()
        })
    }

    fn failing(e: EkpError) -> Arc<Self> {
        Arc::new(Self {
            fail_with: Some(e),
            ..Default::default()
        })
    }

    fn domain_calls(&self) -> Vec<Vec<DomainId>> {
        self.domain_calls.lock().clone()
    }

    fn key_id_calls(&self) -> Vec<Vec<(DomainId, BaseCipherId)>> {
        self.key_id_calls.lock().clone()
    }
}

#[async_trait]
impl KmsConnector for ScriptedKms {
    fn connector_type(&self) -> &'static str {
        "ScriptedKms"
    }

    async fn lookup_by_key_ids(
        &self,
        req: KmsLookupByKeyIdsRequest,
    ) -> EkpResult<KmsLookupByKeyIdsReply> {
        let mut ids = req.cipher_ids.clone();
        ids.sort_unstable();
        self.key_id_calls.lock().push(ids);
        if let Some(e) = &self.fail_with {
            return Err(e.clone());
        }
        Ok(KmsLookupByKeyIdsReply {
            cipher_key_details: self
                .latest
                .iter()
                .filter(|d| req.cipher_ids.contains(&(d.domain_id, d.base_cipher_id)))
                .cloned()
                .collect(),
        })
    }

    async fn lookup_by_domain_ids(
        &self,
        req: KmsLookupByDomainIdsRequest,
    ) -> EkpResult<KmsLookupByDomainIdsReply> {
        let mut ids = req.domain_ids.clone();
        ids.sort_unstable();
        self.domain_calls.lock().push(ids);
        if let Some(e) = &self.fail_with {
            return Err(e.clone());
        }
        Ok(KmsLookupByDomainIdsReply {
            cipher_key_details: self
                .latest
                .iter()
                .filter(|d| req.domain_ids.contains(&d.domain_id))
                .cloned()
                .collect(),
        })
    }

    async fn blob_metadata(
        &self,
        _req: KmsBlobMetadataRequest,
    ) -> EkpResult<KmsBlobMetadataReply> {
        if let Some(e) = &self.fail_with {
            return Err(e.clone());
        }
        Ok(KmsBlobMetadataReply::default())
    }
}

fn latest_key(domain_id: DomainId, base_cipher_id: BaseCipherId, tag: u8) -> KmsCipherKeyDetails {
    KmsCipherKeyDetails {
        domain_id,
        base_cipher_id,
        material: KeyMaterial::from(vec![tag; 32]),
        refresh_after_secs: Some(300),
        expire_after_secs: Some(-1),
    }
}

fn fast_retry_config() -> Config {
    Config {
        kms_backoff_base_ms: 1,
        kms_backoff_max_ms: 4,
        ..Config::default()
    }
}

#[tokio::test]
async fn cold_miss_then_warm_hit_without_a_second_fetch() {
    let kms = ScriptedKms::with_latest(vec![latest_key(7, 42, 0x4b)]);
    let (proxy, server) = spawn_with_connector(fast_retry_config(), kms.clone());

    let before = now_ts();
    let first = proxy.get_latest_cipher_keys(vec![7], Some(1)).await.unwrap();
    assert!(first.error.is_none());
    assert_eq!(first.num_hits, 0);
    assert_eq!(first.base_cipher_details.len(), 1);
    let detail = &first.base_cipher_details[0];
    assert_eq!(detail.base_cipher_id, 42);
    assert_eq!(detail.material.as_bytes(), &[0x4bu8; 32]);
    // refresh_after=300 becomes an absolute horizon; expire_after=-1 never
    // expires.
    let refresh_at = detail.refresh_at.unwrap();
    assert!(refresh_at >= before + 300 && refresh_at <= now_ts() + 300);
    assert_eq!(detail.expire_at, Some(NEVER_TS));

    // The warmed entry satisfies the by-ids path without any KMS traffic.
    let by_ids = proxy.get_cipher_keys_by_ids(vec![(7, 42)], None).await.unwrap();
    assert!(by_ids.error.is_none());
    assert_eq!(by_ids.num_hits, 1);
    assert_eq!(by_ids.base_cipher_details[0].material.as_bytes(), &[0x4bu8; 32]);
    assert!(kms.key_id_calls().is_empty());
    assert_eq!(kms.domain_calls().len(), 1);

    proxy.halt(0).await.unwrap();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn mixed_hit_and_miss_fetches_only_the_misses() {
    let kms = ScriptedKms::with_latest(vec![latest_key(7, 42, 1), latest_key(8, 51, 2)]);
    let (proxy, server) = spawn_with_connector(fast_retry_config(), kms.clone());

    // Warm domain 7.
    proxy.get_latest_cipher_keys(vec![7], None).await.unwrap();

    let reply = proxy.get_latest_cipher_keys(vec![7, 8], None).await.unwrap();
    assert_eq!(reply.base_cipher_details.len(), 2);
    assert_eq!(reply.num_hits, 1);

    // Exactly one extra KMS call, asking only for the miss.
    assert_eq!(kms.domain_calls(), vec![vec![7], vec![8]]);

    proxy.halt(0).await.unwrap();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn timeout_exhausts_the_retry_budget_then_reports() {
    let kms = ScriptedKms::failing(EkpError::TimedOut);
    let cfg = Config {
        kms_connection_retries: 3,
        ..fast_retry_config()
    };
    let (proxy, server) = spawn_with_connector(cfg, kms.clone());

    let reply = proxy.get_latest_cipher_keys(vec![1], None).await.unwrap();
    assert_eq!(reply.error, Some(EkpError::TimedOut));
    assert!(reply.base_cipher_details.is_empty());
    // retries + 1 attempts in total.
    assert_eq!(kms.domain_calls().len(), 4);

    proxy.halt(0).await.unwrap();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn fetch_failure_reports_without_retrying() {
    let kms = ScriptedKms::failing(EkpError::KeysFetchFailed);
    let (proxy, server) = spawn_with_connector(fast_retry_config(), kms.clone());

    let reply = proxy.get_cipher_keys_by_ids(vec![(1, 1)], None).await.unwrap();
    assert_eq!(reply.error, Some(EkpError::KeysFetchFailed));
    assert_eq!(kms.key_id_calls().len(), 1);

    proxy.halt(0).await.unwrap();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn partial_reply_warms_only_the_returned_domains() {
    // The KMS only knows domains 1 and 2.
    let kms = ScriptedKms::with_latest(vec![latest_key(1, 11, 1), latest_key(2, 22, 2)]);
    let (proxy, server) = spawn_with_connector(fast_retry_config(), kms.clone());

    let reply = proxy.get_latest_cipher_keys(vec![1, 2, 3], None).await.unwrap();
    assert!(reply.error.is_none());
    let mut domains: Vec<_> = reply
        .base_cipher_details
        .iter()
        .map(|d| d.domain_id)
        .collect();
    domains.sort_unstable();
    assert_eq!(domains, vec![1, 2]);

    // 1 and 2 are now cached; 3 still misses and triggers another fetch.
    let again = proxy.get_latest_cipher_keys(vec![1, 2, 3], None).await.unwrap();
    assert_eq!(again.num_hits, 2);
    assert_eq!(kms.domain_calls().len(), 2);
    assert_eq!(kms.domain_calls()[1], vec![3]);

    proxy.halt(0).await.unwrap();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn unsolicited_kms_reply_is_a_protocol_violation() {
    // The KMS answers for domain 9 no matter what was asked.
    struct RogueKms;

    #[async_trait]
    impl KmsConnector for RogueKms {
        fn connector_type(&self) -> &'static str {
            "RogueKms"
        }

        async fn lookup_by_key_ids(
            &self,
            _req: KmsLookupByKeyIdsRequest,
        ) -> EkpResult<KmsLookupByKeyIdsReply> {
            Ok(KmsLookupByKeyIdsReply::default())
        }

        async fn lookup_by_domain_ids(
            &self,
            _req: KmsLookupByDomainIdsRequest,
        ) -> EkpResult<KmsLookupByDomainIdsReply> {
            Ok(KmsLookupByDomainIdsReply {
                cipher_key_details: vec![latest_key(9, 99, 9)],
            })
        }

        async fn blob_metadata(
            &self,
            _req: KmsBlobMetadataRequest,
        ) -> EkpResult<KmsBlobMetadataReply> {
            Ok(KmsBlobMetadataReply::default())
        }
    }

    let (proxy, server) = spawn_with_connector(fast_retry_config(), Arc::new(RogueKms));

    let reply = proxy.get_latest_cipher_keys(vec![1], None).await.unwrap();
    assert_eq!(reply.error, Some(EkpError::KeysFetchFailed));

    // The unsolicited key must not have been cached.
    let probe = proxy.get_latest_cipher_keys(vec![9], None).await.unwrap();
    assert_eq!(probe.num_hits, 0);

    proxy.halt(0).await.unwrap();
    server.await.unwrap().unwrap();
}
