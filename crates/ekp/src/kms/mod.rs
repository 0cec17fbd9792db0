//! The KMS connector capability: the only surface the cache engine consumes.
//!
//! Concrete transports implement [`KmsConnector`]; the engine holds a boxed
//! instance selected by [`activate_kms_connector`] and never downcasts.

pub mod rest;
pub mod sim;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use ekp_common::protocol::{
    BaseCipherId, BlobDomainId, BlobMetadataDetails, DomainId, KeyMaterial,
};
use ekp_common::{EkpError, EkpResult};

use crate::config::Config;
use rest::RestKmsConnector;
use sim::SimKmsConnector;

pub const REST_KMS_CONNECTOR_TYPE: &str = "RESTKmsConnector";
pub const PERF_KMS_CONNECTOR_TYPE: &str = "FDBPerfKmsConnector";
pub const SIM_KMS_CONNECTOR_TYPE: &str = "SimKmsConnector";

// ---------------------------------------------------------------------------
// Connector request / reply types
// ---------------------------------------------------------------------------

/// One base cipher key as described by the KMS.
#[derive(Debug, Clone)]
pub struct KmsCipherKeyDetails {
    pub domain_id: DomainId,
    pub base_cipher_id: BaseCipherId,
    pub material: KeyMaterial,
    /// Advertised refresh interval in seconds; see the validity policy.
    pub refresh_after_secs: Option<i64>,
    /// Advertised expiry interval in seconds; negative means non-revocable.
    pub expire_after_secs: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct KmsLookupByKeyIdsRequest {
    pub cipher_ids: Vec<(DomainId, BaseCipherId)>,
    pub debug_id: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct KmsLookupByKeyIdsReply {
    pub cipher_key_details: Vec<KmsCipherKeyDetails>,
}

#[derive(Debug, Clone, Default)]
pub struct KmsLookupByDomainIdsRequest {
    pub domain_ids: Vec<DomainId>,
    pub debug_id: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct KmsLookupByDomainIdsReply {
    pub cipher_key_details: Vec<KmsCipherKeyDetails>,
}

#[derive(Debug, Clone, Default)]
pub struct KmsBlobMetadataRequest {
    pub domain_ids: Vec<BlobDomainId>,
    pub debug_id: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct KmsBlobMetadataReply {
    pub metadata_details: Vec<BlobMetadataDetails>,
}

// ---------------------------------------------------------------------------
// Capability trait
// ---------------------------------------------------------------------------

/// Abstract transport to the external key management service.
#[async_trait]
pub trait KmsConnector: Send + Sync {
    /// The connector type string this instance was activated as.
    fn connector_type(&self) -> &'static str;

    /// Fetch specific base cipher key versions.
    async fn lookup_by_key_ids(
        &self,
        req: KmsLookupByKeyIdsRequest,
    ) -> EkpResult<KmsLookupByKeyIdsReply>;

    /// Fetch the latest base cipher key per domain.
    async fn lookup_by_domain_ids(
        &self,
        req: KmsLookupByDomainIdsRequest,
    ) -> EkpResult<KmsLookupByDomainIdsReply>;

    /// Fetch blob storage credentials metadata per blob domain.
    async fn blob_metadata(
        &self,
        req: KmsBlobMetadataRequest,
    ) -> EkpResult<KmsBlobMetadataReply>;

    /// Long-running task for the connector's own I/O, owned and supervised
    /// by the server loop. The default implementation idles forever;
    /// returning is treated as an internal invariant violation by the
    /// supervisor.
    async fn core_task(&self) -> EkpResult<()> {
        std::future::pending::<()>().await;
        Ok(())
    }
}

/// Construct the connector selected by `KMS_CONNECTOR_TYPE`.
///
/// The perf harness runs against the in-process simulator; only the REST
/// connector talks to a real endpoint.
///
/// # Errors
///
/// Returns an error for an unknown connector type or an unusable REST
/// configuration. `Config::validate` catches both earlier in normal startup.
pub fn activate_kms_connector(cfg: &Config) -> EkpResult<Arc<dyn KmsConnector>> {
    match cfg.kms_connector_type.as_str() {
        SIM_KMS_CONNECTOR_TYPE => Ok(Arc::new(SimKmsConnector::new(SIM_KMS_CONNECTOR_TYPE))),
        PERF_KMS_CONNECTOR_TYPE => Ok(Arc::new(SimKmsConnector::new(PERF_KMS_CONNECTOR_TYPE))),
        REST_KMS_CONNECTOR_TYPE => {
            let endpoint = cfg
                .kms_endpoint_url
                .as_deref()
                .filter(|url| !url.trim().is_empty())
                .ok_or_else(|| {
                    EkpError::Internal(format!(
                        "KMS_ENDPOINT_URL is required for {REST_KMS_CONNECTOR_TYPE}"
                    ))
                })?;
            let connector = RestKmsConnector::new(
                endpoint,
                Duration::from_secs(cfg.kms_request_timeout_secs),
            )?;
            Ok(Arc::new(connector))
        }
        other => Err(EkpError::Internal(format!(
            "unknown KMS connector type: {other}"
        ))),
    }
}
