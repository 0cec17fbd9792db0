//! KMS connector speaking HTTP + JSON to an external key management
//! service.
//!
//! Endpoint URL parsing and connection pooling are `reqwest`'s concern; this
//! module owns the wire format and the mapping of transport failures onto
//! the proxy error taxonomy.

use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::warn;

use ekp_common::protocol::{BlobMetadataDetails, KeyMaterial};
use ekp_common::{EkpError, EkpResult};

use super::{
    KmsBlobMetadataReply, KmsBlobMetadataRequest, KmsCipherKeyDetails, KmsConnector,
    KmsLookupByDomainIdsReply, KmsLookupByDomainIdsRequest, KmsLookupByKeyIdsReply,
    KmsLookupByKeyIdsRequest, REST_KMS_CONNECTOR_TYPE,
};

const BY_KEY_IDS_PATH: &str = "get-encryption-keys-by-key-ids";
const BY_DOMAIN_IDS_PATH: &str = "get-encryption-keys-by-domain-ids";
const BLOB_METADATA_PATH: &str = "get-blob-metadata";

/// HTTP connector to a REST KMS.
pub struct RestKmsConnector {
    client: reqwest::Client,
    endpoint: String,
}

impl RestKmsConnector {
    /// Build a connector for `endpoint` with a per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(endpoint: &str, request_timeout: Duration) -> EkpResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| EkpError::Internal(format!("failed to build KMS HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_owned(),
        })
    }

    async fn post<Req: Serialize, Rep: DeserializeOwned>(
        &self,
        path: &str,
        req: &Req,
    ) -> EkpResult<Rep> {
        let url = format!("{}/{}", self.endpoint, path);
        let resp = self
            .client
            .post(&url)
            .json(req)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = resp.status();
        if !status.is_success() {
            warn!(%url, status = status.as_u16(), "KMS returned a failure status");
            return Err(map_status_error(status));
        }

        resp.json::<Rep>().await.map_err(|e| {
            warn!(%url, error = %e, "failed to decode KMS reply");
            EkpError::KeysFetchFailed
        })
    }
}

fn map_transport_error(e: reqwest::Error) -> EkpError {
    if e.is_timeout() {
        EkpError::TimedOut
    } else if e.is_connect() {
        EkpError::ConnectionFailed
    } else {
        EkpError::KeysFetchFailed
    }
}

/// A 404 is the KMS stating the requested ids do not exist; any other
/// failure status is an unusable reply.
fn map_status_error(status: reqwest::StatusCode) -> EkpError {
    if status == reqwest::StatusCode::NOT_FOUND {
        EkpError::KeyNotFound
    } else {
        EkpError::KeysFetchFailed
    }
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct WireCipherId {
    domain_id: i64,
    base_cipher_id: u64,
}

#[derive(Debug, Serialize)]
struct WireByKeyIdsRequest {
    cipher_key_ids: Vec<WireCipherId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    debug_id: Option<u64>,
}

#[derive(Debug, Serialize)]
struct WireByDomainIdsRequest {
    domain_ids: Vec<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    debug_id: Option<u64>,
}

#[derive(Debug, Serialize)]
struct WireBlobMetadataRequest {
    blob_domain_ids: Vec<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    debug_id: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireCipherKeyDetails {
    domain_id: i64,
    base_cipher_id: u64,
    /// Base64-encoded key material.
    base_cipher_key: String,
    refresh_after_secs: Option<i64>,
    expire_after_secs: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct WireCipherKeysReply {
    cipher_key_details: Vec<WireCipherKeyDetails>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireBlobMetadataDetails {
    domain_id: i64,
    locations: Vec<String>,
    refresh_at: i64,
    expire_at: i64,
}

#[derive(Debug, Deserialize)]
struct WireBlobMetadataReply {
    blob_metadata_details: Vec<WireBlobMetadataDetails>,
}

fn decode_details(wire: WireCipherKeyDetails) -> EkpResult<KmsCipherKeyDetails> {
    let material = BASE64.decode(&wire.base_cipher_key).map_err(|_| {
        warn!(
            domain_id = wire.domain_id,
            base_cipher_id = wire.base_cipher_id,
            "KMS reply carried undecodable key material"
        );
        EkpError::KeysFetchFailed
    })?;
    Ok(KmsCipherKeyDetails {
        domain_id: wire.domain_id,
        base_cipher_id: wire.base_cipher_id,
        material: KeyMaterial::new(material),
        refresh_after_secs: wire.refresh_after_secs,
        expire_after_secs: wire.expire_after_secs,
    })
}

#[async_trait]
impl KmsConnector for RestKmsConnector {
    fn connector_type(&self) -> &'static str {
        REST_KMS_CONNECTOR_TYPE
    }

    async fn lookup_by_key_ids(
        &self,
        req: KmsLookupByKeyIdsRequest,
    ) -> EkpResult<KmsLookupByKeyIdsReply> {
        let wire_req = WireByKeyIdsRequest {
            cipher_key_ids: req
                .cipher_ids
                .iter()
                .map(|&(domain_id, base_cipher_id)| WireCipherId {
                    domain_id,
                    base_cipher_id,
                })
                .collect(),
            debug_id: req.debug_id,
        };
        let reply: WireCipherKeysReply = self.post(BY_KEY_IDS_PATH, &wire_req).await?;
        let cipher_key_details = reply
            .cipher_key_details
            .into_iter()
            .map(decode_details)
            .collect::<EkpResult<Vec<_>>>()?;
        Ok(KmsLookupByKeyIdsReply { cipher_key_details })
    }

    async fn lookup_by_domain_ids(
        &self,
        req: KmsLookupByDomainIdsRequest,
    ) -> EkpResult<KmsLookupByDomainIdsReply> {
        let wire_req = WireByDomainIdsRequest {
            domain_ids: req.domain_ids,
            debug_id: req.debug_id,
        };
        let reply: WireCipherKeysReply = self.post(BY_DOMAIN_IDS_PATH, &wire_req).await?;
        let cipher_key_details = reply
            .cipher_key_details
            .into_iter()
            .map(decode_details)
            .collect::<EkpResult<Vec<_>>>()?;
        Ok(KmsLookupByDomainIdsReply { cipher_key_details })
    }

    async fn blob_metadata(
        &self,
        req: KmsBlobMetadataRequest,
    ) -> EkpResult<KmsBlobMetadataReply> {
        let wire_req = WireBlobMetadataRequest {
            blob_domain_ids: req.domain_ids,
            debug_id: req.debug_id,
        };
        let reply: WireBlobMetadataReply = self.post(BLOB_METADATA_PATH, &wire_req).await?;
        let metadata_details = reply
            .blob_metadata_details
            .into_iter()
            .map(|wire| BlobMetadataDetails {
                domain_id: wire.domain_id,
                locations: wire.locations,
                refresh_at: wire.refresh_at,
                expire_at: wire.expire_at,
            })
            .collect();
        Ok(KmsBlobMetadataReply { metadata_details })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cipher_details_decode_from_wire_json() {
        let json = format!(
            r#"{{"cipher_key_details":[{{"domain_id":7,"base_cipher_id":42,
                "base_cipher_key":"{}","refresh_after_secs":300,"expire_after_secs":-1}}]}}"#,
            BASE64.encode(b"super secret key")
        );
        let reply: WireCipherKeysReply = serde_json::from_str(&json).unwrap();
        let details = decode_details(reply.cipher_key_details.into_iter().next().unwrap()).unwrap();
        assert_eq!(details.domain_id, 7);
        assert_eq!(details.base_cipher_id, 42);
        assert_eq!(details.material.as_bytes(), b"super secret key");
        assert_eq!(details.refresh_after_secs, Some(300));
        assert_eq!(details.expire_after_secs, Some(-1));
    }

    #[test]
    fn undecodable_material_is_a_fetch_failure() {
        let wire = WireCipherKeyDetails {
            domain_id: 1,
            base_cipher_id: 2,
            base_cipher_key: "not base64!!".into(),
            refresh_after_secs: None,
            expire_after_secs: None,
        };
        assert!(matches!(decode_details(wire), Err(EkpError::KeysFetchFailed)));
    }

    #[test]
    fn requests_omit_absent_debug_ids() {
        let req = WireByDomainIdsRequest {
            domain_ids: vec![1, 2],
            debug_id: None,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains("debug_id"));
    }

    #[test]
    fn not_found_status_maps_to_key_not_found() {
        assert_eq!(
            map_status_error(reqwest::StatusCode::NOT_FOUND),
            EkpError::KeyNotFound
        );
        assert_eq!(
            map_status_error(reqwest::StatusCode::INTERNAL_SERVER_ERROR),
            EkpError::KeysFetchFailed
        );
        assert_eq!(
            map_status_error(reqwest::StatusCode::BAD_REQUEST),
            EkpError::KeysFetchFailed
        );
    }

    #[test]
    fn endpoint_trailing_slash_is_normalised() {
        let c = RestKmsConnector::new("http://kms.internal:9000/", Duration::from_secs(1)).unwrap();
        assert_eq!(c.endpoint, "http://kms.internal:9000");
    }
}
