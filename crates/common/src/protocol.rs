//! Request and reply types exchanged between the proxy and its in-process
//! clients.
//!
//! The proxy exposes four endpoints, each modelled as a request struct that
//! carries a oneshot reply sender. Clients normally go through the typed
//! methods on `EncryptKeyProxy` rather than building these by hand.

use tokio::sync::oneshot;

use crate::error::EkpError;

/// Encryption domain (tenant) identifier.
pub type DomainId = i64;

/// Identifier of a base cipher key version within a domain.
pub type BaseCipherId = u64;

/// Blob storage namespace identifier.
pub type BlobDomainId = i64;

// ---------------------------------------------------------------------------
// Key material
// ---------------------------------------------------------------------------

/// Immutable base cipher key bytes as supplied by the KMS.
///
/// Never mutated after insertion; cloned into reply envelopes when served.
/// The buffer is overwritten with zeroes on drop to shorten the window
/// during which plaintext key material lives in RAM.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial(Vec<u8>);

impl KeyMaterial {
    /// Wrap raw key bytes supplied by the KMS.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Borrow the raw key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Length of the key material in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the material is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for KeyMaterial {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl From<&[u8]> for KeyMaterial {
    fn from(bytes: &[u8]) -> Self {
        Self::new(bytes.to_vec())
    }
}

impl Drop for KeyMaterial {
    fn drop(&mut self) {
        // Zero the key material on drop.
        self.0.iter_mut().for_each(|b| *b = 0);
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material — not even in debug builds.
        write!(f, "KeyMaterial([REDACTED; {}])", self.0.len())
    }
}

// ---------------------------------------------------------------------------
// Reply payloads
// ---------------------------------------------------------------------------

/// A single base cipher key in a reply.
///
/// The validity horizons are populated on latest-by-domain replies so that
/// downstream consumers can make their own staleness calls for non-revocable
/// keys; by-ids replies leave them unset.
#[derive(Debug, Clone, PartialEq)]
pub struct BaseCipherDetails {
    pub domain_id: DomainId,
    pub base_cipher_id: BaseCipherId,
    pub material: KeyMaterial,
    /// Wall-clock seconds after which the key is stale for serving.
    pub refresh_at: Option<i64>,
    /// Wall-clock seconds after which the key must not be used.
    pub expire_at: Option<i64>,
}

/// Blob storage credentials metadata, passed through verbatim from the KMS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobMetadataDetails {
    pub domain_id: BlobDomainId,
    /// Opaque storage location records.
    pub locations: Vec<String>,
    /// Absolute refresh horizon declared by the KMS.
    pub refresh_at: i64,
    /// Absolute expiry horizon declared by the KMS.
    pub expire_at: i64,
}

// ---------------------------------------------------------------------------
// Endpoints
// ---------------------------------------------------------------------------

/// Look up specific base cipher key versions by `(domain, key id)` pairs.
#[derive(Debug)]
pub struct GetByIdsRequest {
    pub cipher_ids: Vec<(DomainId, BaseCipherId)>,
    pub debug_id: Option<u64>,
    pub reply: oneshot::Sender<GetByIdsReply>,
}

#[derive(Debug, Default)]
pub struct GetByIdsReply {
    pub base_cipher_details: Vec<BaseCipherDetails>,
    /// How many of the returned details were served from the cache.
    pub num_hits: usize,
    /// Set when the KMS lookup failed with a client-reportable error; the
    /// details list is empty in that case.
    pub error: Option<EkpError>,
}

/// Look up the latest base cipher key for each domain.
#[derive(Debug)]
pub struct GetLatestRequest {
    pub domain_ids: Vec<DomainId>,
    pub debug_id: Option<u64>,
    pub reply: oneshot::Sender<GetLatestReply>,
}

#[derive(Debug, Default)]
pub struct GetLatestReply {
    pub base_cipher_details: Vec<BaseCipherDetails>,
    pub num_hits: usize,
    pub error: Option<EkpError>,
}

/// Look up blob storage credentials metadata for each blob domain.
#[derive(Debug)]
pub struct GetBlobMetadataRequest {
    pub domain_ids: Vec<BlobDomainId>,
    pub debug_id: Option<u64>,
    pub reply: oneshot::Sender<Result<GetBlobMetadataReply, EkpError>>,
}

#[derive(Debug, Default)]
pub struct GetBlobMetadataReply {
    pub metadata_details: Vec<BlobMetadataDetails>,
}

/// Ask the proxy to acknowledge and stop.
#[derive(Debug)]
pub struct HaltRequest {
    pub requester_id: u64,
    pub reply: oneshot::Sender<()>,
}

/// Multiplexed request intake for the server loop.
#[derive(Debug)]
pub enum ProxyRequest {
    GetByIds(GetByIdsRequest),
    GetLatest(GetLatestRequest),
    GetBlobMetadata(GetBlobMetadataRequest),
    Halt(HaltRequest),
}
