//! Configuration loading and validation for the encryption key proxy.
//!
//! All values are read from environment variables at startup. The process
//! will exit with a clear error message if any value is missing or invalid.

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::kms::{
    PERF_KMS_CONNECTOR_TYPE, REST_KMS_CONNECTOR_TYPE, SIM_KMS_CONNECTOR_TYPE,
};

/// Validated proxy configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Default TTL (seconds) applied to cipher keys whose KMS reply carries
    /// no refresh interval.
    #[serde(default = "default_cipher_key_cache_ttl")]
    pub cipher_key_cache_ttl_secs: i64,

    /// Cipher key refresher cadence (seconds). Must be strictly shorter than
    /// the cache TTL so entries are re-fetched before their refresh horizon
    /// fires on the serving path.
    #[serde(default = "default_cipher_key_refresh_interval")]
    pub cipher_key_refresh_interval_secs: i64,

    /// Local TTL (seconds) for cached blob metadata entries.
    #[serde(default = "default_blob_metadata_cache_ttl")]
    pub blob_metadata_cache_ttl_secs: i64,

    /// Blob metadata refresher cadence (seconds). Must be < the blob TTL.
    #[serde(default = "default_blob_metadata_refresh_interval")]
    pub blob_metadata_refresh_interval_secs: i64,

    /// Retry budget for KMS calls, beyond the first attempt.
    #[serde(default = "default_kms_connection_retries")]
    pub kms_connection_retries: u32,

    /// First retry delay (milliseconds); doubles per attempt.
    #[serde(default = "default_kms_backoff_base_ms")]
    pub kms_backoff_base_ms: u64,

    /// Retry delay cap (milliseconds).
    #[serde(default = "default_kms_backoff_max_ms")]
    pub kms_backoff_max_ms: u64,

    /// Per-request timeout (seconds) enforced by the REST connector.
    #[serde(default = "default_kms_request_timeout")]
    pub kms_request_timeout_secs: u64,

    /// Which `KmsConnector` implementation to activate:
    /// `"RESTKmsConnector"`, `"FDBPerfKmsConnector"`, or `"SimKmsConnector"`.
    #[serde(default = "default_kms_connector_type")]
    pub kms_connector_type: String,

    /// Base URL of the external KMS. **Required** for the REST connector.
    #[serde(default)]
    pub kms_endpoint_url: Option<String>,

    /// LRU bound on the historical `(domain, key id)` cache.
    #[serde(default = "default_cipher_key_id_cache_capacity")]
    pub cipher_key_id_cache_capacity: usize,

    /// Cap on the number of ids listed in a single debug trace event.
    #[serde(default = "default_max_debug_trace_ids")]
    pub max_debug_trace_ids: usize,

    /// Probability of forcing a cached entry into the refresh candidate set,
    /// exercising the refresh path. Leave at 0 outside test environments.
    #[serde(default)]
    pub refresh_fault_injection_prob: f64,

    /// Tracing log level (e.g. `"info"`, `"debug"`) when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_cipher_key_cache_ttl() -> i64 {
    600
}
fn default_cipher_key_refresh_interval() -> i64 {
    60
}
fn default_blob_metadata_cache_ttl() -> i64 {
    3600
}
fn default_blob_metadata_refresh_interval() -> i64 {
    120
}
fn default_kms_connection_retries() -> u32 {
    3
}
fn default_kms_backoff_base_ms() -> u64 {
    500
}
fn default_kms_backoff_max_ms() -> u64 {
    10_000
}
fn default_kms_request_timeout() -> u64 {
    30
}
fn default_kms_connector_type() -> String {
    SIM_KMS_CONNECTOR_TYPE.into()
}
fn default_cipher_key_id_cache_capacity() -> usize {
    65_536
}
fn default_max_debug_trace_ids() -> usize {
    64
}
fn default_log_level() -> String {
    "info".into()
}

impl Config {
    /// Load and validate configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if any variable cannot be parsed or fails
    /// validation.
    pub fn from_env() -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::default())
            .build()
            .context("failed to build configuration from environment")?;

        let c: Config = cfg
            .try_deserialize()
            .context("failed to deserialise configuration")?;

        c.validate()?;
        Ok(c)
    }

    /// Validate all fields, returning a descriptive error on the first failure.
    pub fn validate(&self) -> Result<()> {
        if self.cipher_key_cache_ttl_secs <= 0 {
            anyhow::bail!("CIPHER_KEY_CACHE_TTL_SECS must be > 0");
        }
        if self.cipher_key_refresh_interval_secs <= 0 {
            anyhow::bail!("CIPHER_KEY_REFRESH_INTERVAL_SECS must be > 0");
        }
        if self.cipher_key_refresh_interval_secs >= self.cipher_key_cache_ttl_secs {
            anyhow::bail!(
                "CIPHER_KEY_REFRESH_INTERVAL_SECS must be < CIPHER_KEY_CACHE_TTL_SECS \
                 so entries refresh before going stale on the serving path"
            );
        }
        if self.blob_metadata_cache_ttl_secs <= 0 {
            anyhow::bail!("BLOB_METADATA_CACHE_TTL_SECS must be > 0");
        }
        if self.blob_metadata_refresh_interval_secs <= 0 {
            anyhow::bail!("BLOB_METADATA_REFRESH_INTERVAL_SECS must be > 0");
        }
        if self.blob_metadata_refresh_interval_secs >= self.blob_metadata_cache_ttl_secs {
            anyhow::bail!(
                "BLOB_METADATA_REFRESH_INTERVAL_SECS must be < BLOB_METADATA_CACHE_TTL_SECS"
            );
        }
        if self.kms_backoff_base_ms == 0 || self.kms_backoff_base_ms > self.kms_backoff_max_ms {
            anyhow::bail!("KMS_BACKOFF_BASE_MS must be > 0 and <= KMS_BACKOFF_MAX_MS");
        }
        if self.cipher_key_id_cache_capacity == 0 {
            anyhow::bail!("CIPHER_KEY_ID_CACHE_CAPACITY must be > 0");
        }
        if !(0.0..=1.0).contains(&self.refresh_fault_injection_prob) {
            anyhow::bail!("REFRESH_FAULT_INJECTION_PROB must be within [0, 1]");
        }
        match self.kms_connector_type.as_str() {
            SIM_KMS_CONNECTOR_TYPE | PERF_KMS_CONNECTOR_TYPE => {}
            REST_KMS_CONNECTOR_TYPE => {
                let has_endpoint = self
                    .kms_endpoint_url
                    .as_deref()
                    .is_some_and(|url| !url.trim().is_empty());
                if !has_endpoint {
                    anyhow::bail!("KMS_ENDPOINT_URL is required for {REST_KMS_CONNECTOR_TYPE}");
                }
            }
            other => anyhow::bail!("unknown KMS_CONNECTOR_TYPE: {other}"),
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cipher_key_cache_ttl_secs: default_cipher_key_cache_ttl(),
            cipher_key_refresh_interval_secs: default_cipher_key_refresh_interval(),
            blob_metadata_cache_ttl_secs: default_blob_metadata_cache_ttl(),
            blob_metadata_refresh_interval_secs: default_blob_metadata_refresh_interval(),
            kms_connection_retries: default_kms_connection_retries(),
            kms_backoff_base_ms: default_kms_backoff_base_ms(),
            kms_backoff_max_ms: default_kms_backoff_max_ms(),
            kms_request_timeout_secs: default_kms_request_timeout(),
            kms_connector_type: default_kms_connector_type(),
            kms_endpoint_url: None,
            cipher_key_id_cache_capacity: default_cipher_key_id_cache_capacity(),
            max_debug_trace_ids: default_max_debug_trace_ids(),
            refresh_fault_injection_prob: 0.0,
            log_level: default_log_level(),
        }
    }
}
