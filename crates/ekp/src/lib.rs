//! Encryption key proxy: the cache-and-refresh engine sitting between
//! internal database components and an external key management service.
//!
//! The proxy caches two kinds of secret material, base cipher keys and blob
//! storage credentials metadata, and serves them with low latency while
//! hiding KMS outages behind a bounded staleness and retry policy. Lookups
//! consult the in-memory caches first and batch all misses into a single
//! KMS round trip; recurring refreshers re-fetch entries before their
//! refresh horizons fire on the serving path.

pub mod cache;
pub mod config;
pub mod kms;
pub mod metrics;
pub mod refresh;
pub mod retry;
pub mod server;
pub mod telemetry;
pub mod validity;
