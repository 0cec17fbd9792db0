//! In-memory caches for base cipher keys and blob storage metadata.
//!
//! All maps are process-local and never persisted. Entries are created on a
//! lookup miss (warmed after responding to the caller) or by a refresher
//! pull, mutated only by wholesale replacement from a KMS reply, and
//! destroyed when a refresher observes them past their expire horizon.

pub mod blob;
pub mod cipher;

pub use blob::BlobMetadataCache;
pub use cipher::{BaseCipherKey, CipherKeyCache};
