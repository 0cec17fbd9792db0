//! The proxy-wide error taxonomy.
//!
//! Errors are classified along two independent axes:
//! - [`EkpError::is_retryable`] governs the exponential-backoff wrapper
//!   around every KMS call.
//! - [`EkpError::is_client_reportable`] governs handler-level recovery: a
//!   reportable error is embedded in the reply envelope so the caller can
//!   react (for instance by evicting its own cached entries); anything else
//!   escapes to the server loop and terminates the handler task.
//!
//! The axes are deliberately independent. A fetch failure is reported to the
//! client but never retried (the KMS has spoken definitively), while a
//! timeout is retried first and only reported once the retry budget is
//! exhausted.

use thiserror::Error;

/// Top-level proxy error type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EkpError {
    /// The KMS has no key material for the requested id.
    #[error("encrypt_key_not_found")]
    KeyNotFound,

    /// The KMS reply was definitive but unusable: missing material,
    /// unsolicited ids, or a malformed payload.
    #[error("encrypt_keys_fetch_failed")]
    KeysFetchFailed,

    /// A KMS request exceeded its per-call deadline.
    #[error("timed_out")]
    TimedOut,

    /// The KMS endpoint could not be reached.
    #[error("connection_failed")]
    ConnectionFailed,

    /// An unexpected internal failure. Never retried, never reported to
    /// clients.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the proxy.
pub type EkpResult<T> = Result<T, EkpError>;

impl EkpError {
    /// Whether the backoff wrapper may re-issue the failed KMS call.
    ///
    /// Only transient connectivity classes qualify. Callers holding a cached
    /// non-revocable key may keep using it when a refresh fails with one of
    /// these.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EkpError::TimedOut | EkpError::ConnectionFailed)
    }

    /// Whether a handler may embed this error in the reply envelope instead
    /// of crashing the handler task.
    pub fn is_client_reportable(&self) -> bool {
        matches!(
            self,
            EkpError::KeyNotFound
                | EkpError::KeysFetchFailed
                | EkpError::TimedOut
                | EkpError::ConnectionFailed
        )
    }
}
