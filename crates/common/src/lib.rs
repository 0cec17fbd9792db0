//! Common types shared between the encryption key proxy and its in-process clients.

pub mod error;
pub mod protocol;

pub use error::{EkpError, EkpResult};
