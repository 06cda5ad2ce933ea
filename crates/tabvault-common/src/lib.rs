//! Tabvault Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared error handling, logging and checksum utilities for the Tabvault
//! backup and disaster-recovery workspace.
//!
//! # Overview
//!
//! - **Error Handling**: the [`VaultError`] taxonomy and [`Result`] alias
//! - **Logging**: `tracing` subscriber initialisation driven by `LOG_*` variables
//! - **Checksums**: SHA-256 helpers used to verify mirrored objects
//!
//! # Example
//!
//! ```no_run
//! use tabvault_common::{checksum, Result};
//!
//! fn fingerprint(body: &[u8]) -> Result<String> {
//!     let digest = checksum::sha256_hex(body);
//!     checksum::verify_sha256(body, &digest)?;
//!     Ok(digest)
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{Result, VaultError};
