//! RPRO Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared utilities for the RPRO workspace.
//!
//! - **Checksums**: SHA-256 content hashes used to recognise files already ingested
//! - **Logging**: `tracing` subscriber setup shared by every binary
//!
//! # Example
//!
//! ```
//! use rpro_common::checksum::sha256_hex;
//!
//! let hash = sha256_hex(b"hello world");
//! assert_eq!(hash.len(), 64);
//! ```

pub mod checksum;
pub mod logging;
