//! Avian Biosurveillance Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, utilities, and error handling for the ingestion workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`AvianError`] and the crate [`Result`] alias
//! - **Checksums**: canonical content hashing for raw records
//! - **Logging**: tracing subscriber setup shared by every binary
//! - **Types**: geographic bounds and tolerant timestamp parsing
//!
//! # Example
//!
//! ```no_run
//! use avian_common::checksum::content_hash;
//! use serde_json::json;
//!
//! let hash = content_hash(&json!({"id": 1, "species": "eurbla"}));
//! assert_eq!(hash.len(), 64);
//! ```

pub mod checksum;
pub mod error;
pub mod logging;
pub mod types;

pub use error::{AvianError, Result};
