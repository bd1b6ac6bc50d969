//! Shared utilities.
//!
//! Currently just base-URL validation for inbound snapshots: persisted base
//! URLs must be well-formed http(s) URLs with a host, since renderers and
//! the download layer derive file URLs from them.

mod url_validator;

pub use url_validator::{validate_base_url, UrlValidationError};
