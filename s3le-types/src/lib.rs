//! Shared types, modes and error taxonomy for the `s3le` family of crates.

pub mod error;
pub mod mode;

pub use error::ExtractionError;
pub use mode::Mode;

pub use proxmox_schema::api_types::{IPV4RE_STR, IP_V4_FORMAT, IP_V4_REGEX};
