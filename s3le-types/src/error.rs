//! The error taxonomy surfaced by extraction, indexing and remote-fetch
//! operations. Anything below this layer uses `anyhow::Error` freely;
//! these variants exist for the handful of conditions callers need to
//! branch on or report with a dedicated exit code.

use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum ExtractionError {
    #[error("cache configuration error: {0}")]
    Config(String),

    #[error("record log {path:?} is corrupt: {reason}")]
    RecordCorruption { path: PathBuf, reason: String },

    #[error("extraction of {path:?} failed: {reason}")]
    ExtractionFailed { path: PathBuf, reason: String },

    #[error("exhausted {attempts} attempts drawing a unique index for {subject}")]
    IndexCollisionExhausted { subject: String, attempts: u32 },

    #[error("manifest mismatch for {date}: manifest lists {manifest_count} files, listing found {listed_count}")]
    ManifestMismatch {
        date: String,
        manifest_count: usize,
        listed_count: usize,
    },
}
