//! The extraction pipeline: field extraction (C3), mirror-tree ingest
//! (C4, delegated to [`s3le_mirror`]) and the parallel, resumable
//! extraction driver (C5).

pub mod driver;
pub mod parser;
pub mod worker;

pub use driver::{extract_directory, resolve_worker_count, ExtractionSummary, SubprocessWorker};
pub use worker::{process_one_file, FileOutcome};
