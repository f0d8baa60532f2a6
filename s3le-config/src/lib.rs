pub mod cache;
pub mod record_log;

pub use cache::Cache;
pub use record_log::RecordLog;
