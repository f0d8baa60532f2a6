//! The mirror tree: a directory hierarchy that mirrors S3 object keys and
//! accumulates one line per log line observed for that key across
//! timestamps.txt, bytes_sent.txt and full_ips.txt.
//!
//! Invariant I1 (enforced by [`writer::MirrorWriter`]): the three files
//! for a destination always have the same number of lines, since a log
//! line that is missing a field still contributes an (possibly empty)
//! entry to every file.

pub mod hierarchy;
pub mod key;
pub mod walk;
pub mod writer;

pub use key::destination_for;
pub use writer::MirrorWriter;
