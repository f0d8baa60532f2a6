//! Append-only record logs tracking which source log files a component
//! has started and finished processing.
//!
//! Each component owns a pair of sibling files under `records/`:
//! `<ClassName>_file-processing-start.txt` and
//! `<ClassName>_file-processing-end.txt`, one absolute source path per
//! line. A start record is appended before any mirror data is written
//! for that file; the matching end record is appended only once all of
//! that file's mirror data and temp cleanup are complete. A path present
//! in the start file but absent from the end file after a crash is
//! exactly the set of files whose extraction was interrupted mid-flight
//! — the mirror tree cannot be trusted to resume cleanly from them since
//! its streams are append-only.

use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Error};
use s3le_tools::flock::{with_exclusive_lock, DEFAULT_LOCK_RETRIES, DEFAULT_LOCK_RETRY_DELAY};
use s3le_types::ExtractionError;

/// Record-log class name used by the field extractor (C3/C5). Owned here
/// rather than by `s3le-extract` so that `reset extraction` (§4.1), which
/// lives in this crate's `cache` module, can remove exactly this class's
/// start/end files without depending on the extraction crate.
pub const FIELD_EXTRACTOR_CLASS_NAME: &str = "FieldExtractor";

/// Handle onto the start/end record pair for one component, identified
/// by `class_name` (e.g. `"FieldExtractor"`).
pub struct RecordLog {
    start_path: PathBuf,
    end_path: PathBuf,
}

impl RecordLog {
    pub fn new(records_dir: &Path, class_name: &str) -> Self {
        Self {
            start_path: records_dir.join(format!("{class_name}_file-processing-start.txt")),
            end_path: records_dir.join(format!("{class_name}_file-processing-end.txt")),
        }
    }

    fn read_lines(path: &Path) -> Result<HashSet<String>, Error> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Ok(contents.lines().map(str::to_owned).collect()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(HashSet::new()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn started(&self) -> Result<HashSet<String>, Error> {
        Self::read_lines(&self.start_path)
    }

    pub fn finished(&self) -> Result<HashSet<String>, Error> {
        Self::read_lines(&self.end_path)
    }

    /// `start − end`: source files a previous run began but never
    /// finished.
    pub fn incomplete(&self) -> Result<HashSet<String>, Error> {
        let started = self.started()?;
        let finished = self.finished()?;
        Ok(started.difference(&finished).cloned().collect())
    }

    /// Raise `RecordCorruption` if a previous run left any file started
    /// but not finished. Call once at the top of a driver invocation,
    /// before any new work is dispatched.
    pub fn check_consistency(&self) -> Result<(), Error> {
        let incomplete = self.incomplete()?;
        if !incomplete.is_empty() {
            let mut offending: Vec<&String> = incomplete.iter().collect();
            offending.sort();
            return Err(ExtractionError::RecordCorruption {
                path: self.start_path.clone(),
                reason: format!(
                    "{} file(s) started but never finished in a previous run: {:?}",
                    offending.len(),
                    offending
                ),
            }
            .into());
        }
        Ok(())
    }

    pub fn is_finished(&self, source_path: &str) -> Result<bool, Error> {
        Ok(self.finished()?.contains(source_path))
    }

    pub fn append_start(&self, source_path: &str) -> Result<(), Error> {
        append_line(&self.start_path, source_path)
    }

    pub fn append_end(&self, source_path: &str) -> Result<(), Error> {
        append_line(&self.end_path, source_path)
    }
}

fn append_line(path: &Path, line: &str) -> Result<(), Error> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open record log {:?}", path))?;

    with_exclusive_lock(
        &file,
        DEFAULT_LOCK_RETRIES,
        DEFAULT_LOCK_RETRY_DELAY,
        || {
            let mut file = &file;
            writeln!(file, "{line}")?;
            Ok(())
        },
    )
    .with_context(|| format!("failed to append to record log {:?}", path))
}

/// Touch the cooperative stop sentinel so running and future workers
/// exit between files instead of mid-write.
pub fn request_stop(sentinel_path: &Path) -> Result<(), Error> {
    OpenOptions::new()
        .create(true)
        .write(true)
        .open(sentinel_path)
        .with_context(|| format!("failed to create stop sentinel {:?}", sentinel_path))?;
    Ok(())
}

pub fn stop_requested(sentinel_path: &Path) -> bool {
    sentinel_path.exists()
}

pub fn clear_stop_request(sentinel_path: &Path) -> Result<(), Error> {
    match std::fs::remove_file(sentinel_path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Remove `class_name`'s start/end record files under `records_dir`, if
/// present. Used by `reset extraction` (§4.1/§3: "remove the entire mirror
/// and start/end records"), which must remove only the record files that
/// back the mirror it is resetting, not every file under `records_dir()`
/// (the Y/M/D remote-fetch progress caches also live there and must
/// survive an extraction reset).
pub fn remove_class_records(records_dir: &Path, class_name: &str) -> Result<(), Error> {
    let log = RecordLog::new(records_dir, class_name);
    remove_file_if_present(&log.start_path)?;
    remove_file_if_present(&log.end_path)?;
    Ok(())
}

fn remove_file_if_present(path: &Path) -> Result<(), Error> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_then_end_marks_a_file_finished() {
        let dir = tempfile::tempdir().unwrap();
        let log = RecordLog::new(dir.path(), "FieldExtractor");

        log.append_start("/logs/2024-01-01.log").unwrap();
        assert!(!log.is_finished("/logs/2024-01-01.log").unwrap());

        log.append_end("/logs/2024-01-01.log").unwrap();
        assert!(log.is_finished("/logs/2024-01-01.log").unwrap());
        log.check_consistency().unwrap();
    }

    #[test]
    fn incomplete_lists_started_but_unfinished_files() {
        let dir = tempfile::tempdir().unwrap();
        let log = RecordLog::new(dir.path(), "FieldExtractor");

        log.append_start("/logs/a.log").unwrap();
        log.append_start("/logs/b.log").unwrap();
        log.append_end("/logs/a.log").unwrap();

        let incomplete = log.incomplete().unwrap();
        assert_eq!(incomplete.len(), 1);
        assert!(incomplete.contains("/logs/b.log"));
    }

    #[test]
    fn a_started_but_unfinished_file_is_corruption_at_startup() {
        let dir = tempfile::tempdir().unwrap();
        let log = RecordLog::new(dir.path(), "FieldExtractor");

        log.append_start("/logs/a.log").unwrap();
        log.append_start("/logs/b.log").unwrap();
        log.append_end("/logs/a.log").unwrap();

        let err = log.check_consistency().unwrap_err();
        assert!(err.to_string().contains("started but never finished"));
    }

    #[test]
    fn no_records_at_all_is_not_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let log = RecordLog::new(dir.path(), "FieldExtractor");
        log.check_consistency().unwrap();
    }

    #[test]
    fn stop_sentinel_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let sentinel = dir.path().join("stop_extraction");

        assert!(!stop_requested(&sentinel));
        request_stop(&sentinel).unwrap();
        assert!(stop_requested(&sentinel));
        clear_stop_request(&sentinel).unwrap();
        assert!(!stop_requested(&sentinel));
    }

    #[test]
    fn remove_class_records_only_touches_the_named_classs_files() {
        let dir = tempfile::tempdir().unwrap();
        let log = RecordLog::new(dir.path(), FIELD_EXTRACTOR_CLASS_NAME);
        log.append_start("/logs/a.log").unwrap();
        log.append_end("/logs/a.log").unwrap();

        let other = RecordLog::new(dir.path(), "SomeOtherClass");
        other.append_start("/logs/b.log").unwrap();

        remove_class_records(dir.path(), FIELD_EXTRACTOR_CLASS_NAME).unwrap();

        assert!(log.started().unwrap().is_empty());
        assert!(log.finished().unwrap().is_empty());
        assert!(other.started().unwrap().contains("/logs/b.log"));
    }

    #[test]
    fn remove_class_records_is_a_no_op_when_nothing_was_ever_written() {
        let dir = tempfile::tempdir().unwrap();
        remove_class_records(dir.path(), FIELD_EXTRACTOR_CLASS_NAME).unwrap();
    }
}
