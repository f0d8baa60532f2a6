//! Per-log-file worker logic (§4.5): the sequence of record-log and
//! mirror-tree operations a single worker performs for one source log
//! file, start to finish.
//!
//! This is the `WorkerContext` the design notes call for (§9,
//! "per-class dynamic temp-file attributes"): rather than mutating
//! `self.temporary_directory` etc. on a shared extractor instance, every
//! piece of per-call state is a local here, making the single-writer
//! contract explicit and eliminating the source's latent data race.

use std::path::{Path, PathBuf};

use anyhow::{Context, Error};
use regex::Regex;

use s3le_config::{Cache, RecordLog};
use s3le_mirror::MirrorWriter;
use s3le_types::{ExtractionError, Mode};

use crate::parser::{extract_fields, OBJECT_KEYS_FILE};

/// Record-log class name shared by every extraction worker, matching the
/// `<ClassName>_file-processing-{start,end}.txt` naming from §3. Owned by
/// `s3le-config` so that `reset extraction` can remove exactly these
/// record files without depending on this crate.
pub const RECORD_CLASS_NAME: &str = s3le_config::record_log::FIELD_EXTRACTOR_CLASS_NAME;

/// Outcome of attempting to process one log file.
#[derive(Debug, PartialEq, Eq)]
pub enum FileOutcome {
    /// The stop sentinel was present; the file was left untouched.
    Stopped,
    /// The file was already in the end-record from a previous run.
    AlreadyDone,
    /// The file was extracted (whether or not it contained any matching
    /// lines) and the end-record was appended.
    Processed { matched_lines: usize },
}

/// Process exactly one log file: the stop-sentinel check, start/end
/// record bookkeeping, the per-worker temp directory, the field
/// extractor (C3) and the mirror writer (C4).
///
/// Safe to call from multiple OS processes concurrently, provided no two
/// callers are simultaneously handling the *same* log file (guaranteed by
/// the driver, which hands each file to exactly one worker).
pub fn process_one_file(
    cache: &Cache,
    mode: Mode,
    skip_ip_regex: Option<&Regex>,
    log_path: &Path,
) -> Result<FileOutcome, Error> {
    if s3le_config::record_log::stop_requested(&cache.stop_sentinel()) {
        return Ok(FileOutcome::Stopped);
    }

    let absolute_path = absolute_path_string(log_path)?;
    let record_log = RecordLog::new(&cache.records_dir(), RECORD_CLASS_NAME);

    if record_log.is_finished(&absolute_path)? {
        return Ok(FileOutcome::AlreadyDone);
    }

    record_log.append_start(&absolute_path)?;

    let temp_dir = cache.tmp_dir().join(std::process::id().to_string());
    Cache::ensure_dir(&temp_dir)?;

    // The skip-IP filter is a DANDI-deployment concept (§ Glossary,
    // "Mode"): generic mode never applies it, regardless of what the
    // caller configured.
    let effective_skip_ip_regex = match mode {
        Mode::Dandi => skip_ip_regex,
        Mode::Generic => None,
    };

    let matched_lines = extract_fields(log_path, &temp_dir, effective_skip_ip_regex).map_err(|err| {
        ExtractionError::ExtractionFailed {
            path: log_path.to_path_buf(),
            reason: err.to_string(),
        }
    })?;

    if temp_dir.join(OBJECT_KEYS_FILE).exists() {
        let writer = MirrorWriter::new(cache.extraction_dir(), mode);
        writer.apply(&temp_dir)?;
    }

    std::fs::remove_dir_all(&temp_dir)
        .with_context(|| format!("failed to remove temp directory {:?}", temp_dir))?;

    record_log.append_end(&absolute_path)?;

    Ok(FileOutcome::Processed { matched_lines })
}

fn absolute_path_string(path: &Path) -> Result<String, Error> {
    let absolute: PathBuf = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .with_context(|| "failed to resolve current directory")?
            .join(path)
    };
    Ok(absolute.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_cache(root: &Path) -> Cache {
        Cache::set_directory(root).unwrap()
    }

    #[test]
    fn a_log_with_no_matching_lines_is_processed_with_no_mirror_impact() {
        let cache_root = tempfile::tempdir().unwrap();
        let cache = make_cache(cache_root.path());

        let log = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(log.path(), "not a matching line\n").unwrap();

        let outcome = process_one_file(&cache, Mode::Generic, None, log.path()).unwrap();
        assert_eq!(outcome, FileOutcome::Processed { matched_lines: 0 });
        assert!(std::fs::read_dir(cache.extraction_dir()).unwrap().next().is_none());

        let record_log = RecordLog::new(&cache.records_dir(), RECORD_CLASS_NAME);
        let absolute = absolute_path_string(log.path()).unwrap();
        assert!(record_log.is_finished(&absolute).unwrap());
    }

    #[test]
    fn stop_sentinel_prevents_processing() {
        let cache_root = tempfile::tempdir().unwrap();
        let cache = make_cache(cache_root.path());
        Cache::ensure_dir(&cache.records_dir()).unwrap();
        s3le_config::record_log::request_stop(&cache.stop_sentinel()).unwrap();

        let log = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(log.path(), "anything\n").unwrap();

        let outcome = process_one_file(&cache, Mode::Generic, None, log.path()).unwrap();
        assert_eq!(outcome, FileOutcome::Stopped);
    }

    #[test]
    fn a_previously_finished_file_is_skipped() {
        let cache_root = tempfile::tempdir().unwrap();
        let cache = make_cache(cache_root.path());

        let log = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(log.path(), "not matching\n").unwrap();

        process_one_file(&cache, Mode::Generic, None, log.path()).unwrap();
        let outcome = process_one_file(&cache, Mode::Generic, None, log.path()).unwrap();
        assert_eq!(outcome, FileOutcome::AlreadyDone);
    }

    #[test]
    fn generic_mode_ignores_a_configured_skip_ip_regex() {
        let cache_root = tempfile::tempdir().unwrap();
        let cache = make_cache(cache_root.path());

        let log = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(
            log.path(),
            "bucketowner bucket [14/Nov/2024:12:34:56 +0000] 10.0.0.1 requester requestid \
             REST.GET.OBJECT key \"GET /key HTTP/1.1\" 200 - 1 1 1 1 \"-\" \"-\" -\n",
        )
        .unwrap();

        let regex = Regex::new("^10\\.0\\.0\\.").unwrap();
        let outcome = process_one_file(&cache, Mode::Generic, Some(&regex), log.path()).unwrap();
        assert_eq!(outcome, FileOutcome::Processed { matched_lines: 1 });
    }
}
