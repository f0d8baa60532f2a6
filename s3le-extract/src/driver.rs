//! The extraction driver (C5): discovers candidate log files under a
//! directory, dispatches them to workers, and honors the stop sentinel.
//!
//! §5 fixes multi-process parallelism at file granularity: "Process count
//! is static for the lifetime of an `extract_directory` call" and workers
//! "run as OS processes (not threads), communicating only via the
//! filesystem". `workers = 1` is handled in-process (no subprocess
//! overhead for the common single-worker case); `workers > 1` spawns a
//! bounded pool of child processes, each re-invoking the calling binary
//! via a [`SubprocessWorker`] template supplied by the CLI layer, one
//! file per child.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};

use anyhow::{bail, Context, Error};
use regex::Regex;
use walkdir::WalkDir;

use s3le_config::{Cache, RecordLog};
use s3le_tools::str::matches_s3_log_object_name;
use s3le_types::Mode;

use crate::worker::{process_one_file, FileOutcome, RECORD_CLASS_NAME};

/// Resolves `workers` per §4.5: `1` forces serial, positive integers are
/// bounded to the host CPU count, negative integers request
/// `cpu_count + n + 1` (`-2` is "all but one"). Windows is always forced
/// to a single worker.
pub fn resolve_worker_count(workers: i64) -> i64 {
    if cfg!(windows) {
        return 1;
    }

    let workers = if workers == 0 {
        log::warn!("worker count of 0 is invalid; falling back to -2 (all but one CPU)");
        -2
    } else {
        workers
    };

    let cpu_count = std::thread::available_parallelism().map(|n| n.get() as i64).unwrap_or(1);

    if workers < 0 {
        (cpu_count + workers + 1).max(1)
    } else {
        workers.min(cpu_count)
    }
}

/// Discover every candidate log file under `directory` (recursive,
/// filtered to the S3 log object-name glob), in natural-sort order, minus
/// anything already in the end-record.
fn discover_files(directory: &Path, record_log: &RecordLog) -> Result<Vec<PathBuf>, Error> {
    let finished = record_log.finished()?;

    let mut candidates: Vec<PathBuf> = WalkDir::new(directory)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(matches_s3_log_object_name)
        })
        .map(|entry| entry.into_path())
        .collect();

    s3le_tools::natural_sort::sort_by_key(&mut candidates, |path| path.to_string_lossy().into_owned());

    let mut absolute = Vec::with_capacity(candidates.len());
    for path in candidates {
        let absolute_path = std::fs::canonicalize(&path).unwrap_or(path);
        absolute.push(absolute_path);
    }

    Ok(absolute
        .into_iter()
        .filter(|path| !finished.contains(&path.to_string_lossy().into_owned()))
        .collect())
}

/// Template for spawning one child process per file when `workers > 1`.
/// `program` and `args` are held fixed; the absolute log file path is
/// appended as the final argument of every spawned child.
#[derive(Debug, Clone)]
pub struct SubprocessWorker {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl SubprocessWorker {
    fn spawn(&self, file_path: &Path) -> std::io::Result<Child> {
        Command::new(&self.program)
            .args(&self.args)
            .arg(file_path)
            .spawn()
    }
}

/// Summary counters returned by [`extract_directory`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExtractionSummary {
    pub processed: usize,
    pub already_done: usize,
    pub stopped_early: bool,
}

/// Run the field extractor and mirror writer (C3+C4) over every
/// unprocessed file in `directory`, per §4.5.
///
/// `subprocess` must be `Some` when `workers` resolves to more than one;
/// it describes how to re-invoke this program as a single-file worker.
pub fn extract_directory(
    cache: &Cache,
    mode: Mode,
    skip_ip_regex: Option<&Regex>,
    directory: &Path,
    limit: Option<usize>,
    workers: i64,
    subprocess: Option<&SubprocessWorker>,
) -> Result<ExtractionSummary, Error> {
    Cache::ensure_dir(&cache.extraction_dir())?;
    Cache::ensure_dir(&cache.records_dir())?;
    Cache::ensure_dir(&cache.tmp_dir())?;

    let record_log = RecordLog::new(&cache.records_dir(), RECORD_CLASS_NAME);
    record_log.check_consistency()?;

    let mut files = discover_files(directory, &record_log)?;
    if let Some(limit) = limit {
        files.truncate(limit);
    }

    let resolved_workers = resolve_worker_count(workers);

    let mut summary = ExtractionSummary::default();

    if resolved_workers <= 1 {
        for file in &files {
            match process_one_file(cache, mode, skip_ip_regex, file)? {
                FileOutcome::Stopped => {
                    summary.stopped_early = true;
                    break;
                }
                FileOutcome::AlreadyDone => summary.already_done += 1,
                FileOutcome::Processed { .. } => summary.processed += 1,
            }
        }
        return Ok(summary);
    }

    let Some(subprocess) = subprocess else {
        bail!("workers > 1 requires a subprocess worker template to re-invoke this binary");
    };

    let mut pending: VecDeque<PathBuf> = files.into();
    let mut in_flight: Vec<(PathBuf, Child)> = Vec::new();

    while !pending.is_empty() || !in_flight.is_empty() {
        if s3le_config::record_log::stop_requested(&cache.stop_sentinel()) {
            summary.stopped_early = true;
            pending.clear();
        }

        while in_flight.len() < resolved_workers as usize {
            let Some(file) = pending.pop_front() else {
                break;
            };
            let child = subprocess
                .spawn(&file)
                .with_context(|| format!("failed to spawn extraction worker for {:?}", file))?;
            in_flight.push((file, child));
        }

        if in_flight.is_empty() {
            break;
        }

        let (file, mut child) = in_flight.remove(0);
        let status = child
            .wait()
            .with_context(|| format!("failed to wait for extraction worker processing {:?}", file))?;

        if !status.success() {
            bail!(
                "extraction worker for {:?} exited with status {:?}",
                file,
                status.code()
            );
        }
        summary.processed += 1;
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_log(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    fn matching_line(key: &str) -> String {
        format!(
            "bucketowner bucket [14/Nov/2024:12:34:56 +0000] 10.0.0.1 requester requestid REST.GET.OBJECT {key} \"GET /{key} HTTP/1.1\" 200 - 1024 1234 20 10 \"-\" \"-\" -\n"
        )
    }

    #[test]
    fn resolves_worker_counts_per_sign_convention() {
        assert_eq!(resolve_worker_count(1), 1);
        assert!(resolve_worker_count(-1) >= 1);
        assert_eq!(resolve_worker_count(1000), resolve_worker_count(1000).min(1000));
    }

    #[test]
    fn single_file_happy_path_end_to_end() {
        let cache_root = tempfile::tempdir().unwrap();
        let cache = Cache::set_directory(cache_root.path()).unwrap();

        let logs = tempfile::tempdir().unwrap();
        let log_name = "2024-11-14-12-34-56-0123ABCDEF0123ABCDEF0123ABCDEF0123ABCD";
        write_log(
            logs.path(),
            log_name,
            &format!(
                "{}{}{}",
                matching_line("blobs/aa/bb/aabbccdd"),
                "bucketowner bucket [14/Nov/2024:12:34:56 +0000] 10.0.0.1 requester requestid REST.PUT.OBJECT blobs/aa/bb/aabbccdd \"PUT /blobs/aa/bb/aabbccdd HTTP/1.1\" 200 - 1024 1234 20 10 \"-\" \"-\" -\n",
                "bucketowner bucket [14/Nov/2024:12:34:56 +0000] 10.0.0.1 requester requestid REST.GET.OBJECT blobs/aa/bb/aabbccdd \"GET /blobs/aa/bb/aabbccdd HTTP/1.1\" 404 - 1024 1234 20 10 \"-\" \"-\" -\n",
            ),
        );

        let summary = extract_directory(&cache, Mode::Generic, None, logs.path(), None, 1, None).unwrap();
        assert_eq!(summary.processed, 1);

        let dest = cache.extraction_dir().join("blobs/aa/bb/aabbccdd");
        assert_eq!(std::fs::read_to_string(dest.join("timestamps.txt")).unwrap(), "241114123456\n");
        assert_eq!(std::fs::read_to_string(dest.join("bytes_sent.txt")).unwrap(), "1024\n");
        assert_eq!(std::fs::read_to_string(dest.join("full_ips.txt")).unwrap(), "10.0.0.1\n");

        let record_log = RecordLog::new(&cache.records_dir(), RECORD_CLASS_NAME);
        let finished = record_log.finished().unwrap();
        assert_eq!(finished.len(), 1);
        assert!(finished.iter().next().unwrap().ends_with(log_name));
    }

    #[test]
    fn a_second_run_over_the_same_input_is_a_no_op() {
        let cache_root = tempfile::tempdir().unwrap();
        let cache = Cache::set_directory(cache_root.path()).unwrap();

        let logs = tempfile::tempdir().unwrap();
        let log_name = "2024-11-14-12-34-56-0123ABCDEF0123ABCDEF0123ABCDEF0123ABCD";
        write_log(logs.path(), log_name, &matching_line("blobs/aa/bb/aabbccdd"));

        extract_directory(&cache, Mode::Generic, None, logs.path(), None, 1, None).unwrap();
        let contents_after_first = std::fs::read_to_string(
            cache.extraction_dir().join("blobs/aa/bb/aabbccdd/timestamps.txt"),
        )
        .unwrap();

        let summary = extract_directory(&cache, Mode::Generic, None, logs.path(), None, 1, None).unwrap();
        assert_eq!(summary.processed, 0);
        assert_eq!(summary.already_done, 1);

        let contents_after_second = std::fs::read_to_string(
            cache.extraction_dir().join("blobs/aa/bb/aabbccdd/timestamps.txt"),
        )
        .unwrap();
        assert_eq!(contents_after_first, contents_after_second);
    }

    #[test]
    fn stop_sentinel_halts_before_the_next_file() {
        let cache_root = tempfile::tempdir().unwrap();
        let cache = Cache::set_directory(cache_root.path()).unwrap();
        Cache::ensure_dir(&cache.records_dir()).unwrap();

        let logs = tempfile::tempdir().unwrap();
        write_log(logs.path(), "2024-11-14-00-00-00-aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa", &matching_line("k1"));
        write_log(logs.path(), "2024-11-15-00-00-00-bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb", &matching_line("k2"));

        s3le_config::record_log::request_stop(&cache.stop_sentinel()).unwrap();

        let summary = extract_directory(&cache, Mode::Generic, None, logs.path(), None, 1, None).unwrap();
        assert!(summary.stopped_early);
        assert_eq!(summary.processed, 0);
    }

    #[test]
    fn a_corrupt_record_log_is_a_fatal_error() {
        let cache_root = tempfile::tempdir().unwrap();
        let cache = Cache::set_directory(cache_root.path()).unwrap();
        Cache::ensure_dir(&cache.records_dir()).unwrap();

        let record_log = RecordLog::new(&cache.records_dir(), RECORD_CLASS_NAME);
        record_log.append_start("/logs/a.log").unwrap();

        let logs = tempfile::tempdir().unwrap();
        let result = extract_directory(&cache, Mode::Generic, None, logs.path(), None, 1, None);
        assert!(result.is_err());
    }

    #[test]
    fn an_all_putting_log_produces_no_mirror_but_is_marked_done() {
        let cache_root = tempfile::tempdir().unwrap();
        let cache = Cache::set_directory(cache_root.path()).unwrap();

        let logs = tempfile::tempdir().unwrap();
        let log_name = "2024-11-14-12-34-56-0123ABCDEF0123ABCDEF0123ABCDEF0123ABCD";
        write_log(
            logs.path(),
            log_name,
            "bucketowner bucket [14/Nov/2024:12:34:56 +0000] 10.0.0.1 requester requestid REST.PUT.OBJECT key \"PUT /key HTTP/1.1\" 200 - 1 1 1 1 \"-\" \"-\" -\n",
        );

        let summary = extract_directory(&cache, Mode::Generic, None, logs.path(), None, 1, None).unwrap();
        assert_eq!(summary.processed, 1);
        assert!(std::fs::read_dir(cache.extraction_dir()).unwrap().next().is_none());
    }
}
