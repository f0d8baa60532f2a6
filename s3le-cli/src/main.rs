//! `s3logextraction`: command line interface wiring the extraction driver
//! (C3-C5), the IP indexer (C6/C7) and the remote fetch orchestrator (C8)
//! into a single binary, in the same `proxmox_router::cli` style as `pmt`.
//!
//! Every sync command runs to completion before `main` returns, so this
//! binary never needs a tokio runtime: `run_cli_command` is invoked with
//! no async executor, matching `pbs-tape/src/bin/pmt.rs`.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Error};
use rand::Rng;
use regex::Regex;

use proxmox_router::cli::*;
use proxmox_schema::api;

use s3le_config::{record_log, Cache, RecordLog};
use s3le_extract::driver::{extract_directory, SubprocessWorker};
use s3le_extract::worker::{process_one_file, FileOutcome, RECORD_CLASS_NAME};
use s3le_remote::{fetch_remote, RemoteFetchConfig, S5cmd, SubprocessExtractInvoker};
use s3le_types::{ExtractionError, Mode};

/// Environment variable controlling log verbosity, mirroring the
/// teacher's own `PBS_LOG`.
const LOG_ENV_VAR: &str = "S3LE_LOG";

fn current_exe() -> Result<PathBuf, Error> {
    std::env::current_exe().context("failed to resolve path of the running executable")
}

fn parse_mode(mode: Option<String>) -> Result<Mode, Error> {
    mode.as_deref().unwrap_or("generic").parse()
}

/// Resolves the IP skip regex for `dandi` mode. The source bakes a
/// deployment-specific, encrypted regex into the package itself; this
/// crate has no equivalent secret to embed, so the pattern is supplied at
/// the call site instead, from `--skip-ip-regex` or
/// `S3LE_SKIP_IP_REGEX` (see DESIGN.md).
fn resolve_skip_ip_regex(mode: Mode, skip_ip_regex: Option<String>) -> Result<Option<Regex>, Error> {
    if mode != Mode::Dandi {
        return Ok(None);
    }

    let pattern = skip_ip_regex
        .or_else(|| std::env::var("S3LE_SKIP_IP_REGEX").ok())
        .ok_or_else(|| {
            ExtractionError::Config(
                "dandi mode requires --skip-ip-regex or S3LE_SKIP_IP_REGEX to be set".to_string(),
            )
        })?;

    Regex::new(&pattern).with_context(|| format!("invalid skip-ip-regex pattern {pattern:?}"))
}

#[api(
    input: {
        properties: {
            directory: {
                description: "Directory of raw access log files to extract.",
            },
            limit: {
                description: "Maximum number of files to process in this invocation.",
                type: Integer,
                optional: true,
                minimum: 1,
            },
            workers: {
                description: "Worker process count: 1 runs serially, positive values are capped \
                    at the CPU count, negative values request cpu_count + n + 1.",
                type: Integer,
                optional: true,
                default: 1,
            },
            mode: {
                description: "Field-extraction mode: 'generic' or 'dandi'.",
                optional: true,
            },
            "skip-ip-regex": {
                description: "Regex of remote IPs to exclude from the mirror (dandi mode only).",
                optional: true,
            },
        },
    },
)]
/// Extract S3 access logs under a directory into the mirror tree.
fn extract(
    directory: String,
    limit: Option<i64>,
    workers: Option<i64>,
    mode: Option<String>,
    skip_ip_regex: Option<String>,
) -> Result<(), Error> {
    let cache = Cache::open()?;
    let mode = parse_mode(mode)?;
    let skip_ip_regex = resolve_skip_ip_regex(mode, skip_ip_regex)?;

    let workers = workers.unwrap_or(1);
    let mut worker_args = vec!["extract-one-file".to_string(), "--mode".to_string(), mode.to_string()];
    if let Some(regex) = &skip_ip_regex {
        worker_args.push("--skip-ip-regex".to_string());
        worker_args.push(regex.as_str().to_string());
    }
    let subprocess = SubprocessWorker {
        program: current_exe()?,
        args: worker_args,
    };

    let summary = extract_directory(
        &cache,
        mode,
        skip_ip_regex.as_ref(),
        Path::new(&directory),
        limit.map(|limit| limit as usize),
        workers,
        Some(&subprocess),
    )?;

    log::info!(
        "extraction complete: {} processed, {} already done{}",
        summary.processed,
        summary.already_done,
        if summary.stopped_early { " (stopped early)" } else { "" },
    );
    Ok(())
}

#[api(
    input: {
        properties: {
            path: {
                description: "Absolute path of a single raw access log file to extract.",
            },
            mode: {
                description: "Field-extraction mode: 'generic' or 'dandi'.",
                optional: true,
            },
            "skip-ip-regex": {
                description: "Regex of remote IPs to exclude from the mirror (dandi mode only).",
                optional: true,
            },
        },
    },
)]
/// Extract a single log file. Internal entry point used by `extract` to
/// re-invoke this binary once per file when running with multiple workers
/// (see `s3le_extract::driver::SubprocessWorker`).
///
/// Exits 0 on `FileOutcome::Stopped`: the stop sentinel makes each worker
/// return cleanly at the next file boundary (§4.5), and a child that was
/// just about to process a file when the sentinel appeared should simply
/// leave that file unprocessed for a later run, not poison the parent
/// driver's whole parallel run with a non-zero exit.
fn extract_one_file(path: String, mode: Option<String>, skip_ip_regex: Option<String>) -> Result<(), Error> {
    let cache = Cache::open()?;
    let mode = parse_mode(mode)?;
    let skip_ip_regex = resolve_skip_ip_regex(mode, skip_ip_regex)?;

    match process_one_file(&cache, mode, skip_ip_regex.as_ref(), Path::new(&path))? {
        FileOutcome::Stopped => {
            log::info!("stop requested; {path} left unprocessed");
            Ok(())
        }
        FileOutcome::AlreadyDone | FileOutcome::Processed { .. } => Ok(()),
    }
}

#[api(
    input: {
        properties: {
            timeout: {
                description: "Seconds to wait for in-flight workers to finish before giving up.",
                type: Integer,
                optional: true,
                default: 600,
                minimum: 1,
            },
        },
    },
)]
/// Request that any running extraction stop at its next file boundary,
/// and wait for in-flight workers to drain.
///
/// There is no shared process table to poll (§4.5 workers communicate
/// only via the filesystem), so readiness is judged by the
/// `FieldExtractor` record log converging: once every started file also
/// has an end record, nothing is still running.
fn stop(timeout: Option<i64>) -> Result<(), Error> {
    let cache = Cache::open()?;
    Cache::ensure_dir(&cache.records_dir())?;
    record_log::request_stop(&cache.stop_sentinel())?;

    let record_log = RecordLog::new(&cache.records_dir(), RECORD_CLASS_NAME);
    let deadline = Instant::now() + Duration::from_secs(timeout.unwrap_or(600) as u64);

    loop {
        if record_log.incomplete()?.is_empty() {
            log::info!("stop acknowledged; no files left in flight");
            break;
        }
        if Instant::now() >= deadline {
            bail!("timed out waiting for in-flight extraction workers to finish");
        }
        std::thread::sleep(Duration::from_secs(1));
    }

    record_log::clear_stop_request(&cache.stop_sentinel())?;
    Ok(())
}

#[api(
    input: {
        properties: {
            directory: {
                description: "Directory to use as the cache root.",
            },
        },
    },
)]
/// Set the directory used as the cache root for all future invocations.
fn config_cache_set(directory: String) -> Result<(), Error> {
    let cache = Cache::set_directory(Path::new(&directory))?;
    log::info!("cache directory set to {:?}", cache.root());
    Ok(())
}

#[api(input: { properties: {} })]
/// Remove and recreate the mirror tree and its record logs.
fn reset_extraction() -> Result<(), Error> {
    Cache::open()?.reset_extraction()
}

#[api(input: { properties: {} })]
/// Remove and recreate the scratch (tmp) directory.
fn reset_tmp() -> Result<(), Error> {
    Cache::open()?.reset_tmp()
}

#[api(input: { properties: {} })]
/// Remove and recreate the IP index cache.
fn reset_ips() -> Result<(), Error> {
    Cache::open()?.reset_ips()
}

#[api(input: { properties: {} })]
/// Re-index every mirror directory's observed IPs into the encrypted
/// IP-to-index bijection (C6).
fn update_ip_indexes() -> Result<(), Error> {
    let cache = Cache::open()?;
    let seed = rand::thread_rng().gen();
    let summary = s3le_ipindex::run(&cache, seed)?;
    log::info!(
        "indexed {} director{}, {} new IP{}",
        summary.directories_indexed,
        if summary.directories_indexed == 1 { "y" } else { "ies" },
        summary.new_ips_indexed,
        if summary.new_ips_indexed == 1 { "" } else { "s" },
    );
    Ok(())
}

#[api(
    input: {
        properties: {
            "s3-url": {
                description: "Base s3:// URL of the remote bucket and prefix to fetch from.",
            },
            "date-limit": {
                description: "Maximum number of unprocessed dates to fetch in this invocation.",
                type: Integer,
                optional: true,
                minimum: 1,
            },
            "file-limit": {
                description: "Maximum number of files to extract per date.",
                type: Integer,
                optional: true,
                minimum: 1,
            },
            workers: {
                description: "Worker process count passed through to each date's extraction.",
                type: Integer,
                optional: true,
                default: 1,
            },
            mode: {
                description: "Field-extraction mode: 'generic' or 'dandi'.",
                optional: true,
            },
            "manifest-file": {
                description: "Optional flat-layout manifest file (output of \
                    `s5cmd ls s3://bucket/prefix/*`) for buckets that do not use a nested \
                    YYYY/MM/DD key layout.",
                optional: true,
            },
        },
    },
)]
/// Discover and fetch unprocessed remote log dates, extracting each as it
/// is pulled down (C8).
fn remote_fetch(
    s3_url: String,
    date_limit: Option<i64>,
    file_limit: Option<i64>,
    workers: Option<i64>,
    mode: Option<String>,
    manifest_file: Option<String>,
) -> Result<(), Error> {
    let cache = Cache::open()?;
    let config = RemoteFetchConfig {
        s3_url,
        date_limit: date_limit.map(|limit| limit as usize),
        file_limit: file_limit.map(|limit| limit as usize),
        workers: workers.unwrap_or(1),
        mode: parse_mode(mode)?,
        manifest_path: manifest_file.map(PathBuf::from),
    };

    let lister = S5cmd;
    let fetcher = S5cmd;
    let extractor = SubprocessExtractInvoker {
        program: current_exe()?,
        base_args: Vec::new(),
    };

    let summary = fetch_remote(&cache, &config, &lister, &fetcher, &extractor)?;
    log::info!(
        "remote fetch complete: {} date(s) processed, {} remaining",
        summary.dates_processed,
        summary.dates_remaining,
    );
    Ok(())
}

fn reset_cli() -> CliCommandMap {
    CliCommandMap::new()
        .insert("extraction", CliCommand::new(&API_METHOD_RESET_EXTRACTION))
        .insert("tmp", CliCommand::new(&API_METHOD_RESET_TMP))
        .insert("ips", CliCommand::new(&API_METHOD_RESET_IPS))
}

fn config_cli() -> CliCommandMap {
    CliCommandMap::new().insert(
        "cache",
        CliCommandMap::new().insert("set", CliCommand::new(&API_METHOD_CONFIG_CACHE_SET).arg_param(&["directory"])),
    )
}

fn update_cli() -> CliCommandMap {
    CliCommandMap::new().insert(
        "ip",
        CliCommandMap::new().insert("indexes", CliCommand::new(&API_METHOD_UPDATE_IP_INDEXES)),
    )
}

fn remote_cli() -> CliCommandMap {
    CliCommandMap::new().insert("fetch", CliCommand::new(&API_METHOD_REMOTE_FETCH).arg_param(&["s3-url"]))
}

fn main() -> Result<(), Error> {
    init_cli_logger(LOG_ENV_VAR, "info");

    let cmd_def = CliCommandMap::new()
        .insert("extract", CliCommand::new(&API_METHOD_EXTRACT).arg_param(&["directory"]))
        .insert(
            "extract-one-file",
            CliCommand::new(&API_METHOD_EXTRACT_ONE_FILE).arg_param(&["path"]),
        )
        .insert("stop", CliCommand::new(&API_METHOD_STOP))
        .insert("config", config_cli())
        .insert("reset", reset_cli())
        .insert("update", update_cli())
        .insert("remote", remote_cli());

    let rpcenv = CliEnvironment::new();
    run_cli_command(cmd_def, rpcenv, None);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_mode_defaults_to_generic() {
        assert_eq!(parse_mode(None).unwrap(), Mode::Generic);
        assert_eq!(parse_mode(Some("dandi".to_string())).unwrap(), Mode::Dandi);
        assert!(parse_mode(Some("bogus".to_string())).is_err());
    }

    #[test]
    fn skip_ip_regex_is_irrelevant_outside_dandi_mode() {
        assert!(resolve_skip_ip_regex(Mode::Generic, None).unwrap().is_none());
        assert!(resolve_skip_ip_regex(Mode::Generic, Some("10\\..*".to_string())).unwrap().is_none());
    }

    #[test]
    fn dandi_mode_requires_a_skip_regex_from_some_source() {
        std::env::remove_var("S3LE_SKIP_IP_REGEX");
        assert!(resolve_skip_ip_regex(Mode::Dandi, None).is_err());

        let regex = resolve_skip_ip_regex(Mode::Dandi, Some("^10\\.".to_string())).unwrap().unwrap();
        assert!(regex.is_match("10.0.0.1"));
        assert!(!regex.is_match("8.8.8.8"));
    }

    #[test]
    fn dandi_mode_falls_back_to_the_environment_variable() {
        std::env::set_var("S3LE_SKIP_IP_REGEX", "^192\\.168\\.");
        let regex = resolve_skip_ip_regex(Mode::Dandi, None).unwrap().unwrap();
        assert!(regex.is_match("192.168.1.1"));
        std::env::remove_var("S3LE_SKIP_IP_REGEX");
    }
}
