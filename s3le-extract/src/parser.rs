//! The field extractor (C3): reads one raw S3 access log file and emits
//! four lockstep temp streams for lines that pass the GET-success filter.
//!
//! Grounded in the reference implementation's AWK one-liner, which splits
//! each line on the `"` character into a pre-URI, URI and post-URI
//! segment, then indexes whitespace-separated fields within the pre- and
//! post-URI segments. This reimplements that split with Rust string
//! primitives (§4.3, design note "external scanner as a shell subprocess",
//! option b) rather than shelling out to `awk`.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Error};
use regex::Regex;

const REQUEST_TYPE_GET_OBJECT: &str = "REST.GET.OBJECT";

const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// One record surviving the filter, ready to be appended to the four
/// lockstep temp streams.
struct ExtractedRecord {
    object_key: String,
    timestamp: String,
    bytes_sent: String,
    ip: String,
}

/// Parse a single pre-URI/post-URI delimited S3 access log line into its
/// four tracked fields, or `None` if the line does not match the
/// canonical grammar closely enough to extract them (§4.3: such lines are
/// silently skipped, not treated as errors).
fn parse_line(line: &str) -> Option<ExtractedRecord> {
    let first_quote = line.find('"')?;
    let pre_uri = &line[..first_quote];
    let after_first = &line[first_quote + 1..];
    let second_quote = after_first.find('"')?;
    let post_uri = &after_first[second_quote + 1..];

    let pre_fields: Vec<&str> = pre_uri.split_whitespace().collect();
    let post_fields: Vec<&str> = post_uri.split_whitespace().collect();

    let raw_timestamp = *pre_fields.get(2)?;
    let ip = *pre_fields.get(4)?;
    let request_type = *pre_fields.get(7)?;
    let object_key = *pre_fields.get(8)?;

    let status = *post_fields.first()?;
    let raw_bytes_sent = *post_fields.get(2)?;

    if request_type != REQUEST_TYPE_GET_OBJECT {
        return None;
    }
    if !status.as_bytes().first().is_some_and(|b| *b == b'2') {
        return None;
    }

    let timestamp = reformat_timestamp(raw_timestamp.trim_matches(['[', ']']))?;
    let bytes_sent = if raw_bytes_sent == "-" {
        "0".to_string()
    } else {
        raw_bytes_sent.to_string()
    };

    Some(ExtractedRecord {
        object_key: object_key.to_string(),
        timestamp,
        bytes_sent,
        ip: ip.to_string(),
    })
}

/// Reformat `DD/Mon/YYYY:hh:mm:ss` into the fixed-width, lexicographically
/// sortable `YYMMDDhhmmss` used throughout the mirror tree. Returns `None`
/// on any deviation from the expected shape rather than erroring, since a
/// malformed timestamp simply drops the line (§4.3 error policy).
fn reformat_timestamp(raw: &str) -> Option<String> {
    let (day, rest) = raw.split_once('/')?;
    let (month_name, rest) = rest.split_once('/')?;
    let (year, time) = rest.split_once(':')?;

    let month_index = MONTHS.iter().position(|m| *m == month_name)? + 1;
    let mut time_parts = time.splitn(3, ':');
    let hour = time_parts.next()?;
    let minute = time_parts.next()?;
    let second = time_parts.next()?;

    if day.len() != 2 || year.len() != 4 || hour.len() != 2 || minute.len() != 2 || second.len() != 2 {
        return None;
    }
    let short_year = &year[2..];

    Some(format!("{short_year}{month_index:02}{day}{hour}{minute}{second}"))
}

/// Does `ip` match the deployment's skip-list regex? A `None` regex never
/// matches (the default "IPs-to-skip" filter is inert).
fn is_skipped(ip: &str, skip_ip_regex: Option<&Regex>) -> bool {
    skip_ip_regex.is_some_and(|regex| regex.is_match(ip))
}

pub const OBJECT_KEYS_FILE: &str = "object_keys.txt";
pub const TIMESTAMPS_FILE: &str = "timestamps.txt";
pub const BYTES_SENT_FILE: &str = "bytes_sent.txt";
pub const FULL_IPS_FILE: &str = "full_ips.txt";

/// Scan `log_path` and write the four lockstep temp streams into
/// `temp_dir`, returning the number of records that passed the filter.
///
/// Matching the reference AWK script's behavior of only ever opening its
/// output streams via redirection on a passing line: if zero lines match,
/// no files are created in `temp_dir` at all (C5 treats this as "valid
/// empty log", not an error).
pub fn extract_fields(log_path: &Path, temp_dir: &Path, skip_ip_regex: Option<&Regex>) -> Result<usize, Error> {
    let file = File::open(log_path).with_context(|| format!("failed to open log file {:?}", log_path))?;
    let reader = BufReader::new(file);

    let mut records = Vec::new();
    for line in reader.lines() {
        let line = line.with_context(|| format!("failed to read a line of {:?}", log_path))?;
        let Some(record) = parse_line(&line) else {
            continue;
        };
        if is_skipped(&record.ip, skip_ip_regex) {
            continue;
        }
        records.push(record);
    }

    if records.is_empty() {
        return Ok(0);
    }

    let mut object_keys = BufWriter::new(
        File::create(temp_dir.join(OBJECT_KEYS_FILE))
            .with_context(|| format!("failed to create {:?}", temp_dir.join(OBJECT_KEYS_FILE)))?,
    );
    let mut timestamps = BufWriter::new(
        File::create(temp_dir.join(TIMESTAMPS_FILE))
            .with_context(|| format!("failed to create {:?}", temp_dir.join(TIMESTAMPS_FILE)))?,
    );
    let mut bytes_sent = BufWriter::new(
        File::create(temp_dir.join(BYTES_SENT_FILE))
            .with_context(|| format!("failed to create {:?}", temp_dir.join(BYTES_SENT_FILE)))?,
    );
    let mut full_ips = BufWriter::new(
        File::create(temp_dir.join(FULL_IPS_FILE))
            .with_context(|| format!("failed to create {:?}", temp_dir.join(FULL_IPS_FILE)))?,
    );

    let count = records.len();
    for record in records {
        writeln!(object_keys, "{}", record.object_key)?;
        writeln!(timestamps, "{}", record.timestamp)?;
        writeln!(bytes_sent, "{}", record.bytes_sent)?;
        writeln!(full_ips, "{}", record.ip)?;
    }

    object_keys.flush()?;
    timestamps.flush()?;
    bytes_sent.flush()?;
    full_ips.flush()?;

    Ok(count)
}
