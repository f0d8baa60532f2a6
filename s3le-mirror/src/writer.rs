//! Appends the four temp streams produced by the field extractor for one
//! log file into the mirror tree, grouped by object key (C4).
//!
//! The per-key files are the only mutable state touched here; no
//! intermediate metadata file is written. Invariant I1 (equal line
//! counts across `timestamps.txt`, `bytes_sent.txt` and `full_ips.txt`)
//! follows directly from writing the three streams in lockstep for each
//! record.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Error};
use s3le_types::Mode;

use crate::key::destination_for;

pub const OBJECT_KEYS_FILE: &str = "object_keys.txt";
pub const TIMESTAMPS_FILE: &str = "timestamps.txt";
pub const BYTES_SENT_FILE: &str = "bytes_sent.txt";
pub const FULL_IPS_FILE: &str = "full_ips.txt";
pub const INDEXED_IPS_FILE: &str = "indexed_ips.txt";

/// Three append-mode handles for one mirror destination, opened lazily
/// and held for the duration of one [`MirrorWriter::apply`] call.
struct DestinationStreams {
    timestamps: BufWriter<File>,
    bytes_sent: BufWriter<File>,
    full_ips: BufWriter<File>,
}

impl DestinationStreams {
    fn open(destination_dir: &Path) -> Result<Self, Error> {
        std::fs::create_dir_all(destination_dir)
            .with_context(|| format!("failed to create mirror directory {:?}", destination_dir))?;

        let open_append = |name: &str| -> Result<BufWriter<File>, Error> {
            let path = destination_dir.join(name);
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("failed to open mirror stream {:?}", path))?;
            Ok(BufWriter::new(file))
        };

        Ok(Self {
            timestamps: open_append(TIMESTAMPS_FILE)?,
            bytes_sent: open_append(BYTES_SENT_FILE)?,
            full_ips: open_append(FULL_IPS_FILE)?,
        })
    }

    fn append(&mut self, timestamp: &str, bytes_sent: &str, ip: &str) -> Result<(), Error> {
        writeln!(self.timestamps, "{timestamp}")?;
        writeln!(self.bytes_sent, "{bytes_sent}")?;
        writeln!(self.full_ips, "{ip}")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Error> {
        self.timestamps.flush()?;
        self.bytes_sent.flush()?;
        self.full_ips.flush()?;
        Ok(())
    }
}

/// Appends field-extractor temp streams into a mirror tree rooted at
/// `mirror_root`, applying `mode`'s object-key normalization.
pub struct MirrorWriter {
    mirror_root: PathBuf,
    mode: Mode,
}

impl MirrorWriter {
    pub fn new(mirror_root: impl Into<PathBuf>, mode: Mode) -> Self {
        Self {
            mirror_root: mirror_root.into(),
            mode,
        }
    }

    /// Consume the four temp streams in `temp_dir` (produced by the
    /// field extractor for a single log file) and append them into the
    /// mirror tree. `temp_dir` must contain `object_keys.txt`; an empty
    /// file (zero matching lines) is valid and is a no-op.
    pub fn apply(&self, temp_dir: &Path) -> Result<(), Error> {
        let object_keys = read_lines(&temp_dir.join(OBJECT_KEYS_FILE))?;
        let timestamps = read_lines(&temp_dir.join(TIMESTAMPS_FILE))?;
        let bytes_sent = read_lines(&temp_dir.join(BYTES_SENT_FILE))?;
        let full_ips = read_lines(&temp_dir.join(FULL_IPS_FILE))?;

        anyhow::ensure!(
            object_keys.len() == timestamps.len()
                && object_keys.len() == bytes_sent.len()
                && object_keys.len() == full_ips.len(),
            "temp streams in {:?} have mismatched line counts ({} keys, {} timestamps, {} bytes, {} ips)",
            temp_dir,
            object_keys.len(),
            timestamps.len(),
            bytes_sent.len(),
            full_ips.len(),
        );

        let mut open_streams: HashMap<PathBuf, DestinationStreams> = HashMap::new();

        for i in 0..object_keys.len() {
            let Some(destination) = destination_for(self.mode, &object_keys[i]) else {
                continue;
            };
            let destination_dir = self.mirror_root.join(&destination);

            if !open_streams.contains_key(&destination_dir) {
                let streams = DestinationStreams::open(&destination_dir)?;
                open_streams.insert(destination_dir.clone(), streams);
            }
            let streams = open_streams.get_mut(&destination_dir).expect("just inserted");
            streams.append(&timestamps[i], &bytes_sent[i], &full_ips[i])?;
        }

        for streams in open_streams.values_mut() {
            streams.flush()?;
        }

        Ok(())
    }
}

fn read_lines(path: &Path) -> Result<Vec<String>, Error> {
    let file = File::open(path).with_context(|| format!("failed to open temp stream {:?}", path))?;
    BufReader::new(file)
        .lines()
        .collect::<Result<Vec<String>, std::io::Error>>()
        .with_context(|| format!("failed to read temp stream {:?}", path))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, lines: &[&str]) {
        let mut content = lines.join("\n");
        if !lines.is_empty() {
            content.push('\n');
        }
        std::fs::write(dir.join(name), content).unwrap();
    }

    #[test]
    fn appends_one_record_per_matching_line_grouped_by_key() {
        let temp = tempfile::tempdir().unwrap();
        let mirror = tempfile::tempdir().unwrap();

        write(temp.path(), OBJECT_KEYS_FILE, &["blobs/aa/bb/aabbccdd"]);
        write(temp.path(), TIMESTAMPS_FILE, &["241114123456"]);
        write(temp.path(), BYTES_SENT_FILE, &["1024"]);
        write(temp.path(), FULL_IPS_FILE, &["10.0.0.1"]);

        let writer = MirrorWriter::new(mirror.path(), Mode::Generic);
        writer.apply(temp.path()).unwrap();

        let dest = mirror.path().join("blobs/aa/bb/aabbccdd");
        assert_eq!(std::fs::read_to_string(dest.join(TIMESTAMPS_FILE)).unwrap(), "241114123456\n");
        assert_eq!(std::fs::read_to_string(dest.join(BYTES_SENT_FILE)).unwrap(), "1024\n");
        assert_eq!(std::fs::read_to_string(dest.join(FULL_IPS_FILE)).unwrap(), "10.0.0.1\n");
    }

    #[test]
    fn appends_to_an_existing_destination_preserving_source_order() {
        let temp = tempfile::tempdir().unwrap();
        let mirror = tempfile::tempdir().unwrap();

        write(temp.path(), OBJECT_KEYS_FILE, &["k", "k"]);
        write(temp.path(), TIMESTAMPS_FILE, &["241114120000", "241114120001"]);
        write(temp.path(), BYTES_SENT_FILE, &["1", "2"]);
        write(temp.path(), FULL_IPS_FILE, &["10.0.0.1", "10.0.0.2"]);

        let writer = MirrorWriter::new(mirror.path(), Mode::Generic);
        writer.apply(temp.path()).unwrap();

        let dest = mirror.path().join("k");
        assert_eq!(
            std::fs::read_to_string(dest.join(TIMESTAMPS_FILE)).unwrap(),
            "241114120000\n241114120001\n"
        );
    }

    #[test]
    fn an_empty_object_keys_file_is_a_no_op() {
        let temp = tempfile::tempdir().unwrap();
        let mirror = tempfile::tempdir().unwrap();

        write(temp.path(), OBJECT_KEYS_FILE, &[]);
        write(temp.path(), TIMESTAMPS_FILE, &[]);
        write(temp.path(), BYTES_SENT_FILE, &[]);
        write(temp.path(), FULL_IPS_FILE, &[]);

        let writer = MirrorWriter::new(mirror.path(), Mode::Generic);
        writer.apply(temp.path()).unwrap();
        assert!(std::fs::read_dir(mirror.path()).unwrap().next().is_none());
    }

    #[test]
    fn dandi_mode_drops_lines_outside_blobs_and_zarr() {
        let temp = tempfile::tempdir().unwrap();
        let mirror = tempfile::tempdir().unwrap();

        write(temp.path(), OBJECT_KEYS_FILE, &["assets/index.json"]);
        write(temp.path(), TIMESTAMPS_FILE, &["241114120000"]);
        write(temp.path(), BYTES_SENT_FILE, &["1"]);
        write(temp.path(), FULL_IPS_FILE, &["10.0.0.1"]);

        let writer = MirrorWriter::new(mirror.path(), Mode::Dandi);
        writer.apply(temp.path()).unwrap();
        assert!(std::fs::read_dir(mirror.path()).unwrap().next().is_none());
    }
}
