//! Enumeration helpers over an existing mirror tree, used by the IP
//! indexer (C6) and by property tests (P1) that need to walk every
//! object-key directory at rest.

use std::path::{Path, PathBuf};

use anyhow::{Context, Error};
use walkdir::WalkDir;

use crate::writer::{BYTES_SENT_FILE, FULL_IPS_FILE, INDEXED_IPS_FILE, TIMESTAMPS_FILE};

/// One object-key directory found while walking a mirror tree.
pub struct MirrorEntry {
    pub dir: PathBuf,
}

impl MirrorEntry {
    pub fn full_ips_path(&self) -> PathBuf {
        self.dir.join(FULL_IPS_FILE)
    }

    pub fn indexed_ips_path(&self) -> PathBuf {
        self.dir.join(INDEXED_IPS_FILE)
    }

    pub fn timestamps_path(&self) -> PathBuf {
        self.dir.join(TIMESTAMPS_FILE)
    }

    pub fn bytes_sent_path(&self) -> PathBuf {
        self.dir.join(BYTES_SENT_FILE)
    }

    /// `true` if `indexed_ips.txt` is missing, or older than
    /// `full_ips.txt` — i.e. this directory has unindexed records.
    pub fn needs_indexing(&self) -> Result<bool, Error> {
        let full_ips_modified = match std::fs::metadata(self.full_ips_path()) {
            Ok(metadata) => metadata.modified()?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err.into()),
        };

        match std::fs::metadata(self.indexed_ips_path()) {
            Ok(metadata) => Ok(metadata.modified()? < full_ips_modified),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(true),
            Err(err) => Err(err.into()),
        }
    }
}

/// Every object-key directory under `mirror_root` that currently holds a
/// `full_ips.txt` stream (indexed or not).
pub fn entries(mirror_root: &Path) -> Result<Vec<MirrorEntry>, Error> {
    let mut found = Vec::new();
    for entry in WalkDir::new(mirror_root) {
        let entry = entry.with_context(|| format!("failed to walk mirror tree at {:?}", mirror_root))?;
        if entry.file_name() == FULL_IPS_FILE {
            let dir = entry
                .path()
                .parent()
                .expect("full_ips.txt always has a parent directory")
                .to_path_buf();
            found.push(MirrorEntry { dir });
        }
    }
    Ok(found)
}

/// Line counts of the three invariant-bound streams for one
/// destination, used by property tests asserting I1.
pub fn line_counts(entry: &MirrorEntry) -> Result<(usize, usize, Option<usize>, Option<usize>), Error> {
    let timestamps = count_lines(&entry.timestamps_path())?;
    let bytes_sent = count_lines(&entry.bytes_sent_path())?;
    let full_ips = count_lines_if_exists(&entry.full_ips_path())?;
    let indexed_ips = count_lines_if_exists(&entry.indexed_ips_path())?;
    Ok((timestamps, bytes_sent, full_ips, indexed_ips))
}

fn count_lines(path: &Path) -> Result<usize, Error> {
    let contents = std::fs::read_to_string(path).with_context(|| format!("failed to read {:?}", path))?;
    Ok(contents.lines().count())
}

fn count_lines_if_exists(path: &Path) -> Result<Option<usize>, Error> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents.lines().count())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_every_directory_with_a_full_ips_stream() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("blobs/aa/bb/aabbccdd")).unwrap();
        std::fs::write(root.path().join("blobs/aa/bb/aabbccdd/full_ips.txt"), "10.0.0.1\n").unwrap();

        let found = entries(root.path()).unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].needs_indexing().unwrap());
    }

    #[test]
    fn a_directory_without_full_ips_is_not_found() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("blobs/aa")).unwrap();
        assert!(entries(root.path()).unwrap().is_empty());
    }
}
