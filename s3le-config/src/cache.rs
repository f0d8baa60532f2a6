//! Cache directory layout and the JSON config file that records where it
//! lives.
//!
//! The cache root defaults to the xdg cache home and can be relocated
//! with `config cache set <dir>`, which persists the choice to the xdg
//! config file. Every subdirectory is created lazily and idempotently,
//! mirroring the `pathlib.Path.mkdir(exist_ok=True)` pattern the cache
//! layout was distilled from.

use std::path::{Path, PathBuf};

use anyhow::{format_err, Context, Error};
use proxmox_sys::fs::{create_path, replace_file, CreateOptions};
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Serialize, Deserialize)]
struct ConfigFile {
    cache_directory: Option<PathBuf>,
}

/// Handle to the cache directory layout used by every `s3le` component.
#[derive(Debug, Clone)]
pub struct Cache {
    root: PathBuf,
}

impl Cache {
    /// Resolve the cache from the persisted config file, falling back to
    /// the xdg cache home when no directory has been configured yet.
    pub fn open() -> Result<Self, Error> {
        let root = match Self::read_config()?.cache_directory {
            Some(dir) => dir,
            None => s3le_buildcfg::base_directories()?
                .create_cache_directory("")
                .context("failed to resolve default cache directory")?,
        };
        Ok(Self { root })
    }

    /// Persist `dir` as the cache directory for all future invocations.
    pub fn set_directory(dir: &Path) -> Result<Self, Error> {
        create_path(dir, None, Some(CreateOptions::new()))
            .with_context(|| format!("failed to create cache directory {:?}", dir))?;

        let config = ConfigFile {
            cache_directory: Some(dir.to_path_buf()),
        };
        Self::write_config(&config)?;

        Ok(Self {
            root: dir.to_path_buf(),
        })
    }

    fn config_path() -> Result<PathBuf, Error> {
        s3le_buildcfg::base_directories()?
            .place_config_file(s3le_buildcfg::CONFIG_FILE_NAME)
            .map_err(Error::from)
    }

    fn read_config() -> Result<ConfigFile, Error> {
        let path = Self::config_path()?;
        match std::fs::read(&path) {
            Ok(raw) => serde_json::from_slice(&raw)
                .with_context(|| format!("failed to parse config file {:?}", path)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
            Err(err) => Err(err.into()),
        }
    }

    fn write_config(config: &ConfigFile) -> Result<(), Error> {
        let path = Self::config_path()?;
        let raw = serde_json::to_vec_pretty(config)?;
        replace_file(&path, &raw, CreateOptions::new(), false)
            .with_context(|| format!("failed to write config file {:?}", path))
    }

    /// Root of the mirror tree (C1): one directory per extracted object key.
    pub fn extraction_dir(&self) -> PathBuf {
        self.root.join("extraction")
    }

    /// Append-only per-file record logs plus the `stop_extraction` sentinel.
    pub fn records_dir(&self) -> PathBuf {
        self.root.join("records")
    }

    /// Encrypted IP index cache and its plaintext index companion file.
    pub fn ips_dir(&self) -> PathBuf {
        self.root.join("ips")
    }

    /// Scratch space for remote downloads and running-worker tracking.
    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    /// Reserved home for a future per-bucket split of the Y/M/D remote
    /// progress files; those currently live under `records_dir()` and
    /// nothing writes here yet. Kept so `Cache` remains a complete map of
    /// the on-disk layout rather than a partial one.
    pub fn remote_dir(&self) -> PathBuf {
        self.root.join("remote")
    }

    /// Optional export directory for collaborator-owned sharing bundles.
    /// Nothing under `s3le-*` writes here; this is a complete map of the
    /// on-disk layout, not a claim that the core populates every entry.
    pub fn sharing_dir(&self) -> PathBuf {
        self.root.join("sharing")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the cooperative stop sentinel checked by every extraction
    /// worker between files.
    pub fn stop_sentinel(&self) -> PathBuf {
        self.records_dir().join("stop_extraction")
    }

    pub fn ensure_dir(path: &Path) -> Result<(), Error> {
        create_path(path, None, Some(CreateOptions::new()))
            .with_context(|| format!("failed to create directory {:?}", path))?;
        Ok(())
    }

    /// Remove and recreate the mirror tree, along with the field
    /// extractor's own start/end record files (§3: "removes the entire
    /// mirror and start/end records"). `records_dir()` also holds the Y/M/D
    /// remote-fetch progress caches (§4.1: reset operations "remove the
    /// respective subtree and matching record files; they do not remove
    /// other subtrees"), so those are left untouched rather than wiping
    /// `records_dir()` wholesale.
    pub fn reset_extraction(&self) -> Result<(), Error> {
        remove_dir_if_present(&self.extraction_dir())?;
        Self::ensure_dir(&self.extraction_dir())?;
        Self::ensure_dir(&self.records_dir())?;
        crate::record_log::remove_class_records(
            &self.records_dir(),
            crate::record_log::FIELD_EXTRACTOR_CLASS_NAME,
        )?;
        Ok(())
    }

    /// Remove and recreate the scratch directory.
    pub fn reset_tmp(&self) -> Result<(), Error> {
        remove_dir_if_present(&self.tmp_dir())?;
        Self::ensure_dir(&self.tmp_dir())?;
        Ok(())
    }

    /// Remove and recreate the IP index cache.
    pub fn reset_ips(&self) -> Result<(), Error> {
        remove_dir_if_present(&self.ips_dir())?;
        Self::ensure_dir(&self.ips_dir())?;
        Ok(())
    }
}

fn remove_dir_if_present(path: &Path) -> Result<(), Error> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(format_err!("failed to remove {:?}: {}", path, err)),
    }
}
