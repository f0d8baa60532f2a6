//! Maps a raw object key from a log line onto the relative destination
//! directory inside the mirror tree.

use std::path::{Component, Path, PathBuf};

use s3le_types::Mode;

use crate::hierarchy;

/// Resolve where `object_key` should be mirrored under `mode`, or
/// `None` if the key should be dropped entirely (a DANDI-mode key
/// outside `blobs/`/`zarr/`, or a key that would escape the mirror
/// root).
///
/// Object keys originate in untrusted log content, so any key
/// containing a `..` component or resolving to an absolute path is
/// rejected rather than joined onto the mirror root.
pub fn destination_for(mode: Mode, object_key: &str) -> Option<PathBuf> {
    let normalized = match mode {
        Mode::Generic => object_key.to_string(),
        Mode::Dandi => hierarchy::dandi_normalize(object_key)?,
    };
    sanitize(&normalized)
}

fn sanitize(relative: &str) -> Option<PathBuf> {
    if relative.is_empty() {
        return None;
    }
    let path = Path::new(relative);
    if path.is_absolute() {
        return None;
    }
    if path
        .components()
        .any(|component| matches!(component, Component::ParentDir))
    {
        return None;
    }
    Some(path.to_path_buf())
}
