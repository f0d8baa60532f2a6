//! DANDI-mode object key normalization (§3): Zarr store keys truncate to
//! their store-level prefix, and blob keys are rewritten as the
//! hash-prefix hierarchy `blobs/<h[0:3]>/<h[3:6]>/<h>` so that a single
//! store's many chunks collapse into one mirror directory.

const ZARR_PREFIX: &str = "zarr/";
const BLOBS_PREFIX: &str = "blobs/";

/// Length of `"zarr/"` plus a 36-character UUID store id.
const ZARR_STORE_KEY_LEN: usize = ZARR_PREFIX.len() + 36;

/// Rewrite `object_key` per the DANDI normalization rule, or return
/// `None` if it falls outside the `blobs/`/`zarr/` prefixes (dropped by
/// the DANDI-mode extractor).
pub fn dandi_normalize(object_key: &str) -> Option<String> {
    if object_key.starts_with(ZARR_PREFIX) {
        let truncated: String = object_key.chars().take(ZARR_STORE_KEY_LEN).collect();
        return Some(truncated);
    }
    if let Some(hash) = object_key.strip_prefix(BLOBS_PREFIX) {
        return Some(blob_destination(hash));
    }
    None
}

/// `blobs/<h[0:3]>/<h[3:6]>/<h>`, falling back to a flat
/// `blobs/<h>` for hashes too short to shard.
pub fn blob_destination(hash: &str) -> String {
    if hash.len() < 6 {
        return format!("{BLOBS_PREFIX}{hash}");
    }
    let (first, rest) = hash.split_at(3);
    let (second, _) = rest.split_at(3);
    format!("{BLOBS_PREFIX}{first}/{second}/{hash}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_keys_shard_by_hash_prefix() {
        let dest = dandi_normalize("blobs/aabbccddeeff00112233445566778899aabbccdd").unwrap();
        assert_eq!(dest, "blobs/aab/bcc/aabbccddeeff00112233445566778899aabbccdd");
    }

    #[test]
    fn zarr_keys_truncate_to_the_store_prefix() {
        let store = "de305d54-75b4-431b-adb2-eb6b9e546014";
        let chunk_key = format!("zarr/{store}/0/0/0.1.2");
        let dest = dandi_normalize(&chunk_key).unwrap();
        assert_eq!(dest, format!("zarr/{store}"));
    }

    #[test]
    fn every_chunk_of_one_store_collapses_to_the_same_directory() {
        let store = "de305d54-75b4-431b-adb2-eb6b9e546014";
        let a = dandi_normalize(&format!("zarr/{store}/0/0/0")).unwrap();
        let b = dandi_normalize(&format!("zarr/{store}/9/9/9")).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn keys_outside_blobs_and_zarr_are_dropped() {
        assert!(dandi_normalize("assets/index.json").is_none());
    }
}
