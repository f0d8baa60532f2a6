//! Encrypted-at-rest storage for the sensitive YAML caches used by the
//! IP indexer (C6/C7), plus a plain-YAML sibling for the caches that
//! carry no raw IPs and therefore need no confidentiality.
//!
//! Encrypted caches are sealed with a key derived from
//! [`s3le_buildcfg::CACHE_PASSWORD_ENV_VAR`] via scrypt and AES-256-GCM.
//! Unlike the non-sensitive caches, a missing passphrase here is a fatal
//! configuration error rather than a silent fallback to plaintext: the
//! whole point of [`save_encrypted`] is that raw IPs never land on disk
//! unsealed. Either way the container is written atomically (write to a
//! temporary file, then rename) so a crash mid-write cannot corrupt the
//! previous generation.

use std::path::Path;

use anyhow::{bail, format_err, Error};
use openssl::symm::{decrypt_aead, encrypt_aead, Cipher};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use s3le_types::ExtractionError;

const SCRYPT_LOGN: u8 = 16;
const SCRYPT_R: u64 = 8;
const SCRYPT_P: u64 = 1;
const SALT_LEN: usize = 32;
const IV_LEN: usize = 16;
const TAG_LEN: usize = 16;

#[derive(Serialize, Deserialize)]
struct KeyDerivation {
    salt: [u8; SALT_LEN],
}

impl KeyDerivation {
    fn generate() -> Result<Self, Error> {
        let salt = proxmox_sys::linux::random_data(SALT_LEN)?
            .try_into()
            .map_err(|_| format_err!("random_data returned unexpected length"))?;
        Ok(Self { salt })
    }

    fn derive_key(&self, passphrase: &[u8]) -> Result<[u8; 32], Error> {
        let mut key = [0u8; 32];
        openssl::pkcs5::scrypt(
            passphrase,
            &self.salt,
            1 << SCRYPT_LOGN,
            SCRYPT_R,
            SCRYPT_P,
            128 * 1024 * 1024,
            &mut key,
        )?;
        Ok(key)
    }
}

/// On-disk container for an encrypted cache: `iv || tag || ciphertext`
/// wrapping the YAML bytes.
#[derive(Serialize, Deserialize)]
struct EncryptedContainer {
    kdf: KeyDerivation,
    #[serde(with = "proxmox_serde::epoch_as_rfc3339")]
    modified: i64,
    #[serde(with = "proxmox_serde::bytes_as_base64")]
    data: Vec<u8>,
}

fn passphrase_from_env() -> Result<Vec<u8>, Error> {
    std::env::var(s3le_buildcfg::CACHE_PASSWORD_ENV_VAR)
        .ok()
        .filter(|s| !s.is_empty())
        .map(String::into_bytes)
        .ok_or_else(|| {
            ExtractionError::Config(format!(
                "{} must be set to load or save an encrypted IP index cache",
                s3le_buildcfg::CACHE_PASSWORD_ENV_VAR,
            ))
            .into()
        })
}

/// Load and decode a YAML mapping from an encrypted cache file. Returns
/// `T::default()` if the file does not exist or is empty, matching the
/// "first run" behavior of the index caches this backs.
///
/// Fails with [`ExtractionError::Config`] if
/// [`s3le_buildcfg::CACHE_PASSWORD_ENV_VAR`] is unset, and fails
/// authentication (wrong password) if the derived key cannot open the
/// stored AEAD tag.
pub fn load_encrypted<T>(path: &Path) -> Result<T, Error>
where
    T: DeserializeOwned + Default,
{
    let raw = match std::fs::read(path) {
        Ok(raw) if raw.is_empty() => return Ok(T::default()),
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
        Err(err) => return Err(err.into()),
    };

    let passphrase = passphrase_from_env()?;
    let container: EncryptedContainer = serde_json::from_slice(&raw)
        .map_err(|err| format_err!("failed to parse encrypted cache container {:?}: {}", path, err))?;

    let yaml_bytes = decrypt(&container.kdf, &passphrase, &container.data)
        .map_err(|err| format_err!("failed to decrypt cache {:?}: {}", path, err))?;

    serde_yaml::from_slice(&yaml_bytes)
        .map_err(|err| format_err!("failed to parse decrypted cache {:?}: {}", path, err))
}

/// Encode `value` as YAML, encrypt it, and atomically replace `path`
/// (write to a sibling temp file, then rename).
pub fn save_encrypted<T>(path: &Path, value: &T) -> Result<(), Error>
where
    T: Serialize,
{
    let passphrase = passphrase_from_env()?;
    let yaml_bytes = serde_yaml::to_vec(value)?;

    let kdf = KeyDerivation::generate()?;
    let data = encrypt(&kdf, &passphrase, &yaml_bytes)?;

    let container = EncryptedContainer {
        kdf,
        modified: proxmox_time::epoch_i64(),
        data,
    };

    let raw = serde_json::to_vec_pretty(&container)?;
    proxmox_sys::fs::replace_file(path, &raw, proxmox_sys::fs::CreateOptions::new(), false)?;
    Ok(())
}

/// Load a plain (unencrypted) YAML mapping, e.g. `index_to_region.yaml`
/// or the remote-fetch progress caches. Returns `T::default()` if the
/// file does not exist or is empty.
pub fn load_plain<T>(path: &Path) -> Result<T, Error>
where
    T: DeserializeOwned + Default,
{
    match std::fs::read(path) {
        Ok(raw) if raw.is_empty() => Ok(T::default()),
        Ok(raw) => serde_yaml::from_slice(&raw)
            .map_err(|err| format_err!("failed to parse cache {:?}: {}", path, err)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(err) => Err(err.into()),
    }
}

/// Encode `value` as YAML and atomically replace `path`.
pub fn save_plain<T>(path: &Path, value: &T) -> Result<(), Error>
where
    T: Serialize,
{
    let yaml_bytes = serde_yaml::to_vec(value)?;
    proxmox_sys::fs::replace_file(path, &yaml_bytes, proxmox_sys::fs::CreateOptions::new(), false)?;
    Ok(())
}

fn encrypt(kdf: &KeyDerivation, passphrase: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, Error> {
    let key = kdf.derive_key(passphrase)?;
    let iv = proxmox_sys::linux::random_data(IV_LEN)?;
    let cipher = Cipher::aes_256_gcm();

    let mut tag = [0u8; TAG_LEN];
    let ciphertext = encrypt_aead(cipher, &key, Some(&iv), b"", plaintext, &mut tag)?;

    let mut sealed = Vec::with_capacity(iv.len() + tag.len() + ciphertext.len());
    sealed.extend_from_slice(&iv);
    sealed.extend_from_slice(&tag);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

fn decrypt(kdf: &KeyDerivation, passphrase: &[u8], sealed: &[u8]) -> Result<Vec<u8>, Error> {
    if sealed.len() < IV_LEN + TAG_LEN {
        bail!("encrypted cache data is too short");
    }
    let key = kdf.derive_key(passphrase)?;
    let cipher = Cipher::aes_256_gcm();

    let (iv, rest) = sealed.split_at(IV_LEN);
    let (tag, ciphertext) = rest.split_at(TAG_LEN);

    decrypt_aead(cipher, &key, Some(iv), b"", ciphertext, tag)
        .map_err(|_| format_err!("decryption failed, wrong password?"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn with_passphrase<T>(passphrase: &str, body: impl FnOnce() -> T) -> T {
        std::env::set_var(s3le_buildcfg::CACHE_PASSWORD_ENV_VAR, passphrase);
        let result = body();
        std::env::remove_var(s3le_buildcfg::CACHE_PASSWORD_ENV_VAR);
        result
    }

    #[test]
    fn missing_file_loads_as_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist.yaml");

        let loaded: BTreeMap<u64, String> = load_plain(&path).unwrap();
        assert!(loaded.is_empty());

        let loaded: BTreeMap<u64, String> =
            with_passphrase("pw", || load_encrypted(&path)).unwrap();
        assert!(loaded.is_empty());
    }

    #[test]
    fn round_trips_plain_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("processed_years.yaml");

        let mut map: BTreeMap<String, bool> = BTreeMap::new();
        map.insert("2024".to_string(), true);
        save_plain(&path, &map).unwrap();

        let on_disk = std::fs::read_to_string(&path).unwrap();
        assert!(on_disk.contains("2024"));

        let loaded: BTreeMap<String, bool> = load_plain(&path).unwrap();
        assert_eq!(loaded, map);
    }

    #[test]
    fn round_trips_through_encryption_with_a_passphrase() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index_to_ip.yaml");

        let mut map: BTreeMap<u64, String> = BTreeMap::new();
        map.insert(1, "10.0.0.1".to_string());

        with_passphrase("correct horse battery staple", || {
            save_encrypted(&path, &map).unwrap();
        });

        let on_disk = std::fs::read_to_string(&path).unwrap();
        assert!(!on_disk.contains("10.0.0.1"), "ciphertext must not leak plaintext");

        let loaded: BTreeMap<u64, String> =
            with_passphrase("correct horse battery staple", || load_encrypted(&path)).unwrap();
        assert_eq!(loaded, map);
    }

    #[test]
    fn wrong_passphrase_fails_authentication() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index_to_ip.yaml");

        let mut map: BTreeMap<u64, String> = BTreeMap::new();
        map.insert(1, "10.0.0.1".to_string());
        with_passphrase("correct horse battery staple", || {
            save_encrypted(&path, &map).unwrap();
        });

        let result: Result<BTreeMap<u64, String>, Error> =
            with_passphrase("wrong password", || load_encrypted(&path));
        assert!(result.is_err());
    }

    #[test]
    fn missing_passphrase_is_a_config_error_for_an_existing_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index_to_ip.yaml");

        let mut map: BTreeMap<u64, String> = BTreeMap::new();
        map.insert(1, "10.0.0.1".to_string());
        with_passphrase("correct horse battery staple", || {
            save_encrypted(&path, &map).unwrap();
        });

        std::env::remove_var(s3le_buildcfg::CACHE_PASSWORD_ENV_VAR);
        let result: Result<BTreeMap<u64, String>, Error> = load_encrypted(&path);
        assert!(result.is_err());
    }

    #[test]
    fn missing_passphrase_does_not_block_reading_a_nonexistent_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist.yaml");
        std::env::remove_var(s3le_buildcfg::CACHE_PASSWORD_ENV_VAR);

        let loaded: BTreeMap<u64, String> = load_encrypted(&path).unwrap();
        assert!(loaded.is_empty());
    }
}
