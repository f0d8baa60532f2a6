//! Build-time constants and path configuration shared by all `s3le` crates.

pub const PKG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION_MAJOR"),
    ".",
    env!("CARGO_PKG_VERSION_MINOR"),
);
pub const PKG_RELEASE: &str = env!("CARGO_PKG_VERSION_PATCH");
pub const PKG_REPOID: &str = env!("REPOID");

/// `xdg` application prefix used for the cache directory, the config file
/// and for locating the encrypted IP index passphrase file.
pub const XDG_PREFIX: &str = "s3-log-extraction";

/// Name of the JSON config file placed in the xdg config home.
pub const CONFIG_FILE_NAME: &str = "config.json";

/// Environment variable carrying the passphrase used to encrypt the IP
/// index cache. Required whenever the encrypted cache is read or written.
pub const CACHE_PASSWORD_ENV_VAR: &str = "S3LE_CACHE_PASSWORD";

/// Resolve the xdg base directories for this application.
pub fn base_directories() -> Result<xdg::BaseDirectories, anyhow::Error> {
    xdg::BaseDirectories::with_prefix(XDG_PREFIX).map_err(anyhow::Error::from)
}
