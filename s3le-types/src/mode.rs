use proxmox_schema::api;
use serde::{Deserialize, Serialize};

#[api()]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
/// Selects which field-extraction rules apply to a log directory.
pub enum Mode {
    /// Generic S3-compatible access logs: timestamp, bytes sent, remote IP.
    Generic,
    /// DANDI archive logs: additionally normalizes the requested object key
    /// into its `blobs/`/`zarr/` hash-prefixed form and applies the
    /// deployment's IP skip-list.
    Dandi,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Generic
    }
}

impl std::str::FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "generic" => Ok(Mode::Generic),
            "dandi" => Ok(Mode::Dandi),
            other => anyhow::bail!("unknown mode {:?}, expected 'generic' or 'dandi'", other),
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Generic => write!(f, "generic"),
            Mode::Dandi => write!(f, "dandi"),
        }
    }
}
