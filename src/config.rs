//! Repository-wide tunables and per-remote records, both persisted as
//! `toml_edit`-formatted text under the repository root so a human can
//! hand-edit `config.toml` without losing comments or formatting.

use std::fs;
use std::path::Path;

use serde::Deserialize;
use serde::Serialize;

use crate::error::IoResultExt as _;
use crate::error::OriResult;
use crate::large_blob::MAX_CHUNK_SIZE;
use crate::large_blob::TARGET_CHUNK_SIZE;
use crate::packfile::DEFAULT_PACKFILE_SOFT_CAP;
use crate::packfile::DEFAULT_TRANSACTION_THRESHOLD;

/// Overridable tunables for packfile sizing, transaction batching, and
/// chunking. Defaults match the constants used elsewhere in the crate; a
/// `config.toml` is optional and need only specify the fields it overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepoConfig {
    pub packfile_soft_cap: u64,
    pub transaction_threshold: u64,
    pub chunk_target_size: u64,
    pub chunk_max_size: u64,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            packfile_soft_cap: DEFAULT_PACKFILE_SOFT_CAP,
            transaction_threshold: DEFAULT_TRANSACTION_THRESHOLD,
            chunk_target_size: TARGET_CHUNK_SIZE as u64,
            chunk_max_size: MAX_CHUNK_SIZE as u64,
        }
    }
}

impl RepoConfig {
    /// Loads `path` if present, falling back to defaults if it is absent.
    pub fn load_or_default(path: &Path) -> OriResult<Self> {
        match fs::read_to_string(path) {
            Ok(text) => toml_edit::de::from_str(&text)
                .map_err(|e| crate::error::OriError::corruption(format!("invalid config at {}: {e}", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_path(path),
        }
    }

    pub fn save(&self, path: &Path) -> OriResult<()> {
        let text = toml_edit::ser::to_string(self)
            .map_err(|e| crate::error::OriError::corruption(format!("serializing config: {e}")))?;
        fs::write(path, text).with_path(path)
    }
}

/// A remote repository record: `refs/remotes/<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub url: String,
    #[serde(default)]
    pub instaclone: bool,
}

impl RemoteConfig {
    pub fn load(path: &Path) -> OriResult<Self> {
        let text = fs::read_to_string(path).with_path(path)?;
        toml_edit::de::from_str(&text)
            .map_err(|e| crate::error::OriError::corruption(format!("invalid remote record at {}: {e}", path.display())))
    }

    pub fn save(&self, path: &Path) -> OriResult<()> {
        let text = toml_edit::ser::to_string(self)
            .map_err(|e| crate::error::OriError::corruption(format!("serializing remote record: {e}")))?;
        fs::write(path, text).with_path(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = RepoConfig::load_or_default(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config, RepoConfig::default());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = RepoConfig::default();
        config.packfile_soft_cap = 1234;
        config.save(&path).unwrap();
        let loaded = RepoConfig::load_or_default(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn remote_record_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("origin");
        let remote = RemoteConfig {
            url: "ori://example.org/repo".to_owned(),
            instaclone: true,
        };
        remote.save(&path).unwrap();
        assert_eq!(RemoteConfig::load(&path).unwrap(), remote);
    }
}
