//! Local (client-side) configuration file: which repository to connect to
//! and how to cache it. Written with 0600 permissions inside a 0700
//! directory, the same directory discipline `src/config.rs` uses.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use repo_types::{RepoError, Result};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ConnectionInfo {
    pub kind: String,
    pub path: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CachingConfig {
    pub cache_directory: Option<String>,
    pub max_cache_size_bytes: u64,
    pub max_list_cache_duration_sec: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LocalConfig {
    pub storage: ConnectionInfo,
    pub caching: CachingConfig,
    pub hostname: String,
    pub username: String,
}

impl LocalConfig {
    /// Creates the parent directory (0700) if needed, then writes this
    /// config as 0600 JSON.
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| RepoError::Other(e.into()))?;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| RepoError::Other(e.into()))?;
        }
        let json = serde_json::to_vec_pretty(self).map_err(|e| RepoError::Other(e.into()))?;
        fs::write(path, &json).map_err(|e| RepoError::Other(e.into()))?;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| RepoError::Other(e.into()))?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RepoError::NotFound(path.display().to_string())
            } else {
                RepoError::Other(e.into())
            }
        })?;
        serde_json::from_slice(&bytes).map_err(|e| RepoError::InvalidConfiguration(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_roundtrips_and_sets_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let config = LocalConfig {
            storage: ConnectionInfo {
                kind: "filesystem".into(),
                path: "/var/backups/repo".into(),
            },
            caching: CachingConfig {
                cache_directory: Some("/var/cache/repo".into()),
                max_cache_size_bytes: 1 << 30,
                max_list_cache_duration_sec: 30,
            },
            hostname: "host1".into(),
            username: "alice".into(),
        };
        config.write(&path).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);

        let parent_mode = fs::metadata(path.parent().unwrap()).unwrap().permissions().mode() & 0o777;
        assert_eq!(parent_mode, 0o700);

        let loaded = LocalConfig::read(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");
        assert!(matches!(LocalConfig::read(&path), Err(RepoError::NotFound(_))));
    }
}
