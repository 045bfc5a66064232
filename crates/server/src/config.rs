//! Server configuration, persisted as a small JSON file in the data dir.

use meridian_core::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

const CONFIG_FILE: &str = "config";

/// Persisted server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Random hex id assigned at first boot; leaders refuse to follow
    /// themselves.
    pub server_id: String,
    #[serde(default)]
    pub follow_host: String,
    #[serde(default)]
    pub follow_port: u16,
    #[serde(default)]
    pub read_only: bool,
    /// Memory cap in bytes; zero means unlimited.
    #[serde(default)]
    pub max_memory: u64,
}

impl Config {
    /// Load from `dir`, creating a fresh config (with a new server id) when
    /// none exists.
    pub fn load(dir: &Path) -> Result<Config> {
        let path = Self::path(dir);
        match std::fs::read(&path) {
            Ok(data) => match serde_json::from_slice::<Config>(&data) {
                Ok(config) => Ok(config),
                Err(err) => {
                    warn!(%err, "config file unreadable, starting fresh");
                    let config = Config::fresh();
                    config.save(dir)?;
                    Ok(config)
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let config = Config::fresh();
                config.save(dir)?;
                Ok(config)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn fresh() -> Config {
        Config {
            server_id: format!("{:016x}", rand::random::<u64>()),
            ..Config::default()
        }
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        let data = serde_json::to_vec_pretty(self).expect("config serializes");
        std::fs::write(Self::path(dir), data)?;
        Ok(())
    }

    pub fn is_following(&self) -> bool {
        !self.follow_host.is_empty() && self.follow_port != 0
    }

    fn path(dir: &Path) -> PathBuf {
        dir.join(CONFIG_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_config_persists_id() {
        let dir = tempfile::tempdir().unwrap();
        let a = Config::load(dir.path()).unwrap();
        assert_eq!(a.server_id.len(), 16);
        assert!(!a.is_following());
        let b = Config::load(dir.path()).unwrap();
        assert_eq!(a.server_id, b.server_id);
    }

    #[test]
    fn test_follow_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::load(dir.path()).unwrap();
        config.follow_host = "127.0.0.1".into();
        config.follow_port = 9851;
        config.save(dir.path()).unwrap();
        let again = Config::load(dir.path()).unwrap();
        assert!(again.is_following());
        assert_eq!(again.follow_port, 9851);
    }
}
