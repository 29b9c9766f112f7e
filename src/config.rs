use crate::app_dirs::AppDirs;
use crate::challenge::ChallengeConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Serial device and acquisition settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LinkConfig {
    pub device: String,
    pub baud_rate: u32,
    pub read_timeout_ms: u64,
    /// Boards that reset on open need a moment before their output is usable.
    pub settle_ms: u64,
    pub poll_interval_ms: u64,
    pub join_timeout_ms: u64,
    pub buffer_capacity: usize,
    pub channel_capacity: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            device: "/dev/ttyACM0".to_string(),
            baud_rate: 9600,
            read_timeout_ms: 1000,
            settle_ms: 2000,
            poll_interval_ms: 10,
            join_timeout_ms: 1000,
            buffer_capacity: crate::buffer::DEFAULT_CAPACITY,
            channel_capacity: 256,
        }
    }
}

impl LinkConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub link: LinkConfig,
    pub challenge: ChallengeConfig,
}

pub trait ConfigStore {
    fn load(&self) -> Config;
    fn save(&self, cfg: &Config) -> std::io::Result<()>;
}

#[derive(Debug, Clone)]
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    pub fn new() -> Self {
        let path = AppDirs::config_path().unwrap_or_else(|| PathBuf::from("ppgquest_config.json"));
        Self { path }
    }

    pub fn with_path<P: AsRef<Path>>(p: P) -> Self {
        Self {
            path: p.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Default for FileConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigStore for FileConfigStore {
    fn load(&self) -> Config {
        match fs::read(&self.path) {
            Ok(bytes) => match serde_json::from_slice::<Config>(&bytes) {
                Ok(cfg) => return cfg,
                Err(e) => log::warn!(
                    "Ignoring unreadable config {}: {}",
                    self.path.display(),
                    e
                ),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Could not read config {}: {}", self.path.display(), e),
        }
        Config::default()
    }

    fn save(&self, cfg: &Config) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec_pretty(cfg)?;
        fs::write(&self.path, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn roundtrip_default_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let store = FileConfigStore::with_path(&path);
        let cfg = Config::default();
        store.save(&cfg).unwrap();
        let loaded = store.load();
        assert_eq!(cfg, loaded);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let store = FileConfigStore::with_path(dir.path().join("nope.json"));
        assert_eq!(store.load(), Config::default());
    }

    #[test]
    fn garbage_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, b"{ not json").unwrap();
        assert_eq!(FileConfigStore::with_path(&path).load(), Config::default());
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            br#"{ "link": { "device": "/dev/ttyUSB3" }, "challenge": { "max_duration": 60.0 } }"#,
        )
        .unwrap();

        let cfg = FileConfigStore::with_path(&path).load();
        assert_eq!(cfg.link.device, "/dev/ttyUSB3");
        assert_eq!(cfg.link.baud_rate, 9600);
        assert_eq!(cfg.challenge.max_duration, 60.0);
        assert_eq!(cfg.challenge.ramp_delta, 50.0);
    }

    #[test]
    fn save_creates_parent_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("deeper").join("config.json");
        let store = FileConfigStore::with_path(&path);
        let mut cfg = Config::default();
        cfg.link.baud_rate = 115200;
        cfg.challenge.sample_dt = 0.01;
        store.save(&cfg).unwrap();
        assert_eq!(store.load(), cfg);
    }
}
