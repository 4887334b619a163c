use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

fn default_max_concurrent_transfers() -> usize {
    3
}

fn default_capture_timeout_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_keepalive_secs() -> u64 {
    20
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_pty_cols() -> u32 {
    120
}

fn default_pty_rows() -> u32 {
    30
}

fn default_pty_term() -> String {
    "xterm".to_string()
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("_ssh_download")
}

fn default_probe_dir() -> String {
    ".ssh".to_string()
}

fn default_probe_interval_secs() -> u64 {
    3
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Tunables shared by the shell session, the filesystem queue and the
/// transfer engine. Passed into each component explicitly.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    #[serde(default = "default_max_concurrent_transfers")]
    pub max_concurrent_transfers: usize,
    #[serde(default)]
    pub compress_uploads: bool,
    #[serde(default = "default_capture_timeout_secs")]
    pub capture_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_pty_cols")]
    pub pty_cols: u32,
    #[serde(default = "default_pty_rows")]
    pub pty_rows: u32,
    #[serde(default = "default_pty_term")]
    pub pty_term: String,
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    #[serde(default = "default_probe_dir")]
    pub probe_dir: String,
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_transfers: default_max_concurrent_transfers(),
            compress_uploads: false,
            capture_timeout_secs: default_capture_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            keepalive_secs: default_keepalive_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            pty_cols: default_pty_cols(),
            pty_rows: default_pty_rows(),
            pty_term: default_pty_term(),
            download_dir: default_download_dir(),
            probe_dir: default_probe_dir(),
            probe_interval_secs: default_probe_interval_secs(),
            log_file: None,
            log_level: default_log_level(),
        }
    }
}

impl EngineConfig {
    pub fn capture_timeout(&self) -> Duration {
        Duration::from_secs(self.capture_timeout_secs.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.clamp(10, 1000))
    }

    pub fn pool_size(&self) -> usize {
        self.max_concurrent_transfers.clamp(1, 32)
    }

    pub fn probe_path(&self) -> String {
        format!("{}/processes", self.probe_dir.trim_end_matches('/'))
    }
}

pub fn config_path() -> PathBuf {
    if let Some(dir) = dirs::config_dir() {
        return dir.join("rusty-remote").join("engine.toml");
    }
    PathBuf::from("engine.toml")
}

/// Missing file means defaults; a file that exists but does not parse is an error.
pub fn load_from(path: &Path) -> Result<EngineConfig> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(EngineConfig::default());
        }
        Err(err) => {
            return Err(err).with_context(|| format!("Failed to read {}", path.display()));
        }
    };
    toml::from_str(&text).with_context(|| format!("Invalid config file {}", path.display()))
}

pub fn load() -> Result<EngineConfig> {
    load_from(&config_path())
}

pub fn save_to(cfg: &EngineConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let text = toml::to_string_pretty(cfg).context("Failed to serialize config")?;

    let tmp = path.with_extension("toml.tmp");
    fs::write(&tmp, text).with_context(|| format!("Failed to write {}", tmp.display()))?;
    if let Err(err) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(err).with_context(|| format!("Failed to replace {}", path.display()));
    }
    Ok(())
}
