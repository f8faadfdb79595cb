use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::{RateTier, UserId};

/// 10 MiB; the user-facing message says "10MB".
pub const DEFAULT_MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Runtime configuration. Every field has a default, so a partial TOML file is fine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Per-user ceiling on concurrently running scans.
    pub max_concurrent_scans: usize,
    /// Wall-clock limit for one run, checked between ranges.
    pub scan_timeout_secs: u64,
    /// Largest accepted range-list upload in bytes.
    pub max_file_size: u64,
    /// Recompute the progress text every N engine output lines.
    pub progress_every_lines: u64,
    /// Where uploaded range lists and result logs live.
    pub files_dir: PathBuf,
    pub owner_id: Option<UserId>,
    pub bind: String,
    pub rates: RateTable,
    pub engine: EngineConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent_scans: 3,
            scan_timeout_secs: 36_000,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            progress_every_lines: 10,
            files_dir: PathBuf::from("files"),
            owner_id: None,
            bind: "127.0.0.1:8080".to_string(),
            rates: RateTable::default(),
            engine: EngineConfig::default(),
        }
    }
}

impl Config {
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    /// Upload limit as shown to users, e.g. `10MB`.
    pub fn max_file_size_label(&self) -> String {
        let mib = self.max_file_size / (1024 * 1024);
        if mib > 0 && self.max_file_size % (1024 * 1024) == 0 {
            format!("{mib}MB")
        } else {
            format!("{} bytes", self.max_file_size)
        }
    }
}

/// Packets/second ceiling for each rate tier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RateTable {
    pub slow: u64,
    pub normal: u64,
    pub fast: u64,
}

impl Default for RateTable {
    fn default() -> Self {
        Self {
            slow: 1_000,
            normal: 10_000,
            fast: 100_000,
        }
    }
}

impl RateTable {
    pub fn packets_per_second(&self, tier: RateTier) -> u64 {
        match tier {
            RateTier::Slow => self.slow,
            RateTier::Normal => self.normal,
            RateTier::Fast => self.fast,
        }
    }
}

/// Textual format of the engine's stdout.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EngineOutput {
    /// `Discovered open port 80/tcp on 10.0.0.1`
    #[default]
    Text,
    /// One JSON object per line (masscan `-oD`).
    Ndjson,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Program followed by fixed leading arguments, e.g. `["sudo", "masscan"]`.
    pub command: Vec<String>,
    /// Inserted after `--rate=N`, before the range.
    pub extra_args: Vec<String>,
    pub output: EngineOutput,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command: vec!["sudo".to_string(), "masscan".to_string()],
            extra_args: Vec::new(),
            output: EngineOutput::Text,
        }
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("org", "scan-relay", "scan-relay")
        .map(|proj| proj.config_dir().join("config.toml"))
}

/// Load the config file at `path`, or at the default location when `path` is
/// `None`. A missing file yields `Ok(None)`.
pub fn load_config(path: Option<&Path>) -> Result<Option<Config>> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => match default_config_path() {
            Some(p) => p,
            None => return Ok(None),
        },
    };
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let cfg = toml::from_str(&content)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    Ok(Some(cfg))
}

pub fn save_config(cfg: &Config, path: Option<&Path>) -> Result<PathBuf> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => default_config_path().context("no default config directory")?,
    };
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create config dir: {}", dir.display()))?;
    }
    let toml_str = toml::to_string_pretty(cfg).context("failed to serialize config")?;
    fs::write(&path, toml_str)
        .with_context(|| format!("failed to write config file: {}", path.display()))?;
    Ok(path)
}
