//! Configuration system for deluge nodes.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $DELUGE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/deluge/config.toml
//!   3. ~/.config/deluge/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::elf::Arch;
use crate::page::Variant;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DelugeConfig {
    pub network: NetworkConfig,
    pub protocol: ProtocolConfig,
    pub loader: LoaderConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Network interface name. Empty = let the OS pick (scope 0).
    pub interface: String,
    /// UDP port shared by every node on the link.
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub variant: Variant,
    /// Lower bound of the advertisement round interval.
    pub t_low_secs: u64,
    /// Upper bound of the advertisement round interval.
    pub t_high_secs: u64,
    /// Summaries heard per round before our own is suppressed.
    pub const_k: u32,
    /// Unanswered requests before giving up on a page for this round.
    pub const_lambda: u8,
    /// Multiplier on the estimated transmission time for request delays.
    pub const_omega: u32,
    pub estimated_tx_time_ms: u64,
    /// Random spread added to request delays.
    pub t_r_ms: u64,
    /// Delay between accepting a request and streaming the page.
    pub tx_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    pub arch: Arch,
    pub ram_base: u32,
    pub ram_size: u32,
    pub rom_base: u32,
    pub rom_size: u32,
    /// Fail the load on unknown or out-of-range relocations instead of skipping them.
    pub strict_relocations: bool,
    /// TOML file mapping global symbol names to addresses.
    pub symbols: Option<PathBuf>,
    /// Load the object as soon as an update completes.
    pub autoload: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding disseminated objects.
    pub dir: PathBuf,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            interface: String::new(),
            port: 6464,
        }
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            variant: Variant::Deluge,
            t_low_secs: 2,
            t_high_secs: 64,
            const_k: 1,
            const_lambda: 2,
            const_omega: 8,
            estimated_tx_time_ms: 125,
            t_r_ms: 2000,
            tx_delay_ms: 1000,
        }
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            arch: Arch::Msp430x,
            ram_base: 0x1c00,
            ram_size: 4096,
            rom_base: 0x10000,
            rom_size: 64 * 1024,
            strict_relocations: false,
            symbols: None,
            autoload: false,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: data_dir().join("objects"),
        }
    }
}

impl ProtocolConfig {
    pub fn t_low(&self) -> Duration {
        Duration::from_secs(self.t_low_secs)
    }

    pub fn t_high(&self) -> Duration {
        Duration::from_secs(self.t_high_secs)
    }

    pub fn estimated_tx_time(&self) -> Duration {
        Duration::from_millis(self.estimated_tx_time_ms)
    }

    pub fn t_r(&self) -> Duration {
        Duration::from_millis(self.t_r_ms)
    }

    pub fn tx_delay(&self) -> Duration {
        Duration::from_millis(self.tx_delay_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("deluge")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("deluge")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl DelugeConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            DelugeConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse one file without consulting the environment.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("DELUGE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&DelugeConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply DELUGE_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(v) = get("DELUGE_NETWORK__INTERFACE") {
            self.network.interface = v;
        }
        if let Some(v) = get("DELUGE_NETWORK__PORT") {
            if let Ok(p) = v.parse() {
                self.network.port = p;
            }
        }
        if let Some(v) = get("DELUGE_PROTOCOL__VARIANT") {
            if let Ok(variant) = v.parse() {
                self.protocol.variant = variant;
            }
        }
        if let Some(v) = get("DELUGE_LOADER__ARCH") {
            if let Ok(arch) = v.parse() {
                self.loader.arch = arch;
            }
        }
        if let Some(v) = get("DELUGE_LOADER__STRICT_RELOCATIONS") {
            self.loader.strict_relocations = v == "true" || v == "1";
        }
        if let Some(v) = get("DELUGE_LOADER__AUTOLOAD") {
            self.loader.autoload = v == "true" || v == "1";
        }
        if let Some(v) = get("DELUGE_STORAGE__DIR") {
            self.storage.dir = PathBuf::from(v);
        }
    }
}
