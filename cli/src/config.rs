// Configuration management for the hrlink CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/hrlink/config.json
// - Linux: ~/.config/hrlink/config.json
// - Windows: %APPDATA%\hrlink\config.json

use anyhow::{Context, Result};
use hrlink_core::{CapabilityTier, SessionConfig, TransportEncoding};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Settings handed to the core session
    pub session: SessionConfig,

    /// Peripheral id or name `monitor` uses when none is given
    pub default_device: Option<String>,

    /// Connect attempts `monitor` makes before giving up
    pub connect_retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            default_device: None,
            connect_retries: 3,
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("hrlink");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from the default location, creating it if missing
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            config
                .session
                .validate()
                .context("Invalid session settings in config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Set a config value in memory; callers save
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "scan_timeout_secs" => {
                let secs: u64 = value.parse().context("Invalid number")?;
                self.session = self.session.clone().with_scan_timeout(secs)?;
            }
            "capability_tier" => {
                self.session.capability_tier = value
                    .parse::<CapabilityTier>()
                    .map_err(anyhow::Error::msg)?;
            }
            "transport_encoding" => {
                self.session.transport_encoding = value.parse::<TransportEncoding>()?;
            }
            "update_channel_capacity" => {
                let session = SessionConfig {
                    update_channel_capacity: value.parse().context("Invalid number")?,
                    ..self.session.clone()
                };
                session.validate()?;
                self.session = session;
            }
            "default_device" => {
                self.default_device = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "connect_retries" => {
                self.connect_retries = value.parse().context("Invalid number")?;
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "scan_timeout_secs" => Some(self.session.scan_timeout_secs.to_string()),
            "capability_tier" => Some(self.session.capability_tier.to_string()),
            "transport_encoding" => Some(self.session.transport_encoding.to_string()),
            "update_channel_capacity" => Some(self.session.update_channel_capacity.to_string()),
            "default_device" => self.default_device.clone(),
            "connect_retries" => Some(self.connect_retries.to_string()),
            _ => None,
        }
    }

    pub fn list(&self) -> Vec<(String, String)> {
        vec![
            (
                "scan_timeout_secs".to_string(),
                format!("{}s", self.session.scan_timeout_secs),
            ),
            (
                "capability_tier".to_string(),
                self.session.capability_tier.to_string(),
            ),
            (
                "transport_encoding".to_string(),
                self.session.transport_encoding.to_string(),
            ),
            (
                "update_channel_capacity".to_string(),
                self.session.update_channel_capacity.to_string(),
            ),
            (
                "default_device".to_string(),
                self.default_device
                    .clone()
                    .unwrap_or_else(|| "(none)".to_string()),
            ),
            (
                "connect_retries".to_string(),
                self.connect_retries.to_string(),
            ),
        ]
    }
}
