//! Loopback client configuration

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Largest bulk packet at full speed
const MAX_FULL_SPEED_PACKET: u16 = 64;
/// Largest bulk packet at high speed
const MAX_HIGH_SPEED_PACKET: u16 = 512;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoopbackConfig {
    #[serde(default)]
    pub gadget: GadgetSettings,
    #[serde(default)]
    pub device: DeviceSettings,
    #[serde(default)]
    pub transfer: TransferSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Where gadgetfs lives
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GadgetSettings {
    /// gadgetfs mount point (`~` and `$VARS` are expanded)
    #[serde(default = "GadgetSettings::default_path")]
    pub path: String,
    /// Controller file name; auto-detected when unset
    #[serde(default)]
    pub controller: Option<String>,
}

impl Default for GadgetSettings {
    fn default() -> Self {
        Self {
            path: Self::default_path(),
            controller: None,
        }
    }
}

impl GadgetSettings {
    fn default_path() -> String {
        gadget::DEFAULT_GADGETFS_PATH.to_string()
    }
}

/// Strings and endpoint layout of the loopback device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSettings {
    #[serde(default = "DeviceSettings::default_manufacturer")]
    pub manufacturer: String,
    #[serde(default = "DeviceSettings::default_product")]
    pub product: String,
    #[serde(default = "DeviceSettings::default_serial")]
    pub serial: String,
    /// String table language id
    #[serde(default = "DeviceSettings::default_language")]
    pub language: u16,
    /// Bulk IN endpoint number (device to host)
    #[serde(default = "DeviceSettings::default_in_endpoint")]
    pub in_endpoint: u8,
    /// Bulk OUT endpoint number (host to device)
    #[serde(default = "DeviceSettings::default_out_endpoint")]
    pub out_endpoint: u8,
    #[serde(default = "DeviceSettings::default_full_speed_packet")]
    pub full_speed_packet: u16,
    #[serde(default = "DeviceSettings::default_high_speed_packet")]
    pub high_speed_packet: u16,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            manufacturer: Self::default_manufacturer(),
            product: Self::default_product(),
            serial: Self::default_serial(),
            language: Self::default_language(),
            in_endpoint: Self::default_in_endpoint(),
            out_endpoint: Self::default_out_endpoint(),
            full_speed_packet: Self::default_full_speed_packet(),
            high_speed_packet: Self::default_high_speed_packet(),
        }
    }
}

impl DeviceSettings {
    fn default_manufacturer() -> String {
        "The manufacturer".to_string()
    }

    fn default_product() -> String {
        "The product".to_string()
    }

    fn default_serial() -> String {
        "0123456789.0123456789.0123456789".to_string()
    }

    fn default_language() -> u16 {
        0x0409 // en-us
    }

    fn default_in_endpoint() -> u8 {
        7
    }

    fn default_out_endpoint() -> u8 {
        3
    }

    fn default_full_speed_packet() -> u16 {
        MAX_FULL_SPEED_PACKET
    }

    fn default_high_speed_packet() -> u16 {
        MAX_HIGH_SPEED_PACKET
    }
}

/// Echo worker transfer parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSettings {
    /// Largest transfer read from the OUT endpoint
    #[serde(default = "TransferSettings::default_buffer_size")]
    pub buffer_size: usize,
    /// Per-transfer timeout in milliseconds
    #[serde(default = "TransferSettings::default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            buffer_size: Self::default_buffer_size(),
            timeout_ms: Self::default_timeout_ms(),
        }
    }
}

impl TransferSettings {
    fn default_buffer_size() -> usize {
        64
    }

    fn default_timeout_ms() -> u64 {
        100
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Level used when neither RUST_LOG nor --debug is given
    #[serde(default = "LoggingSettings::default_level")]
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
        }
    }
}

impl LoggingSettings {
    fn default_level() -> String {
        "info".to_string()
    }
}

impl LoopbackConfig {
    /// Load configuration from `path`, or from the default location
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => expand_path(&p.to_string_lossy())?,
            None => {
                let default = Self::default_path();
                if !default.exists() {
                    return Err(anyhow!("No configuration file found, using defaults"));
                }
                default
            }
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: LoopbackConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration from the default location or fall back to defaults
    pub fn load_or_default() -> Self {
        Self::load_or_default_from(&Self::default_path())
    }

    /// Defaults when `path` is absent; a file that is present but unusable
    /// is reported on stderr as well, since logging is not set up yet
    fn load_or_default_from(path: &Path) -> Self {
        if !path.exists() {
            tracing::debug!("No configuration file at {}, using defaults", path.display());
            return Self::default();
        }
        match Self::load(Some(path.to_path_buf())) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {:#}, using defaults", e);
                eprintln!("Warning: failed to load config: {:#}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usg").join("loopback.toml")
        } else {
            PathBuf::from(".config/usg/loopback.toml")
        }
    }

    /// gadgetfs mount point with `~` and environment variables expanded
    pub fn gadget_path(&self) -> Result<PathBuf> {
        expand_path(&self.gadget.path)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            ));
        }

        let device = &self.device;
        for (name, number) in [
            ("in_endpoint", device.in_endpoint),
            ("out_endpoint", device.out_endpoint),
        ] {
            if !(1..=15).contains(&number) {
                return Err(anyhow!("{} must be within 1..=15, got {}", name, number));
            }
        }
        if device.in_endpoint == device.out_endpoint {
            return Err(anyhow!(
                "in_endpoint and out_endpoint must differ (both {})",
                device.in_endpoint
            ));
        }
        if !matches!(device.full_speed_packet, 8 | 16 | 32 | 64) {
            return Err(anyhow!(
                "full_speed_packet must be 8, 16, 32 or {}, got {}",
                MAX_FULL_SPEED_PACKET,
                device.full_speed_packet
            ));
        }
        if device.high_speed_packet != MAX_HIGH_SPEED_PACKET {
            return Err(anyhow!(
                "high_speed_packet must be {} for bulk endpoints, got {}",
                MAX_HIGH_SPEED_PACKET,
                device.high_speed_packet
            ));
        }

        if self.transfer.buffer_size == 0 {
            return Err(anyhow!("buffer_size must be greater than 0"));
        }

        Ok(())
    }
}

fn expand_path(path: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(path)
        .with_context(|| format!("Failed to expand path: {}", path))?;
    Ok(PathBuf::from(expanded.as_ref()))
}
