//! Configuration management for deej-bridge
//!
//! Loads and validates the YAML configuration file. Slider and button
//! mappings are kept as raw YAML here; the resolver turns them into bindings
//! and drops entries it cannot understand.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub serial: SerialConfig,
    /// Slider index -> target name or list of target names
    #[serde(default)]
    pub slider_mapping: serde_yaml::Mapping,
    /// Button index -> key code (number or name)
    #[serde(default)]
    pub button_mapping: serde_yaml::Mapping,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageConfig>,
}

/// Serial link parameters
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SerialConfig {
    #[serde(default = "default_port")]
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Boards reset when the port opens; wait this long before talking
    #[serde(default = "default_reset_delay")]
    pub reset_delay_ms: u64,
    /// Read timeout used by the reader thread between idle polls
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,
}

/// Sync engine timing and bounds
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SyncConfig {
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_ms: u64,
    #[serde(default = "default_foreground_poll")]
    pub foreground_poll_ms: u64,
    #[serde(default = "default_volume_call_timeout")]
    pub volume_call_timeout_ms: u64,
    #[serde(default = "default_max_concurrent_writes")]
    pub max_concurrent_writes: usize,
    /// Capacity of the reader -> engine queue
    #[serde(default = "default_event_queue")]
    pub event_queue: usize,
}

/// Image sent to display-capable devices on request
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ImageConfig {
    pub path: PathBuf,
    #[serde(default = "default_image_side")]
    pub width: u32,
    #[serde(default = "default_image_side")]
    pub height: u32,
    #[serde(default = "default_row_delay")]
    pub row_delay_ms: u64,
    /// Pixel layout the firmware expects
    #[serde(default)]
    pub format: PixelFormat,
    /// Text line sent after the image, e.g. `title<TAB>artist`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
}

/// Pixel encoding of the image payload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// 3 bytes per pixel, R G B
    #[default]
    Rgb888,
    /// 2 bytes per pixel, big-endian RRRRRGGG GGGBBBBB
    Rgb565,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgb888 => 3,
            PixelFormat::Rgb565 => 2,
        }
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            baud_rate: default_baud_rate(),
            reset_delay_ms: default_reset_delay(),
            read_timeout_ms: default_read_timeout(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_ms: default_reconcile_interval(),
            foreground_poll_ms: default_foreground_poll(),
            volume_call_timeout_ms: default_volume_call_timeout(),
            max_concurrent_writes: default_max_concurrent_writes(),
            event_queue: default_event_queue(),
        }
    }
}

impl SyncConfig {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    pub fn foreground_poll(&self) -> Duration {
        Duration::from_millis(self.foreground_poll_ms)
    }

    pub fn volume_call_timeout(&self) -> Duration {
        Duration::from_millis(self.volume_call_timeout_ms)
    }
}

impl ImageConfig {
    /// Default geometry for an ad-hoc image
    pub fn for_path(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            width: default_image_side(),
            height: default_image_side(),
            row_delay_ms: default_row_delay(),
            format: PixelFormat::default(),
            caption: None,
        }
    }

    pub fn row_delay(&self) -> Duration {
        Duration::from_millis(self.row_delay_ms)
    }
}

impl AppConfig {
    /// Load configuration from file with validation
    pub async fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path))?;

        Self::from_yaml_str(&contents)
            .with_context(|| format!("Invalid config file: {}", path))
    }

    /// Parse and validate configuration from a YAML string
    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        let config: AppConfig =
            serde_yaml::from_str(contents).context("Failed to parse YAML config")?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration for correctness and consistency
    ///
    /// Individual mapping entries are not checked here; a bad entry is
    /// dropped later with a warning instead of failing startup.
    pub fn validate(&self) -> Result<()> {
        if self.serial.port.trim().is_empty() {
            anyhow::bail!("serial.port cannot be empty");
        }
        if self.serial.baud_rate == 0 {
            anyhow::bail!("serial.baud_rate must be greater than 0");
        }
        if self.serial.read_timeout_ms == 0 {
            anyhow::bail!("serial.read_timeout_ms must be greater than 0");
        }

        if self.sync.reconcile_interval_ms == 0 {
            anyhow::bail!("sync.reconcile_interval_ms must be greater than 0");
        }
        if self.sync.foreground_poll_ms == 0 {
            anyhow::bail!("sync.foreground_poll_ms must be greater than 0");
        }
        if self.sync.volume_call_timeout_ms == 0 {
            anyhow::bail!("sync.volume_call_timeout_ms must be greater than 0");
        }
        if self.sync.max_concurrent_writes == 0 {
            anyhow::bail!("sync.max_concurrent_writes must be greater than 0");
        }
        if self.sync.event_queue == 0 {
            anyhow::bail!("sync.event_queue must be greater than 0");
        }

        if let Some(image) = &self.image {
            if image.width == 0 || image.height == 0 {
                anyhow::bail!(
                    "image size {}x{} is invalid (both sides must be non-zero)",
                    image.width,
                    image.height
                );
            }
        }

        Ok(())
    }
}

// Default value functions
fn default_port() -> String { "COM9".to_string() }
fn default_baud_rate() -> u32 { 9600 }
fn default_reset_delay() -> u64 { 2000 }
fn default_read_timeout() -> u64 { 100 }
fn default_reconcile_interval() -> u64 { 1000 }
fn default_foreground_poll() -> u64 { 100 }
fn default_volume_call_timeout() -> u64 { 500 }
fn default_max_concurrent_writes() -> usize { 4 }
fn default_event_queue() -> usize { 64 }
fn default_image_side() -> u32 { 100 }
fn default_row_delay() -> u64 { 5 }

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_from_minimal_config() -> Result<()> {
        let config = AppConfig::from_yaml_str("slider_mapping:\n  0: master\n")?;

        assert_eq!(config.serial.port, "COM9");
        assert_eq!(config.serial.baud_rate, 9600);
        assert_eq!(config.sync.reconcile_interval(), Duration::from_secs(1));
        assert_eq!(config.sync.max_concurrent_writes, 4);
        assert_eq!(config.slider_mapping.len(), 1);
        assert!(config.button_mapping.is_empty());
        assert!(config.image.is_none());
        Ok(())
    }

    #[test]
    fn test_full_config() -> Result<()> {
        let yaml = r#"
serial:
  port: /dev/ttyACM0
  baud_rate: 115200
slider_mapping:
  0: master
  1:
    - chrome.exe
    - spotify.exe
button_mapping:
  0: media_play_pause
  1: 176
sync:
  reconcile_interval_ms: 250
image:
  path: cover.png
  width: 64
"#;
        let config = AppConfig::from_yaml_str(yaml)?;

        assert_eq!(config.serial.port, "/dev/ttyACM0");
        assert_eq!(config.serial.baud_rate, 115200);
        assert_eq!(config.sync.reconcile_interval_ms, 250);
        assert_eq!(config.sync.foreground_poll_ms, 100);
        assert_eq!(config.button_mapping.len(), 2);

        let image = config.image.expect("image section");
        assert_eq!(image.width, 64);
        assert_eq!(image.height, 100);
        assert_eq!(image.format, PixelFormat::Rgb888);
        assert_eq!(image.caption, None);
        Ok(())
    }

    #[test]
    fn test_image_format_and_caption() -> Result<()> {
        let yaml = "image:\n  path: art.jpg\n  format: rgb565\n  caption: \"Song\\tBand\"\n";
        let image = AppConfig::from_yaml_str(yaml)?
            .image
            .expect("image section");

        assert_eq!(image.format, PixelFormat::Rgb565);
        assert_eq!(image.format.bytes_per_pixel(), 2);
        assert_eq!(image.caption.as_deref(), Some("Song\tBand"));

        assert!(AppConfig::from_yaml_str("image:\n  path: a.png\n  format: bgr\n").is_err());
        Ok(())
    }

    #[test]
    fn test_validation_rejects_bad_transport() {
        assert!(AppConfig::from_yaml_str("serial:\n  port: \"\"\n").is_err());
        assert!(AppConfig::from_yaml_str("serial:\n  baud_rate: 0\n").is_err());
        assert!(AppConfig::from_yaml_str("sync:\n  reconcile_interval_ms: 0\n").is_err());
        assert!(AppConfig::from_yaml_str("sync:\n  max_concurrent_writes: 0\n").is_err());
    }

    #[tokio::test]
    async fn test_load_from_file() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let config_path = temp_dir.path().join("config.yaml");
        std::fs::write(&config_path, "serial:\n  port: COM3\n")?;

        let config = AppConfig::load(&config_path.to_string_lossy()).await?;
        assert_eq!(config.serial.port, "COM3");

        let missing = temp_dir.path().join("missing.yaml");
        assert!(AppConfig::load(&missing.to_string_lossy()).await.is_err());
        Ok(())
    }
}
