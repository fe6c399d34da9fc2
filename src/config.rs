//! Runtime configuration for device paths, buffer pool sizing, and the
//! request pool depth.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

fn default_output_buffer_count() -> u32 {
    16
}

fn default_capture_buffer_count() -> u32 {
    16
}

fn default_request_pool_size() -> u32 {
    32
}

fn default_drain_idle_budget_ms() -> u64 {
    100
}

fn default_device_path() -> String {
    "/dev/video0".to_string()
}

fn default_media_device_path() -> String {
    "/dev/media0".to_string()
}

/// Pixel format fourccs the orchestrator will try, in order, when negotiating
/// the decoded-output queue.
fn default_preferred_pixel_format() -> String {
    "NV12".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_output_buffer_count")]
    pub output_buffer_count: u32,
    #[serde(default = "default_capture_buffer_count")]
    pub capture_buffer_count: u32,
    #[serde(default = "default_request_pool_size")]
    pub request_pool_size: u32,
    #[serde(default = "default_preferred_pixel_format")]
    pub preferred_pixel_format: String,
    #[serde(default)]
    pub use_dma_prime_buffers: bool,
    #[serde(default)]
    pub initial_width: u32,
    #[serde(default)]
    pub initial_height: u32,
    #[serde(default = "default_drain_idle_budget_ms")]
    pub drain_idle_budget_ms: u64,
    #[serde(default = "default_device_path")]
    pub device_path: String,
    #[serde(default = "default_media_device_path")]
    pub media_device_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            output_buffer_count: default_output_buffer_count(),
            capture_buffer_count: default_capture_buffer_count(),
            request_pool_size: default_request_pool_size(),
            preferred_pixel_format: default_preferred_pixel_format(),
            use_dma_prime_buffers: false,
            initial_width: 0,
            initial_height: 0,
            drain_idle_budget_ms: default_drain_idle_budget_ms(),
            device_path: default_device_path(),
            media_device_path: default_media_device_path(),
        }
    }
}

impl Config {
    fn config_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("org", "v4l2-h264-stateless", "v4l2-h264-stateless")
            .context("could not determine config directory")?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }

    fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path).context("failed to read config file")?;
        toml::from_str(&content).context("failed to parse config file")
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir).context("failed to create config directory")?;

        let path = Self::config_path()?;
        let content = toml::to_string_pretty(self).context("failed to serialize config")?;
        fs::write(&path, content).context("failed to write config file")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_pool_sizes() {
        let cfg = Config::default();
        assert!(cfg.output_buffer_count > 0);
        assert!(cfg.capture_buffer_count > 0);
        assert!(cfg.request_pool_size > 0);
    }

    #[test]
    fn round_trips_through_toml() {
        let cfg = Config::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back.output_buffer_count, cfg.output_buffer_count);
        assert_eq!(back.device_path, cfg.device_path);
    }
}
