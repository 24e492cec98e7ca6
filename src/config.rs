//! Engine configuration
//!
//! One explicit configuration object, constructed once by the host and
//! passed into [`Transcoder::new`](crate::transcoder::Transcoder::new).
//! There is no package-level mutable state.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::hwaccel::HwAccelKind;

/// Transcoder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscoderConfig {
    /// Root of the on-disk segment cache; one subtree per asset
    pub cache_dir: PathBuf,

    /// Path to the `ffmpeg` binary (resolution is the host's concern)
    pub ffmpeg_path: PathBuf,

    /// Hardware acceleration backend
    pub hwaccel: HwAccelKind,

    /// GPU render device, used by the VAAPI and QSV backends
    pub hwaccel_device: PathBuf,

    /// How often the tracker sweeps for idle assets
    pub sweep_interval_secs: u64,

    /// Idle time after which an asset's transcoding state is destroyed
    pub idle_timeout_secs: u64,

    /// How long a caller waits for a requested segment before timing out
    pub segment_timeout_secs: u64,

    /// Capacity of the usage event channel; events are dropped rather than
    /// back-pressuring playback when the tracker falls behind
    pub usage_buffer: usize,
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("cache/hls"),
            ffmpeg_path: PathBuf::from("ffmpeg"),
            hwaccel: HwAccelKind::Software,
            hwaccel_device: PathBuf::from("/dev/dri/renderD128"),
            sweep_interval_secs: 30 * 60,
            idle_timeout_secs: 4 * 60 * 60,
            segment_timeout_secs: 60,
            usage_buffer: 64,
        }
    }
}

impl TranscoderConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn segment_timeout(&self) -> Duration {
        Duration::from_secs(self.segment_timeout_secs)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: TranscoderConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &std::path::Path) -> Result<(), Box<dyn std::error::Error>> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TranscoderConfig::default();
        assert_eq!(config.idle_timeout(), Duration::from_secs(4 * 60 * 60));
        assert_eq!(config.sweep_interval(), Duration::from_secs(30 * 60));
        assert_eq!(config.hwaccel, HwAccelKind::Software);
    }

    #[test]
    fn test_toml_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transcoder.toml");

        let mut config = TranscoderConfig::default();
        config.hwaccel = HwAccelKind::Vaapi;
        config.idle_timeout_secs = 120;
        config.to_file(&path).unwrap();

        let loaded = TranscoderConfig::from_file(&path).unwrap();
        assert_eq!(loaded.hwaccel, HwAccelKind::Vaapi);
        assert_eq!(loaded.idle_timeout_secs, 120);
    }
}
