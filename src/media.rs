//! Probed media metadata and the provider seam
//!
//! The scanning subsystem probes files and extracts keyframes out of band;
//! this engine consumes the results through [`MediaProvider`].

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::keyframe::Keyframe;

/// Media file information for a single asset
#[derive(Debug, Clone, Default)]
pub struct MediaInfo {
    /// Absolute path of the source file
    pub path: std::path::PathBuf,
    /// Total duration in seconds
    pub duration: f64,
    pub videos: Vec<VideoTrack>,
    pub audios: Vec<AudioTrack>,
}

/// Metadata for a single video track
#[derive(Debug, Clone)]
pub struct VideoTrack {
    pub index: u32,
    pub title: Option<String>,
    pub language: Option<String>,
    pub codec: String,
    /// RFC 6381 codec string, advertised for `Original` variants
    pub mime_codec: Option<String>,
    pub width: u32,
    pub height: u32,
    pub bitrate: u32,
    pub is_default: bool,
}

/// Metadata for a single audio track
#[derive(Debug, Clone)]
pub struct AudioTrack {
    pub index: u32,
    pub title: Option<String>,
    pub language: Option<String>,
    pub codec: String,
    pub mime_codec: Option<String>,
    pub bitrate: u32,
    pub is_default: bool,
}

impl MediaInfo {
    /// The default video track, falling back to the first one.
    pub fn default_video(&self) -> Option<&VideoTrack> {
        self.videos
            .iter()
            .find(|v| v.is_default)
            .or_else(|| self.videos.first())
    }

    pub fn video(&self, index: u32) -> Option<&VideoTrack> {
        self.videos.iter().find(|v| v.index == index)
    }

    pub fn audio(&self, index: u32) -> Option<&AudioTrack> {
        self.audios.iter().find(|a| a.index == index)
    }
}

/// Asset metadata and keyframe provider, implemented by the host on top of
/// its store. The provider owns each [`Keyframe`] and may keep appending to
/// it after handing it over while extraction is still running.
#[async_trait]
pub trait MediaProvider: Send + Sync {
    /// Probed track metadata for an asset.
    async fn media_info(&self, asset_id: &str, source_path: &Path) -> Result<MediaInfo>;

    /// Keyframe boundaries for an asset, possibly still incomplete.
    async fn keyframes(&self, asset_id: &str) -> Result<Arc<Keyframe>>;
}
