//! Per-asset stream aggregate
//!
//! A [`StreamWrapper`] owns every video and audio stream of one asset, the
//! probed metadata backing them, and the asset's cache subtree. It is
//! created once per asset on first request and destroyed by the tracker or
//! by explicit eviction.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::cmap::CMap;
use crate::error::{Error, Result};
use crate::hwaccel::HwAccel;
use crate::keyframe::Keyframe;
use crate::media::MediaInfo;
use crate::playlist;
use crate::quality::Quality;
use crate::stream::{AudioStream, StreamCtx, VideoStream};

/// Identifies one video rendition within an asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VideoKey {
    pub index: u32,
    pub quality: Quality,
}

/// All transcoding state of a single asset.
pub struct StreamWrapper {
    info: Arc<MediaInfo>,
    keyframes: Arc<Keyframe>,
    /// Cache subtree of this asset, deleted wholesale on destroy
    out_dir: PathBuf,
    ffmpeg_path: PathBuf,
    hwaccel: Arc<HwAccel>,
    segment_timeout: Duration,
    videos: CMap<VideoKey, Arc<VideoStream>>,
    audios: CMap<u32, Arc<AudioStream>>,
}

impl StreamWrapper {
    pub(crate) fn new(
        info: MediaInfo,
        keyframes: Arc<Keyframe>,
        out_dir: PathBuf,
        ffmpeg_path: PathBuf,
        hwaccel: Arc<HwAccel>,
        segment_timeout: Duration,
    ) -> Self {
        Self {
            info: Arc::new(info),
            keyframes,
            out_dir,
            ffmpeg_path,
            hwaccel,
            segment_timeout,
            videos: CMap::new(),
            audios: CMap::new(),
        }
    }

    pub fn info(&self) -> &MediaInfo {
        &self.info
    }

    fn ctx(&self) -> StreamCtx {
        StreamCtx {
            info: self.info.clone(),
            keyframes: self.keyframes.clone(),
            out_dir: self.out_dir.clone(),
            ffmpeg_path: self.ffmpeg_path.clone(),
            hwaccel: self.hwaccel.clone(),
            segment_timeout: self.segment_timeout,
        }
    }

    /// Master playlist with the full quality ladder.
    pub fn master_multi(&self) -> String {
        playlist::master_multi(&self.info)
    }

    /// Master playlist with a single variant picked for the client class.
    pub fn master_single(&self, is_mobile: bool) -> String {
        playlist::master_single(&self.info, is_mobile)
    }

    /// The video stream for `(index, quality)`, created on first use. The
    /// track is validated first so the map never caches a failure.
    fn video_stream(&self, index: u32, quality: Quality) -> Result<Arc<VideoStream>> {
        let track = self
            .info
            .video(index)
            .ok_or(Error::TrackNotFound {
                kind: "video",
                index,
            })?
            .clone();
        Ok(self
            .videos
            .get_or_create(VideoKey { index, quality }, || {
                Arc::new(VideoStream::new(self.ctx(), track, quality))
            }))
    }

    fn audio_stream(&self, index: u32) -> Result<Arc<AudioStream>> {
        if self.info.audio(index).is_none() {
            return Err(Error::TrackNotFound {
                kind: "audio",
                index,
            });
        }
        Ok(self
            .audios
            .get_or_create(index, || Arc::new(AudioStream::new(self.ctx(), index))))
    }

    pub fn get_video_index(&self, index: u32, quality: Quality) -> Result<String> {
        Ok(self.video_stream(index, quality)?.index_playlist())
    }

    pub async fn get_video_segment(
        &self,
        index: u32,
        quality: Quality,
        segment: u32,
    ) -> Result<PathBuf> {
        self.video_stream(index, quality)?.get_segment(segment).await
    }

    pub fn get_audio_index(&self, index: u32) -> Result<String> {
        Ok(self.audio_stream(index)?.index_playlist())
    }

    pub async fn get_audio_segment(&self, index: u32, segment: u32) -> Result<PathBuf> {
        self.audio_stream(index)?.get_segment(segment).await
    }

    /// Kill every encoder head owned by this asset. Waiters are woken with
    /// a cancellation.
    pub fn kill(&self) {
        self.videos.for_each(|_, stream| stream.kill());
        self.audios.for_each(|_, stream| stream.kill());
    }

    /// Kill all streams and delete the asset's cache subtree. Idempotent.
    pub fn destroy(&self) {
        info!(path = %self.info.path.display(), "removing transcode cache");
        self.kill();
        self.videos.clear();
        self.audios.clear();
        if let Err(err) = std::fs::remove_dir_all(&self.out_dir) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    dir = %self.out_dir.display(),
                    "failed to remove cache subtree: {}",
                    err
                );
            }
        }
    }

    /// Total heads ever spawned across this asset's streams.
    pub fn head_count(&self) -> usize {
        let mut count = 0;
        self.videos.for_each(|_, stream| count += stream.head_count());
        self.audios.for_each(|_, stream| count += stream.head_count());
        count
    }
}
