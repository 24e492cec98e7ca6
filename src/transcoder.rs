//! Top-level transcoding entry point
//!
//! Maps asset identifiers to [`StreamWrapper`]s, constructed single-flight
//! so a request stampede on a cold asset builds exactly one wrapper, and
//! reports usage to the tracker that reaps idle assets.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::cmap::CMap;
use crate::config::TranscoderConfig;
use crate::error::{Error, Result};
use crate::hwaccel::HwAccel;
use crate::media::MediaProvider;
use crate::quality::Quality;
use crate::runlock::{Flight, RunLock};
use crate::tracker;
use crate::wrapper::StreamWrapper;

/// A playback touch reported to the tracker.
#[derive(Debug, Clone)]
pub(crate) struct UsageEvent {
    pub asset_id: String,
}

/// The on-demand HLS transcoding engine.
pub struct Transcoder {
    config: TranscoderConfig,
    hwaccel: Arc<HwAccel>,
    provider: Arc<dyn MediaProvider>,
    pub(crate) streams: CMap<String, Arc<StreamWrapper>>,
    constructing: RunLock<String, std::result::Result<Arc<StreamWrapper>, Error>>,
    usage_tx: mpsc::Sender<UsageEvent>,
}

impl Transcoder {
    /// Build the engine and start its background tracker. Must be called
    /// from within a tokio runtime.
    pub fn new(config: TranscoderConfig, provider: Arc<dyn MediaProvider>) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&config.cache_dir)
            .map_err(|err| Error::Construction(format!("cannot create cache dir: {}", err)))?;

        let hwaccel = Arc::new(HwAccel::new(config.hwaccel, &config.hwaccel_device));
        info!(
            backend = ?config.hwaccel,
            cache = %config.cache_dir.display(),
            "transcoder ready"
        );

        let (usage_tx, usage_rx) = mpsc::channel(config.usage_buffer.max(1));
        let transcoder = Arc::new(Self {
            hwaccel,
            provider,
            streams: CMap::new(),
            constructing: RunLock::new(),
            usage_tx,
            config,
        });

        tracker::spawn(
            Arc::downgrade(&transcoder),
            usage_rx,
            transcoder.config.sweep_interval(),
            transcoder.config.idle_timeout(),
        );

        Ok(transcoder)
    }

    /// Master playlist with the full quality ladder.
    pub async fn get_master(&self, source_path: &Path, asset_id: &str) -> Result<String> {
        self.touch(asset_id);
        let wrapper = self.wrapper(source_path, asset_id).await?;
        Ok(wrapper.master_multi())
    }

    /// Master playlist with exactly one variant for constrained clients.
    pub async fn get_master_single(
        &self,
        source_path: &Path,
        asset_id: &str,
        is_mobile: bool,
    ) -> Result<String> {
        self.touch(asset_id);
        let wrapper = self.wrapper(source_path, asset_id).await?;
        Ok(wrapper.master_single(is_mobile))
    }

    /// Variant index playlist for one video rendition.
    pub async fn get_video_index(
        &self,
        source_path: &Path,
        asset_id: &str,
        video_index: u32,
        quality: Quality,
    ) -> Result<String> {
        self.touch(asset_id);
        let wrapper = self.wrapper(source_path, asset_id).await?;
        wrapper.get_video_index(video_index, quality)
    }

    /// Path of one video segment, transcoding on demand.
    pub async fn get_video_segment(
        &self,
        source_path: &Path,
        asset_id: &str,
        video_index: u32,
        quality: Quality,
        segment: u32,
    ) -> Result<PathBuf> {
        self.touch(asset_id);
        let wrapper = self.wrapper(source_path, asset_id).await?;
        wrapper.get_video_segment(video_index, quality, segment).await
    }

    /// Variant index playlist for one audio track.
    pub async fn get_audio_index(
        &self,
        source_path: &Path,
        asset_id: &str,
        audio_index: u32,
    ) -> Result<String> {
        self.touch(asset_id);
        let wrapper = self.wrapper(source_path, asset_id).await?;
        wrapper.get_audio_index(audio_index)
    }

    /// Path of one audio segment, transcoding on demand.
    pub async fn get_audio_segment(
        &self,
        source_path: &Path,
        asset_id: &str,
        audio_index: u32,
        segment: u32,
    ) -> Result<PathBuf> {
        self.touch(asset_id);
        let wrapper = self.wrapper(source_path, asset_id).await?;
        wrapper.get_audio_segment(audio_index, segment).await
    }

    /// Drop one asset's transcoding state and cache subtree right away.
    pub fn evict(&self, asset_id: &str) -> bool {
        match self.streams.remove(&asset_id.to_string()) {
            Some(wrapper) => {
                wrapper.destroy();
                true
            }
            None => false,
        }
    }

    /// Destroy every active asset. The cache root itself is left in place.
    pub fn shutdown(&self) {
        for wrapper in self.streams.values() {
            wrapper.destroy();
        }
        self.streams.clear();
    }

    /// Number of assets with live transcoding state.
    pub fn active_assets(&self) -> usize {
        self.streams.len()
    }

    /// Total encoder heads ever spawned for an asset; 0 when inactive.
    pub fn head_count(&self, asset_id: &str) -> usize {
        self.streams
            .get(&asset_id.to_string())
            .map(|wrapper| wrapper.head_count())
            .unwrap_or(0)
    }

    /// Resolve (or single-flight construct) the wrapper for an asset.
    /// Construction failures are published to the stampede but never
    /// cached, so a later request can retry.
    async fn wrapper(&self, source_path: &Path, asset_id: &str) -> Result<Arc<StreamWrapper>> {
        if let Some(wrapper) = self.streams.get(&asset_id.to_string()) {
            return Ok(wrapper);
        }

        match self.constructing.start(asset_id.to_string()) {
            Flight::Waiter(waiter) => match waiter.wait().await {
                Some(result) => result,
                // leader panicked or was cancelled mid-build
                None => Err(Error::Cancelled),
            },
            Flight::Leader(completer) => {
                // the previous flight may have finished between our map
                // check and joining this one
                if let Some(wrapper) = self.streams.get(&asset_id.to_string()) {
                    completer.complete(Ok(wrapper.clone()));
                    return Ok(wrapper);
                }

                let result = self.build_wrapper(source_path, asset_id).await;
                if let Ok(wrapper) = &result {
                    self.streams.set(asset_id.to_string(), wrapper.clone());
                } else {
                    warn!(asset = asset_id, "stream construction failed");
                }
                completer.complete(result.clone());
                result
            }
        }
    }

    async fn build_wrapper(
        &self,
        source_path: &Path,
        asset_id: &str,
    ) -> Result<Arc<StreamWrapper>> {
        info!(asset = asset_id, path = %source_path.display(), "creating stream wrapper");
        let info = self.provider.media_info(asset_id, source_path).await?;
        let keyframes = self.provider.keyframes(asset_id).await?;
        Ok(Arc::new(StreamWrapper::new(
            info,
            keyframes,
            self.config.cache_dir.join(asset_id),
            self.config.ffmpeg_path.clone(),
            self.hwaccel.clone(),
            self.config.segment_timeout(),
        )))
    }

    /// Report a playback touch; dropped rather than blocking when the
    /// tracker falls behind.
    fn touch(&self, asset_id: &str) {
        let _ = self.usage_tx.try_send(UsageEvent {
            asset_id: asset_id.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyframe::Keyframe;
    use crate::media::{AudioTrack, MediaInfo, VideoTrack};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeProvider {
        media_calls: AtomicUsize,
        fail: bool,
    }

    impl FakeProvider {
        fn new(fail: bool) -> Self {
            Self {
                media_calls: AtomicUsize::new(0),
                fail,
            }
        }
    }

    #[async_trait]
    impl MediaProvider for FakeProvider {
        async fn media_info(&self, _asset_id: &str, source_path: &Path) -> Result<MediaInfo> {
            self.media_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::Construction("probe failed".to_string()));
            }
            Ok(MediaInfo {
                path: source_path.to_path_buf(),
                duration: 9.0,
                videos: vec![VideoTrack {
                    index: 0,
                    title: None,
                    language: None,
                    codec: "h264".to_string(),
                    mime_codec: None,
                    width: 1280,
                    height: 720,
                    bitrate: 2_000_000,
                    is_default: true,
                }],
                audios: vec![AudioTrack {
                    index: 0,
                    title: None,
                    language: None,
                    codec: "aac".to_string(),
                    mime_codec: None,
                    bitrate: 128_000,
                    is_default: true,
                }],
            })
        }

        async fn keyframes(&self, _asset_id: &str) -> Result<Arc<Keyframe>> {
            Ok(Arc::new(Keyframe::new(vec![0.0, 4.0, 8.0], true)))
        }
    }

    fn test_config(dir: &Path) -> TranscoderConfig {
        TranscoderConfig {
            cache_dir: dir.join("hls"),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_wrapper_built_once_per_asset() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(FakeProvider::new(false));
        let t = Transcoder::new(test_config(dir.path()), provider.clone()).unwrap();

        let source = Path::new("/media/lesson.mp4");
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let t = t.clone();
            tasks.push(tokio::spawn(async move {
                t.get_master(Path::new("/media/lesson.mp4"), "asset-1").await
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }
        let _ = t.get_master(source, "asset-1").await.unwrap();

        assert_eq!(provider.media_calls.load(Ordering::SeqCst), 1);
        assert_eq!(t.active_assets(), 1);
    }

    #[tokio::test]
    async fn test_construction_failure_is_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(FakeProvider::new(true));
        let t = Transcoder::new(test_config(dir.path()), provider.clone()).unwrap();

        let source = Path::new("/media/lesson.mp4");
        assert!(t.get_master(source, "asset-1").await.is_err());
        assert_eq!(t.active_assets(), 0);

        // a retry reaches the provider again instead of a poisoned entry
        assert!(t.get_master(source, "asset-1").await.is_err());
        assert_eq!(provider.media_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unknown_track_surfaces_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let t = Transcoder::new(test_config(dir.path()), Arc::new(FakeProvider::new(false)))
            .unwrap();

        let err = t
            .get_video_index(Path::new("/media/lesson.mp4"), "asset-1", 9, Quality::P720)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            Error::TrackNotFound {
                kind: "video",
                index: 9
            }
        );
    }

    #[tokio::test]
    async fn test_evict_then_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(FakeProvider::new(false));
        let t = Transcoder::new(test_config(dir.path()), provider.clone()).unwrap();

        let source = Path::new("/media/lesson.mp4");
        let _ = t.get_master(source, "asset-1").await.unwrap();
        assert!(t.evict("asset-1"));
        assert!(!t.evict("asset-1"));
        assert_eq!(t.active_assets(), 0);

        let _ = t.get_master(source, "asset-1").await.unwrap();
        assert_eq!(provider.media_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_master_playlists() {
        let dir = tempfile::tempdir().unwrap();
        let t = Transcoder::new(test_config(dir.path()), Arc::new(FakeProvider::new(false)))
            .unwrap();

        let source = Path::new("/media/lesson.mp4");
        let multi = t.get_master(source, "asset-1").await.unwrap();
        // 240p, 360p, 480p, 720p plus original for a 720p source
        assert_eq!(multi.matches("#EXT-X-STREAM-INF:").count(), 5);

        let single = t
            .get_master_single(source, "asset-1", true)
            .await
            .unwrap();
        assert_eq!(single.matches("#EXT-X-STREAM-INF:").count(), 1);
        assert!(single.contains("video/0/720p/index.m3u8"));
    }
}
