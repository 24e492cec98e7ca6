//! Video stream specialization
//!
//! Supplies track selection, the per-quality codec/bitrate arguments, and
//! the on-disk layout for video segments.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;

use crate::hwaccel::HwAccel;
use crate::media::VideoTrack;
use crate::quality::{Quality, STANDARD};

use super::{Stream, StreamCtx, StreamKind};

/// One transcoded rendition of a video track.
pub struct VideoStream {
    stream: Arc<Stream>,
}

impl VideoStream {
    /// The caller has already resolved `track` from the probed metadata, so
    /// construction cannot fail and is safe to run inside the stream map's
    /// atomic get-or-create.
    pub(crate) fn new(ctx: StreamCtx, track: VideoTrack, quality: Quality) -> Self {
        debug!(
            path = %ctx.info.path.display(),
            track = track.index,
            quality = %quality,
            "creating video stream"
        );

        // NoResize re-encodes at source resolution and has no bitrate
        // constants of its own; it borrows the ladder of the smallest
        // standard tier covering the source height.
        let ladder = match quality {
            Quality::Original => None,
            Quality::NoResize => Some(
                STANDARD
                    .iter()
                    .copied()
                    .find(|q| q.height().expect("standard tiers are sized") >= track.height)
                    .unwrap_or(Quality::P8k),
            ),
            sized => Some(sized),
        };
        let (avg_bitrate, max_bitrate) = match ladder {
            Some(tier) => (
                tier.average_bitrate().expect("ladder tiers are sized"),
                tier.max_bitrate().expect("ladder tiers are sized"),
            ),
            None => (0, 0),
        };

        let kind = VideoKind {
            track,
            quality,
            avg_bitrate,
            max_bitrate,
            hwaccel: ctx.hwaccel.clone(),
            out_dir: ctx.out_dir.clone(),
        };
        Self {
            stream: Stream::new(ctx, Box::new(kind)),
        }
    }

    pub fn index_playlist(&self) -> String {
        self.stream.index_playlist()
    }

    pub async fn get_segment(&self, segment: u32) -> crate::error::Result<PathBuf> {
        self.stream.get_segment(segment).await
    }

    pub fn kill(&self) {
        self.stream.kill()
    }

    pub fn head_count(&self) -> usize {
        self.stream.head_count()
    }
}

struct VideoKind {
    track: VideoTrack,
    quality: Quality,
    /// Resolved ladder bitrates; unused in transmux mode
    avg_bitrate: u32,
    max_bitrate: u32,
    hwaccel: Arc<HwAccel>,
    out_dir: PathBuf,
}

impl StreamKind for VideoKind {
    fn is_video(&self) -> bool {
        true
    }

    fn out_pattern(&self, head_id: usize) -> PathBuf {
        self.out_dir
            .join(self.quality.to_string())
            .join(format!("segment-{}-{}-%d.ts", self.quality, head_id))
    }

    fn transcode_args(&self, segment_times: &str) -> Vec<String> {
        let mut args = vec!["-map".to_string(), format!("0:V:{}", self.track.index)];

        // Original is a transmux: stream copy, no scaling or bitrate args
        if self.quality.is_original() {
            args.push("-c:v".to_string());
            args.push("copy".to_string());
            return args;
        }

        args.extend(self.hwaccel.encode_flags().iter().cloned());

        if self.quality == Quality::NoResize {
            if let Some(filter) = self.hwaccel.no_resize_filter() {
                args.push("-vf".to_string());
                args.push(filter.to_string());
            }
        } else {
            let height = self.quality.height().expect("sized quality");
            let width =
                (f64::from(height) / f64::from(self.track.height) * f64::from(self.track.width))
                    as u32;
            args.push("-vf".to_string());
            args.push(self.hwaccel.scale_filter(width, height));
        }

        args.extend([
            // bufsize is 5x the max bitrate; the average only matters across
            // whole segments
            "-bufsize".to_string(),
            (self.max_bitrate * 5).to_string(),
            "-b:v".to_string(),
            self.avg_bitrate.to_string(),
            "-maxrate".to_string(),
            self.max_bitrate.to_string(),
            // forced-idr makes the forced keyframes idr-frames; hardware
            // encoders otherwise emit plain i-frames the segment muxer
            // cannot cut on
            "-forced-idr".to_string(),
            "1".to_string(),
            "-force_key_frames".to_string(),
            segment_times.to_string(),
            "-strict".to_string(),
            "-2".to_string(),
        ]);

        args
    }

    fn describe(&self) -> String {
        format!("video {} {}", self.track.index, self.quality)
    }
}
