//! Audio stream specialization
//!
//! Audio is always transcoded to stereo AAC at 128kbps; multi-quality and
//! surround passthrough are not supported.

use std::path::PathBuf;

use tracing::debug;

use super::{Stream, StreamCtx, StreamKind};
use std::sync::Arc;

/// The transcoded rendition of one audio track.
pub struct AudioStream {
    stream: Arc<Stream>,
}

impl AudioStream {
    pub(crate) fn new(ctx: StreamCtx, index: u32) -> Self {
        debug!(
            path = %ctx.info.path.display(),
            track = index,
            "creating audio stream"
        );
        let kind = AudioKind {
            index,
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

struct AudioKind {
    index: u32,
    out_dir: PathBuf,
}

impl StreamKind for AudioKind {
    fn is_video(&self) -> bool {
        false
    }

    fn out_pattern(&self, head_id: usize) -> PathBuf {
        self.out_dir
            .join(format!("a{}", self.index))
            .join(format!("segment-a{}-{}-%d.ts", self.index, head_id))
    }

    fn transcode_args(&self, _segment_times: &str) -> Vec<String> {
        vec![
            "-map".to_string(),
            format!("0:a:{}", self.index),
            "-c:a".to_string(),
            "aac".to_string(),
            // stereo down-mix; surround sources are not passed through
            "-ac".to_string(),
            "2".to_string(),
            "-b:a".to_string(),
            "128k".to_string(),
        ]
    }

    fn describe(&self) -> String {
        format!("audio {}", self.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_pattern() {
        let k = AudioKind {
            index: 1,
            out_dir: PathBuf::from("/cache/asset"),
        };
        assert_eq!(
            k.out_pattern(0),
            PathBuf::from("/cache/asset/a1/segment-a1-0-%d.ts")
        );
    }

    #[test]
    fn test_transcode_args_fixed_aac_stereo() {
        let k = AudioKind {
            index: 2,
            out_dir: PathBuf::from("/cache/asset"),
        };
        assert_eq!(
            k.transcode_args("ignored"),
            vec!["-map", "0:a:2", "-c:a", "aac", "-ac", "2", "-b:a", "128k"]
        );
    }
}
