//! On-demand HLS transcoding engine
//!
//! Serves adaptively-bitrated HLS from arbitrary source files without
//! pre-encoding: per-quality segment streams are materialized lazily by
//! ffmpeg encode *heads* cutting on precomputed keyframe boundaries, and
//! idle per-asset state is reaped in the background. The engine returns
//! playlist text and on-disk file paths; HTTP transport, media scanning and
//! binary path resolution belong to the host.

pub mod cmap;
pub mod config;
pub mod error;
pub mod hwaccel;
pub mod keyframe;
pub mod media;
pub mod playlist;
pub mod quality;
pub mod runlock;
pub mod stream;
pub(crate) mod tracker;
pub mod transcoder;
pub mod wrapper;

pub use config::TranscoderConfig;
pub use error::{Error, Result};
pub use hwaccel::{HwAccel, HwAccelKind};
pub use keyframe::Keyframe;
pub use media::{AudioTrack, MediaInfo, MediaProvider, VideoTrack};
pub use quality::{qualities_for, quality_for_video, Quality};
pub use stream::{AudioStream, VideoStream};
pub use transcoder::Transcoder;
pub use wrapper::{StreamWrapper, VideoKey};
