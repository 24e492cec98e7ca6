//! Hardware acceleration backends
//!
//! One backend is selected at process start from configuration. Each backend
//! contributes decode-stage flags, encode-stage flags, and scale filter
//! chains. Decode flags must precede the `-i` input argument and encode
//! flags must follow it; the wrong ordering does not error, ffmpeg silently
//! falls back to software decode.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Supported acceleration backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HwAccelKind {
    /// Software x264
    Software,
    Vaapi,
    Qsv,
    Nvenc,
}

/// Resolved flag sets and filter templates for the selected backend.
#[derive(Debug, Clone)]
pub struct HwAccel {
    kind: HwAccelKind,
    decode_flags: Vec<String>,
    encode_flags: Vec<String>,
    device: PathBuf,
}

impl HwAccel {
    pub fn new(kind: HwAccelKind, device: &Path) -> Self {
        let dev = device.display().to_string();
        let (decode_flags, encode_flags) = match kind {
            HwAccelKind::Software => (
                vec![],
                // sc_threshold disables x264's own scene-cut keyframes; the
                // segmenter needs keyframes exactly where it forces them
                svec(&[
                    "-c:v",
                    "libx264",
                    "-preset",
                    "fast",
                    "-sc_threshold",
                    "0",
                    "-pix_fmt",
                    "yuv420p",
                ]),
            ),
            HwAccelKind::Vaapi => (
                svec(&[
                    "-hwaccel",
                    "vaapi",
                    "-hwaccel_device",
                    &dev,
                    "-hwaccel_output_format",
                    "vaapi",
                ]),
                svec(&["-c:v", "h264_vaapi"]),
            ),
            HwAccelKind::Qsv => (
                svec(&[
                    "-hwaccel",
                    "qsv",
                    "-qsv_device",
                    &dev,
                    "-hwaccel_output_format",
                    "qsv",
                ]),
                svec(&["-c:v", "h264_qsv", "-preset", "fast"]),
            ),
            HwAccelKind::Nvenc => (
                svec(&["-hwaccel", "cuda", "-hwaccel_output_format", "cuda"]),
                svec(&["-c:v", "h264_nvenc", "-preset", "fast", "-no-scenecut", "1"]),
            ),
        };

        Self {
            kind,
            decode_flags,
            encode_flags,
            device: device.to_path_buf(),
        }
    }

    pub fn kind(&self) -> HwAccelKind {
        self.kind
    }

    pub fn device(&self) -> &Path {
        &self.device
    }

    /// Flags placed before `-i`
    pub fn decode_flags(&self) -> &[String] {
        &self.decode_flags
    }

    /// Flags placed after `-i`
    pub fn encode_flags(&self) -> &[String] {
        &self.encode_flags
    }

    /// Resize filter chain for the target dimensions. The width is rounded
    /// to the nearest multiple of 2 because odd widths break some players
    /// and hardware encoders.
    pub fn scale_filter(&self, width: u32, height: u32) -> String {
        let width = closest_multiple(width, 2);
        match self.kind {
            HwAccelKind::Software => format!("scale={}:{}", width, height),
            HwAccelKind::Vaapi => format!(
                "format=nv12|vaapi,hwupload,scale_vaapi={}:{}:format=nv12",
                width, height
            ),
            HwAccelKind::Qsv => format!(
                "format=nv12|qsv,hwupload,scale_qsv={}:{}:format=nv12",
                width, height
            ),
            HwAccelKind::Nvenc => format!(
                "format=nv12|cuda,hwupload,scale_cuda={}:{}:format=nv12",
                width, height
            ),
        }
    }

    /// Filter chain for re-encodes at source resolution. The accelerated
    /// backends still need the GPU upload/format conversion even when no
    /// resize is requested; software needs nothing.
    pub fn no_resize_filter(&self) -> Option<&'static str> {
        match self.kind {
            HwAccelKind::Software => None,
            HwAccelKind::Vaapi => Some("format=nv12|vaapi,hwupload,scale_vaapi=format=nv12"),
            HwAccelKind::Qsv => Some("format=nv12|qsv,hwupload,scale_qsv=format=nv12"),
            HwAccelKind::Nvenc => Some("format=nv12|cuda,hwupload,scale_cuda=format=nv12"),
        }
    }
}

fn svec(flags: &[&str]) -> Vec<String> {
    flags.iter().map(|s| s.to_string()).collect()
}

/// Round `n` to the closest multiple of `x` (at least `x`).
pub(crate) fn closest_multiple(n: u32, x: u32) -> u32 {
    if x > n {
        return x;
    }
    let n = n + x / 2;
    n - (n % x)
}
