use thiserror::Error;

use crate::quality::Quality;

/// Main error type for the transcoding engine.
///
/// The enum is `Clone` because a single terminal outcome is broadcast to
/// every waiter of a segment or of a single-flight construction; io errors
/// are therefore captured as strings rather than wrapped.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// A requested track index is absent from the probed metadata
    #[error("{kind} track {index} not found")]
    TrackNotFound { kind: &'static str, index: u32 },

    /// Stream or wrapper setup failed; the entry is not cached so a retry can succeed
    #[error("Construction failed: {0}")]
    Construction(String),

    /// An encoder process exited with a non-zero status
    #[error("Encoder failed: {0}")]
    Process(String),

    /// The operation was cancelled: head killed, stream destroyed, or
    /// construction abandoned. Distinct from a failure so it never poisons
    /// a still-valid cache entry.
    #[error("Cancelled")]
    Cancelled,

    /// A segment readiness wait expired
    #[error("Segment {index} was not produced within {timeout_secs}s")]
    SegmentTimeout { index: u32, timeout_secs: u64 },

    /// A segment index beyond the keyframe sequence was requested
    #[error("Segment {index} out of range ({len} segments)")]
    SegmentOutOfRange { index: u32, len: usize },

    /// Height/bitrate accessors were called on a sentinel quality; callers
    /// are expected to guard with `Quality::is_sized`
    #[error("Quality {0} has no fixed height or bitrate")]
    QualityUnsized(Quality),

    /// IO error (captured as text)
    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, Error>;
