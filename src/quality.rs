//! Video quality tiers
//!
//! Each standard tier pairs a target height with an average/maximum bitrate
//! pair that drives both the encoder invocation and the master playlist
//! `BANDWIDTH` attributes. Two sentinels sit outside the ladder: `Original`
//! (stream copy, no scaling, source bitrate) and `NoResize` (re-encode
//! without scaling, used when a target height/bitrate cannot be computed).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A target resolution/bitrate combination, or a passthrough sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Quality {
    P240,
    P360,
    P480,
    P720,
    P1080,
    P1440,
    P4k,
    P8k,
    /// Re-encode at source resolution (no scale filter)
    NoResize,
    /// Stream copy, no re-encode at all
    Original,
}

/// The transcoding ladder, ascending by height.
pub const STANDARD: [Quality; 8] = [
    Quality::P240,
    Quality::P360,
    Quality::P480,
    Quality::P720,
    Quality::P1080,
    Quality::P1440,
    Quality::P4k,
    Quality::P8k,
];

impl Quality {
    pub fn is_original(&self) -> bool {
        matches!(self, Quality::Original)
    }

    /// True for the standard tiers that carry fixed height/bitrate constants.
    pub fn is_sized(&self) -> bool {
        !matches!(self, Quality::Original | Quality::NoResize)
    }

    /// Target height in pixels. Errors for the sentinels, which have no
    /// fixed height; guard with [`Quality::is_sized`].
    pub fn height(&self) -> Result<u32> {
        match self {
            Quality::P240 => Ok(240),
            Quality::P360 => Ok(360),
            Quality::P480 => Ok(480),
            Quality::P720 => Ok(720),
            Quality::P1080 => Ok(1080),
            Quality::P1440 => Ok(1440),
            Quality::P4k => Ok(2160),
            Quality::P8k => Ok(4320),
            _ => Err(Error::QualityUnsized(*self)),
        }
    }

    /// Average bitrate in bps, used for `-b:v` and `AVERAGE-BANDWIDTH`.
    pub fn average_bitrate(&self) -> Result<u32> {
        match self {
            Quality::P240 => Ok(400_000),
            Quality::P360 => Ok(800_000),
            Quality::P480 => Ok(1_200_000),
            Quality::P720 => Ok(2_500_000),
            Quality::P1080 => Ok(5_000_000),
            Quality::P1440 => Ok(8_000_000),
            Quality::P4k => Ok(15_000_000),
            Quality::P8k => Ok(30_000_000),
            _ => Err(Error::QualityUnsized(*self)),
        }
    }

    /// Maximum bitrate in bps, used for `-maxrate` and `BANDWIDTH`.
    pub fn max_bitrate(&self) -> Result<u32> {
        match self {
            Quality::P240 => Ok(600_000),
            Quality::P360 => Ok(1_200_000),
            Quality::P480 => Ok(1_800_000),
            Quality::P720 => Ok(3_750_000),
            Quality::P1080 => Ok(7_500_000),
            Quality::P1440 => Ok(12_000_000),
            Quality::P4k => Ok(22_500_000),
            Quality::P8k => Ok(45_000_000),
            _ => Err(Error::QualityUnsized(*self)),
        }
    }
}

/// Select the tier to serve a source with the given height and overall
/// bitrate: the smallest standard tier that covers the source by height or
/// average bitrate, never exceeding the source height. When no tier covers
/// the source, the largest tier that still fits is used, and when even the
/// lowest tier is taller than the source, the lowest tier is returned.
pub fn quality_for_video(height: u32, bitrate: u32) -> Quality {
    let mut best_fitting = None;
    for q in STANDARD {
        let q_height = q.height().expect("standard tiers are sized");
        if q_height > height {
            break;
        }
        if q_height >= height || q.average_bitrate().expect("standard tiers are sized") >= bitrate {
            return q;
        }
        best_fitting = Some(q);
    }
    best_fitting.unwrap_or(Quality::P240)
}

/// Every standard tier available for a source of the given height (height
/// less than or equal to the source), ascending, with `Original` appended.
pub fn qualities_for(source_height: u32) -> Vec<Quality> {
    let mut out: Vec<Quality> = STANDARD
        .iter()
        .copied()
        .filter(|q| q.height().expect("standard tiers are sized") <= source_height)
        .collect();
    out.push(Quality::Original);
    out
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Quality::P240 => "240p",
            Quality::P360 => "360p",
            Quality::P480 => "480p",
            Quality::P720 => "720p",
            Quality::P1080 => "1080p",
            Quality::P1440 => "1440p",
            Quality::P4k => "4k",
            Quality::P8k => "8k",
            Quality::NoResize => "noresize",
            Quality::Original => "original",
        };
        f.write_str(s)
    }
}

impl FromStr for Quality {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "240p" => Ok(Quality::P240),
            "360p" => Ok(Quality::P360),
            "480p" => Ok(Quality::P480),
            "720p" => Ok(Quality::P720),
            "1080p" => Ok(Quality::P1080),
            "1440p" => Ok(Quality::P1440),
            "4k" => Ok(Quality::P4k),
            "8k" => Ok(Quality::P8k),
            "noresize" => Ok(Quality::NoResize),
            "original" => Ok(Quality::Original),
            _ => Err(format!("unknown quality: {}", s)),
        }
    }
}

impl TryFrom<String> for Quality {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, String> {
        s.parse()
    }
}

impl From<Quality> for String {
    fn from(q: Quality) -> String {
        q.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tiers_ordered_by_height_and_bitrate() {
        for pair in STANDARD.windows(2) {
            assert!(pair[0].height().unwrap() < pair[1].height().unwrap());
            assert!(pair[0].average_bitrate().unwrap() <= pair[1].average_bitrate().unwrap());
            assert!(pair[0].max_bitrate().unwrap() <= pair[1].max_bitrate().unwrap());
        }
    }

    #[test]
    fn test_average_below_max() {
        for q in STANDARD {
            assert!(q.average_bitrate().unwrap() < q.max_bitrate().unwrap());
        }
    }

    #[test]
    fn test_sentinels_are_unsized() {
        assert_eq!(
            Quality::Original.height(),
            Err(Error::QualityUnsized(Quality::Original))
        );
        assert_eq!(
            Quality::NoResize.average_bitrate(),
            Err(Error::QualityUnsized(Quality::NoResize))
        );
        assert!(Quality::Original.is_original());
        assert!(!Quality::P720.is_original());
        assert!(Quality::P720.is_sized());
        assert!(!Quality::NoResize.is_sized());
    }

    #[test]
    fn test_quality_for_video_never_exceeds_source_height() {
        for height in [140, 240, 500, 719, 720, 1000, 1080, 2160, 5000] {
            for bitrate in [100_000, 2_000_000, 8_000_000, 100_000_000] {
                let q = quality_for_video(height, bitrate);
                let qh = q.height().unwrap();
                assert!(
                    qh <= height || height < 240,
                    "{}x{} -> {} exceeds source",
                    height,
                    bitrate,
                    q
                );
            }
        }
    }

    #[test]
    fn test_quality_for_video_selection() {
        // exact tier match selects that tier
        assert_eq!(quality_for_video(1080, 8_000_000), Quality::P1080);
        // low-bitrate source is covered by a smaller tier's average bitrate
        assert_eq!(quality_for_video(1080, 2_000_000), Quality::P720);
        // tiny sources fall back to the lowest tier
        assert_eq!(quality_for_video(100, 50_000), Quality::P240);
        // between tiers, the largest fitting tier is used
        assert_eq!(quality_for_video(1000, 10_000_000), Quality::P720);
    }

    #[test]
    fn test_qualities_for_ladder() {
        let qs = qualities_for(1080);
        assert_eq!(
            qs,
            vec![
                Quality::P240,
                Quality::P360,
                Quality::P480,
                Quality::P720,
                Quality::P1080,
                Quality::Original
            ]
        );

        // sources below the lowest tier still expose Original
        assert_eq!(qualities_for(100), vec![Quality::Original]);
    }

    #[test]
    fn test_parse_round_trip() {
        for q in STANDARD
            .iter()
            .copied()
            .chain([Quality::Original, Quality::NoResize])
        {
            assert_eq!(q.to_string().parse::<Quality>(), Ok(q));
        }
        assert!("potato".parse::<Quality>().is_err());
    }
}
