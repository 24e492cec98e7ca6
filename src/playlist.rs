//! Master playlist generation
//!
//! Master playlists advertise one variant per available quality plus the
//! passthrough original, with every audio track declared as an
//! `EXT-X-MEDIA` rendition in a single group. All URIs are relative to the
//! master playlist so the transport layer can mount the engine anywhere.
//!
//! The `BANDWIDTH`/`AVERAGE-BANDWIDTH` attributes are derived from the same
//! [`Quality`] constants that drive the encoder invocations.

use crate::hwaccel::closest_multiple;
use crate::media::MediaInfo;
use crate::quality::{qualities_for, Quality};

/// Codec string advertised for transcoded video variants (H.264 High@L4.0)
const TRANSCODE_CODEC: &str = "avc1.640028";
/// Codec string advertised for the AAC audio renditions
const AUDIO_CODEC: &str = "mp4a.40.2";

/// Master playlist with the full quality ladder, for clients that switch
/// between variants on their own.
pub fn master_multi(info: &MediaInfo) -> String {
    let mut master = String::from("#EXTM3U\n");
    push_audio_media(&mut master, info);

    if let Some(video) = info.default_video() {
        for quality in qualities_for(video.height) {
            push_variant(&mut master, info, video, quality);
        }
    }

    master
}

/// Master playlist with exactly one variant: the highest transcoded tier
/// for mobile clients, the passthrough original for desktop. Constrained
/// players handle a single rendition better than a full ladder.
pub fn master_single(info: &MediaInfo, is_mobile: bool) -> String {
    let mut master = String::from("#EXTM3U\n");
    push_audio_media(&mut master, info);

    if let Some(video) = info.default_video() {
        let quality = if is_mobile {
            qualities_for(video.height)
                .into_iter()
                .filter(|q| q.is_sized())
                .next_back()
                .unwrap_or(Quality::Original)
        } else {
            Quality::Original
        };
        push_variant(&mut master, info, video, quality);
    }

    master
}

fn push_audio_media(master: &mut String, info: &MediaInfo) {
    for audio in &info.audios {
        master.push_str("#EXT-X-MEDIA:TYPE=AUDIO,");
        master.push_str("GROUP-ID=\"audio\",");
        if let Some(language) = &audio.language {
            master.push_str(&format!("LANGUAGE=\"{}\",", language));
        }
        let name = audio
            .title
            .clone()
            .or_else(|| audio.language.clone())
            .unwrap_or_else(|| format!("Audio {}", audio.index));
        master.push_str(&format!("NAME=\"{}\",", name));
        if audio.is_default {
            master.push_str("DEFAULT=YES,");
        }
        master.push_str("AUTOSELECT=YES,");
        master.push_str("CHANNELS=\"2\",");
        master.push_str(&format!("URI=\"audio/{}/index.m3u8\"\n", audio.index));
    }
    if !info.audios.is_empty() {
        master.push('\n');
    }
}

fn push_variant(
    master: &mut String,
    info: &MediaInfo,
    video: &crate::media::VideoTrack,
    quality: Quality,
) {
    master.push_str("#EXT-X-STREAM-INF:");

    if quality.is_sized() {
        let height = quality.height().expect("sized quality");
        let aspect = f64::from(video.width) / f64::from(video.height);
        let width = closest_multiple((aspect * f64::from(height) + 0.5) as u32, 2);

        master.push_str(&format!(
            "AVERAGE-BANDWIDTH={},",
            quality.average_bitrate().expect("sized quality")
        ));
        master.push_str(&format!(
            "BANDWIDTH={},",
            quality.max_bitrate().expect("sized quality")
        ));
        master.push_str(&format!("RESOLUTION={}x{},", width, height));
        master.push_str(&format!("CODECS=\"{},{}\",", TRANSCODE_CODEC, AUDIO_CODEC));
    } else {
        // original/noresize advertise the probed source bitrate
        let bitrate = f64::from(video.bitrate);
        master.push_str(&format!("AVERAGE-BANDWIDTH={},", (bitrate * 0.8) as u64));
        master.push_str(&format!("BANDWIDTH={},", bitrate as u64));
        master.push_str(&format!("RESOLUTION={}x{},", video.width, video.height));
        if quality.is_original() {
            if let Some(mime) = &video.mime_codec {
                master.push_str(&format!("CODECS=\"{},{}\",", mime, AUDIO_CODEC));
            }
        } else {
            master.push_str(&format!("CODECS=\"{},{}\",", TRANSCODE_CODEC, AUDIO_CODEC));
        }
    }

    if !info.audios.is_empty() {
        master.push_str("AUDIO=\"audio\",");
    }
    master.push_str("CLOSED-CAPTIONS=NONE\n");
    master.push_str(&format!(
        "video/{}/{}/index.m3u8\n",
        video.index, quality
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{AudioTrack, VideoTrack};
    use std::path::PathBuf;

    fn test_info() -> MediaInfo {
        MediaInfo {
            path: PathBuf::from("/media/lesson.mp4"),
            duration: 600.0,
            videos: vec![VideoTrack {
                index: 0,
                title: None,
                language: None,
                codec: "h264".to_string(),
                mime_codec: Some("avc1.64002a".to_string()),
                width: 1920,
                height: 1080,
                bitrate: 6_000_000,
                is_default: true,
            }],
            audios: vec![AudioTrack {
                index: 0,
                title: None,
                language: Some("en".to_string()),
                codec: "aac".to_string(),
                mime_codec: Some("mp4a.40.2".to_string()),
                bitrate: 160_000,
                is_default: true,
            }],
        }
    }

    #[test]
    fn test_master_multi_lists_full_ladder() {
        let master = master_multi(&test_info());

        assert!(master.starts_with("#EXTM3U\n"));
        // 240p..1080p plus original
        assert_eq!(master.matches("#EXT-X-STREAM-INF:").count(), 6);
        assert!(!master.contains("1440p"));
        assert!(master.contains("video/0/original/index.m3u8"));
        assert!(master.contains("video/0/720p/index.m3u8"));
    }

    #[test]
    fn test_master_multi_bandwidth_matches_quality_constants() {
        let master = master_multi(&test_info());

        for quality in [Quality::P240, Quality::P720, Quality::P1080] {
            let expected = format!(
                "AVERAGE-BANDWIDTH={},BANDWIDTH={},",
                quality.average_bitrate().unwrap(),
                quality.max_bitrate().unwrap()
            );
            assert!(master.contains(&expected), "missing {}", expected);
        }
        // original advertises the probed bitrate
        assert!(master.contains("AVERAGE-BANDWIDTH=4800000,BANDWIDTH=6000000,"));
    }

    #[test]
    fn test_master_multi_audio_group() {
        let master = master_multi(&test_info());

        assert!(master.contains(
            "#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"audio\",LANGUAGE=\"en\",NAME=\"en\",DEFAULT=YES,AUTOSELECT=YES,CHANNELS=\"2\",URI=\"audio/0/index.m3u8\""
        ));
        // every variant references the audio group
        assert_eq!(
            master.matches("AUDIO=\"audio\"").count(),
            master.matches("#EXT-X-STREAM-INF:").count()
        );
    }

    #[test]
    fn test_master_multi_resolution_from_aspect_ratio() {
        let master = master_multi(&test_info());
        assert!(master.contains("RESOLUTION=1280x720,"));
        // 1.78 * 240 rounds to 427, evened up to 428
        assert!(master.contains("RESOLUTION=428x240,"));
        assert!(master.contains("RESOLUTION=1920x1080,"));
    }

    #[test]
    fn test_master_single_mobile_picks_highest_transcoded_tier() {
        let master = master_single(&test_info(), true);

        assert_eq!(master.matches("#EXT-X-STREAM-INF:").count(), 1);
        assert!(master.contains("video/0/1080p/index.m3u8"));
        assert!(master.contains(&format!(
            "BANDWIDTH={},",
            Quality::P1080.max_bitrate().unwrap()
        )));
    }

    #[test]
    fn test_master_single_desktop_picks_original() {
        let master = master_single(&test_info(), false);

        assert_eq!(master.matches("#EXT-X-STREAM-INF:").count(), 1);
        assert!(master.contains("video/0/original/index.m3u8"));
        assert!(master.contains("CODECS=\"avc1.64002a,mp4a.40.2\""));
    }

    #[test]
    fn test_master_without_video_tracks() {
        let mut info = test_info();
        info.videos.clear();
        let master = master_multi(&info);

        assert!(master.contains("#EXT-X-MEDIA:TYPE=AUDIO"));
        assert!(!master.contains("#EXT-X-STREAM-INF"));
    }
}
