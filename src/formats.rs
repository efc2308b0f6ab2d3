//! Quality-tier catalog built from the engine's raw format list.
//!
//! A probe reports dozens of concrete encodings; callers only ever pick from
//! a small menu of tiers ("mp3", "720p", ...). This module performs that
//! lossy collapse: one audio tier at most, video tiers deduplicated by label
//! and ordered by height, everything else dropped on the floor.

use serde::Deserialize;

use crate::error::{Error, Result};

/// Icon class served alongside the audio tier.
pub const AUDIO_ICON: &str = "bx bxs-music";
/// Icon class served alongside every video tier.
pub const VIDEO_ICON: &str = "bx bxs-video";

/// Exact resolution strings the catalog recognizes, with the tier label and
/// the height used for ordering. Anything the engine reports outside this
/// table does not produce a tier.
const RESOLUTION_TIERS: &[(&str, &str, u32)] = &[
    ("640x360", "360p", 360),
    ("854x480", "480p", 480),
    ("1280x720", "720p", 720),
    ("1920x1080", "1080p", 1080),
    ("2560x1440", "1440p", 1440),
    ("3840x2160", "2160p", 2160),
];

/// One concrete encoding reported by the engine probe. Every field is
/// optional because the engine routinely reports partial entries (storyboard
/// tracks, live fragments, and similar).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawFormat {
    #[serde(rename = "format_id")]
    pub format_id: Option<String>,
    pub acodec: Option<String>,
    pub vcodec: Option<String>,
    pub resolution: Option<String>,
    pub ext: Option<String>,
}

impl RawFormat {
    /// An absent codec is treated the same as the engine's literal "none".
    fn has_audio(&self) -> bool {
        self.acodec
            .as_deref()
            .is_some_and(|codec| !codec.eq_ignore_ascii_case("none"))
    }

    fn has_video(&self) -> bool {
        self.vcodec
            .as_deref()
            .is_some_and(|codec| !codec.eq_ignore_ascii_case("none"))
    }
}

/// Whether a tier selects an audio-only or a video rendition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierKind {
    Audio,
    Video,
}

/// One entry of the user-facing quality menu. Serializes as the `/check`
/// wire shape: `{"icon": ..., "quality": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct QualityTier {
    #[serde(skip)]
    pub kind: TierKind,
    pub icon: &'static str,
    #[serde(rename = "quality")]
    pub label: String,
}

/// Collapses the probe's raw format list into the ordered tier menu.
///
/// The first format carrying an audio codec produces the single "mp3" tier;
/// later audio-capable formats are ignored (first-qualifying-stream policy —
/// this does not guarantee the best audio candidate, it mirrors what the
/// download selection will re-derive on its own). Video formats contribute a
/// tier only when their resolution string matches the fixed table exactly;
/// matched labels are deduplicated and sorted ascending by height.
pub fn build_tier_menu(formats: &[RawFormat]) -> Result<Vec<QualityTier>> {
    if formats.is_empty() {
        return Err(Error::NoFormats);
    }

    let mut menu = Vec::new();
    let mut video_tiers: Vec<(u32, &'static str)> = Vec::new();

    for format in formats {
        if format.has_audio() && menu.is_empty() {
            menu.push(QualityTier {
                kind: TierKind::Audio,
                icon: AUDIO_ICON,
                label: "mp3".to_owned(),
            });
        }

        if format.has_video()
            && let Some(resolution) = format.resolution.as_deref()
            && let Some(&(_, label, height)) = RESOLUTION_TIERS
                .iter()
                .find(|(exact, _, _)| *exact == resolution)
            && !video_tiers.iter().any(|&(h, _)| h == height)
        {
            video_tiers.push((height, label));
        }
    }

    video_tiers.sort_unstable_by_key(|&(height, _)| height);
    for (_, label) in video_tiers {
        menu.push(QualityTier {
            kind: TierKind::Video,
            icon: VIDEO_ICON,
            label: label.to_owned(),
        });
    }

    Ok(menu)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audio_format() -> RawFormat {
        RawFormat {
            format_id: Some("140".into()),
            acodec: Some("mp4a.40.2".into()),
            vcodec: Some("none".into()),
            resolution: None,
            ext: Some("m4a".into()),
        }
    }

    fn video_format(resolution: &str) -> RawFormat {
        RawFormat {
            format_id: Some("137".into()),
            acodec: Some("none".into()),
            vcodec: Some("avc1.640028".into()),
            resolution: Some(resolution.into()),
            ext: Some("mp4".into()),
        }
    }

    #[test]
    fn empty_probe_is_an_error() {
        assert!(matches!(build_tier_menu(&[]), Err(Error::NoFormats)));
    }

    #[test]
    fn builds_audio_then_ascending_video_tiers() {
        let formats = vec![
            video_format("1920x1080"),
            audio_format(),
            video_format("640x360"),
        ];
        let menu = build_tier_menu(&formats).unwrap();
        let labels: Vec<&str> = menu.iter().map(|t| t.label.as_str()).collect();
        assert_eq!(labels, ["mp3", "360p", "1080p"]);
        assert_eq!(menu[0].kind, TierKind::Audio);
        assert_eq!(menu[0].icon, AUDIO_ICON);
        assert!(menu[1..].iter().all(|t| t.icon == VIDEO_ICON));
    }

    #[test]
    fn at_most_one_audio_tier() {
        let formats = vec![audio_format(), audio_format(), audio_format()];
        let menu = build_tier_menu(&formats).unwrap();
        assert_eq!(menu.len(), 1);
        assert_eq!(menu[0].label, "mp3");
    }

    #[test]
    fn duplicate_resolutions_collapse() {
        let formats = vec![
            video_format("1280x720"),
            video_format("1280x720"),
            video_format("1280x720"),
        ];
        let menu = build_tier_menu(&formats).unwrap();
        assert_eq!(menu.len(), 1);
        assert_eq!(menu[0].label, "720p");
    }

    #[test]
    fn unknown_resolutions_are_ignored() {
        let formats = vec![
            video_format("1906x1080"),
            video_format("256x144"),
            video_format("3840x2160"),
        ];
        let menu = build_tier_menu(&formats).unwrap();
        let labels: Vec<&str> = menu.iter().map(|t| t.label.as_str()).collect();
        assert_eq!(labels, ["2160p"]);
    }

    #[test]
    fn absent_codecs_count_as_none() {
        let formats = vec![RawFormat {
            resolution: Some("1280x720".into()),
            ..RawFormat::default()
        }];
        // No audio codec, no video codec: nothing qualifies.
        let menu = build_tier_menu(&formats).unwrap();
        assert!(menu.is_empty());
    }

    #[test]
    fn menu_serializes_to_icon_and_quality() {
        let menu = build_tier_menu(&[audio_format(), video_format("854x480")]).unwrap();
        let json = serde_json::to_value(&menu).unwrap();
        assert_eq!(
            json,
            serde_json::json!([
                {"icon": "bx bxs-music", "quality": "mp3"},
                {"icon": "bx bxs-video", "quality": "480p"},
            ])
        );
    }
}
