//! Maps a requested tier label onto concrete engine directives.

use crate::error::{Error, Result};

/// Target bitrate for audio extraction, in kbps.
pub const MP3_BITRATE_KBPS: u32 = 192;

/// Post-processing directive handed to the engine after stream selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostProcessing {
    /// Extract/transcode the selected audio stream to mp3.
    ExtractMp3 { bitrate_kbps: u32 },
    /// Convert the merged download's container to mp4.
    ConvertMp4,
}

/// Fully resolved tier: what to select, how to post-process, and which
/// extension the finished file will carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedQuality {
    pub selection: String,
    pub post_processing: PostProcessing,
    pub extension: &'static str,
}

/// Resolves a tier label into engine directives.
///
/// `"mp3"` selects the best audio-only stream and extracts it to mp3 at
/// 192 kbps. A `<height>p` label selects the video stream whose height
/// equals the requested value, merged with the best available audio, and
/// converts the container to mp4. Every other label is rejected.
pub fn resolve(label: &str) -> Result<ResolvedQuality> {
    if label == "mp3" {
        return Ok(ResolvedQuality {
            selection: "bestaudio/best".to_owned(),
            post_processing: PostProcessing::ExtractMp3 {
                bitrate_kbps: MP3_BITRATE_KBPS,
            },
            extension: "mp3",
        });
    }

    if let Some(digits) = label.strip_suffix('p')
        && !digits.is_empty()
        && digits.bytes().all(|b| b.is_ascii_digit())
        && let Ok(height) = digits.parse::<u32>()
    {
        return Ok(ResolvedQuality {
            selection: format!("bestvideo[height={height}]+bestaudio"),
            post_processing: PostProcessing::ConvertMp4,
            extension: "mp4",
        });
    }

    Err(Error::InvalidQuality(label.to_owned()))
}
