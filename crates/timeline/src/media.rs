//! Source media description.
//!
//! Media facts come from an external probe. A codec the probe could not
//! confirm is stored as `None` and is never treated as compatible with
//! anything.

use serde::{Deserialize, Serialize};

/// Video codec family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    H264,
    H265,
    Vp9,
    Av1,
    ProRes,
}

impl VideoCodec {
    pub fn as_str(self) -> &'static str {
        match self {
            VideoCodec::H264 => "h264",
            VideoCodec::H265 => "h265",
            VideoCodec::Vp9 => "vp9",
            VideoCodec::Av1 => "av1",
            VideoCodec::ProRes => "prores",
        }
    }

    /// Parse a codec name as used on the command line.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "h264" | "avc" => Some(VideoCodec::H264),
            "h265" | "hevc" => Some(VideoCodec::H265),
            "vp9" => Some(VideoCodec::Vp9),
            "av1" => Some(VideoCodec::Av1),
            "prores" => Some(VideoCodec::ProRes),
            _ => None,
        }
    }
}

/// What kind of media a clip references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Image,
    Audio,
}

/// Rational frame rate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FrameRate {
    pub num: u32,
    pub den: u32,
}

impl FrameRate {
    pub const fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    /// Integer frame rate (`fps / 1`).
    pub const fn integer(fps: u32) -> Self {
        Self { num: fps, den: 1 }
    }

    pub fn as_f64(self) -> f64 {
        self.num as f64 / self.den.max(1) as f64
    }

    /// The same rate in lowest terms.
    pub fn reduced(self) -> Self {
        let divisor = gcd(self.num, self.den).max(1);
        Self {
            num: self.num / divisor,
            den: self.den / divisor,
        }
    }
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Two rates are equal when they describe the same ratio (30/1 == 60/2).
impl PartialEq for FrameRate {
    fn eq(&self, other: &Self) -> bool {
        self.num as u64 * other.den as u64 == other.num as u64 * self.den as u64
    }
}

impl Eq for FrameRate {}

impl std::fmt::Display for FrameRate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.den == 1 {
            write!(f, "{}", self.num)
        } else {
            write!(f, "{}/{}", self.num, self.den)
        }
    }
}

/// Probed facts about a clip's source media.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    /// Media kind.
    pub kind: MediaKind,

    /// Codec, when positively identified.
    #[serde(default)]
    pub codec: Option<VideoCodec>,

    /// Coded width in pixels.
    pub width: u32,

    /// Coded height in pixels.
    pub height: u32,

    /// Native frame rate.
    pub fps: FrameRate,

    /// Path of the source file (informational).
    #[serde(default)]
    pub path: Option<String>,
}

impl MediaInfo {
    /// A video source with a confirmed codec.
    pub fn video(codec: VideoCodec, width: u32, height: u32, fps: FrameRate) -> Self {
        Self {
            kind: MediaKind::Video,
            codec: Some(codec),
            width,
            height,
            fps,
            path: None,
        }
    }

    /// Whether the codec is confirmed and equal to `codec`.
    pub fn codec_matches(&self, codec: VideoCodec) -> bool {
        self.codec == Some(codec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_rate_compares_ratios() {
        assert_eq!(FrameRate::new(60, 2), FrameRate::integer(30));
        assert_ne!(FrameRate::new(30_000, 1_001), FrameRate::integer(30));
    }

    #[test]
    fn test_reduced_rate() {
        let rate = FrameRate::new(60, 2).reduced();
        assert_eq!((rate.num, rate.den), (30, 1));
    }

    #[test]
    fn test_unknown_codec_never_matches() {
        let mut media = MediaInfo::video(VideoCodec::H264, 1920, 1080, FrameRate::integer(30));
        assert!(media.codec_matches(VideoCodec::H264));
        media.codec = None;
        assert!(!media.codec_matches(VideoCodec::H264));
    }

    #[test]
    fn test_codec_parse_aliases() {
        assert_eq!(VideoCodec::parse("HEVC"), Some(VideoCodec::H265));
        assert_eq!(VideoCodec::parse("avc"), Some(VideoCodec::H264));
        assert_eq!(VideoCodec::parse("mpeg2"), None);
    }
}
