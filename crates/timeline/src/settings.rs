//! Encoder settings shared by conforming and export.
//!
//! Conformed packets are only reusable when they were produced with exactly
//! the settings of the export, so equality here is field-by-field.

use serde::{Deserialize, Serialize};

use crate::media::{FrameRate, VideoCodec};
use crate::timeline::Sequence;

/// Rate control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BitrateMode {
    Constant,
    Variable,
    Quantizer,
}

/// Encoder speed/quality trade-off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Realtime,
    Balanced,
    Quality,
}

/// Encoder configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderSettings {
    pub codec: VideoCodec,
    pub width: u32,
    pub height: u32,
    pub fps: FrameRate,
    pub bitrate_bps: u64,
    pub bitrate_mode: BitrateMode,
    pub quality: Quality,
}

impl EncoderSettings {
    /// Settings matching a sequence's canvas and frame rate.
    pub fn for_sequence(sequence: &Sequence, codec: VideoCodec, bitrate_bps: u64) -> Self {
        Self {
            codec,
            width: sequence.width,
            height: sequence.height,
            fps: sequence.fps,
            bitrate_bps,
            bitrate_mode: BitrateMode::Variable,
            quality: Quality::Balanced,
        }
    }

    /// Problems that make these settings unusable by an encoder.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.width == 0 || self.height == 0 {
            problems.push(format!("Resolution {}x{} is empty", self.width, self.height));
        }
        if self.width % 2 != 0 || self.height % 2 != 0 {
            problems.push(format!(
                "Resolution {}x{} must have even dimensions",
                self.width, self.height
            ));
        }
        if self.fps.num == 0 || self.fps.den == 0 {
            problems.push(format!("Frame rate {} is invalid", self.fps));
        }
        if self.bitrate_mode != BitrateMode::Quantizer && self.bitrate_bps == 0 {
            problems.push("Bitrate must be non-zero outside quantizer mode".to_string());
        }
        problems
    }

    /// Stable textual form used for fingerprinting.
    pub fn canonical_string(&self) -> String {
        let fps = self.fps.reduced();
        format!(
            "{}|{}x{}|{}/{}|{}|{:?}|{:?}",
            self.codec.as_str(),
            self.width,
            self.height,
            fps.num,
            fps.den,
            self.bitrate_bps,
            self.bitrate_mode,
            self.quality
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> EncoderSettings {
        EncoderSettings {
            codec: VideoCodec::H264,
            width: 1920,
            height: 1080,
            fps: FrameRate::integer(30),
            bitrate_bps: 10_000_000,
            bitrate_mode: BitrateMode::Variable,
            quality: Quality::Balanced,
        }
    }

    #[test]
    fn test_equality_is_field_by_field() {
        let a = settings();
        let mut b = settings();
        assert_eq!(a, b);
        b.quality = Quality::Quality;
        assert_ne!(a, b);
    }

    #[test]
    fn test_validate_rejects_odd_dimensions() {
        let mut s = settings();
        s.width = 1921;
        assert!(!s.validate().is_empty());
    }

    #[test]
    fn test_quantizer_mode_allows_zero_bitrate() {
        let mut s = settings();
        s.bitrate_bps = 0;
        assert!(!s.validate().is_empty());
        s.bitrate_mode = BitrateMode::Quantizer;
        assert!(s.validate().is_empty());
    }
}
