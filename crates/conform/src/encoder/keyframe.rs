//! Forced-keyframe placement for conformed frames.
//!
//! A conformed packet may be spliced into an export on its own, so the
//! encoder is asked for a keyframe whenever the decoder could not otherwise
//! reconstruct the frame from what precedes it in the export: at the start
//! of every conformable run, whenever the submission order skips a frame or
//! changes clip, and at a regular interval.

use splice_common::ConformConfig;
use splice_timeline::{ClipId, EncoderSettings};

/// Keyframe interval derived from bitrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyframePolicy {
    interval_frames: u64,
}

impl KeyframePolicy {
    pub fn new(interval_frames: u64) -> Self {
        Self {
            interval_frames: interval_frames.max(1),
        }
    }

    /// Short interval below the bitrate threshold, long interval at or
    /// above it.
    pub fn for_settings(config: &ConformConfig, settings: &EncoderSettings) -> Self {
        let secs = if settings.bitrate_bps < config.keyframe_bitrate_threshold_bps {
            config.keyframe_interval_low_secs
        } else {
            config.keyframe_interval_high_secs
        };
        Self::new((secs * settings.fps.as_f64()).round().max(1.0) as u64)
    }

    pub fn interval_frames(&self) -> u64 {
        self.interval_frames
    }
}

impl Default for KeyframePolicy {
    fn default() -> Self {
        Self::new(30)
    }
}

/// Tracks the encoder session to decide when to force a keyframe.
#[derive(Debug, Default)]
pub struct KeyframeTracker {
    policy: KeyframePolicy,
    last: Option<(u64, ClipId)>,
    since_keyframe: u64,
}

impl KeyframeTracker {
    pub fn new(policy: KeyframePolicy) -> Self {
        Self {
            policy,
            last: None,
            since_keyframe: 0,
        }
    }

    pub fn policy(&self) -> KeyframePolicy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: KeyframePolicy) {
        self.policy = policy;
        self.reset();
    }

    /// Forget the session; the next frame is forced.
    pub fn reset(&mut self) {
        self.last = None;
        self.since_keyframe = 0;
    }

    /// Decide for the next submitted frame and advance the session.
    pub fn should_force(&mut self, frame: u64, clip_id: &ClipId, range_start: bool) -> bool {
        let contiguous = matches!(
            &self.last,
            Some((prev, prev_clip)) if prev + 1 == frame && prev_clip == clip_id
        );
        let force =
            range_start || !contiguous || self.since_keyframe >= self.policy.interval_frames;
        if force {
            self.since_keyframe = 0;
        }
        self.since_keyframe += 1;
        self.last = Some((frame, clip_id.clone()));
        force
    }
}
