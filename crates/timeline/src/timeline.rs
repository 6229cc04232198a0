//! Sequences, tracks and clips.
//!
//! A sequence is a snapshot of the editable timeline. The conform cache never
//! mutates it; hosts push a fresh snapshot whenever the user edits.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::effect::Effect;
use crate::media::{FrameRate, MediaInfo, MediaKind};

/// Sequence identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SequenceId(pub String);

/// Clip identifier. Durable for the lifetime of the clip, across moves and
/// trims.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClipId(pub String);

macro_rules! string_id {
    ($ty:ident) => {
        impl $ty {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $ty {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id!(SequenceId);
string_id!(ClipId);

/// Track type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Video,
    Audio,
}

/// A transition on a track, spanning `start_frame..start_frame + duration_frames`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub start_frame: u64,
    pub duration_frames: u64,
    /// Transition style (informational; any active transition blocks copy).
    #[serde(default)]
    pub style: String,
}

impl Transition {
    pub fn end_frame(&self) -> u64 {
        self.start_frame + self.duration_frames
    }

    pub fn is_active_at(&self, frame: u64) -> bool {
        frame >= self.start_frame && frame < self.end_frame()
    }
}

/// A clip placed on a track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clip {
    pub id: ClipId,

    /// Source media facts.
    pub media: MediaInfo,

    /// First timeline frame occupied by the clip.
    pub start_frame: u64,

    /// Number of timeline frames occupied.
    pub duration_frames: u64,

    /// Source frame shown at `start_frame`.
    #[serde(default)]
    pub source_in_frame: u64,

    /// Playback speed multiplier.
    #[serde(default = "default_speed")]
    pub speed: f64,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub effects: Vec<Effect>,
}

fn default_speed() -> f64 {
    1.0
}

fn default_enabled() -> bool {
    true
}

impl Clip {
    /// An enabled 1× clip without effects.
    pub fn new(
        id: impl Into<String>,
        media: MediaInfo,
        start_frame: u64,
        duration_frames: u64,
    ) -> Self {
        Self {
            id: ClipId::new(id),
            media,
            start_frame,
            duration_frames,
            source_in_frame: 0,
            speed: 1.0,
            enabled: true,
            effects: Vec::new(),
        }
    }

    /// One past the last occupied timeline frame.
    pub fn end_frame(&self) -> u64 {
        self.start_frame + self.duration_frames
    }

    pub fn covers(&self, frame: u64) -> bool {
        frame >= self.start_frame && frame < self.end_frame()
    }

    /// Source frame displayed at the given timeline frame.
    pub fn source_frame_at(&self, frame: u64) -> u64 {
        let offset = frame.saturating_sub(self.start_frame);
        if self.speed == 1.0 {
            return self.source_in_frame + offset;
        }
        self.source_in_frame + (offset as f64 * self.speed.max(0.0)).floor() as u64
    }

    /// Whether the clip renders pixels at all.
    pub fn is_visual(&self) -> bool {
        self.media.kind != MediaKind::Audio
    }

    /// Enabled effects that can change the picture.
    pub fn visual_effects(&self) -> impl Iterator<Item = &Effect> {
        self.effects.iter().filter(|effect| effect.is_visual())
    }

    /// Whether every enabled visual effect sits at its neutral default.
    pub fn has_neutral_effects(&self) -> bool {
        self.visual_effects().all(Effect::is_neutral)
    }
}

/// A track holding clips and transitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: String,
    pub kind: TrackKind,
    #[serde(default)]
    pub muted: bool,
    #[serde(default)]
    pub clips: Vec<Clip>,
    #[serde(default)]
    pub transitions: Vec<Transition>,
}

impl Track {
    pub fn video(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: TrackKind::Video,
            muted: false,
            clips: Vec::new(),
            transitions: Vec::new(),
        }
    }

    /// Whether this track contributes to the rendered picture.
    pub fn is_visible(&self) -> bool {
        self.kind == TrackKind::Video && !self.muted
    }
}

/// A timeline sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sequence {
    pub id: SequenceId,

    #[serde(default)]
    pub name: String,

    /// Canvas width in pixels.
    pub width: u32,

    /// Canvas height in pixels.
    pub height: u32,

    pub fps: FrameRate,

    /// Sequence length in frames.
    pub duration_frames: u64,

    #[serde(default)]
    pub tracks: Vec<Track>,
}

impl Sequence {
    /// Create an empty sequence.
    pub fn new(
        id: impl Into<String>,
        width: u32,
        height: u32,
        fps: FrameRate,
        duration_frames: u64,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id: SequenceId(id),
            width,
            height,
            fps,
            duration_frames,
            tracks: Vec::new(),
        }
    }

    /// Enabled clips on visible video tracks.
    pub fn visible_clips(&self) -> impl Iterator<Item = &Clip> {
        self.tracks
            .iter()
            .filter(|track| track.is_visible())
            .flat_map(|track| track.clips.iter())
            .filter(|clip| clip.enabled && clip.is_visual())
    }

    /// Transitions on visible video tracks.
    pub fn visible_transitions(&self) -> impl Iterator<Item = &Transition> {
        self.tracks
            .iter()
            .filter(|track| track.is_visible())
            .flat_map(|track| track.transitions.iter())
    }

    /// Identifiers of every clip in the sequence, regardless of state.
    pub fn clip_ids(&self) -> HashSet<&ClipId> {
        self.tracks
            .iter()
            .flat_map(|track| track.clips.iter())
            .map(|clip| &clip.id)
            .collect()
    }

    pub fn find_clip(&self, id: &ClipId) -> Option<&Clip> {
        self.tracks
            .iter()
            .flat_map(|track| track.clips.iter())
            .find(|clip| &clip.id == id)
    }

    /// Mutable lookup, for hosts applying edits to a snapshot.
    pub fn find_clip_mut(&mut self, id: &ClipId) -> Option<&mut Clip> {
        self.tracks
            .iter_mut()
            .flat_map(|track| track.clips.iter_mut())
            .find(|clip| &clip.id == id)
    }

    /// Load a sequence from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TimelineError> {
        let path = path.as_ref().to_path_buf();
        let json = std::fs::read_to_string(&path).map_err(|e| TimelineError::IoError {
            path: path.clone(),
            source: e,
        })?;
        let sequence: Sequence =
            serde_json::from_str(&json).map_err(|e| TimelineError::ParseError {
                path: path.clone(),
                source: e,
            })?;
        let problems = sequence.validate();
        if !problems.is_empty() {
            return Err(TimelineError::ValidationError {
                message: problems.join("; "),
            });
        }
        Ok(sequence)
    }

    /// Save the sequence as pretty JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), TimelineError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| TimelineError::IoError {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|e| TimelineError::ParseError {
            path: path.clone(),
            source: e,
        })?;
        std::fs::write(&path, json).map_err(|e| TimelineError::IoError { path, source: e })
    }

    /// Structural problems that would make the sequence unusable.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.width == 0 || self.height == 0 {
            problems.push(format!(
                "Canvas size {}x{} is empty",
                self.width, self.height
            ));
        }
        if self.fps.num == 0 || self.fps.den == 0 {
            problems.push(format!("Frame rate {} is invalid", self.fps));
        }

        let mut seen = HashSet::new();
        for clip in self.tracks.iter().flat_map(|track| track.clips.iter()) {
            if !seen.insert(&clip.id) {
                problems.push(format!("Duplicate clip id {}", clip.id));
            }
            if clip.duration_frames == 0 {
                problems.push(format!("Clip {} has zero duration", clip.id));
            }
            if clip.speed.is_nan() || clip.speed <= 0.0 {
                problems.push(format!("Clip {} has non-positive speed", clip.id));
            }
        }
        problems
    }
}

/// Errors that can occur when loading or saving sequences.
#[derive(Debug, thiserror::Error)]
pub enum TimelineError {
    #[error("I/O error at {path}: {source}")]
    IoError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Parse error in {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Invalid sequence: {message}")]
    ValidationError { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect::{Effect, EffectKind};
    use crate::media::VideoCodec;

    fn media() -> MediaInfo {
        MediaInfo::video(VideoCodec::H264, 1920, 1080, FrameRate::integer(30))
    }

    #[test]
    fn test_source_frame_mapping() {
        let mut clip = Clip::new("c1", media(), 100, 50);
        clip.source_in_frame = 10;
        assert_eq!(clip.source_frame_at(100), 10);
        assert_eq!(clip.source_frame_at(120), 30);

        clip.speed = 2.0;
        assert_eq!(clip.source_frame_at(105), 20);

        clip.speed = 0.5;
        assert_eq!(clip.source_frame_at(103), 11);
    }

    #[test]
    fn test_visible_clips_skip_muted_and_disabled() {
        let mut seq = Sequence::new("s", 1920, 1080, FrameRate::integer(30), 100);
        let mut v1 = Track::video("v1");
        v1.clips.push(Clip::new("a", media(), 0, 10));
        let mut disabled = Clip::new("b", media(), 10, 10);
        disabled.enabled = false;
        v1.clips.push(disabled);
        let mut v2 = Track::video("v2");
        v2.muted = true;
        v2.clips.push(Clip::new("c", media(), 0, 10));
        seq.tracks.push(v1);
        seq.tracks.push(v2);

        let ids: Vec<_> = seq.visible_clips().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a"]);
        assert_eq!(seq.clip_ids().len(), 3);
    }

    #[test]
    fn test_neutral_effects_ignore_audio() {
        let mut clip = Clip::new("a", media(), 0, 10);
        clip.effects
            .push(Effect::new("vol", EffectKind::Volume).with_param("gain_db", -3.0));
        clip.effects
            .push(Effect::new("op", EffectKind::Opacity).with_param("opacity", 1.0));
        assert!(clip.has_neutral_effects());

        let mut blur = Effect::new("blur", EffectKind::Blur);
        blur.enabled = false;
        clip.effects.push(blur);
        assert!(clip.has_neutral_effects());
    }

    #[test]
    fn test_validate_reports_duplicates() {
        let mut seq = Sequence::new("s", 1920, 1080, FrameRate::integer(30), 100);
        let mut track = Track::video("v1");
        track.clips.push(Clip::new("a", media(), 0, 10));
        track.clips.push(Clip::new("a", media(), 20, 10));
        seq.tracks.push(track);
        let problems = seq.validate();
        assert!(problems.iter().any(|p| p.contains("Duplicate clip id a")));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = std::env::temp_dir().join("splice_test_sequence");
        let _ = std::fs::remove_dir_all(&dir);
        let path = dir.join("sequence.json");

        let mut seq = Sequence::new("roundtrip", 1280, 720, FrameRate::new(30_000, 1_001), 300);
        let mut track = Track::video("v1");
        track.clips.push(Clip::new("a", media(), 0, 120));
        seq.tracks.push(track);

        seq.save(&path).unwrap();
        let loaded = Sequence::load(&path).unwrap();
        assert_eq!(loaded, seq);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let result = Sequence::load("/nonexistent/splice/sequence.json");
        assert!(matches!(result, Err(TimelineError::IoError { .. })));
    }
}
