//! Segment planning.
//!
//! Every frame of the export range is classified as copyable straight from
//! its source, servable from the conform cache, or in need of a full
//! composite and encode. Adjacent frames with the same classification are
//! merged into segments; a copy run additionally never crosses a clip
//! boundary.

use std::ops::Range;

use serde::Serialize;
use splice_conform::SequenceConformState;
use splice_timeline::{Clip, ClipId, CoverageMap, EncoderSettings, MediaKind, Sequence};

/// How a segment's frames are produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentKind {
    /// Source packets are copied unchanged.
    Copy,
    /// Packets come from the conform cache.
    ConformCopy,
    /// Frames are composited and encoded now.
    Render,
}

impl SegmentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SegmentKind::Copy => "copy",
            SegmentKind::ConformCopy => "conform-copy",
            SegmentKind::Render => "render",
        }
    }
}

/// A maximal run of frames sharing a classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Segment {
    pub kind: SegmentKind,
    pub start_frame: u64,
    /// One past the last frame.
    pub end_frame: u64,
    /// Clip copied from (copy segments only).
    pub source_clip: Option<ClipId>,
}

impl Segment {
    pub fn len(&self) -> u64 {
        self.end_frame - self.start_frame
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn frames(&self) -> Range<u64> {
        self.start_frame..self.end_frame
    }
}

/// Ordered segments covering an export range exactly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SegmentPlan {
    pub start_frame: u64,
    pub end_frame: u64,
    pub segments: Vec<Segment>,
}

impl SegmentPlan {
    pub fn total_frames(&self) -> u64 {
        self.end_frame - self.start_frame
    }

    /// Whether the whole range is one segment of `kind`.
    pub fn is_single(&self, kind: SegmentKind) -> bool {
        matches!(self.segments.as_slice(), [only] if only.kind == kind)
    }

    /// Frames classified as `kind`.
    pub fn frames_of(&self, kind: SegmentKind) -> u64 {
        self.segments
            .iter()
            .filter(|s| s.kind == kind)
            .map(Segment::len)
            .sum()
    }

    /// The same range as a single render segment.
    pub fn full_render(&self) -> Self {
        Self {
            start_frame: self.start_frame,
            end_frame: self.end_frame,
            segments: vec![Segment {
                kind: SegmentKind::Render,
                start_frame: self.start_frame,
                end_frame: self.end_frame,
                source_clip: None,
            }],
        }
    }
}

/// Answers whether the conform cache holds a usable packet for a frame.
pub trait ConformLookup {
    fn has_packet(&self, frame: u64) -> bool;
}

impl ConformLookup for SequenceConformState {
    fn has_packet(&self, frame: u64) -> bool {
        self.is_conformed(frame)
    }
}

impl<T: ConformLookup> ConformLookup for Option<&T> {
    fn has_packet(&self, frame: u64) -> bool {
        self.is_some_and(|lookup| lookup.has_packet(frame))
    }
}

/// No conform packets at all.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoConform;

impl ConformLookup for NoConform {
    fn has_packet(&self, _frame: u64) -> bool {
        false
    }
}

/// Classify every frame of `range` and merge the result into segments.
pub fn plan_segments(
    sequence: &Sequence,
    settings: &EncoderSettings,
    range: Range<u64>,
    conform: &dyn ConformLookup,
) -> SegmentPlan {
    let map = CoverageMap::build(sequence, range.clone());
    let mut segments: Vec<Segment> = Vec::new();

    for frame in range.clone() {
        let (kind, clip) = classify(&map, frame, settings, conform);
        let source_clip = (kind == SegmentKind::Copy).then(|| clip.map(|c| c.id.clone())).flatten();
        match segments.last_mut() {
            Some(last)
                if last.kind == kind
                    && last.end_frame == frame
                    && last.source_clip == source_clip =>
            {
                last.end_frame += 1;
            }
            _ => segments.push(Segment {
                kind,
                start_frame: frame,
                end_frame: frame + 1,
                source_clip,
            }),
        }
    }

    let plan = SegmentPlan {
        start_frame: range.start,
        end_frame: range.end.max(range.start),
        segments,
    };
    tracing::debug!(
        sequence = %sequence.id,
        segments = plan.segments.len(),
        copy = plan.frames_of(SegmentKind::Copy),
        conform = plan.frames_of(SegmentKind::ConformCopy),
        render = plan.frames_of(SegmentKind::Render),
        "Export plan"
    );
    plan
}

fn classify<'a>(
    map: &CoverageMap<'a>,
    frame: u64,
    settings: &EncoderSettings,
    conform: &dyn ConformLookup,
) -> (SegmentKind, Option<&'a Clip>) {
    let fallback = if conform.has_packet(frame) {
        SegmentKind::ConformCopy
    } else {
        SegmentKind::Render
    };

    let Some(clip) = map.single(frame) else {
        return (fallback, None);
    };
    if clip.media.kind != MediaKind::Video
        || map.transition_active(frame)
        || clip.speed != 1.0
        || !clip.media.codec_matches(settings.codec)
        || !clip.has_neutral_effects()
    {
        return (fallback, Some(clip));
    }
    let geometry_matches = clip.media.width == settings.width
        && clip.media.height == settings.height
        && clip.media.fps == settings.fps;
    if geometry_matches {
        (SegmentKind::Copy, Some(clip))
    } else {
        (fallback, Some(clip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use splice_timeline::{
        BitrateMode, Effect, EffectKind, FrameRate, MediaInfo, Quality, Track, Transition,
        VideoCodec,
    };
    use std::collections::HashSet;

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

    fn media() -> MediaInfo {
        MediaInfo::video(VideoCodec::H264, 1920, 1080, FrameRate::integer(30))
    }

    fn sequence(clips: Vec<Clip>, duration: u64) -> Sequence {
        let mut seq = Sequence::new("s", 1920, 1080, FrameRate::integer(30), duration);
        let mut track = Track::video("v1");
        track.clips = clips;
        seq.tracks.push(track);
        seq
    }

    struct Conformed(HashSet<u64>);

    impl ConformLookup for Conformed {
        fn has_packet(&self, frame: u64) -> bool {
            self.0.contains(&frame)
        }
    }

    fn kinds(plan: &SegmentPlan) -> Vec<(SegmentKind, u64, u64)> {
        plan.segments
            .iter()
            .map(|s| (s.kind, s.start_frame, s.end_frame))
            .collect()
    }

    #[test]
    fn test_single_compatible_clip_is_one_copy_segment() {
        let seq = sequence(vec![Clip::new("a", media(), 0, 90)], 90);
        let plan = plan_segments(&seq, &settings(), 0..90, &NoConform);
        assert!(plan.is_single(SegmentKind::Copy));
        assert_eq!(plan.segments[0].source_clip, Some(ClipId::new("a")));
    }

    #[test]
    fn test_one_frame_gap_splits_copy_render_copy() {
        let seq = sequence(
            vec![Clip::new("a", media(), 0, 30), Clip::new("b", media(), 31, 29)],
            60,
        );
        let plan = plan_segments(&seq, &settings(), 0..60, &NoConform);
        assert_eq!(
            kinds(&plan),
            vec![
                (SegmentKind::Copy, 0, 30),
                (SegmentKind::Render, 30, 31),
                (SegmentKind::Copy, 31, 60),
            ]
        );
    }

    #[test]
    fn test_clip_boundary_ends_copy_run() {
        let seq = sequence(
            vec![Clip::new("a", media(), 0, 10), Clip::new("b", media(), 10, 10)],
            20,
        );
        let plan = plan_segments(&seq, &settings(), 0..20, &NoConform);
        assert_eq!(plan.segments.len(), 2);
        assert!(plan.segments.iter().all(|s| s.kind == SegmentKind::Copy));
    }

    #[test]
    fn test_unknown_codec_never_copies() {
        let mut media = media();
        media.codec = None;
        let seq = sequence(vec![Clip::new("a", media, 0, 10)], 10);
        let plan = plan_segments(&seq, &settings(), 0..10, &NoConform);
        assert!(plan.is_single(SegmentKind::Render));
    }

    #[test]
    fn test_geometry_mismatch_uses_conform_packets_when_present() {
        let small = MediaInfo::video(VideoCodec::H264, 1280, 720, FrameRate::integer(30));
        let seq = sequence(vec![Clip::new("a", small, 0, 10)], 10);
        let conformed = Conformed((0..5).collect());
        let plan = plan_segments(&seq, &settings(), 0..10, &conformed);
        assert_eq!(
            kinds(&plan),
            vec![
                (SegmentKind::ConformCopy, 0, 5),
                (SegmentKind::Render, 5, 10)
            ]
        );
    }

    #[test]
    fn test_speed_effects_and_transitions_disqualify_copy() {
        let mut fast = Clip::new("fast", media(), 0, 10);
        fast.speed = 2.0;
        let mut graded = Clip::new("graded", media(), 10, 10);
        graded
            .effects
            .push(Effect::new("cc", EffectKind::ColorCorrection).with_param("gain", 1.2));
        let mut neutral = Clip::new("neutral", media(), 20, 10);
        neutral
            .effects
            .push(Effect::new("op", EffectKind::Opacity).with_param("opacity", 1.0));
        let mut seq = sequence(vec![fast, graded, neutral], 30);
        seq.tracks[0].transitions.push(Transition {
            start_frame: 28,
            duration_frames: 2,
            style: "dissolve".to_string(),
        });

        let plan = plan_segments(&seq, &settings(), 0..30, &NoConform);
        assert_eq!(
            kinds(&plan),
            vec![
                (SegmentKind::Render, 0, 20),
                (SegmentKind::Copy, 20, 28),
                (SegmentKind::Render, 28, 30),
            ]
        );
    }

    #[test]
    fn test_overlap_renders_unless_conformed() {
        let seq = sequence(
            vec![Clip::new("a", media(), 0, 10), Clip::new("b", media(), 5, 10)],
            15,
        );
        let plan = plan_segments(&seq, &settings(), 0..15, &NoConform);
        assert_eq!(
            kinds(&plan),
            vec![
                (SegmentKind::Copy, 0, 5),
                (SegmentKind::Render, 5, 10),
                (SegmentKind::Copy, 10, 15),
            ]
        );
    }

    #[test]
    fn test_partial_range_is_planned_exactly() {
        let seq = sequence(vec![Clip::new("a", media(), 0, 90)], 90);
        let plan = plan_segments(&seq, &settings(), 30..45, &NoConform);
        assert_eq!(kinds(&plan), vec![(SegmentKind::Copy, 30, 45)]);
        assert_eq!(plan.total_frames(), 15);
    }

    proptest! {
        #[test]
        fn prop_segments_tile_range_and_respect_clips(
            starts in proptest::collection::vec(0u64..80, 1..6),
            lens in proptest::collection::vec(1u64..30, 6),
        ) {
            let clips: Vec<Clip> = starts
                .iter()
                .zip(&lens)
                .enumerate()
                .map(|(i, (start, len))| Clip::new(format!("c{i}"), media(), *start, *len))
                .collect();
            let seq = sequence(clips, 100);
            let plan = plan_segments(&seq, &settings(), 0..100, &NoConform);

            let mut expected = 0;
            for segment in &plan.segments {
                prop_assert_eq!(segment.start_frame, expected);
                prop_assert!(segment.end_frame > segment.start_frame);
                expected = segment.end_frame;
                if segment.kind == SegmentKind::Copy {
                    let id = segment.source_clip.clone().unwrap();
                    let clip = seq.find_clip(&id).unwrap();
                    prop_assert!(clip.start_frame <= segment.start_frame);
                    prop_assert!(clip.end_frame() >= segment.end_frame);
                }
            }
            prop_assert_eq!(expected, 100);
            for pair in plan.segments.windows(2) {
                prop_assert!(pair[0].kind != pair[1].kind || pair[0].source_clip != pair[1].source_clip);
            }
        }
    }
}
