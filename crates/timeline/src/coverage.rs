//! Frame coverage sweep.
//!
//! Builds, in one pass over the clips, a per-frame record of which visible
//! clips cover each frame of a range. Work is proportional to the number of
//! clips plus the frames they cover, never frames × clips.

use std::ops::Range;

use crate::timeline::{Clip, Sequence};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cell {
    Empty,
    One(usize),
    Many(u32),
}

/// What covers a single frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FrameCoverage<'a> {
    /// No visible clip.
    Gap,
    /// Exactly one visible clip.
    Single(&'a Clip),
    /// More than one visible clip; the value is the clip count.
    Multiple(u32),
}

/// Per-frame coverage of a frame range.
#[derive(Debug, Clone)]
pub struct CoverageMap<'a> {
    range: Range<u64>,
    clips: Vec<&'a Clip>,
    cells: Vec<Cell>,
    transitions: Vec<bool>,
}

impl<'a> CoverageMap<'a> {
    /// Sweep the visible clips and transitions of `sequence` over `range`.
    pub fn build(sequence: &'a Sequence, range: Range<u64>) -> Self {
        let start = range.start;
        let end = range.end.max(start);
        let len = (end - start) as usize;
        let mut cells = vec![Cell::Empty; len];
        let mut transitions = vec![false; len];
        let mut clips = Vec::new();

        for clip in sequence.visible_clips() {
            let lo = clip.start_frame.max(start);
            let hi = clip.end_frame().min(end);
            if lo >= hi {
                continue;
            }
            let idx = clips.len();
            clips.push(clip);
            for cell in &mut cells[(lo - start) as usize..(hi - start) as usize] {
                *cell = match *cell {
                    Cell::Empty => Cell::One(idx),
                    Cell::One(_) => Cell::Many(2),
                    Cell::Many(n) => Cell::Many(n + 1),
                };
            }
        }

        for transition in sequence.visible_transitions() {
            let lo = transition.start_frame.max(start);
            let hi = transition.end_frame().min(end);
            if lo >= hi {
                continue;
            }
            for active in &mut transitions[(lo - start) as usize..(hi - start) as usize] {
                *active = true;
            }
        }

        Self {
            range: start..end,
            clips,
            cells,
            transitions,
        }
    }

    /// Swept range.
    pub fn range(&self) -> Range<u64> {
        self.range.clone()
    }

    /// Clips intersecting the range, in sweep order.
    pub fn clips(&self) -> &[&'a Clip] {
        &self.clips
    }

    /// Coverage at a frame. Frames outside the range are gaps.
    pub fn at(&self, frame: u64) -> FrameCoverage<'a> {
        match self.cell(frame) {
            Some(Cell::One(idx)) => FrameCoverage::Single(self.clips[idx]),
            Some(Cell::Many(n)) => FrameCoverage::Multiple(n),
            _ => FrameCoverage::Gap,
        }
    }

    /// The single covering clip, if exactly one covers the frame.
    pub fn single(&self, frame: u64) -> Option<&'a Clip> {
        self.single_indexed(frame).map(|(_, clip)| clip)
    }

    /// Like [`single`](Self::single), also returning the clip's position in
    /// [`clips`](Self::clips) so callers can keep per-clip side tables.
    pub fn single_indexed(&self, frame: u64) -> Option<(usize, &'a Clip)> {
        match self.cell(frame) {
            Some(Cell::One(idx)) => Some((idx, self.clips[idx])),
            _ => None,
        }
    }

    /// Whether a transition is active at the frame.
    pub fn transition_active(&self, frame: u64) -> bool {
        self.index(frame)
            .map(|idx| self.transitions[idx])
            .unwrap_or(false)
    }

    fn cell(&self, frame: u64) -> Option<Cell> {
        self.index(frame).map(|idx| self.cells[idx])
    }

    fn index(&self, frame: u64) -> Option<usize> {
        if self.range.contains(&frame) {
            Some((frame - self.range.start) as usize)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{FrameRate, MediaInfo, VideoCodec};
    use crate::timeline::{Track, Transition};
    use proptest::prelude::*;

    fn media() -> MediaInfo {
        MediaInfo::video(VideoCodec::H264, 1920, 1080, FrameRate::integer(30))
    }

    fn sequence() -> Sequence {
        let mut seq = Sequence::new("s", 1920, 1080, FrameRate::integer(30), 100);
        let mut v1 = Track::video("v1");
        v1.clips.push(Clip::new("a", media(), 0, 40));
        v1.clips.push(Clip::new("b", media(), 50, 30));
        v1.transitions.push(Transition {
            start_frame: 70,
            duration_frames: 5,
            style: "dissolve".into(),
        });
        let mut v2 = Track::video("v2");
        v2.clips.push(Clip::new("c", media(), 30, 15));
        seq.tracks.push(v1);
        seq.tracks.push(v2);
        seq
    }

    #[test]
    fn test_coverage_classification() {
        let seq = sequence();
        let map = CoverageMap::build(&seq, 0..100);

        assert_eq!(map.single(0).map(|c| c.id.as_str()), Some("a"));
        assert_eq!(map.at(35), FrameCoverage::Multiple(2));
        assert_eq!(map.single(42).map(|c| c.id.as_str()), Some("c"));
        assert_eq!(map.at(47), FrameCoverage::Gap);
        assert_eq!(map.single(60).map(|c| c.id.as_str()), Some("b"));
        assert_eq!(map.at(99), FrameCoverage::Gap);
        assert_eq!(map.at(250), FrameCoverage::Gap);
    }

    #[test]
    fn test_transition_mask() {
        let seq = sequence();
        let map = CoverageMap::build(&seq, 60..80);
        assert!(!map.transition_active(69));
        assert!(map.transition_active(70));
        assert!(map.transition_active(74));
        assert!(!map.transition_active(75));
    }

    #[test]
    fn test_subrange_only_keeps_intersecting_clips() {
        let seq = sequence();
        let map = CoverageMap::build(&seq, 50..60);
        let ids: Vec<_> = map.clips().iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["b"]);
    }

    proptest! {
        #[test]
        fn prop_sweep_matches_naive_scan(
            spans in proptest::collection::vec((0u64..200, 1u64..60), 0..12)
        ) {
            let mut seq = Sequence::new("p", 640, 360, FrameRate::integer(30), 240);
            let mut track = Track::video("v1");
            for (i, (start, len)) in spans.iter().enumerate() {
                track.clips.push(Clip::new(format!("c{i}"), media(), *start, *len));
            }
            seq.tracks.push(track);
            let map = CoverageMap::build(&seq, 0..240);

            for frame in 0..240u64 {
                let covering: Vec<_> = seq.visible_clips().filter(|c| c.covers(frame)).collect();
                let expected = match covering.len() {
                    0 => FrameCoverage::Gap,
                    1 => FrameCoverage::Single(covering[0]),
                    n => FrameCoverage::Multiple(n as u32),
                };
                prop_assert_eq!(map.at(frame), expected);
            }
        }
    }
}
