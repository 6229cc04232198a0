//! Per-sequence conform state: the dual-keyed packet cache.
//!
//! The source cache is authoritative. The frame cache is derived from it on
//! every rebuild and only ever contains a packet for a frame whose current
//! source key matches the key the packet was encoded for.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Range;

use splice_timeline::{CoverageMap, EncoderSettings, Sequence, SequenceId};

use crate::packet::Packet;
use crate::source_key::{effects_hash, SourceKey};
use crate::store::namespace_for;

/// Attempts after which a frame is skipped until the next rebuild.
pub const MAX_FRAME_ATTEMPTS: u32 = 3;

/// Summary of one frame-index rebuild.
#[derive(Debug, Default)]
pub struct RebuildReport {
    /// Frames with exactly one covering clip and no transition.
    pub conformable: usize,
    /// Conformable frames satisfied from the source cache.
    pub conformed: usize,
    /// Keys that should be looked up in the warm tier.
    pub recoveries: Vec<SourceKey>,
    /// Source-cache keys dropped because their clip left the timeline.
    pub pruned: Vec<SourceKey>,
}

/// Frames picked for one idle-fill tick.
#[derive(Debug, Default)]
pub struct FillBatch {
    pub frames: Vec<(u64, SourceKey)>,
    /// Whether the scan ran past the end of the sequence.
    pub wrapped: bool,
}

/// Conform state of one sequence under one set of encoder settings.
#[derive(Debug)]
pub struct SequenceConformState {
    sequence_id: SequenceId,
    settings: EncoderSettings,
    namespace: String,
    duration_frames: u64,

    source_cache: HashMap<SourceKey, Packet>,
    packet_cache: HashMap<u64, Packet>,
    frame_keys: BTreeMap<u64, SourceKey>,
    conformed: HashSet<u64>,
    idle_fill_cursor: u64,

    pending_recovery: HashMap<SourceKey, Vec<u64>>,
    reads_in_flight: HashSet<SourceKey>,
    warm_absent: HashSet<SourceKey>,
    parked: HashSet<SourceKey>,
    failures: HashMap<u64, u32>,
}

impl SequenceConformState {
    pub fn new(sequence_id: SequenceId, settings: EncoderSettings) -> Self {
        let namespace = namespace_for(&sequence_id, &settings);
        Self {
            sequence_id,
            settings,
            namespace,
            duration_frames: 0,
            source_cache: HashMap::new(),
            packet_cache: HashMap::new(),
            frame_keys: BTreeMap::new(),
            conformed: HashSet::new(),
            idle_fill_cursor: 0,
            pending_recovery: HashMap::new(),
            reads_in_flight: HashSet::new(),
            warm_absent: HashSet::new(),
            parked: HashSet::new(),
            failures: HashMap::new(),
        }
    }

    pub fn sequence_id(&self) -> &SequenceId {
        &self.sequence_id
    }

    pub fn settings(&self) -> &EncoderSettings {
        &self.settings
    }

    /// Warm-tier namespace for the current settings.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn duration_frames(&self) -> u64 {
        self.duration_frames
    }

    pub fn cursor(&self) -> u64 {
        self.idle_fill_cursor
    }

    /// Move the idle-fill cursor, wrapping to 0 past the end.
    pub fn set_cursor(&mut self, frame: u64) {
        self.idle_fill_cursor = if frame >= self.duration_frames { 0 } else { frame };
    }

    /// Drop every packet and switch to new settings.
    pub fn reset(&mut self, settings: EncoderSettings) {
        *self = Self::new(self.sequence_id.clone(), settings);
    }

    /// Recompute the frame index against a timeline snapshot.
    ///
    /// Runs in time proportional to clips plus frames. Source-cache entries
    /// for clips that no longer exist are pruned; everything else in the
    /// source cache is kept, so moves and trims are free.
    pub fn rebuild(&mut self, sequence: &Sequence) -> RebuildReport {
        let mut report = RebuildReport::default();
        let map = CoverageMap::build(sequence, 0..sequence.duration_frames);
        let hashes: Vec<u64> = map.clips().iter().map(|clip| effects_hash(clip)).collect();

        self.duration_frames = sequence.duration_frames;
        self.packet_cache.clear();
        self.frame_keys.clear();
        self.conformed.clear();
        self.pending_recovery.clear();
        self.failures.clear();

        for frame in 0..sequence.duration_frames {
            if map.transition_active(frame) {
                continue;
            }
            let Some((idx, clip)) = map.single_indexed(frame) else {
                continue;
            };
            let key = SourceKey::at_timeline_frame(clip, frame, hashes[idx]);
            if let Some(packet) = self.source_cache.get(&key) {
                self.packet_cache.insert(frame, packet.clone());
                self.conformed.insert(frame);
            } else if !self.warm_absent.contains(&key) && !self.parked.contains(&key) {
                self.pending_recovery
                    .entry(key.clone())
                    .or_default()
                    .push(frame);
            }
            self.frame_keys.insert(frame, key);
        }

        let live = sequence.clip_ids();
        self.source_cache.retain(|key, _| {
            let keep = live.contains(&key.clip_id);
            if !keep {
                report.pruned.push(key.clone());
            }
            keep
        });
        self.warm_absent.retain(|key| live.contains(&key.clip_id));
        self.parked.retain(|key| live.contains(&key.clip_id));
        self.reads_in_flight.retain(|key| live.contains(&key.clip_id));

        for key in self.pending_recovery.keys() {
            if self.reads_in_flight.insert(key.clone()) {
                report.recoveries.push(key.clone());
            }
        }

        self.set_cursor(self.idle_fill_cursor);
        report.conformable = self.frame_keys.len();
        report.conformed = self.conformed.len();
        report
    }

    /// Encoded packet for a timeline frame, if conformed.
    pub fn get_packet(&self, frame: u64) -> Option<&Packet> {
        self.packet_cache.get(&frame)
    }

    pub fn is_conformed(&self, frame: u64) -> bool {
        self.conformed.contains(&frame)
    }

    pub fn is_conformable(&self, frame: u64) -> bool {
        self.frame_keys.contains_key(&frame)
    }

    /// Whether every frame of `start..start + count` is conformed.
    pub fn is_range_conformed(&self, start: u64, count: u64) -> bool {
        count > 0 && (start..start.saturating_add(count)).all(|f| self.conformed.contains(&f))
    }

    pub fn source_key_at(&self, frame: u64) -> Option<&SourceKey> {
        self.frame_keys.get(&frame)
    }

    /// Whether `frame` begins a run of conformable frames.
    pub fn is_range_start(&self, frame: u64) -> bool {
        self.frame_keys.contains_key(&frame)
            && (frame == 0 || !self.frame_keys.contains_key(&(frame - 1)))
    }

    pub fn conformable_count(&self) -> usize {
        self.frame_keys.len()
    }

    pub fn conformed_count(&self) -> usize {
        self.conformed.len()
    }

    pub fn source_packet_count(&self) -> usize {
        self.source_cache.len()
    }

    pub fn pending_recovery_count(&self) -> usize {
        self.pending_recovery.len()
    }

    /// Whether `frame` is unconformed in RAM but its packet was parked in
    /// the warm tier.
    pub fn is_parked(&self, frame: u64) -> bool {
        !self.conformed.contains(&frame)
            && self
                .frame_keys
                .get(&frame)
                .is_some_and(|key| self.parked.contains(key))
    }

    /// Conformed in RAM or parked in the warm tier.
    pub fn is_satisfied(&self, frame: u64) -> bool {
        self.conformed.contains(&frame) || self.is_parked(frame)
    }

    /// Frames whose only packet is parked in the warm tier.
    pub fn parked_frame_count(&self) -> usize {
        if self.parked.is_empty() {
            return 0;
        }
        self.frame_keys
            .iter()
            .filter(|(frame, key)| !self.conformed.contains(frame) && self.parked.contains(*key))
            .count()
    }

    /// Whether every conformable frame is conformed or parked.
    pub fn is_complete(&self) -> bool {
        self.conformed.len() + self.parked_frame_count() == self.frame_keys.len()
    }

    /// Next frames to encode, starting at the cursor and wrapping once.
    ///
    /// Conformed frames, frames for which `skip` returns true, and frames
    /// that have failed too often are passed over.
    pub fn next_batch(&self, limit: usize, skip: impl Fn(u64) -> bool) -> FillBatch {
        let mut batch = FillBatch::default();
        let cursor = self.idle_fill_cursor;
        let head = self.frame_keys.range(cursor..);
        let tail = self.frame_keys.range(..cursor);

        for (pass, iter) in [head, tail].into_iter().enumerate() {
            if batch.frames.len() >= limit {
                break;
            }
            if pass == 1 {
                batch.wrapped = true;
            }
            for (&frame, key) in iter {
                if batch.frames.len() >= limit {
                    break;
                }
                if self.conformed.contains(&frame)
                    || self.parked.contains(key)
                    || skip(frame)
                    || self.failures.get(&frame).copied().unwrap_or(0) >= MAX_FRAME_ATTEMPTS
                {
                    continue;
                }
                batch.frames.push((frame, key.clone()));
            }
        }
        batch
    }

    /// Store an encoded packet.
    ///
    /// The packet always lands in the source cache. It is placed in the
    /// frame cache only if `frame` still maps to `key`; returns whether it
    /// was.
    pub fn accept_packet(&mut self, frame: u64, key: SourceKey, packet: Packet) -> bool {
        self.warm_absent.remove(&key);
        self.parked.remove(&key);
        self.failures.remove(&frame);
        let placed = self.frame_keys.get(&frame) == Some(&key);
        if placed {
            self.packet_cache.insert(frame, packet.clone());
            self.conformed.insert(frame);
        }
        self.source_cache.insert(key, packet);
        placed
    }

    pub fn record_failure(&mut self, frame: u64) {
        *self.failures.entry(frame).or_insert(0) += 1;
    }

    /// Apply a warm-tier hit. Returns the number of frames it satisfied.
    pub fn accept_recovered(&mut self, key: SourceKey, packet: Packet) -> usize {
        self.reads_in_flight.remove(&key);
        let frames = self.pending_recovery.remove(&key).unwrap_or_default();
        self.place(key, packet, frames)
    }

    /// Bring a parked packet back for the given frames.
    pub fn accept_restored(&mut self, key: SourceKey, packet: Packet, frames: Vec<u64>) -> usize {
        self.parked.remove(&key);
        self.place(key, packet, frames)
    }

    fn place(&mut self, key: SourceKey, packet: Packet, frames: Vec<u64>) -> usize {
        let mut placed = 0;
        for frame in frames {
            if self.frame_keys.get(&frame) == Some(&key) && !self.conformed.contains(&frame) {
                self.packet_cache.insert(frame, packet.clone());
                self.conformed.insert(frame);
                placed += 1;
            }
        }
        self.source_cache.insert(key, packet);
        placed
    }

    /// Record a warm-tier miss so later rebuilds stop asking for the key.
    pub fn recovery_missed(&mut self, key: &SourceKey) {
        self.reads_in_flight.remove(key);
        self.pending_recovery.remove(key);
        self.warm_absent.insert(key.clone());
    }

    /// Remove a packet from the source cache (memory purge). The frame
    /// cache is left untouched until the next rebuild.
    ///
    /// A parked key is known to be in the warm tier: idle fill does not
    /// re-encode its frames and rebuilds do not queue a read for it. It is
    /// brought back on demand with [`accept_restored`](Self::accept_restored).
    pub fn evict_source(&mut self, key: &SourceKey, park: bool) -> Option<Packet> {
        if park {
            self.parked.insert(key.clone());
        }
        self.source_cache.remove(key)
    }

    /// Parked keys mapped by frames in `range`, with those frames.
    pub fn parked_in(&self, range: Range<u64>) -> Vec<(SourceKey, Vec<u64>)> {
        let mut grouped: HashMap<&SourceKey, Vec<u64>> = HashMap::new();
        for (frame, key) in self.frame_keys.range(range) {
            if self.parked.contains(key) {
                grouped.entry(key).or_default().push(*frame);
            }
        }
        let mut out: Vec<_> = grouped
            .into_iter()
            .map(|(key, frames)| (key.clone(), frames))
            .collect();
        out.sort_by_key(|(_, frames)| frames[0]);
        out
    }

    /// Forget that a parked key was in the warm tier (read failed).
    pub fn unpark(&mut self, key: &SourceKey) {
        self.parked.remove(key);
    }

    pub fn parked_count(&self) -> usize {
        self.parked.len()
    }

    /// Resident bytes held by the source cache.
    pub fn source_cache_bytes(&self) -> usize {
        self.source_cache.values().map(Packet::resident_bytes).sum()
    }
}
