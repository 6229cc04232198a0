//! Conform engine.
//!
//! Owns every per-sequence conform state, the shared RAM budget, the encoder
//! channel and the generation counter. All mutation goes through `&mut self`,
//! so the engine is meant to live inside a single task (see the service in
//! `splice-export`) and be driven by messages.
//!
//! The generation counter increases on every sequence switch and every full
//! invalidation. Each encode request records the generation it was issued
//! under; a packet that comes back under a different generation is dropped.

use std::collections::{HashMap, HashSet, VecDeque};
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use splice_common::{ConformConfig, FrameClock, SpliceError, SpliceResult};
use splice_timeline::{EncoderSettings, Sequence, SequenceId, VideoCodec};
use tokio::sync::mpsc;

use crate::encoder::{
    CorrelationId, EncoderChannel, EncoderCompletion, KeyframePolicy, KeyframeTracker,
};
use crate::frame_index::{RebuildReport, SequenceConformState};
use crate::media::{Compositor, DecodeAhead};
use crate::memory::MemoryBudget;
use crate::packet::Packet;
use crate::scheduler::ActivityFlags;
use crate::source_key::SourceKey;
use crate::store::WarmStore;

/// What one idle-fill tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    /// At least one frame was submitted.
    Submitted,
    /// Every conformable frame is conformed.
    Complete,
    /// Nothing could be submitted although unconformed frames remain.
    Starved,
    /// Playback or export started.
    Blocked,
    /// The RAM cap is still exceeded after a purge.
    MemoryPressure,
    /// Decode-ahead failed for the batch.
    DecodeFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOutcome {
    pub status: BatchStatus,
    pub submitted: usize,
    /// Whether the frame scan wrapped past the end of the sequence.
    pub wrapped: bool,
}

impl BatchOutcome {
    fn empty(status: BatchStatus) -> Self {
        Self {
            status,
            submitted: 0,
            wrapped: false,
        }
    }
}

/// Conform progress of one sequence.
#[derive(Debug, Clone, Serialize)]
pub struct CoverageReport {
    pub sequence_id: SequenceId,
    pub settings: EncoderSettings,
    pub total_frames: u64,
    pub conformable_frames: usize,
    pub conformed_frames: usize,
    pub source_packets: usize,
    pub pending_recoveries: usize,
    pub parked_packets: usize,
    /// Conformable frames whose packet is parked in the warm tier.
    pub parked_frames: usize,
    pub in_flight: usize,
    pub resident_bytes: usize,
    pub generation: u64,
}

impl CoverageReport {
    /// Conformed or parked share of the conformable frames (1.0 when none
    /// are).
    pub fn ratio(&self) -> f64 {
        if self.conformable_frames == 0 {
            1.0
        } else {
            (self.conformed_frames + self.parked_frames) as f64 / self.conformable_frames as f64
        }
    }

    pub fn is_complete(&self) -> bool {
        self.conformed_frames + self.parked_frames == self.conformable_frames
    }
}

/// Result of a background warm-tier read.
#[derive(Debug)]
pub struct RecoveryResult {
    sequence_id: SequenceId,
    namespace: String,
    key: SourceKey,
    packet: Option<Packet>,
}

/// Something the engine should react to.
#[derive(Debug)]
pub enum EngineEvent {
    Encoder(EncoderCompletion),
    Recovery(RecoveryResult),
}

#[derive(Debug)]
struct EncodeRequest {
    sequence_id: SequenceId,
    frame: u64,
    key: SourceKey,
    generation: u64,
}

pub struct ConformEngine {
    config: ConformConfig,
    default_codec: VideoCodec,
    encoder: EncoderChannel,
    store: Arc<dyn WarmStore>,
    decoder: Arc<dyn DecodeAhead>,
    compositor: Arc<dyn Compositor>,
    activity: ActivityFlags,

    sequences: HashMap<SequenceId, Arc<Sequence>>,
    states: HashMap<SequenceId, SequenceConformState>,
    budget: MemoryBudget,
    generation: u64,
    active: Option<SequenceId>,
    in_flight: HashMap<CorrelationId, EncodeRequest>,
    keyframes: KeyframeTracker,

    export_mode: bool,
    foreign: VecDeque<EncoderCompletion>,
    recovery_tx: mpsc::UnboundedSender<RecoveryResult>,
    recovery_rx: mpsc::UnboundedReceiver<RecoveryResult>,
}

impl ConformEngine {
    pub fn new(
        config: ConformConfig,
        encoder: EncoderChannel,
        store: Arc<dyn WarmStore>,
        decoder: Arc<dyn DecodeAhead>,
        compositor: Arc<dyn Compositor>,
        activity: ActivityFlags,
    ) -> SpliceResult<Self> {
        let config = config.validated()?;
        let default_codec = VideoCodec::parse(&config.default_codec).ok_or_else(|| {
            SpliceError::configuration(format!("unknown codec '{}'", config.default_codec))
        })?;
        let budget = MemoryBudget::new(config.ram_cap_bytes, config.ram_purge_target_bytes());
        let (recovery_tx, recovery_rx) = mpsc::unbounded_channel();

        tracing::info!(
            encoder = encoder.backend_name(),
            store = store.name(),
            compositor = compositor.name(),
            ram_cap = config.ram_cap_bytes,
            batch = config.batch_size,
            "Conform engine ready"
        );

        Ok(Self {
            config,
            default_codec,
            encoder,
            store,
            decoder,
            compositor,
            activity,
            sequences: HashMap::new(),
            states: HashMap::new(),
            budget,
            generation: 0,
            active: None,
            in_flight: HashMap::new(),
            keyframes: KeyframeTracker::default(),
            export_mode: false,
            foreign: VecDeque::new(),
            recovery_tx,
            recovery_rx,
        })
    }

    pub fn config(&self) -> &ConformConfig {
        &self.config
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn activity(&self) -> &ActivityFlags {
        &self.activity
    }

    pub fn active_sequence(&self) -> Option<&SequenceId> {
        self.active.as_ref()
    }

    pub fn sequence(&self, id: &SequenceId) -> Option<Arc<Sequence>> {
        self.sequences.get(id).cloned()
    }

    pub fn state(&self, id: &SequenceId) -> Option<&SequenceConformState> {
        self.states.get(id)
    }

    pub fn resident_bytes(&self) -> usize {
        self.budget.used_bytes()
    }

    /// Settings used for a sequence until the host provides its own.
    pub fn default_settings(&self, sequence: &Sequence) -> EncoderSettings {
        EncoderSettings::for_sequence(
            sequence,
            self.default_codec,
            self.config.default_bitrate_bps,
        )
    }

    // ---------------------------------------------------------------------
    // Timeline and settings
    // ---------------------------------------------------------------------

    /// Accept a new timeline snapshot and rebuild its frame index.
    pub fn update_sequence(&mut self, sequence: Sequence) -> SpliceResult<RebuildReport> {
        let problems = sequence.validate();
        if !problems.is_empty() {
            return Err(SpliceError::timeline(problems.join("; ")));
        }
        let id = sequence.id.clone();
        let sequence = Arc::new(sequence);
        if !self.states.contains_key(&id) {
            let settings = self.default_settings(&sequence);
            self.states
                .insert(id.clone(), SequenceConformState::new(id.clone(), settings));
        }
        self.sequences.insert(id.clone(), Arc::clone(&sequence));
        let report = self.rebuild(&id);
        tracing::debug!(
            sequence = %id,
            conformable = report.conformable,
            conformed = report.conformed,
            recoveries = report.recoveries.len(),
            pruned = report.pruned.len(),
            "Frame index rebuilt"
        );
        Ok(report)
    }

    /// Replace a sequence's encoder settings. Any change fully invalidates
    /// the sequence's packets and bumps the generation.
    pub async fn set_settings(
        &mut self,
        id: &SequenceId,
        settings: EncoderSettings,
    ) -> SpliceResult<bool> {
        let problems = settings.validate();
        if !problems.is_empty() {
            return Err(SpliceError::configuration(problems.join("; ")));
        }
        let state = self
            .states
            .get_mut(id)
            .ok_or_else(|| SpliceError::sequence_not_found(id.as_str()))?;
        if state.settings() == &settings {
            return Ok(false);
        }

        let old_namespace = state.namespace().to_string();
        let cursor = state.cursor();
        state.reset(settings);
        state.set_cursor(cursor);
        self.generation += 1;
        self.budget.forget_sequence(id);
        self.in_flight.retain(|_, req| &req.sequence_id != id);
        self.rebuild(id);

        if let Err(e) = self.store.clear(&old_namespace).await {
            tracing::warn!(sequence = %id, error = %e, "Failed to clear stale warm-tier namespace");
        }
        tracing::info!(sequence = %id, generation = self.generation, "Encoder settings changed");
        Ok(true)
    }

    /// Drop all state for a deleted sequence.
    pub fn remove_sequence(&mut self, id: &SequenceId) -> bool {
        let existed = self.states.remove(id).is_some();
        self.sequences.remove(id);
        self.budget.forget_sequence(id);
        self.in_flight.retain(|_, req| &req.sequence_id != id);
        if self.active.as_ref() == Some(id) {
            self.active = None;
            self.generation += 1;
        }
        if existed {
            tracing::info!(sequence = %id, "Sequence removed from conform cache");
        }
        existed
    }

    /// Make `id` the sequence the encoder works for, reconfiguring it if
    /// needed. Work in flight for the previous sequence is drained first.
    pub async fn activate(&mut self, id: &SequenceId) -> SpliceResult<()> {
        let settings = self
            .states
            .get(id)
            .map(|state| state.settings().clone())
            .ok_or_else(|| SpliceError::sequence_not_found(id.as_str()))?;
        if self.active.as_ref() != Some(id) {
            self.quiesce().await?;
            self.generation += 1;
            self.active = Some(id.clone());
            tracing::info!(sequence = %id, generation = self.generation, "Sequence activated");
        }
        self.ensure_configured(&settings).await
    }

    /// Clear the warm tier of a sequence's current namespace.
    pub async fn clear_warm_tier(&mut self, id: &SequenceId) -> SpliceResult<()> {
        let namespace = self
            .states
            .get(id)
            .map(|state| state.namespace().to_string())
            .ok_or_else(|| SpliceError::sequence_not_found(id.as_str()))?;
        self.store.clear(&namespace).await
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    pub fn get_packet(&self, id: &SequenceId, frame: u64) -> Option<Packet> {
        self.states.get(id)?.get_packet(frame).cloned()
    }

    /// Packet for a frame, reading it back from the warm tier if it was
    /// parked by a purge.
    pub async fn fetch_packet(&mut self, id: &SequenceId, frame: u64) -> Option<Packet> {
        let parked = self.states.get(id)?.is_parked(frame);
        if parked {
            self.restore_parked(id, frame..frame + 1).await;
        }
        self.get_packet(id, frame)
    }

    /// Whether a frame has a current packet, in RAM or parked in the warm
    /// tier.
    pub fn is_frame_conformed(&self, id: &SequenceId, frame: u64) -> bool {
        self.states
            .get(id)
            .is_some_and(|state| state.is_satisfied(frame))
    }

    pub fn is_range_conformed(&self, id: &SequenceId, start: u64, count: u64) -> bool {
        self.states.get(id).is_some_and(|state| {
            count > 0 && (start..start.saturating_add(count)).all(|f| state.is_satisfied(f))
        })
    }

    /// Conform state usable for an export with `settings`: only packets
    /// encoded with exactly those settings qualify.
    pub fn state_for_export(
        &self,
        id: &SequenceId,
        settings: &EncoderSettings,
    ) -> Option<&SequenceConformState> {
        self.states
            .get(id)
            .filter(|state| state.settings() == settings)
    }

    pub fn coverage(&self, id: &SequenceId) -> Option<CoverageReport> {
        let state = self.states.get(id)?;
        Some(CoverageReport {
            sequence_id: id.clone(),
            settings: state.settings().clone(),
            total_frames: state.duration_frames(),
            conformable_frames: state.conformable_count(),
            conformed_frames: state.conformed_count(),
            source_packets: state.source_packet_count(),
            pending_recoveries: state.pending_recovery_count(),
            parked_packets: state.parked_count(),
            parked_frames: state.parked_frame_count(),
            in_flight: self
                .in_flight
                .values()
                .filter(|req| &req.sequence_id == id)
                .count(),
            resident_bytes: self.budget.used_bytes(),
            generation: self.generation,
        })
    }

    /// Move the idle-fill cursor of a sequence.
    pub fn seek(&mut self, id: &SequenceId, frame: u64) {
        if let Some(state) = self.states.get_mut(id) {
            state.set_cursor(frame);
        }
    }

    // ---------------------------------------------------------------------
    // Idle fill
    // ---------------------------------------------------------------------

    /// Run one idle-fill tick for `id`.
    pub async fn fill_batch(&mut self, id: &SequenceId) -> SpliceResult<BatchOutcome> {
        self.pump();
        if self.activity.is_blocked() {
            return Ok(BatchOutcome::empty(BatchStatus::Blocked));
        }
        if !self.states.contains_key(id) {
            return Err(SpliceError::sequence_not_found(id.as_str()));
        }
        if !self.enforce_memory_cap() {
            tracing::warn!(
                used = self.budget.used_bytes(),
                cap = self.budget.cap_bytes(),
                "RAM cap still exceeded after purge; skipping batch"
            );
            return Ok(BatchOutcome::empty(BatchStatus::MemoryPressure));
        }
        self.ensure_encoder()?;
        self.activate(id).await?;

        let generation = self.generation;
        let busy: HashSet<u64> = self
            .in_flight
            .values()
            .filter(|req| &req.sequence_id == id && req.generation == generation)
            .map(|req| req.frame)
            .collect();
        let batch = match self.states.get(id) {
            Some(state) => state.next_batch(self.config.batch_size, |f| busy.contains(&f)),
            None => return Err(SpliceError::sequence_not_found(id.as_str())),
        };

        if batch.frames.is_empty() {
            if !self.in_flight.is_empty() {
                self.flush_encoder().await?;
            }
            let complete = self.states.get(id).is_some_and(|s| s.is_complete());
            let status = if complete {
                BatchStatus::Complete
            } else {
                BatchStatus::Starved
            };
            return Ok(BatchOutcome {
                status,
                submitted: 0,
                wrapped: batch.wrapped,
            });
        }

        for run in contiguous_runs(batch.frames.iter().map(|(f, _)| *f)) {
            let count = run.end - run.start;
            if self.decoder.is_range_decoded(id, run.start, count) {
                continue;
            }
            if let Err(e) = self.decoder.ensure_buffered(id, run.start, count).await {
                tracing::warn!(sequence = %id, start = run.start, count, error = %e, "Decode-ahead failed");
                return Ok(BatchOutcome {
                    status: BatchStatus::DecodeFailed,
                    submitted: 0,
                    wrapped: batch.wrapped,
                });
            }
        }

        let sequence = self
            .sequences
            .get(id)
            .cloned()
            .ok_or_else(|| SpliceError::sequence_not_found(id.as_str()))?;
        let settings = self
            .states
            .get(id)
            .map(|s| s.settings().clone())
            .ok_or_else(|| SpliceError::sequence_not_found(id.as_str()))?;
        let clock = FrameClock::new(settings.fps.num, settings.fps.den);

        let mut status = BatchStatus::Submitted;
        let mut submitted = 0;
        let mut last_submitted = None;
        for (frame, key) in batch.frames {
            let activity = self.activity.clone();
            if !self
                .wait_for_capacity(self.config.max_in_flight, || activity.is_blocked())
                .await?
            {
                status = BatchStatus::Blocked;
                break;
            }
            if self.budget.is_over_cap() && !self.enforce_memory_cap() {
                tracing::warn!(
                    used = self.budget.used_bytes(),
                    cap = self.budget.cap_bytes(),
                    "RAM cap still exceeded after purge; ending batch"
                );
                status = BatchStatus::MemoryPressure;
                break;
            }

            let image = match self
                .compositor
                .composite(&sequence, frame, settings.width, settings.height)
                .await
            {
                Ok(image) => image,
                Err(e) if e.is_transient() => {
                    tracing::warn!(sequence = %id, frame, error = %e, "Compositing failed");
                    if let Some(state) = self.states.get_mut(id) {
                        state.record_failure(frame);
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };

            let range_start = self.states.get(id).is_some_and(|s| s.is_range_start(frame));
            let force = self.keyframes.should_force(frame, &key.clip_id, range_start);
            let request_id = self.encoder.submit(image, clock.frame_to_us(frame), force)?;
            self.in_flight.insert(
                request_id,
                EncodeRequest {
                    sequence_id: id.clone(),
                    frame,
                    key,
                    generation,
                },
            );
            submitted += 1;
            last_submitted = Some(frame);
        }

        if let (Some(frame), Some(state)) = (last_submitted, self.states.get_mut(id)) {
            state.set_cursor(frame + 1);
        }
        if submitted == 0 && status == BatchStatus::Submitted {
            status = BatchStatus::Starved;
        }
        tracing::trace!(sequence = %id, submitted, ?status, "Idle-fill batch");
        Ok(BatchOutcome {
            status,
            submitted,
            wrapped: batch.wrapped,
        })
    }

    /// Wait until fewer than `limit` encodes are outstanding. Returns
    /// `Ok(false)` if `cancelled` turns true first.
    pub async fn wait_for_capacity(
        &mut self,
        limit: usize,
        cancelled: impl Fn() -> bool,
    ) -> SpliceResult<bool> {
        let poll = Duration::from_millis(self.config.backpressure_poll_ms.max(1));
        loop {
            self.pump();
            if !self.encoder.is_alive() {
                return Err(SpliceError::channel_crash("encoder worker is not running"));
            }
            if self.encoder.outstanding() < limit {
                return Ok(!cancelled());
            }
            if cancelled() {
                return Ok(false);
            }
            self.encoder.wait_briefly(poll).await;
        }
    }

    // ---------------------------------------------------------------------
    // Completions and recoveries
    // ---------------------------------------------------------------------

    /// Apply every completion and recovery that is ready, without waiting.
    pub fn pump(&mut self) {
        while let Some(completion) = self.encoder.try_next_completion() {
            self.apply_completion(completion);
        }
        while let Ok(result) = self.recovery_rx.try_recv() {
            self.apply_recovery(result);
        }
    }

    /// Wait for the next completion or recovery.
    pub async fn next_event(&mut self) -> Option<EngineEvent> {
        tokio::select! {
            Some(completion) = self.encoder.next_completion() => Some(EngineEvent::Encoder(completion)),
            Some(result) = self.recovery_rx.recv() => Some(EngineEvent::Recovery(result)),
            else => None,
        }
    }

    pub fn handle_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Encoder(completion) => self.apply_completion(completion),
            EngineEvent::Recovery(result) => self.apply_recovery(result),
        }
    }

    fn apply_completion(&mut self, completion: EncoderCompletion) {
        match completion {
            EncoderCompletion::Packet(encoded) => match self.in_flight.remove(&encoded.id) {
                Some(request) => self.store_encoded(request, encoded.packet),
                None => self.push_foreign(EncoderCompletion::Packet(encoded)),
            },
            EncoderCompletion::Failed { id, error } => match self.in_flight.remove(&id) {
                Some(request) => {
                    tracing::warn!(
                        sequence = %request.sequence_id,
                        frame = request.frame,
                        error = %error,
                        "Frame failed to encode"
                    );
                    if request.generation == self.generation && !error.is_channel_crash() {
                        if let Some(state) = self.states.get_mut(&request.sequence_id) {
                            state.record_failure(request.frame);
                        }
                    }
                }
                None => self.push_foreign(EncoderCompletion::Failed { id, error }),
            },
            EncoderCompletion::Crashed { message } => {
                tracing::warn!(
                    lost = self.in_flight.len(),
                    reason = %message,
                    "Encoder crashed; in-flight conform work dropped"
                );
                self.in_flight.clear();
                self.keyframes.reset();
                self.push_foreign(EncoderCompletion::Crashed { message });
            }
        }
    }

    fn store_encoded(&mut self, request: EncodeRequest, packet: Packet) {
        if request.generation != self.generation {
            tracing::debug!(
                frame = request.frame,
                issued = request.generation,
                current = self.generation,
                "Dropping packet from a previous generation"
            );
            return;
        }
        let Some(state) = self.states.get_mut(&request.sequence_id) else {
            return;
        };
        let bytes = packet.resident_bytes();
        let stored = self.config.persist.then(|| packet.to_stored());
        let placed = state.accept_packet(request.frame, request.key.clone(), packet);
        if let Some(stored) = stored {
            self.store
                .write(state.namespace(), &request.key.storage_key(), stored);
        }
        self.budget.record(&request.sequence_id, &request.key, bytes);
        tracing::trace!(frame = request.frame, placed, bytes, "Packet conformed");
    }

    fn apply_recovery(&mut self, result: RecoveryResult) {
        let Some(state) = self.states.get_mut(&result.sequence_id) else {
            return;
        };
        if state.namespace() != result.namespace {
            return;
        }
        match result.packet {
            Some(packet) => {
                let bytes = packet.resident_bytes();
                let placed = state.accept_recovered(result.key.clone(), packet);
                self.budget.record(&result.sequence_id, &result.key, bytes);
                tracing::trace!(placed, "Recovered packet from warm tier");
            }
            None => state.recovery_missed(&result.key),
        }
    }

    fn push_foreign(&mut self, completion: EncoderCompletion) {
        if self.export_mode {
            self.foreign.push_back(completion);
        } else {
            tracing::debug!(?completion, "Dropping completion with no owner");
        }
    }

    fn rebuild(&mut self, id: &SequenceId) -> RebuildReport {
        let (Some(state), Some(sequence)) = (self.states.get_mut(id), self.sequences.get(id))
        else {
            return RebuildReport::default();
        };
        let report = state.rebuild(sequence);
        for key in &report.pruned {
            self.budget.forget(id, key);
        }
        if !report.recoveries.is_empty() {
            if self.config.persist {
                spawn_recoveries(
                    Arc::clone(&self.store),
                    self.recovery_tx.clone(),
                    id.clone(),
                    state.namespace().to_string(),
                    report.recoveries.clone(),
                );
            } else {
                for key in &report.recoveries {
                    state.recovery_missed(key);
                }
            }
        }
        report
    }

    /// Purge the oldest source-cache entries once the RAM cap is exceeded.
    /// Returns false if usage is still over the cap afterwards.
    fn enforce_memory_cap(&mut self) -> bool {
        if !self.budget.is_over_cap() {
            return true;
        }
        let before = self.budget.used_bytes();
        let victims = self.budget.select_victims();
        let mut affected = HashSet::new();
        for (sequence_id, key) in &victims {
            if let Some(state) = self.states.get_mut(sequence_id) {
                state.evict_source(key, self.config.persist);
                affected.insert(sequence_id.clone());
            }
        }
        for sequence_id in &affected {
            self.rebuild(sequence_id);
        }
        tracing::info!(
            evicted = victims.len(),
            freed = before.saturating_sub(self.budget.used_bytes()),
            sequences = affected.len(),
            "Purged conform cache"
        );
        !self.budget.is_over_cap()
    }

    /// Load parked packets for `range` back from the warm tier. Returns the
    /// number of frames restored.
    pub async fn restore_parked(&mut self, id: &SequenceId, range: Range<u64>) -> usize {
        let Some(state) = self.states.get(id) else {
            return 0;
        };
        let namespace = state.namespace().to_string();
        let parked = state.parked_in(range);
        let mut restored = 0;
        for (key, frames) in parked {
            let packet = match self.store.read(&namespace, &key.storage_key()).await {
                Ok(Some(bytes)) => Packet::from_stored(&bytes),
                Ok(None) => None,
                Err(e) => {
                    tracing::warn!(error = %e, "Warm-tier read failed");
                    None
                }
            };
            let Some(state) = self.states.get_mut(id) else {
                break;
            };
            match packet {
                Some(packet) => {
                    let bytes = packet.resident_bytes();
                    restored += state.accept_restored(key.clone(), packet, frames);
                    self.budget.record(id, &key, bytes);
                }
                None => state.unpark(&key),
            }
        }
        restored
    }

    /// Decode `range` ahead in batch-sized chunks, skipping chunks that are
    /// already buffered.
    pub async fn ensure_decoded(&mut self, id: &SequenceId, range: Range<u64>) -> SpliceResult<()> {
        let chunk = self.config.batch_size.max(1) as u64;
        let mut start = range.start;
        while start < range.end {
            let count = chunk.min(range.end - start);
            if !self.decoder.is_range_decoded(id, start, count) {
                self.decoder
                    .ensure_buffered(id, start, count)
                    .await
                    .map_err(|e| match e {
                        decode @ SpliceError::Decode { .. } => decode,
                        other => SpliceError::decode(format!(
                            "frames {start}..{}: {other}",
                            start + count
                        )),
                    })?;
            }
            start += count;
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Encoder access for export
    // ---------------------------------------------------------------------

    /// Enter export mode: idle-fill work is drained and completions that do
    /// not belong to idle fill are kept for the caller.
    pub async fn begin_export(&mut self) -> SpliceResult<()> {
        self.ensure_encoder()?;
        self.quiesce().await?;
        self.export_mode = true;
        self.foreign.clear();
        Ok(())
    }

    pub fn end_export(&mut self) {
        self.export_mode = false;
        self.foreign.clear();
        self.keyframes.reset();
    }

    /// Respawn the encoder worker if it died.
    pub fn ensure_encoder(&mut self) -> SpliceResult<()> {
        if !self.encoder.is_alive() {
            self.pump();
            self.encoder.respawn()?;
            self.keyframes.reset();
        }
        Ok(())
    }

    /// Configure the encoder for `settings` (no-op if already active).
    pub async fn ensure_configured(&mut self, settings: &EncoderSettings) -> SpliceResult<()> {
        if self.encoder.configure(settings).await? {
            self.keyframes
                .set_policy(KeyframePolicy::for_settings(&self.config, settings));
        }
        Ok(())
    }

    /// Composite and submit one frame outside idle fill.
    pub async fn submit_render_frame(
        &mut self,
        sequence: &Sequence,
        frame: u64,
        settings: &EncoderSettings,
        timestamp_us: u64,
        force_keyframe: bool,
    ) -> SpliceResult<CorrelationId> {
        let image = self
            .compositor
            .composite(sequence, frame, settings.width, settings.height)
            .await?;
        self.encoder.submit(image, timestamp_us, force_keyframe)
    }

    /// Next completion not owned by idle fill, without waiting.
    pub fn take_foreign(&mut self) -> Option<EncoderCompletion> {
        self.pump();
        self.foreign.pop_front()
    }

    /// Next completion not owned by idle fill.
    pub async fn next_foreign(&mut self) -> Option<EncoderCompletion> {
        loop {
            if let Some(completion) = self.take_foreign() {
                return Some(completion);
            }
            let completion = self.encoder.next_completion().await?;
            self.apply_completion(completion);
        }
    }

    /// Flush the encoder and apply everything it released.
    pub async fn flush_encoder(&mut self) -> SpliceResult<()> {
        self.encoder.flush().await?;
        self.keyframes.reset();
        self.pump();
        Ok(())
    }

    pub fn encoder_outstanding(&self) -> usize {
        self.encoder.outstanding()
    }

    /// Drain all in-flight idle-fill work into the cache.
    pub async fn quiesce(&mut self) -> SpliceResult<()> {
        if self.encoder.is_alive() && self.encoder.outstanding() > 0 {
            self.flush_encoder().await?;
        }
        self.pump();
        Ok(())
    }

    /// Close the encoder worker.
    pub async fn shutdown(&mut self) -> SpliceResult<()> {
        self.quiesce().await?;
        self.encoder.close().await
    }
}

/// Read keys from the warm tier in the background, one task per rebuild.
fn spawn_recoveries(
    store: Arc<dyn WarmStore>,
    tx: mpsc::UnboundedSender<RecoveryResult>,
    sequence_id: SequenceId,
    namespace: String,
    keys: Vec<SourceKey>,
) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        tracing::warn!("No runtime for warm-tier recovery");
        return;
    };
    runtime.spawn(async move {
        for key in keys {
            let packet = match store.read(&namespace, &key.storage_key()).await {
                Ok(Some(bytes)) => {
                    let packet = Packet::from_stored(&bytes);
                    if packet.is_none() {
                        tracing::warn!(key = %key.storage_key(), "Corrupt warm-tier entry");
                    }
                    packet
                }
                Ok(None) => None,
                Err(e) => {
                    tracing::warn!(error = %e, "Warm-tier read failed");
                    None
                }
            };
            let result = RecoveryResult {
                sequence_id: sequence_id.clone(),
                namespace: namespace.clone(),
                key,
                packet,
            };
            if tx.send(result).is_err() {
                break;
            }
        }
    });
}

/// Split ascending-or-wrapped frame numbers into contiguous runs.
fn contiguous_runs(frames: impl Iterator<Item = u64>) -> Vec<Range<u64>> {
    let mut runs: Vec<Range<u64>> = Vec::new();
    for frame in frames {
        match runs.last_mut() {
            Some(run) if run.end == frame => run.end += 1,
            _ => runs.push(frame..frame + 1),
        }
    }
    runs
}
