//! Hybrid stitching.
//!
//! Produces one elementary stream from planned segments. Copy and
//! conform-copy segments are validated as a whole (keyframe first, every
//! frame present) and demoted to render if they fail; nothing from a demoted
//! segment reaches the output. Render segments are decoded ahead, then go
//! through the shared encoder channel opening with a forced keyframe and
//! ending with a flush. A render that does not open on a keyframe fails the
//! strategy.
//!
//! Output timestamps come from a single counter of emitted frames.

use std::collections::HashSet;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use splice_common::{EmissionCounter, FrameClock, SpliceError, SpliceResult};
use splice_conform::{ConformEngine, CorrelationId, EncodedPacket, EncoderCompletion, Packet};
use splice_timeline::{EncoderSettings, Sequence};
use tokio_util::sync::CancellationToken;

use crate::export::{ExportProgress, ExportStage, ProgressCallback};
use crate::planner::{Segment, SegmentKind, SegmentPlan};
use crate::source::SourceMedia;

/// One packet's place in a [`Bitstream`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PacketEntry {
    pub offset: u64,
    pub len: u64,
    pub timestamp_us: u64,
    pub keyframe: bool,
    pub origin: SegmentKind,
}

/// Raw elementary stream plus a packet index. Decoder configuration is
/// inlined ahead of each keyframe that carries one.
#[derive(Debug, Clone, Default)]
pub struct Bitstream {
    data: BytesMut,
    packets: Vec<PacketEntry>,
}

impl Bitstream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, packet: &Packet, timestamp_us: u64, origin: SegmentKind) {
        let offset = self.data.len() as u64;
        if packet.is_keyframe() {
            if let Some(config) = packet.decoder_config() {
                self.data.extend_from_slice(config);
            }
        }
        self.data.extend_from_slice(packet.data());
        self.packets.push(PacketEntry {
            offset,
            len: self.data.len() as u64 - offset,
            timestamp_us,
            keyframe: packet.is_keyframe(),
            origin,
        });
    }

    /// Append another stream after this one.
    pub fn append(&mut self, other: Bitstream) {
        let base = self.data.len() as u64;
        self.data.extend_from_slice(&other.data);
        self.packets
            .extend(other.packets.into_iter().map(|entry| PacketEntry {
                offset: entry.offset + base,
                ..entry
            }));
    }

    pub fn frame_count(&self) -> u64 {
        self.packets.len() as u64
    }

    pub fn byte_len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn keyframe_count(&self) -> usize {
        self.packets.iter().filter(|p| p.keyframe).count()
    }

    pub fn entries(&self) -> &[PacketEntry] {
        &self.packets
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Bytes {
        self.data.freeze()
    }
}

/// How one planned segment ended up being produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StitchedSegment {
    pub planned: SegmentKind,
    pub produced: SegmentKind,
    pub start_frame: u64,
    pub end_frame: u64,
    pub bytes: u64,
}

#[derive(Debug)]
pub struct Stitched {
    pub bitstream: Bitstream,
    pub segments: Vec<StitchedSegment>,
}

impl Stitched {
    /// Segments produced differently than planned.
    pub fn demoted(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| s.planned != s.produced)
            .count()
    }

    pub fn frames_produced_as(&self, kind: SegmentKind) -> u64 {
        self.segments
            .iter()
            .filter(|s| s.produced == kind)
            .map(|s| s.end_frame - s.start_frame)
            .sum()
    }
}

#[derive(Debug)]
pub enum StitchOutcome {
    Complete(Stitched),
    /// The strategy does not apply; nothing was produced.
    Demoted { reason: String },
    Cancelled,
}

enum SegmentResult {
    Produced(Bitstream),
    Demoted(String),
    Cancelled,
}

/// Assembles an export range into one bitstream.
pub struct Stitcher<'a> {
    engine: &'a mut ConformEngine,
    source: &'a dyn SourceMedia,
    sequence: &'a Sequence,
    settings: &'a EncoderSettings,
    cancel: &'a CancellationToken,
    progress: Option<&'a ProgressCallback>,
    counter: EmissionCounter,
    frames_done: u64,
    total_frames: u64,
    started: Instant,
}

impl<'a> Stitcher<'a> {
    pub fn new(
        engine: &'a mut ConformEngine,
        source: &'a dyn SourceMedia,
        sequence: &'a Sequence,
        settings: &'a EncoderSettings,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            engine,
            source,
            sequence,
            settings,
            cancel,
            progress: None,
            counter: EmissionCounter::new(clock_for(settings)),
            frames_done: 0,
            total_frames: 0,
            started: Instant::now(),
        }
    }

    pub fn with_progress(mut self, progress: Option<&'a ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    /// Whole range copied from one source clip.
    pub async fn stream_copy(&mut self, plan: &SegmentPlan) -> SpliceResult<StitchOutcome> {
        if !plan.is_single(SegmentKind::Copy) {
            return Ok(StitchOutcome::Demoted {
                reason: "range is not a single copy segment".to_string(),
            });
        }
        self.single_segment(plan, SegmentKind::Copy).await
    }

    /// Whole range concatenated from the conform cache.
    pub async fn conform_copy(&mut self, plan: &SegmentPlan) -> SpliceResult<StitchOutcome> {
        if !plan.is_single(SegmentKind::ConformCopy) {
            return Ok(StitchOutcome::Demoted {
                reason: "range is not fully conformed".to_string(),
            });
        }
        self.single_segment(plan, SegmentKind::ConformCopy).await
    }

    /// Process every segment in order, demoting those that fail validation.
    pub async fn stitch(&mut self, plan: &SegmentPlan) -> SpliceResult<StitchOutcome> {
        self.reset(plan);
        let mut out = Bitstream::new();
        let mut segments = Vec::with_capacity(plan.segments.len());

        for segment in &plan.segments {
            if self.cancel.is_cancelled() {
                return Ok(StitchOutcome::Cancelled);
            }
            let result = match segment.kind {
                SegmentKind::Copy => self.copy_segment(segment).await?,
                SegmentKind::ConformCopy => self.conform_segment(segment),
                SegmentKind::Render => self.render_segment(segment).await?,
            };
            let (produced, bits) = match result {
                SegmentResult::Produced(bits) => (segment.kind, bits),
                SegmentResult::Cancelled => return Ok(StitchOutcome::Cancelled),
                SegmentResult::Demoted(reason) => {
                    tracing::info!(
                        kind = segment.kind.as_str(),
                        start = segment.start_frame,
                        end = segment.end_frame,
                        reason = %reason,
                        "Demoting segment to render"
                    );
                    match self.render_segment(segment).await? {
                        SegmentResult::Produced(bits) => (SegmentKind::Render, bits),
                        SegmentResult::Cancelled => return Ok(StitchOutcome::Cancelled),
                        SegmentResult::Demoted(reason) => return Err(SpliceError::export(reason)),
                    }
                }
            };
            self.commit(segment, produced, &bits);
            segments.push(StitchedSegment {
                planned: segment.kind,
                produced,
                start_frame: segment.start_frame,
                end_frame: segment.end_frame,
                bytes: bits.byte_len(),
            });
            out.append(bits);
        }

        Ok(StitchOutcome::Complete(Stitched {
            bitstream: out,
            segments,
        }))
    }

    async fn single_segment(
        &mut self,
        plan: &SegmentPlan,
        kind: SegmentKind,
    ) -> SpliceResult<StitchOutcome> {
        self.reset(plan);
        let Some(segment) = plan.segments.first() else {
            return Ok(StitchOutcome::Demoted {
                reason: "empty plan".to_string(),
            });
        };
        let result = match kind {
            SegmentKind::Copy => self.copy_segment(segment).await?,
            SegmentKind::ConformCopy => self.conform_segment(segment),
            SegmentKind::Render => self.render_segment(segment).await?,
        };
        Ok(match result {
            SegmentResult::Produced(bitstream) => {
                self.commit(segment, kind, &bitstream);
                let bytes = bitstream.byte_len();
                StitchOutcome::Complete(Stitched {
                    bitstream,
                    segments: vec![StitchedSegment {
                        planned: kind,
                        produced: kind,
                        start_frame: segment.start_frame,
                        end_frame: segment.end_frame,
                        bytes,
                    }],
                })
            }
            SegmentResult::Demoted(reason) => StitchOutcome::Demoted { reason },
            SegmentResult::Cancelled => StitchOutcome::Cancelled,
        })
    }

    fn reset(&mut self, plan: &SegmentPlan) {
        self.counter = EmissionCounter::new(clock_for(self.settings));
        self.frames_done = 0;
        self.total_frames = plan.total_frames();
        self.started = Instant::now();
    }

    fn commit(&mut self, segment: &Segment, produced: SegmentKind, bits: &Bitstream) {
        if produced != SegmentKind::Render {
            self.counter.advance(bits.frame_count());
        }
        self.frames_done += segment.len();
        let stage = match produced {
            SegmentKind::Copy => ExportStage::Copying,
            SegmentKind::ConformCopy => ExportStage::Stitching,
            SegmentKind::Render => ExportStage::Rendering,
        };
        self.report(stage, self.frames_done);
    }

    async fn copy_segment(&mut self, segment: &Segment) -> SpliceResult<SegmentResult> {
        if self.cancel.is_cancelled() {
            return Ok(SegmentResult::Cancelled);
        }
        let Some(clip) = segment
            .source_clip
            .as_ref()
            .and_then(|id| self.sequence.find_clip(id))
        else {
            return Ok(SegmentResult::Demoted("source clip is gone".to_string()));
        };
        let source_start = clip.source_frame_at(segment.start_frame);
        let packets = match self
            .source
            .extract_packets(clip, source_start, segment.len())
            .await
        {
            Ok(packets) => packets,
            Err(e) => {
                tracing::warn!(clip = %clip.id, error = %e, "Source packet extraction failed");
                return Ok(SegmentResult::Demoted(format!("extraction failed: {e}")));
            }
        };
        Ok(self.packets_to_segment(packets, segment, SegmentKind::Copy))
    }

    fn conform_segment(&mut self, segment: &Segment) -> SegmentResult {
        let Some(state) = self
            .engine
            .state_for_export(&self.sequence.id, self.settings)
        else {
            return SegmentResult::Demoted("no conform cache for these settings".to_string());
        };
        let mut packets = Vec::with_capacity(segment.len() as usize);
        for frame in segment.frames() {
            match state.get_packet(frame) {
                Some(packet) => packets.push(packet.clone()),
                None => {
                    return SegmentResult::Demoted(format!("frame {frame} has no conform packet"))
                }
            }
        }
        self.packets_to_segment(packets, segment, SegmentKind::ConformCopy)
    }

    /// Validate a complete run of existing packets and lay it out.
    fn packets_to_segment(
        &self,
        packets: Vec<Packet>,
        segment: &Segment,
        origin: SegmentKind,
    ) -> SegmentResult {
        if packets.len() as u64 != segment.len() {
            return SegmentResult::Demoted(format!(
                "expected {} packets, found {}",
                segment.len(),
                packets.len()
            ));
        }
        if !packets.first().is_some_and(Packet::is_keyframe) {
            return SegmentResult::Demoted("segment does not start on a keyframe".to_string());
        }
        let mut counter = self.counter.clone();
        let mut bits = Bitstream::new();
        for packet in &packets {
            bits.push(packet, counter.next_timestamp_us(), origin);
        }
        SegmentResult::Produced(bits)
    }

    async fn render_segment(&mut self, segment: &Segment) -> SpliceResult<SegmentResult> {
        if self.cancel.is_cancelled() {
            return Ok(SegmentResult::Cancelled);
        }
        self.engine
            .ensure_decoded(&self.sequence.id, segment.start_frame..segment.end_frame)
            .await?;
        self.engine.ensure_encoder()?;
        self.engine.ensure_configured(self.settings).await?;
        let limit = self.engine.config().render_max_outstanding;

        let mut expected: HashSet<CorrelationId> = HashSet::new();
        let mut collected: Vec<EncodedPacket> = Vec::with_capacity(segment.len() as usize);
        for (done, frame) in segment.frames().enumerate() {
            let cancel = self.cancel.clone();
            let has_room = self
                .engine
                .wait_for_capacity(limit, || cancel.is_cancelled())
                .await?;
            if !has_room || self.cancel.is_cancelled() {
                self.abandon_render().await;
                return Ok(SegmentResult::Cancelled);
            }
            let timestamp_us = self.counter.next_timestamp_us();
            let id = self
                .engine
                .submit_render_frame(
                    self.sequence,
                    frame,
                    self.settings,
                    timestamp_us,
                    frame == segment.start_frame,
                )
                .await?;
            expected.insert(id);
            self.collect_ready(&mut expected, &mut collected)?;
            self.report(ExportStage::Rendering, self.frames_done + done as u64 + 1);
        }
        self.engine.flush_encoder().await?;
        self.collect_ready(&mut expected, &mut collected)?;
        if !expected.is_empty() {
            return Err(SpliceError::export(format!(
                "{} rendered frames never came back from the encoder",
                expected.len()
            )));
        }

        if !collected.first().is_some_and(|p| p.packet.is_keyframe()) {
            return Err(SpliceError::export(format!(
                "render segment at frame {} does not open with a keyframe",
                segment.start_frame
            )));
        }
        let mut bits = Bitstream::new();
        for encoded in &collected {
            bits.push(&encoded.packet, encoded.timestamp_us, SegmentKind::Render);
        }
        Ok(SegmentResult::Produced(bits))
    }

    /// Move this segment's completions out of the engine, in arrival order.
    fn collect_ready(
        &mut self,
        expected: &mut HashSet<CorrelationId>,
        collected: &mut Vec<EncodedPacket>,
    ) -> SpliceResult<()> {
        while let Some(completion) = self.engine.take_foreign() {
            match completion {
                EncoderCompletion::Packet(encoded) => {
                    if expected.remove(&encoded.id) {
                        collected.push(encoded);
                    } else {
                        tracing::debug!(id = encoded.id, "Dropping packet from an earlier render");
                    }
                }
                EncoderCompletion::Failed { id, error } if expected.contains(&id) => {
                    return Err(SpliceError::export(format!("render frame failed: {error}")));
                }
                EncoderCompletion::Failed { .. } => {}
                EncoderCompletion::Crashed { message } => {
                    return Err(SpliceError::channel_crash(message));
                }
            }
        }
        Ok(())
    }

    async fn abandon_render(&mut self) {
        if let Err(e) = self.engine.flush_encoder().await {
            tracing::debug!(error = %e, "Flush after cancellation failed");
        }
        while self.engine.take_foreign().is_some() {}
    }

    fn report(&self, stage: ExportStage, frames_done: u64) {
        let Some(progress) = self.progress else {
            return;
        };
        let fraction = if self.total_frames == 0 {
            1.0
        } else {
            frames_done as f64 / self.total_frames as f64
        };
        let elapsed = self.started.elapsed().as_secs_f64();
        let eta_secs = if fraction > 0.0 {
            elapsed / fraction * (1.0 - fraction)
        } else {
            0.0
        };
        progress(ExportProgress {
            progress: fraction.clamp(0.0, 1.0),
            frames_done,
            total_frames: self.total_frames,
            eta_secs,
            stage,
        });
    }
}

fn clock_for(settings: &EncoderSettings) -> FrameClock {
    FrameClock::new(settings.fps.num, settings.fps.den)
}
