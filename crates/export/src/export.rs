//! Export jobs and the strategy fallback chain.

use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use splice_common::{SpliceError, SpliceResult};
use splice_conform::ConformEngine;
use splice_timeline::{EncoderSettings, Sequence, SequenceId};
use tokio_util::sync::CancellationToken;

use crate::mux::{MuxMetadata, Muxer};
use crate::planner::{plan_segments, NoConform, SegmentKind, SegmentPlan};
use crate::source::SourceMedia;
use crate::stitcher::{StitchOutcome, Stitched, Stitcher};

/// An export request.
#[derive(Debug, Clone)]
pub struct ExportJob {
    pub sequence_id: SequenceId,

    /// Frames to export; the whole sequence when unset.
    pub range: Option<Range<u64>>,

    /// Encoder settings; the sequence's conform settings when unset.
    pub settings: Option<EncoderSettings>,

    /// Output file path.
    pub output_path: PathBuf,

    /// Container format passed to the muxer.
    pub format: String,

    /// Audio to hand to the muxer.
    pub audio_path: Option<PathBuf>,
}

impl ExportJob {
    /// Export a whole sequence to a raw stream.
    pub fn new(sequence_id: SequenceId, output_path: impl Into<PathBuf>) -> Self {
        Self {
            sequence_id,
            range: None,
            settings: None,
            output_path: output_path.into(),
            format: "raw".to_string(),
            audio_path: None,
        }
    }

    pub fn with_range(mut self, range: Range<u64>) -> Self {
        self.range = Some(range);
        self
    }

    pub fn with_settings(mut self, settings: EncoderSettings) -> Self {
        self.settings = Some(settings);
        self
    }
}

/// Progress callback for export.
pub type ProgressCallback = Box<dyn Fn(ExportProgress) + Send + Sync>;

/// Export progress report.
#[derive(Debug, Clone)]
pub struct ExportProgress {
    /// Current progress [0.0, 1.0].
    pub progress: f64,

    /// Output frames produced so far.
    pub frames_done: u64,

    /// Frames in the export range.
    pub total_frames: u64,

    /// Estimated time remaining in seconds.
    pub eta_secs: f64,

    /// Current stage.
    pub stage: ExportStage,
}

/// Stages of the export process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExportStage {
    Preparing,
    Planning,
    Copying,
    Stitching,
    Rendering,
    Muxing,
    Complete,
}

/// Strategy that produced the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportStrategy {
    StreamCopy,
    ConformCopy,
    Hybrid,
    FullRender,
}

/// Summary of a finished export.
#[derive(Debug, Clone, Serialize)]
pub struct ExportReport {
    pub output_path: PathBuf,
    pub strategy: ExportStrategy,
    pub frames: u64,
    pub bytes: u64,
    pub copied_frames: u64,
    pub conformed_frames: u64,
    pub rendered_frames: u64,
    pub demoted_segments: usize,
    pub elapsed_ms: u64,
}

#[derive(Debug)]
pub enum ExportOutcome {
    Completed(ExportReport),
    /// Cancelled before completion; nothing was written.
    Cancelled,
}

/// Run an export against the engine.
///
/// Idle fill is blocked for the duration and the engine is returned to
/// normal operation afterwards, whatever the outcome. An export never
/// encodes into or invalidates the conform cache; it only reads parked
/// packets for its range back from the warm tier.
pub async fn run_export(
    engine: &mut ConformEngine,
    source: &dyn SourceMedia,
    muxer: &dyn Muxer,
    job: ExportJob,
    cancel: &CancellationToken,
    progress: Option<&ProgressCallback>,
) -> SpliceResult<ExportOutcome> {
    let activity = engine.activity().clone();
    activity.set_export(true);
    let result = match engine.begin_export().await {
        Ok(()) => export_inner(engine, source, muxer, job, cancel, progress).await,
        Err(e) => Err(e),
    };
    engine.end_export();
    activity.set_export(false);

    match &result {
        Ok(ExportOutcome::Completed(report)) => tracing::info!(
            output = %report.output_path.display(),
            strategy = ?report.strategy,
            frames = report.frames,
            rendered = report.rendered_frames,
            elapsed_ms = report.elapsed_ms,
            "Export complete"
        ),
        Ok(ExportOutcome::Cancelled) => tracing::info!("Export cancelled"),
        Err(e) => tracing::error!(error = %e, "Export failed"),
    }
    result
}

async fn export_inner(
    engine: &mut ConformEngine,
    source: &dyn SourceMedia,
    muxer: &dyn Muxer,
    job: ExportJob,
    cancel: &CancellationToken,
    progress: Option<&ProgressCallback>,
) -> SpliceResult<ExportOutcome> {
    let started = Instant::now();
    report(progress, ExportStage::Preparing, 0, 0);

    let sequence: Arc<Sequence> = engine
        .sequence(&job.sequence_id)
        .ok_or_else(|| SpliceError::sequence_not_found(job.sequence_id.as_str()))?;
    let settings = match job.settings.clone() {
        Some(settings) => settings,
        None => engine
            .state(&job.sequence_id)
            .map(|state| state.settings().clone())
            .unwrap_or_else(|| engine.default_settings(&sequence)),
    };
    let problems = settings.validate();
    if !problems.is_empty() {
        return Err(SpliceError::configuration(problems.join("; ")));
    }
    let range = job.range.clone().unwrap_or(0..sequence.duration_frames);
    if range.is_empty() || range.end > sequence.duration_frames {
        return Err(SpliceError::export(format!(
            "range {}..{} is outside sequence of {} frames",
            range.start, range.end, sequence.duration_frames
        )));
    }

    tracing::info!(
        sequence = %sequence.id,
        start = range.start,
        end = range.end,
        codec = settings.codec.as_str(),
        output = %job.output_path.display(),
        "Starting export"
    );

    report(progress, ExportStage::Planning, 0, range.end - range.start);
    if engine.state_for_export(&sequence.id, &settings).is_some() {
        let restored = engine.restore_parked(&sequence.id, range.clone()).await;
        if restored > 0 {
            tracing::debug!(restored, "Restored parked packets for export");
        }
    }
    let plan = match engine.state_for_export(&sequence.id, &settings) {
        Some(state) => plan_segments(&sequence, &settings, range.clone(), state),
        None => plan_segments(&sequence, &settings, range.clone(), &NoConform),
    };

    let (strategy, stitched) = {
        let mut stitcher = Stitcher::new(engine, source, &sequence, &settings, cancel)
            .with_progress(progress);
        match run_strategies(&mut stitcher, &plan).await? {
            Some(found) => found,
            None => return Ok(ExportOutcome::Cancelled),
        }
    };
    if cancel.is_cancelled() {
        return Ok(ExportOutcome::Cancelled);
    }

    let frames = stitched.bitstream.frame_count();
    if frames != plan.total_frames() {
        return Err(SpliceError::export(format!(
            "stitched {frames} frames, expected {}",
            plan.total_frames()
        )));
    }

    report(progress, ExportStage::Muxing, frames, frames);
    let metadata = MuxMetadata {
        codec: settings.codec,
        format: job.format.clone(),
        width: settings.width,
        height: settings.height,
        fps: settings.fps,
        duration_secs: frames as f64 / settings.fps.as_f64(),
        frame_count: frames,
        created_at: Utc::now(),
    };
    let output_path = muxer
        .mux(
            &stitched.bitstream,
            job.audio_path.as_deref(),
            &metadata,
            &job.output_path,
        )
        .await?;
    report(progress, ExportStage::Complete, frames, frames);

    Ok(ExportOutcome::Completed(ExportReport {
        output_path,
        strategy,
        frames,
        bytes: stitched.bitstream.byte_len(),
        copied_frames: stitched.frames_produced_as(SegmentKind::Copy),
        conformed_frames: stitched.frames_produced_as(SegmentKind::ConformCopy),
        rendered_frames: stitched.frames_produced_as(SegmentKind::Render),
        demoted_segments: stitched.demoted(),
        elapsed_ms: started.elapsed().as_millis() as u64,
    }))
}

/// Try each strategy in turn. `None` means cancelled.
async fn run_strategies(
    stitcher: &mut Stitcher<'_>,
    plan: &SegmentPlan,
) -> SpliceResult<Option<(ExportStrategy, Stitched)>> {
    if plan.is_single(SegmentKind::Copy) {
        match attempt(ExportStrategy::StreamCopy, stitcher.stream_copy(plan).await) {
            Attempt::Done(stitched) => return Ok(Some((ExportStrategy::StreamCopy, stitched))),
            Attempt::Cancelled => return Ok(None),
            Attempt::Next => {}
        }
    }
    if plan.is_single(SegmentKind::ConformCopy) {
        match attempt(ExportStrategy::ConformCopy, stitcher.conform_copy(plan).await) {
            Attempt::Done(stitched) => return Ok(Some((ExportStrategy::ConformCopy, stitched))),
            Attempt::Cancelled => return Ok(None),
            Attempt::Next => {}
        }
    }
    if !plan.is_single(SegmentKind::Render) {
        match attempt(ExportStrategy::Hybrid, stitcher.stitch(plan).await) {
            Attempt::Done(stitched) => return Ok(Some((ExportStrategy::Hybrid, stitched))),
            Attempt::Cancelled => return Ok(None),
            Attempt::Next => {}
        }
    }
    match stitcher.stitch(&plan.full_render()).await? {
        StitchOutcome::Complete(stitched) => Ok(Some((ExportStrategy::FullRender, stitched))),
        StitchOutcome::Cancelled => Ok(None),
        StitchOutcome::Demoted { reason } => Err(SpliceError::export(reason)),
    }
}

enum Attempt {
    Done(Stitched),
    Next,
    Cancelled,
}

fn attempt(strategy: ExportStrategy, result: SpliceResult<StitchOutcome>) -> Attempt {
    match result {
        Ok(StitchOutcome::Complete(stitched)) => Attempt::Done(stitched),
        Ok(StitchOutcome::Cancelled) => Attempt::Cancelled,
        Ok(StitchOutcome::Demoted { reason }) => {
            tracing::info!(strategy = ?strategy, reason = %reason, "Export strategy not applicable");
            Attempt::Next
        }
        Err(e) => {
            tracing::warn!(strategy = ?strategy, error = %e, "Export strategy failed; falling back");
            Attempt::Next
        }
    }
}

fn report(progress: Option<&ProgressCallback>, stage: ExportStage, done: u64, total: u64) {
    if let Some(cb) = progress {
        cb(ExportProgress {
            progress: if total == 0 { 0.0 } else { done as f64 / total as f64 },
            frames_done: done,
            total_frames: total,
            eta_secs: 0.0,
            stage,
        });
    }
}
