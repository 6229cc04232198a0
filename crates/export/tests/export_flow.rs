use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use splice_common::{ConformConfig, SpliceError};
use splice_conform::synthetic::{
    SyntheticCompositor, SyntheticDecoder, SyntheticEncoder, SyntheticEncoderOptions,
};
use splice_conform::{
    ActivityFlags, BatchStatus, ConformEngine, DecodeAhead, EncoderChannel, MemoryStore, WarmStore,
};
use splice_export::{
    run_export, ExportJob, ExportOutcome, ExportProgress, ExportReport, ExportStage,
    ExportStrategy, ProgressCallback, RawMuxer, Segment, SegmentKind, SegmentPlan,
    StitchOutcome, Stitcher, SyntheticSource,
};
use splice_timeline::{Clip, FrameRate, MediaInfo, Sequence, SequenceId, Track, VideoCodec};
use tokio_util::sync::CancellationToken;

struct Harness {
    engine: ConformEngine,
    decoder: Arc<SyntheticDecoder>,
    compositor: Arc<SyntheticCompositor>,
    source: SyntheticSource,
}

fn harness_with(config: ConformConfig, options: SyntheticEncoderOptions) -> Harness {
    let encoder = EncoderChannel::spawn(SyntheticEncoder::factory(options)).unwrap();
    let decoder = Arc::new(SyntheticDecoder::new());
    let compositor = Arc::new(SyntheticCompositor::new());
    let engine = ConformEngine::new(
        config,
        encoder,
        Arc::new(MemoryStore::new()) as Arc<dyn WarmStore>,
        decoder.clone(),
        compositor.clone(),
        ActivityFlags::new(),
    )
    .unwrap();
    Harness {
        engine,
        decoder,
        compositor,
        source: SyntheticSource::new(30),
    }
}

fn harness() -> Harness {
    harness_with(ConformConfig::default(), SyntheticEncoderOptions::default())
}

fn media(size: u32) -> MediaInfo {
    MediaInfo::video(VideoCodec::H264, size, size, FrameRate::integer(30))
}

fn sequence(clips: Vec<Clip>, duration: u64) -> Sequence {
    let mut seq = Sequence::new("main", 16, 16, FrameRate::integer(30), duration);
    let mut track = Track::video("v1");
    track.clips = clips;
    seq.tracks.push(track);
    seq
}

fn output_dir(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("splice-export-{name}-{}", std::process::id()))
}

async fn fill_until_complete(engine: &mut ConformEngine, id: &SequenceId) {
    for _ in 0..200 {
        match engine.fill_batch(id).await {
            Ok(outcome) if outcome.status == BatchStatus::Complete => return,
            Ok(_) => {}
            Err(e) => panic!("fill failed: {e}"),
        }
    }
    panic!("sequence never finished conforming");
}

async fn export(
    h: &mut Harness,
    job: ExportJob,
    cancel: &CancellationToken,
    progress: Option<&ProgressCallback>,
) -> ExportOutcome {
    run_export(&mut h.engine, &h.source, &RawMuxer::new(), job, cancel, progress)
        .await
        .unwrap()
}

fn completed(outcome: ExportOutcome) -> ExportReport {
    match outcome {
        ExportOutcome::Completed(report) => report,
        ExportOutcome::Cancelled => panic!("export was cancelled"),
    }
}

fn sidecar(output: &std::path::Path) -> serde_json::Value {
    let text = std::fs::read_to_string(RawMuxer::sidecar_path(output)).unwrap();
    serde_json::from_str(&text).unwrap()
}

#[tokio::test]
async fn single_compatible_clip_is_stream_copied() {
    let mut h = harness();
    let id = SequenceId::new("main");
    h.engine
        .update_sequence(sequence(vec![Clip::new("a", media(16), 0, 90)], 90))
        .unwrap();

    let dir = output_dir("copy");
    let output = dir.join("out.h264");
    let report = completed(
        export(
            &mut h,
            ExportJob::new(id, &output),
            &CancellationToken::new(),
            None,
        )
        .await,
    );

    assert_eq!(report.strategy, ExportStrategy::StreamCopy);
    assert_eq!(report.frames, 90);
    assert_eq!(report.copied_frames, 90);
    assert_eq!(report.rendered_frames, 0);
    assert_eq!(h.compositor.composite_count(), 0);
    assert_eq!(h.source.extracted_count(), 90);
    assert_eq!(std::fs::metadata(&output).unwrap().len(), report.bytes);

    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn idle_fill_then_export_copies_conformed_packets() {
    let mut h = harness();
    let id = SequenceId::new("main");
    // Source geometry differs from the sequence, so only conform packets can
    // avoid a render.
    h.engine
        .update_sequence(sequence(vec![Clip::new("a", media(32), 0, 90)], 90))
        .unwrap();
    fill_until_complete(&mut h.engine, &id).await;

    assert!(h.engine.is_range_conformed(&id, 0, 60));
    assert!(h.engine.get_packet(&id, 30).is_some());
    let composites = h.compositor.composite_count();

    let dir = output_dir("conform");
    let output = dir.join("out.h264");
    let report = completed(
        export(
            &mut h,
            ExportJob::new(id.clone(), &output).with_range(0..60),
            &CancellationToken::new(),
            None,
        )
        .await,
    );

    assert_eq!(report.strategy, ExportStrategy::ConformCopy);
    assert_eq!(report.frames, 60);
    assert_eq!(report.conformed_frames, 60);
    assert_eq!(report.rendered_frames, 0);
    assert_eq!(h.compositor.composite_count(), composites);
    // Export never changes what is cached.
    assert!(h.engine.coverage(&id).unwrap().is_complete());

    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn gap_is_rendered_between_copied_runs() {
    let mut h = harness();
    let id = SequenceId::new("main");
    h.engine
        .update_sequence(sequence(
            vec![
                Clip::new("a", media(16), 0, 30),
                Clip::new("b", media(16), 31, 29),
            ],
            60,
        ))
        .unwrap();

    let dir = output_dir("hybrid");
    let output = dir.join("out.h264");
    let report = completed(
        export(
            &mut h,
            ExportJob::new(id, &output),
            &CancellationToken::new(),
            None,
        )
        .await,
    );

    assert_eq!(report.strategy, ExportStrategy::Hybrid);
    assert_eq!(report.frames, 60);
    assert_eq!(report.copied_frames, 59);
    assert_eq!(report.rendered_frames, 1);
    assert_eq!(h.compositor.composite_count(), 1);

    let json = sidecar(&output);
    let packets = json["packets"].as_array().unwrap();
    assert_eq!(packets.len(), 60);
    assert_eq!(packets[30]["origin"], "render");
    assert_eq!(packets[30]["keyframe"], true);
    assert_eq!(packets[31]["origin"], "copy");
    assert_eq!(packets[31]["keyframe"], true);

    let total: u64 = packets.iter().map(|p| p["len"].as_u64().unwrap()).sum();
    assert_eq!(total, report.bytes);
    assert_eq!(std::fs::metadata(&output).unwrap().len(), report.bytes);

    let stamps: Vec<u64> = packets
        .iter()
        .map(|p| p["timestamp_us"].as_u64().unwrap())
        .collect();
    assert!(stamps.windows(2).all(|w| w[0] < w[1]));

    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn copy_starting_mid_gop_is_demoted_to_render() {
    let mut h = harness();
    let id = SequenceId::new("main");
    let mut clip = Clip::new("a", media(16), 0, 40);
    clip.source_in_frame = 10;
    h.engine.update_sequence(sequence(vec![clip], 40)).unwrap();

    let dir = output_dir("demote");
    let output = dir.join("out.h264");
    let report = completed(
        export(
            &mut h,
            ExportJob::new(id, &output),
            &CancellationToken::new(),
            None,
        )
        .await,
    );

    assert_eq!(report.strategy, ExportStrategy::Hybrid);
    assert_eq!(report.demoted_segments, 1);
    assert_eq!(report.rendered_frames, 40);
    assert_eq!(report.copied_frames, 0);

    let json = sidecar(&output);
    assert_eq!(json["packets"][0]["keyframe"], true);
    assert_eq!(json["packets"][0]["origin"], "render");

    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn cancelled_export_writes_nothing() {
    let mut h = harness();
    let id = SequenceId::new("main");
    h.engine
        .update_sequence(sequence(vec![Clip::new("a", media(32), 0, 30)], 30))
        .unwrap();

    let dir = output_dir("cancel");
    let output = dir.join("out.h264");
    let cancel = CancellationToken::new();
    cancel.cancel();
    let outcome = export(&mut h, ExportJob::new(id, &output), &cancel, None).await;

    assert!(matches!(outcome, ExportOutcome::Cancelled));
    assert!(!output.exists());
    assert!(!h.engine.activity().is_exporting());
}

#[tokio::test]
async fn progress_reaches_complete() {
    let mut h = harness();
    let id = SequenceId::new("main");
    h.engine
        .update_sequence(sequence(vec![Clip::new("a", media(32), 0, 20)], 20))
        .unwrap();

    let seen: Arc<Mutex<Vec<ExportProgress>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let callback: ProgressCallback = Box::new(move |p: ExportProgress| sink.lock().unwrap().push(p));

    let dir = output_dir("progress");
    let report = completed(
        export(
            &mut h,
            ExportJob::new(id, dir.join("out.h264")),
            &CancellationToken::new(),
            Some(&callback),
        )
        .await,
    );
    assert_eq!(report.strategy, ExportStrategy::FullRender);

    let seen = seen.lock().unwrap();
    assert!(seen.iter().any(|p| p.stage == ExportStage::Rendering));
    let last = seen.last().unwrap();
    assert_eq!(last.stage, ExportStage::Complete);
    assert_eq!(last.frames_done, 20);
    assert!(seen.iter().all(|p| (0.0..=1.0).contains(&p.progress)));

    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn range_outside_sequence_is_rejected() {
    let mut h = harness();
    let id = SequenceId::new("main");
    h.engine
        .update_sequence(sequence(vec![Clip::new("a", media(16), 0, 30)], 30))
        .unwrap();

    let result = run_export(
        &mut h.engine,
        &h.source,
        &RawMuxer::new(),
        ExportJob::new(id, output_dir("range").join("out.h264")).with_range(10..45),
        &CancellationToken::new(),
        None,
    )
    .await;
    assert!(result.is_err());
    assert!(!h.engine.activity().is_exporting());
}

#[tokio::test]
async fn export_after_a_purge_copies_parked_packets() {
    let config = ConformConfig {
        ram_cap_bytes: 400,
        ..ConformConfig::default()
    };
    let mut h = harness_with(config, SyntheticEncoderOptions::default());
    let id = SequenceId::new("main");
    h.engine
        .update_sequence(sequence(vec![Clip::new("a", media(32), 0, 40)], 40))
        .unwrap();
    fill_until_complete(&mut h.engine, &id).await;
    assert!(h.engine.coverage(&id).unwrap().parked_frames > 0);
    let composites = h.compositor.composite_count();

    let dir = output_dir("parked");
    let output = dir.join("out.h264");
    let report = completed(
        export(
            &mut h,
            ExportJob::new(id.clone(), &output),
            &CancellationToken::new(),
            None,
        )
        .await,
    );

    assert_eq!(report.strategy, ExportStrategy::ConformCopy);
    assert_eq!(report.conformed_frames, 40);
    assert_eq!(report.rendered_frames, 0);
    assert_eq!(h.compositor.composite_count(), composites);

    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn conform_run_opening_mid_gop_is_demoted_in_a_hybrid_plan() {
    let mut h = harness();
    let id = SequenceId::new("main");
    // One clip on [0, 60) followed by a gap up to 70.
    h.engine
        .update_sequence(sequence(vec![Clip::new("a", media(32), 0, 60)], 70))
        .unwrap();
    fill_until_complete(&mut h.engine, &id).await;
    assert!(!h.engine.get_packet(&id, 5).unwrap().is_keyframe());

    let dir = output_dir("mid-gop");
    let output = dir.join("out.h264");
    let report = completed(
        export(
            &mut h,
            ExportJob::new(id, &output).with_range(5..70),
            &CancellationToken::new(),
            None,
        )
        .await,
    );

    assert_eq!(report.strategy, ExportStrategy::Hybrid);
    assert_eq!(report.demoted_segments, 1);
    assert_eq!(report.conformed_frames, 0);
    assert_eq!(report.rendered_frames, 65);

    let json = sidecar(&output);
    assert_eq!(json["packets"][0]["keyframe"], true);
    assert_eq!(json["packets"][0]["origin"], "render");

    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn conform_segment_with_a_missing_packet_is_rendered() {
    let mut h = harness();
    let seq = sequence(vec![Clip::new("a", media(32), 0, 20)], 30);
    let id = seq.id.clone();
    h.engine.update_sequence(seq.clone()).unwrap();
    let settings = h.engine.state(&id).unwrap().settings().clone();
    let plan = SegmentPlan {
        start_frame: 0,
        end_frame: 30,
        segments: vec![
            Segment {
                kind: SegmentKind::ConformCopy,
                start_frame: 0,
                end_frame: 20,
                source_clip: None,
            },
            Segment {
                kind: SegmentKind::Render,
                start_frame: 20,
                end_frame: 30,
                source_clip: None,
            },
        ],
    };

    h.engine.begin_export().await.unwrap();
    let cancel = CancellationToken::new();
    let outcome = Stitcher::new(&mut h.engine, &h.source, &seq, &settings, &cancel)
        .stitch(&plan)
        .await
        .unwrap();
    h.engine.end_export();

    let stitched = match outcome {
        StitchOutcome::Complete(stitched) => stitched,
        other => panic!("stitch did not complete: {other:?}"),
    };
    assert_eq!(stitched.demoted(), 1);
    assert_eq!(stitched.frames_produced_as(SegmentKind::Render), 30);
    assert_eq!(stitched.bitstream.frame_count(), 30);
    assert!(stitched.bitstream.entries()[0].keyframe);
    assert_eq!(h.compositor.composite_count(), 30);
}

#[tokio::test]
async fn cancelling_mid_render_writes_nothing() {
    let mut h = harness();
    let id = SequenceId::new("main");
    h.engine
        .update_sequence(sequence(vec![Clip::new("a", media(32), 0, 30)], 30))
        .unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let callback: ProgressCallback = Box::new(move |p: ExportProgress| {
        if p.stage == ExportStage::Rendering && p.frames_done >= 5 {
            trigger.cancel();
        }
    });

    let dir = output_dir("cancel-mid");
    let output = dir.join("out.h264");
    let outcome = export(&mut h, ExportJob::new(id, &output), &cancel, Some(&callback)).await;

    assert!(matches!(outcome, ExportOutcome::Cancelled));
    assert!(!output.exists());
    assert!(h.compositor.composite_count() < 30);
    assert!(!h.engine.activity().is_exporting());
}

#[tokio::test]
async fn render_decodes_ahead_before_compositing() {
    let mut h = harness();
    let id = SequenceId::new("main");
    h.engine
        .update_sequence(sequence(vec![Clip::new("a", media(32), 0, 20)], 20))
        .unwrap();

    let dir = output_dir("decode");
    let report = completed(
        export(
            &mut h,
            ExportJob::new(id.clone(), dir.join("out.h264")),
            &CancellationToken::new(),
            None,
        )
        .await,
    );

    assert_eq!(report.strategy, ExportStrategy::FullRender);
    assert_eq!(report.rendered_frames, 20);
    // Two batch-sized chunks.
    assert_eq!(h.decoder.request_count(), 2);
    assert!(h.decoder.is_range_decoded(&id, 16, 4));

    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn decode_failure_fails_the_render() {
    let mut h = harness();
    let id = SequenceId::new("main");
    h.engine
        .update_sequence(sequence(vec![Clip::new("a", media(32), 0, 20)], 20))
        .unwrap();
    h.decoder.set_failing(true);

    let output = output_dir("decode-fail").join("out.h264");
    let result = run_export(
        &mut h.engine,
        &h.source,
        &RawMuxer::new(),
        ExportJob::new(id, &output),
        &CancellationToken::new(),
        None,
    )
    .await;

    assert!(matches!(result, Err(SpliceError::Decode { .. })));
    assert_eq!(h.compositor.composite_count(), 0);
    assert!(!output.exists());
}

#[tokio::test]
async fn render_without_a_leading_keyframe_is_an_error() {
    let mut h = harness_with(
        ConformConfig::default(),
        SyntheticEncoderOptions {
            delta_only: true,
            ..SyntheticEncoderOptions::default()
        },
    );
    let id = SequenceId::new("main");
    h.engine
        .update_sequence(sequence(vec![Clip::new("a", media(32), 0, 10)], 10))
        .unwrap();

    let output = output_dir("no-keyframe").join("out.h264");
    let result = run_export(
        &mut h.engine,
        &h.source,
        &RawMuxer::new(),
        ExportJob::new(id, &output),
        &CancellationToken::new(),
        None,
    )
    .await;

    let err = result.unwrap_err();
    assert!(err.to_string().contains("keyframe"));
    assert!(!output.exists());
    assert!(!h.engine.activity().is_exporting());
}
