//! Export a sequence.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use splice_common::config::AppConfig;
use splice_export::{
    ConformService, ExportJob, ExportOutcome, ExportProgress, ProgressCallback, RawMuxer,
    SyntheticSource,
};
use tokio_util::sync::CancellationToken;

use super::{build_engine, frame_range, load_sequence, resolve_settings};

pub struct ExportArgs {
    pub path: PathBuf,
    pub output: Option<PathBuf>,
    pub start: Option<u64>,
    pub end: Option<u64>,
    pub codec: Option<String>,
    pub bitrate: Option<u64>,
    pub audio: Option<PathBuf>,
    pub conform_first: bool,
}

pub async fn run(config: &AppConfig, args: ExportArgs) -> anyhow::Result<()> {
    println!("Exporting sequence at: {}", args.path.display());

    let sequence = load_sequence(&args.path)?;
    let id = sequence.id.clone();
    let settings = resolve_settings(config, &sequence, args.codec.as_deref(), args.bitrate)?;
    let range = frame_range(&sequence, args.start, args.end)?;
    let output_path = args
        .output
        .unwrap_or_else(|| PathBuf::from(format!("{id}.{}", settings.codec.as_str())));

    println!("  Output: {}", output_path.display());
    println!("  Frames: {}..{}", range.start, range.end);
    println!(
        "  Codec: {} {}x{} @ {} bps",
        settings.codec.as_str(),
        settings.width,
        settings.height,
        settings.bitrate_bps
    );

    let engine = build_engine(config)?;
    let (handle, task) = ConformService::spawn(
        engine,
        Arc::new(SyntheticSource::default()),
        Arc::new(RawMuxer::new()),
    );
    handle.timeline_changed(sequence).await?;
    if args.conform_first {
        println!("  Conforming before export...");
        handle.settings_changed(id.clone(), settings.clone()).await?;
        handle.activate(id.clone()).await?;
        handle.wait_for_idle().await?;
    }

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let progress_cb: ProgressCallback = Box::new(|p: ExportProgress| {
        print!(
            "\r  Progress: {:.1}% ({}/{} frames, {:?}, ETA: {:.0}s)  ",
            p.progress * 100.0,
            p.frames_done,
            p.total_frames,
            p.stage,
            p.eta_secs,
        );
        let _ = std::io::stdout().flush();
    });

    let mut job = ExportJob::new(id, &output_path)
        .with_range(range)
        .with_settings(settings);
    job.audio_path = args.audio;
    let outcome = handle.export(job, Some(progress_cb), cancel).await;

    handle.shutdown().await?;
    task.await?;

    match outcome? {
        ExportOutcome::Completed(report) => {
            println!("\nExport complete: {}", report.output_path.display());
            println!(
                "  Strategy: {:?} ({} copied, {} from conform cache, {} rendered, {} demoted segment(s))",
                report.strategy,
                report.copied_frames,
                report.conformed_frames,
                report.rendered_frames,
                report.demoted_segments
            );
            println!("  {} frames, {} bytes in {} ms", report.frames, report.bytes, report.elapsed_ms);
        }
        ExportOutcome::Cancelled => println!("\nExport cancelled"),
    }
    Ok(())
}
