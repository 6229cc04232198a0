//! Conform a sequence into the warm tier.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use splice_common::config::AppConfig;
use splice_export::{ConformService, RawMuxer, SyntheticSource};

use super::{build_engine, load_sequence};

pub async fn run(
    config: &AppConfig,
    path: PathBuf,
    timeout_secs: u64,
    json: bool,
) -> anyhow::Result<()> {
    let sequence = load_sequence(&path)?;
    let id = sequence.id.clone();
    let engine = build_engine(config)?;
    let (handle, task) = ConformService::spawn(
        engine,
        Arc::new(SyntheticSource::default()),
        Arc::new(RawMuxer::new()),
    );

    let report = handle.timeline_changed(sequence).await?;
    if !json {
        println!("Conforming {id} into {}", config.store_dir.display());
        println!(
            "  Conformable frames: {} ({} already cached, {} to recover)",
            report.conformable,
            report.conformed,
            report.recoveries.len()
        );
    }
    handle.activate(id.clone()).await?;

    let settled = tokio::time::timeout(Duration::from_secs(timeout_secs), handle.wait_for_idle()).await;
    let coverage = handle
        .coverage(id.clone())
        .await?
        .ok_or_else(|| anyhow::anyhow!("Sequence {id} disappeared"))?;
    handle.shutdown().await?;
    task.await?;
    // Warm-tier writes are queued on the runtime; give them a moment to land.
    tokio::time::sleep(Duration::from_millis(200)).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&coverage)?);
    } else {
        println!(
            "  Conformed: {}/{} ({:.1}%)",
            coverage.conformed_frames + coverage.parked_frames,
            coverage.conformable_frames,
            coverage.ratio() * 100.0
        );
        if coverage.parked_frames > 0 {
            println!("  Parked in warm tier: {} frames", coverage.parked_frames);
        }
        println!("  Resident: {} bytes", coverage.resident_bytes);
    }

    match settled {
        Ok(result) => result?,
        Err(_) => anyhow::bail!("Conform did not finish within {timeout_secs}s"),
    }
    Ok(())
}
