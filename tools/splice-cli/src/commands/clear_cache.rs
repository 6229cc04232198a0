//! Drop a sequence's persisted packets.

use std::path::PathBuf;

use splice_common::config::AppConfig;

use super::{build_engine, load_sequence};

pub async fn run(config: &AppConfig, path: PathBuf) -> anyhow::Result<()> {
    let sequence = load_sequence(&path)?;
    let id = sequence.id.clone();
    let mut engine = build_engine(config)?;
    engine.update_sequence(sequence)?;
    engine.clear_warm_tier(&id).await?;
    engine.shutdown().await?;

    println!("Cleared cached packets for {id}");
    Ok(())
}
