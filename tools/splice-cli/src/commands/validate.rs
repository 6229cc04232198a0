//! Validate a sequence file.

use std::path::PathBuf;

use splice_timeline::Sequence;

pub fn run(path: PathBuf) -> anyhow::Result<()> {
    println!("Validating sequence at: {}", path.display());

    let json = std::fs::read_to_string(&path)?;
    let sequence: Sequence =
        serde_json::from_str(&json).map_err(|e| anyhow::anyhow!("Failed to parse sequence: {e}"))?;

    println!("  Name: {}", sequence.name);
    println!("  Canvas: {}x{}", sequence.width, sequence.height);
    println!("  FPS: {}", sequence.fps);
    println!("  Tracks: {}", sequence.tracks.len());

    let problems = sequence.validate();
    if problems.is_empty() {
        println!("\nSequence is valid.");
        return Ok(());
    }

    println!("\nValidation issues:");
    for problem in &problems {
        println!("  - {problem}");
    }
    anyhow::bail!("{} issue(s) found", problems.len())
}
