//! Show sequence information.

use std::path::PathBuf;

use splice_timeline::CoverageMap;

use super::load_sequence;

pub fn run(path: PathBuf) -> anyhow::Result<()> {
    let sequence = load_sequence(&path)?;

    println!("Sequence: {}", sequence.name);
    println!("  ID: {}", sequence.id);
    println!(
        "  Canvas: {}x{} @ {}fps",
        sequence.width, sequence.height, sequence.fps
    );
    println!(
        "  Duration: {} frames ({:.2}s)",
        sequence.duration_frames,
        sequence.duration_frames as f64 / sequence.fps.as_f64()
    );
    println!();

    println!("Tracks:");
    for track in &sequence.tracks {
        let muted = if track.muted { ", muted" } else { "" };
        println!("  {} ({:?}{muted})", track.id, track.kind);
        for clip in &track.clips {
            let codec = clip.media.codec.map(|c| c.as_str()).unwrap_or("unknown");
            println!(
                "    {}: frames {}..{} from source {} ({} {}x{} @ {}fps, speed {}, {} effect(s))",
                clip.id,
                clip.start_frame,
                clip.end_frame(),
                clip.source_in_frame,
                codec,
                clip.media.width,
                clip.media.height,
                clip.media.fps,
                clip.speed,
                clip.effects.len()
            );
        }
        for transition in &track.transitions {
            println!(
                "    transition: frames {}..{}",
                transition.start_frame,
                transition.end_frame()
            );
        }
    }
    println!();

    let coverage = CoverageMap::build(&sequence, 0..sequence.duration_frames);
    let conformable = (0..sequence.duration_frames)
        .filter(|&frame| coverage.single(frame).is_some())
        .count();
    println!("Conform:");
    println!(
        "  Conformable frames: {conformable} of {}",
        sequence.duration_frames
    );

    Ok(())
}
