//! Show the segment plan for an export range.

use std::path::PathBuf;

use splice_common::config::AppConfig;
use splice_export::{plan_segments, NoConform, SegmentKind};

use super::{frame_range, load_sequence, resolve_settings};

pub fn run(
    config: &AppConfig,
    path: PathBuf,
    start: Option<u64>,
    end: Option<u64>,
    codec: Option<String>,
    json: bool,
) -> anyhow::Result<()> {
    let sequence = load_sequence(&path)?;
    let settings = resolve_settings(config, &sequence, codec.as_deref(), None)?;
    let range = frame_range(&sequence, start, end)?;

    // Without a running engine nothing is conformed yet.
    let plan = plan_segments(&sequence, &settings, range, &NoConform);

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    println!(
        "Plan for {} frames {}..{} ({} {}x{}):",
        sequence.id,
        plan.start_frame,
        plan.end_frame,
        settings.codec.as_str(),
        settings.width,
        settings.height
    );
    for segment in &plan.segments {
        let clip = segment
            .source_clip
            .as_ref()
            .map(|id| format!(" from {id}"))
            .unwrap_or_default();
        println!(
            "  {:>12} {}..{} ({} frames){clip}",
            segment.kind.as_str(),
            segment.start_frame,
            segment.end_frame,
            segment.len()
        );
    }
    println!();
    println!(
        "  copy: {}  render: {}",
        plan.frames_of(SegmentKind::Copy),
        plan.frames_of(SegmentKind::Render)
    );
    Ok(())
}
