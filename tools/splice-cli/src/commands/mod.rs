pub mod clear_cache;
pub mod conform;
pub mod export;
pub mod info;
pub mod plan;
pub mod validate;

use std::ops::Range;
use std::path::Path;
use std::sync::Arc;

use splice_common::config::AppConfig;
use splice_conform::synthetic::{
    SyntheticCompositor, SyntheticDecoder, SyntheticEncoder, SyntheticEncoderOptions,
};
use splice_conform::{ActivityFlags, ConformEngine, DiskStore, EncoderChannel, WarmStore};
use splice_timeline::{EncoderSettings, Sequence, VideoCodec};

pub fn load_sequence(path: &Path) -> anyhow::Result<Sequence> {
    Sequence::load(path).map_err(|e| anyhow::anyhow!("Failed to load sequence: {e}"))
}

/// Engine over the configured warm tier and the synthetic media backends.
pub fn build_engine(config: &AppConfig) -> anyhow::Result<ConformEngine> {
    let encoder =
        EncoderChannel::spawn(SyntheticEncoder::factory(SyntheticEncoderOptions::default()))?;
    let store: Arc<dyn WarmStore> = Arc::new(DiskStore::new(&config.store_dir));
    let engine = ConformEngine::new(
        config.conform.clone(),
        encoder,
        store,
        Arc::new(SyntheticDecoder::new()),
        Arc::new(SyntheticCompositor::new()),
        ActivityFlags::new(),
    )?;
    Ok(engine)
}

/// Sequence-derived settings with command-line overrides applied.
pub fn resolve_settings(
    config: &AppConfig,
    sequence: &Sequence,
    codec: Option<&str>,
    bitrate: Option<u64>,
) -> anyhow::Result<EncoderSettings> {
    let name = codec.unwrap_or(&config.conform.default_codec);
    let codec = VideoCodec::parse(name)
        .ok_or_else(|| anyhow::anyhow!("Unknown codec: {name}. Use: h264, h265, prores, vp9, av1"))?;
    let settings = EncoderSettings::for_sequence(
        sequence,
        codec,
        bitrate.unwrap_or(config.conform.default_bitrate_bps),
    );
    let problems = settings.validate();
    if !problems.is_empty() {
        anyhow::bail!("Invalid encoder settings: {}", problems.join("; "));
    }
    Ok(settings)
}

pub fn frame_range(
    sequence: &Sequence,
    start: Option<u64>,
    end: Option<u64>,
) -> anyhow::Result<Range<u64>> {
    let range = start.unwrap_or(0)..end.unwrap_or(sequence.duration_frames);
    if range.is_empty() || range.end > sequence.duration_frames {
        anyhow::bail!(
            "Range {}..{} is outside the sequence ({} frames)",
            range.start,
            range.end,
            sequence.duration_frames
        );
    }
    Ok(range)
}
