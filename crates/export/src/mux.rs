//! Final container step.
//!
//! The muxer receives the finished elementary stream once, at the end of an
//! export. [`RawMuxer`] writes the stream as-is next to a JSON sidecar that
//! describes it.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use splice_common::{SpliceError, SpliceResult};
use splice_timeline::{FrameRate, VideoCodec};

use crate::stitcher::{Bitstream, PacketEntry};

/// Stream description handed to the muxer.
#[derive(Debug, Clone, Serialize)]
pub struct MuxMetadata {
    pub codec: VideoCodec,
    /// Output container format (e.g. "raw", "mp4").
    pub format: String,
    pub width: u32,
    pub height: u32,
    pub fps: FrameRate,
    pub duration_secs: f64,
    pub frame_count: u64,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait Muxer: Send + Sync {
    fn name(&self) -> &str;

    /// Write the finished file and return its path.
    async fn mux(
        &self,
        bitstream: &Bitstream,
        audio: Option<&Path>,
        metadata: &MuxMetadata,
        output: &Path,
    ) -> SpliceResult<PathBuf>;
}

#[derive(Debug, Serialize)]
struct Sidecar<'a> {
    #[serde(flatten)]
    metadata: &'a MuxMetadata,
    bytes: u64,
    keyframes: usize,
    audio: Option<&'a Path>,
    packets: &'a [PacketEntry],
}

/// Writes the elementary stream plus `<output>.stream.json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawMuxer;

impl RawMuxer {
    pub fn new() -> Self {
        Self
    }

    pub fn sidecar_path(output: &Path) -> PathBuf {
        output.with_extension("stream.json")
    }
}

#[async_trait]
impl Muxer for RawMuxer {
    fn name(&self) -> &str {
        "raw"
    }

    async fn mux(
        &self,
        bitstream: &Bitstream,
        audio: Option<&Path>,
        metadata: &MuxMetadata,
        output: &Path,
    ) -> SpliceResult<PathBuf> {
        if metadata.format != "raw" {
            return Err(SpliceError::unsupported(format!(
                "raw muxer cannot write '{}'",
                metadata.format
            )));
        }
        if let Some(parent) = output.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        if let Some(audio) = audio {
            tracing::warn!(audio = %audio.display(), "Raw muxer does not interleave audio; recorded in sidecar only");
        }

        tokio::fs::write(output, bitstream.as_bytes()).await?;
        let sidecar = Sidecar {
            metadata,
            bytes: bitstream.byte_len(),
            keyframes: bitstream.keyframe_count(),
            audio,
            packets: bitstream.entries(),
        };
        let json = serde_json::to_string_pretty(&sidecar)?;
        tokio::fs::write(Self::sidecar_path(output), json).await?;

        tracing::info!(
            output = %output.display(),
            bytes = bitstream.byte_len(),
            frames = bitstream.frame_count(),
            "Wrote raw stream"
        );
        Ok(output.to_path_buf())
    }
}
