//! Decode and compositing collaborators.
//!
//! Both live outside this crate. The conform engine only needs to ask for a
//! frame range to be decoded ahead and for a composited picture of a single
//! timeline frame.

use async_trait::async_trait;
use splice_common::SpliceResult;
use splice_timeline::{Sequence, SequenceId};

/// An uncompressed RGBA picture.
#[derive(Clone, PartialEq, Eq)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl VideoFrame {
    /// Opaque black frame.
    pub fn blank(width: u32, height: u32) -> Self {
        let mut data = vec![0u8; width as usize * height as usize * 4];
        for pixel in data.chunks_exact_mut(4) {
            pixel[3] = 0xff;
        }
        Self {
            width,
            height,
            data,
        }
    }
}

impl std::fmt::Debug for VideoFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Decode-ahead buffer for timeline frames.
#[async_trait]
pub trait DecodeAhead: Send + Sync {
    /// Make sure `count` frames starting at `start_frame` are decoded.
    async fn ensure_buffered(
        &self,
        sequence_id: &SequenceId,
        start_frame: u64,
        count: u64,
    ) -> SpliceResult<()>;

    /// Whether the range is already decoded.
    fn is_range_decoded(&self, sequence_id: &SequenceId, start_frame: u64, count: u64) -> bool;
}

/// Produces the composited picture of a timeline frame.
#[async_trait]
pub trait Compositor: Send + Sync {
    fn name(&self) -> &str;

    async fn composite(
        &self,
        sequence: &Sequence,
        frame: u64,
        width: u32,
        height: u32,
    ) -> SpliceResult<VideoFrame>;
}
