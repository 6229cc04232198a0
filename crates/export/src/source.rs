//! Source media access for stream copy.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use splice_common::{SpliceError, SpliceResult};
use splice_conform::{fnv1a_64, Packet};
use splice_timeline::Clip;

/// Reads already-encoded packets out of a clip's source file.
#[async_trait]
pub trait SourceMedia: Send + Sync {
    fn name(&self) -> &str;

    /// Packets for `count` source frames starting at `source_start`, in
    /// presentation order. Fewer packets than requested means the source
    /// ends early.
    async fn extract_packets(
        &self,
        clip: &Clip,
        source_start: u64,
        count: u64,
    ) -> SpliceResult<Vec<Packet>>;
}

/// Bitstream tag written at the start of every synthetic source packet.
pub const SOURCE_MAGIC: &[u8; 4] = b"SRC1";

/// Source media with a fixed GOP, producing tagged packets.
#[derive(Debug)]
pub struct SyntheticSource {
    gop_frames: u64,
    payload_bytes: usize,
    /// Source frames available per clip; `None` means unbounded.
    length_frames: Option<u64>,
    extracted: AtomicUsize,
}

impl SyntheticSource {
    pub fn new(gop_frames: u64) -> Self {
        Self {
            gop_frames: gop_frames.max(1),
            payload_bytes: 16,
            length_frames: None,
            extracted: AtomicUsize::new(0),
        }
    }

    pub fn with_payload_bytes(mut self, payload_bytes: usize) -> Self {
        self.payload_bytes = payload_bytes;
        self
    }

    /// Limit every source to `frames` frames.
    pub fn with_length(mut self, frames: u64) -> Self {
        self.length_frames = Some(frames);
        self
    }

    /// Packets handed out so far.
    pub fn extracted_count(&self) -> usize {
        self.extracted.load(Ordering::Relaxed)
    }

    fn packet(&self, clip: &Clip, source_frame: u64) -> Packet {
        let keyframe = source_frame % self.gop_frames == 0;
        let mut data = BytesMut::with_capacity(21 + self.payload_bytes);
        data.put_slice(SOURCE_MAGIC);
        data.put_u8(u8::from(keyframe));
        data.put_u64(fnv1a_64(clip.id.as_str().as_bytes()));
        data.put_u64(source_frame);
        data.put_bytes(0x5a, self.payload_bytes);

        let packet = Packet::new(data.freeze(), keyframe);
        if keyframe {
            packet.with_decoder_config(format!("src:{}", clip.id).into_bytes())
        } else {
            packet
        }
    }
}

impl Default for SyntheticSource {
    fn default() -> Self {
        Self::new(30)
    }
}

#[async_trait]
impl SourceMedia for SyntheticSource {
    fn name(&self) -> &str {
        "synthetic"
    }

    async fn extract_packets(
        &self,
        clip: &Clip,
        source_start: u64,
        count: u64,
    ) -> SpliceResult<Vec<Packet>> {
        if clip.media.codec.is_none() {
            return Err(SpliceError::unsupported(format!(
                "clip {} has no known codec to copy",
                clip.id
            )));
        }
        let end = match self.length_frames {
            Some(length) => (source_start + count).min(length),
            None => source_start + count,
        };
        let packets: Vec<Packet> = (source_start..end.max(source_start))
            .map(|frame| self.packet(clip, frame))
            .collect();
        self.extracted.fetch_add(packets.len(), Ordering::Relaxed);
        Ok(packets)
    }
}
