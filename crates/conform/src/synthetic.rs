//! Deterministic in-process collaborators.
//!
//! Used by the CLI when no platform encoder is wired in, and by tests. The
//! synthetic encoder produces a fake bitstream whose packets identify the
//! frame they came from, honours forced keyframes, can hold packets back
//! like a B-frame encoder, and can be told to fail.

use std::collections::{HashMap, HashSet, VecDeque};
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use splice_common::{SpliceError, SpliceResult};
use splice_timeline::{EncoderSettings, Sequence, SequenceId};

use crate::encoder::{BackendFactory, CorrelationId, EncodedPacket, EncoderBackend};
use crate::media::{Compositor, DecodeAhead, VideoFrame};
use crate::packet::Packet;
use crate::source_key::fnv1a_64;

/// Bitstream tag written at the start of every synthetic packet.
pub const SYNTHETIC_MAGIC: &[u8; 4] = b"SYN1";

/// Behaviour knobs for [`SyntheticEncoder`].
#[derive(Debug, Clone, Default)]
pub struct SyntheticEncoderOptions {
    /// Packets held back before being released.
    pub reorder_delay: usize,
    /// Filler bytes appended to each packet.
    pub payload_bytes: usize,
    /// Automatic keyframe interval; 0 keyframes only on request.
    pub gop_frames: u64,
    /// Timestamps whose encode fails with a per-frame error.
    pub fail_timestamps: HashSet<u64>,
    /// Crash the worker on the encode call after this many successes.
    pub crash_after: Option<usize>,
    /// Never emit keyframes.
    pub delta_only: bool,
}

/// Fake encoder backend.
#[derive(Debug)]
pub struct SyntheticEncoder {
    options: SyntheticEncoderOptions,
    settings: Option<EncoderSettings>,
    held: VecDeque<EncodedPacket>,
    since_keyframe: u64,
    needs_keyframe: bool,
    encoded: usize,
}

impl SyntheticEncoder {
    pub fn new(options: SyntheticEncoderOptions) -> Self {
        Self {
            options,
            settings: None,
            held: VecDeque::new(),
            since_keyframe: 0,
            needs_keyframe: true,
            encoded: 0,
        }
    }

    /// Factory producing a fresh encoder with the same options.
    pub fn factory(options: SyntheticEncoderOptions) -> BackendFactory {
        Arc::new(move || -> SpliceResult<Box<dyn EncoderBackend>> {
            Ok(Box::new(SyntheticEncoder::new(options.clone())))
        })
    }

    fn decoder_config(settings: &EncoderSettings) -> Vec<u8> {
        format!("cfg:{}", settings.canonical_string()).into_bytes()
    }
}

impl EncoderBackend for SyntheticEncoder {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn configure(&mut self, settings: &EncoderSettings) -> SpliceResult<()> {
        self.settings = Some(settings.clone());
        self.held.clear();
        self.needs_keyframe = true;
        self.since_keyframe = 0;
        Ok(())
    }

    fn encode(
        &mut self,
        id: CorrelationId,
        frame: &VideoFrame,
        timestamp_us: u64,
        force_keyframe: bool,
    ) -> SpliceResult<Vec<EncodedPacket>> {
        let Some(settings) = self.settings.as_ref() else {
            return Err(SpliceError::configuration("synthetic encoder is not configured"));
        };
        if self.options.crash_after.is_some_and(|limit| self.encoded >= limit) {
            return Err(SpliceError::channel_crash("synthetic encoder crash requested"));
        }
        if self.options.fail_timestamps.contains(&timestamp_us) {
            return Err(SpliceError::encode(format!(
                "synthetic failure at {timestamp_us}us"
            )));
        }
        self.encoded += 1;

        let gop_due = self.options.gop_frames > 0 && self.since_keyframe >= self.options.gop_frames;
        let keyframe =
            !self.options.delta_only && (force_keyframe || gop_due || self.needs_keyframe);
        self.needs_keyframe = false;
        self.since_keyframe = if keyframe { 1 } else { self.since_keyframe + 1 };

        let mut data = BytesMut::with_capacity(21 + self.options.payload_bytes);
        data.put_slice(SYNTHETIC_MAGIC);
        data.put_u8(u8::from(keyframe));
        data.put_u64(timestamp_us);
        data.put_u64(fnv1a_64(&frame.data));
        data.put_bytes(0xa5, self.options.payload_bytes);

        let mut packet = Packet::new(data.freeze(), keyframe);
        if keyframe {
            packet = packet.with_decoder_config(Self::decoder_config(settings));
        }
        self.held.push_back(EncodedPacket {
            id,
            timestamp_us,
            packet,
        });

        let mut out = Vec::new();
        while self.held.len() > self.options.reorder_delay {
            if let Some(packet) = self.held.pop_front() {
                out.push(packet);
            }
        }
        Ok(out)
    }

    fn flush(&mut self) -> SpliceResult<Vec<EncodedPacket>> {
        self.needs_keyframe = true;
        Ok(self.held.drain(..).collect())
    }
}

/// Decode-ahead stand-in that records requested ranges.
#[derive(Debug, Default)]
pub struct SyntheticDecoder {
    buffered: Mutex<HashMap<SequenceId, Vec<Range<u64>>>>,
    requests: AtomicUsize,
    failing: AtomicBool,
}

impl SyntheticDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `ensure_buffered` calls served.
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::Relaxed)
    }

    /// Make subsequent requests fail with a decode error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }
}

#[async_trait]
impl DecodeAhead for SyntheticDecoder {
    async fn ensure_buffered(
        &self,
        sequence_id: &SequenceId,
        start_frame: u64,
        count: u64,
    ) -> SpliceResult<()> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if self.failing.load(Ordering::Relaxed) {
            return Err(SpliceError::decode(format!(
                "synthetic decode failure for {sequence_id} at {start_frame}"
            )));
        }
        let mut buffered = self
            .buffered
            .lock()
            .map_err(|_| SpliceError::decode("decoder state poisoned"))?;
        buffered
            .entry(sequence_id.clone())
            .or_default()
            .push(start_frame..start_frame + count);
        Ok(())
    }

    fn is_range_decoded(&self, sequence_id: &SequenceId, start_frame: u64, count: u64) -> bool {
        let end = start_frame + count;
        self.buffered
            .lock()
            .map(|buffered| {
                buffered.get(sequence_id).is_some_and(|ranges| {
                    ranges
                        .iter()
                        .any(|r| r.start <= start_frame && r.end >= end)
                })
            })
            .unwrap_or(false)
    }
}

/// Compositor that paints each frame with a seed derived from what the
/// timeline shows there.
#[derive(Debug, Default)]
pub struct SyntheticCompositor {
    composited: AtomicUsize,
}

impl SyntheticCompositor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn composite_count(&self) -> usize {
        self.composited.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Compositor for SyntheticCompositor {
    fn name(&self) -> &str {
        "synthetic"
    }

    async fn composite(
        &self,
        sequence: &Sequence,
        frame: u64,
        width: u32,
        height: u32,
    ) -> SpliceResult<VideoFrame> {
        self.composited.fetch_add(1, Ordering::Relaxed);
        let top = sequence.visible_clips().filter(|c| c.covers(frame)).last();
        let label = match top {
            Some(clip) => format!("{}:{}", clip.id, clip.source_frame_at(frame)),
            None => format!("gap:{frame}"),
        };
        let seed = fnv1a_64(label.as_bytes()).to_be_bytes();

        let mut image = VideoFrame::blank(width, height);
        for (i, byte) in image.data.iter_mut().enumerate() {
            if i % 4 != 3 {
                *byte = seed[i % seed.len()];
            }
        }
        Ok(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use splice_timeline::{BitrateMode, FrameRate, Quality, VideoCodec};

    fn settings() -> EncoderSettings {
        EncoderSettings {
            codec: VideoCodec::H264,
            width: 16,
            height: 16,
            fps: FrameRate::integer(25),
            bitrate_bps: 1_000_000,
            bitrate_mode: BitrateMode::Constant,
            quality: Quality::Realtime,
        }
    }

    #[test]
    fn test_first_frame_after_configure_is_keyframe() {
        let mut encoder = SyntheticEncoder::new(SyntheticEncoderOptions::default());
        encoder.configure(&settings()).unwrap();
        let frame = VideoFrame::blank(16, 16);
        let first = encoder.encode(1, &frame, 0, false).unwrap();
        let second = encoder.encode(2, &frame, 40_000, false).unwrap();
        assert!(first[0].packet.is_keyframe());
        assert!(first[0].packet.decoder_config().is_some());
        assert!(!second[0].packet.is_keyframe());
    }

    #[test]
    fn test_reorder_delay_holds_packets_until_flush() {
        let mut encoder = SyntheticEncoder::new(SyntheticEncoderOptions {
            reorder_delay: 2,
            ..SyntheticEncoderOptions::default()
        });
        encoder.configure(&settings()).unwrap();
        let frame = VideoFrame::blank(16, 16);
        assert!(encoder.encode(1, &frame, 0, true).unwrap().is_empty());
        assert!(encoder.encode(2, &frame, 1, false).unwrap().is_empty());
        let released = encoder.encode(3, &frame, 2, false).unwrap();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].id, 1);
        let flushed: Vec<_> = encoder.flush().unwrap().iter().map(|p| p.id).collect();
        assert_eq!(flushed, vec![2, 3]);
    }

    #[test]
    fn test_gop_places_keyframes() {
        let mut encoder = SyntheticEncoder::new(SyntheticEncoderOptions {
            gop_frames: 3,
            ..SyntheticEncoderOptions::default()
        });
        encoder.configure(&settings()).unwrap();
        let frame = VideoFrame::blank(16, 16);
        let keys: Vec<bool> = (0..7)
            .map(|i| encoder.encode(i, &frame, i, false).unwrap()[0].packet.is_keyframe())
            .collect();
        assert_eq!(keys, vec![true, false, false, true, false, false, true]);
    }

    #[tokio::test]
    async fn test_decoder_tracks_ranges() {
        let decoder = SyntheticDecoder::new();
        let seq = SequenceId::new("s");
        assert!(!decoder.is_range_decoded(&seq, 0, 10));
        decoder.ensure_buffered(&seq, 0, 16).await.unwrap();
        assert!(decoder.is_range_decoded(&seq, 4, 10));
        assert!(!decoder.is_range_decoded(&seq, 10, 10));

        decoder.set_failing(true);
        assert!(decoder.ensure_buffered(&seq, 16, 16).await.is_err());
    }
}
