//! Messages exchanged with the encoder worker.

use splice_common::SpliceError;
use splice_timeline::EncoderSettings;

use crate::media::VideoFrame;
use crate::packet::Packet;

/// Identifies one request across the worker boundary.
pub type CorrelationId = u64;

/// Requests sent to the worker.
#[derive(Debug)]
pub enum EncoderMessage {
    Configure {
        id: CorrelationId,
        settings: EncoderSettings,
    },
    Reconfigure {
        id: CorrelationId,
        settings: EncoderSettings,
    },
    Encode {
        id: CorrelationId,
        frame: VideoFrame,
        timestamp_us: u64,
        force_keyframe: bool,
    },
    Flush {
        id: CorrelationId,
    },
    Close {
        id: CorrelationId,
    },
}

/// How bad a worker-reported error is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Settings rejected.
    Configuration,
    /// One frame failed; the worker keeps running.
    Frame,
    /// The worker is exiting.
    Fatal,
}

/// Worker replies, in the order the worker produced them.
#[derive(Debug)]
pub enum EncoderResponse {
    ConfigureDone {
        id: CorrelationId,
    },
    EncodeAccepted {
        id: CorrelationId,
    },
    Packet(EncodedPacket),
    FlushDone {
        id: CorrelationId,
    },
    Closed {
        id: CorrelationId,
    },
    Error {
        id: CorrelationId,
        kind: FailureKind,
        message: String,
    },
}

/// A packet tagged with the request that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPacket {
    pub id: CorrelationId,
    pub timestamp_us: u64,
    pub packet: Packet,
}

/// Outcome of one encode request, as seen by the channel owner.
#[derive(Debug)]
pub enum EncoderCompletion {
    Packet(EncodedPacket),
    Failed {
        id: CorrelationId,
        error: SpliceError,
    },
    /// The worker died. Every outstanding request has already been reported
    /// as `Failed` before this arrives.
    Crashed { message: String },
}

impl FailureKind {
    pub(crate) fn into_error(self, message: String) -> SpliceError {
        match self {
            FailureKind::Configuration => SpliceError::configuration(message),
            FailureKind::Frame => SpliceError::encode(message),
            FailureKind::Fatal => SpliceError::channel_crash(message),
        }
    }
}
