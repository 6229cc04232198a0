//! # Splice Conform
//!
//! Background pre-encoding ("conforming") of timeline frames.
//!
//! While the editor is idle, frames the timeline shows through exactly one
//! clip are composited and encoded ahead of time. The resulting packets are
//! cached twice: by the source content that produced them ([`SourceKey`]),
//! which survives timeline edits, and by timeline frame, which export reads
//! directly. Packets are written through to a warm tier so a restart can
//! recover them.
//!
//! ## Layout
//!
//! - [`packet`]: encoded packets and their stored form
//! - [`source_key`]: content identity of a frame
//! - [`store`]: warm tier
//! - [`memory`]: RAM budget and purge order
//! - [`frame_index`]: per-sequence dual-keyed cache
//! - [`encoder`]: worker-thread encoder channel
//! - [`media`]: decode and compositing collaborators
//! - [`scheduler`]: idle-fill state machine
//! - [`engine`]: everything above wired together

pub mod encoder;
pub mod engine;
pub mod frame_index;
pub mod media;
pub mod memory;
pub mod packet;
pub mod scheduler;
pub mod source_key;
pub mod store;
pub mod synthetic;

pub use encoder::{
    BackendFactory, CorrelationId, EncodedPacket, EncoderBackend, EncoderChannel,
    EncoderCompletion, KeyframePolicy,
};
pub use engine::{BatchOutcome, BatchStatus, ConformEngine, CoverageReport, EngineEvent};
pub use frame_index::SequenceConformState;
pub use media::{Compositor, DecodeAhead, VideoFrame};
pub use memory::MemoryBudget;
pub use packet::Packet;
pub use scheduler::{ActivityFlags, FillState, FillTicket, IdleFillScheduler};
pub use source_key::{effects_hash, fnv1a_64, SourceKey};
pub use store::{namespace_for, DiskStore, MemoryStore, WarmStore};
