//! Splice Export
//!
//! Smart-render export on top of the conform cache.
//!
//! An export range is planned into segments ([`planner`]): stretches that can
//! be copied straight from source media, stretches already conformed in the
//! cache, and stretches that must be rendered. The [`stitcher`] produces each
//! segment and joins them into one elementary stream, which a [`mux::Muxer`]
//! turns into the output file. [`export::run_export`] drives the whole thing
//! and falls back from stream copy to full render as needed.
//!
//! [`service`] owns a conform engine on a single task and serialises idle
//! fill, timeline events, queries and exports against it.

pub mod export;
pub mod mux;
pub mod planner;
pub mod service;
pub mod source;
pub mod stitcher;

pub use export::{
    run_export, ExportJob, ExportOutcome, ExportProgress, ExportReport, ExportStage,
    ExportStrategy, ProgressCallback,
};
pub use mux::{MuxMetadata, Muxer, RawMuxer};
pub use planner::{plan_segments, ConformLookup, NoConform, Segment, SegmentKind, SegmentPlan};
pub use service::{ConformCommand, ConformHandle, ConformService};
pub use source::{SourceMedia, SyntheticSource, SOURCE_MAGIC};
pub use stitcher::{Bitstream, PacketEntry, StitchOutcome, Stitched, StitchedSegment, Stitcher};
