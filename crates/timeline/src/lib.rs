//! Splice Timeline Model
//!
//! Defines the data contracts the conform cache and export planner read:
//! - **Sequence:** tracks, clips and transitions laid out in timeline frames
//! - **Effects:** per-clip effect stacks with parameters and keyframes
//! - **Media:** what is known about a clip's source (kind, codec, geometry)
//! - **Settings:** encoder settings shared by conforming and export
//! - **Coverage:** a single-pass sweep mapping frames to the clips covering them
//!
//! Frame ranges are half-open (`start..end`) throughout.

pub mod coverage;
pub mod effect;
pub mod media;
pub mod settings;
pub mod timeline;

pub use coverage::*;
pub use effect::*;
pub use media::*;
pub use settings::*;
pub use timeline::*;
