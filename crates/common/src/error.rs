//! Error types shared across Splice crates.
//!
//! Expected conditions (a cache miss, a segment demoted to render) are not
//! errors and never travel through this type; they are modelled as `Option`
//! or enum returns at the call site.

/// Top-level error type for Splice operations.
#[derive(Debug, thiserror::Error)]
pub enum SpliceError {
    /// Unsupported or invalid encoder settings. Blocks encoding until fixed.
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// A single frame failed to encode. The frame stays unconformed and is
    /// picked up again by the next idle-fill pass.
    #[error("Encode error: {message}")]
    Encode { message: String },

    /// The encoder worker went away. Every pending request fails with this.
    #[error("Encoder channel crashed: {message}")]
    ChannelCrash { message: String },

    #[error("Timeline error: {message}")]
    Timeline { message: String },

    #[error("Warm store error: {message}")]
    Store { message: String },

    #[error("Export error: {message}")]
    Export { message: String },

    #[error("Decode error: {message}")]
    Decode { message: String },

    #[error("Sequence not found: {id}")]
    SequenceNotFound { id: String },

    #[error("Unsupported operation: {message}")]
    Unsupported { message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias using SpliceError.
pub type SpliceResult<T> = Result<T, SpliceError>;

impl SpliceError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    pub fn encode(msg: impl Into<String>) -> Self {
        Self::Encode {
            message: msg.into(),
        }
    }

    pub fn channel_crash(msg: impl Into<String>) -> Self {
        Self::ChannelCrash {
            message: msg.into(),
        }
    }

    pub fn timeline(msg: impl Into<String>) -> Self {
        Self::Timeline {
            message: msg.into(),
        }
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store {
            message: msg.into(),
        }
    }

    pub fn export(msg: impl Into<String>) -> Self {
        Self::Export {
            message: msg.into(),
        }
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode {
            message: msg.into(),
        }
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported {
            message: msg.into(),
        }
    }

    pub fn sequence_not_found(id: impl Into<String>) -> Self {
        Self::SequenceNotFound { id: id.into() }
    }

    /// Whether the encoder worker must be respawned before further use.
    pub fn is_channel_crash(&self) -> bool {
        matches!(self, Self::ChannelCrash { .. })
    }

    /// Whether the failure is limited to a single frame.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Encode { .. } | Self::Decode { .. })
    }
}
