//! Application configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{SpliceError, SpliceResult};

/// Hard ceiling for both the idle-fill batch size and the in-flight cap.
pub const MAX_BATCH_FRAMES: usize = 16;

/// Global application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Directory backing the persisted warm tier.
    pub store_dir: PathBuf,

    /// Conform cache and idle-fill tuning.
    #[serde(default)]
    pub conform: ConformConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Conform cache, idle-fill and keyframe policy tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConformConfig {
    /// Soft cap on RAM-resident encoded bytes across all sequences.
    pub ram_cap_bytes: usize,

    /// Frames taken per idle-fill tick.
    pub batch_size: usize,

    /// Maximum encode requests outstanding at once during idle fill.
    pub max_in_flight: usize,

    /// Poll interval while waiting for encoder capacity.
    pub backpressure_poll_ms: u64,

    /// Delay before retrying when a tick submitted nothing.
    pub retry_delay_ms: u64,

    /// Delay after a full wraparound that made no progress.
    pub wraparound_delay_ms: u64,

    /// Bitrate separating the short and long keyframe intervals.
    pub keyframe_bitrate_threshold_bps: u64,

    /// Keyframe interval used below the bitrate threshold.
    pub keyframe_interval_low_secs: f64,

    /// Keyframe interval used at or above the bitrate threshold.
    pub keyframe_interval_high_secs: f64,

    /// Outstanding-frame threshold for the export render loop.
    pub render_max_outstanding: usize,

    /// Whether encoded packets are written through to the warm tier.
    pub persist: bool,

    /// Codec used for sequences that have no explicit encoder settings.
    pub default_codec: String,

    /// Bitrate used for sequences that have no explicit encoder settings.
    pub default_bitrate_bps: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "splice_conform=debug,warn").
    pub level: String,

    /// Whether to output structured JSON logs.
    pub json: bool,

    /// Optional log file path.
    pub file: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            store_dir: default_store_dir(),
            conform: ConformConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ConformConfig {
    fn default() -> Self {
        Self {
            ram_cap_bytes: 512 * 1024 * 1024,
            batch_size: MAX_BATCH_FRAMES,
            max_in_flight: MAX_BATCH_FRAMES,
            backpressure_poll_ms: 2,
            retry_delay_ms: 250,
            wraparound_delay_ms: 2_000,
            keyframe_bitrate_threshold_bps: 8_000_000,
            keyframe_interval_low_secs: 1.0,
            keyframe_interval_high_secs: 4.0,
            render_max_outstanding: 8,
            persist: true,
            default_codec: "h264".to_string(),
            default_bitrate_bps: 10_000_000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file: None,
        }
    }
}

impl ConformConfig {
    /// Reject settings the scheduler cannot run with and clamp the batch
    /// limits to [`MAX_BATCH_FRAMES`].
    pub fn validated(mut self) -> SpliceResult<Self> {
        if self.ram_cap_bytes == 0 {
            return Err(SpliceError::configuration("ram_cap_bytes must be non-zero"));
        }
        if self.batch_size == 0 || self.max_in_flight == 0 || self.render_max_outstanding == 0 {
            return Err(SpliceError::configuration(
                "batch_size, max_in_flight and render_max_outstanding must be non-zero",
            ));
        }
        if self.keyframe_interval_low_secs <= 0.0 || self.keyframe_interval_high_secs <= 0.0 {
            return Err(SpliceError::configuration(
                "keyframe intervals must be positive",
            ));
        }
        self.batch_size = self.batch_size.min(MAX_BATCH_FRAMES);
        self.max_in_flight = self.max_in_flight.min(MAX_BATCH_FRAMES);
        Ok(self)
    }

    /// Purge target once the soft cap is exceeded.
    pub fn ram_purge_target_bytes(&self) -> usize {
        self.ram_cap_bytes / 4 * 3
    }
}

impl AppConfig {
    /// Load config from the standard location, falling back to defaults.
    pub fn load() -> Self {
        let config_path = config_file_path();
        if config_path.exists() {
            match std::fs::read_to_string(&config_path) {
                Ok(content) => match serde_json::from_str(&content) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!("Failed to parse config at {:?}: {}", config_path, e);
                    }
                },
                Err(e) => {
                    tracing::warn!("Failed to read config at {:?}: {}", config_path, e);
                }
            }
        }
        Self::default()
    }

    /// Save config to the standard location.
    pub fn save(&self) -> Result<(), std::io::Error> {
        let config_path = config_file_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(config_path, json)
    }
}

/// Standard config file location.
fn config_file_path() -> PathBuf {
    let base = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".config")
        });
    base.join("splice").join("config.json")
}

/// Default warm-tier directory.
fn default_store_dir() -> PathBuf {
    let base = std::env::var("XDG_CACHE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".cache")
        });
    base.join("splice").join("conform")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_respect_batch_ceiling() {
        let config = ConformConfig::default();
        assert!(config.batch_size <= MAX_BATCH_FRAMES);
        assert!(config.max_in_flight <= MAX_BATCH_FRAMES);
    }

    #[test]
    fn test_validated_clamps_oversized_batches() {
        let config = ConformConfig {
            batch_size: 64,
            max_in_flight: 100,
            ..ConformConfig::default()
        }
        .validated()
        .unwrap();
        assert_eq!(config.batch_size, MAX_BATCH_FRAMES);
        assert_eq!(config.max_in_flight, MAX_BATCH_FRAMES);
    }

    #[test]
    fn test_validated_rejects_zero_cap() {
        let result = ConformConfig {
            ram_cap_bytes: 0,
            ..ConformConfig::default()
        }
        .validated();
        assert!(matches!(result, Err(SpliceError::Configuration { .. })));
    }

    #[test]
    fn test_purge_target_is_three_quarters() {
        let config = ConformConfig {
            ram_cap_bytes: 1000,
            ..ConformConfig::default()
        };
        assert_eq!(config.ram_purge_target_bytes(), 750);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let parsed: AppConfig =
            serde_json::from_str(r#"{"store_dir":"/tmp/splice","conform":{"batch_size":8}}"#)
                .unwrap();
        assert_eq!(parsed.conform.batch_size, 8);
        assert_eq!(parsed.conform.max_in_flight, MAX_BATCH_FRAMES);
        assert_eq!(parsed.logging.level, "info");
    }
}
