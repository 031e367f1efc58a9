use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::types::VideoResolution;

/// Media session configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaSessionConfig {
    pub session: SessionConfig,
    pub audio: AudioConfig,
    pub video: VideoConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long `start` waits for the SFU join confirmation
    pub join_timeout_ms: u64,
    /// Minimum spacing between two subscription updates
    pub subscription_debounce_ms: u64,
    /// Longest tolerated gap between two `pump` calls
    pub pump_grace_ms: u64,
    /// Capacity of the session event broadcast channel
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            join_timeout_ms: 10_000,
            subscription_debounce_ms: 100,
            pump_grace_ms: 2_000,
            event_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Prefer the RED redundancy codec for published audio
    pub enable_red: bool,
    /// Turn on opus discontinuous transmission
    pub enable_dtx: bool,
    /// bps
    pub max_bitrate: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            enable_red: true,
            enable_dtx: true,
            max_bitrate: 500_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    pub publisher_max_resolution: VideoResolution,
    pub publisher_frame_rate: u32,
    /// Requested size for remote video unless overridden per participant
    pub default_participant_resolution: VideoResolution,
    /// bps of the full-resolution simulcast layer
    pub max_bitrate: u32,
    /// Codec forced first in the video transceiver preferences
    pub preferred_codec: String,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            publisher_max_resolution: VideoResolution::new(1280, 720),
            publisher_frame_rate: 30,
            default_participant_resolution: VideoResolution::new(1280, 720),
            max_bitrate: 1_200_000,
            preferred_codec: "h264".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl MediaSessionConfig {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // VIDCALL_SESSION__JOIN_TIMEOUT_MS=5000
        builder = builder.add_source(
            Environment::with_prefix("VIDCALL")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    #[must_use]
    pub const fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.session.join_timeout_ms)
    }

    #[must_use]
    pub const fn subscription_debounce(&self) -> Duration {
        Duration::from_millis(self.session.subscription_debounce_ms)
    }

    #[must_use]
    pub const fn pump_grace(&self) -> Duration {
        Duration::from_millis(self.session.pump_grace_ms)
    }
}
