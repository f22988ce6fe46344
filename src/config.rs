use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Engine configuration. Every field has a default, so hosts can construct
/// views with `EngineConfig::default()` or load overrides from a TOML file.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct EngineConfig {
    #[serde(default)]
    pub view: ViewConfig,

    #[serde(default)]
    pub delivery: DeliveryConfig,

    #[serde(default)]
    pub webrtc: WebRtcConfig,

    #[serde(default)]
    pub layer: LayerDefaults,
}

/// Display dimensions of the view canvas.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ViewConfig {
    #[serde(default = "default_width")]
    pub width: u32,

    #[serde(default = "default_height")]
    pub height: u32,
}

/// Pull-delivery tuning.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct DeliveryConfig {
    /// Interval of the pending-request garbage-collection tick.
    #[serde(default = "default_pending_tick_ms")]
    pub pending_tick_ms: u64,

    /// Interval of the WebRTC config/offer drain tick.
    #[serde(default = "default_webrtc_tick_ms")]
    pub webrtc_tick_ms: u64,

    /// Safety valve: above this many pending pull tasks the map is cleared.
    #[serde(default = "default_pending_limit")]
    pub pending_limit: usize,
}

/// WebRTC transport settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct WebRtcConfig {
    #[serde(default = "default_stun_server")]
    pub stun_server: String,

    #[serde(default = "default_bitrate")]
    pub default_bitrate: u64,
}

/// Defaults applied to new layers.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct LayerDefaults {
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,

    #[serde(default = "default_target_fps")]
    pub target_fps: u32,
}

fn default_width() -> u32 {
    1920
}
fn default_height() -> u32 {
    1080
}
fn default_pending_tick_ms() -> u64 {
    5
}
fn default_webrtc_tick_ms() -> u64 {
    100
}
fn default_pending_limit() -> usize {
    100
}
fn default_stun_server() -> String {
    "stun:stun.l.google.com:19302".to_string()
}
fn default_bitrate() -> u64 {
    5_000_000
}
fn default_buffer_size() -> usize {
    4
}
fn default_jpeg_quality() -> u8 {
    85
}
fn default_target_fps() -> u32 {
    60
}

impl Default for ViewConfig {
    fn default() -> Self {
        ViewConfig {
            width: default_width(),
            height: default_height(),
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        DeliveryConfig {
            pending_tick_ms: default_pending_tick_ms(),
            webrtc_tick_ms: default_webrtc_tick_ms(),
            pending_limit: default_pending_limit(),
        }
    }
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        WebRtcConfig {
            stun_server: default_stun_server(),
            default_bitrate: default_bitrate(),
        }
    }
}

impl Default for LayerDefaults {
    fn default() -> Self {
        LayerDefaults {
            buffer_size: default_buffer_size(),
            jpeg_quality: default_jpeg_quality(),
            target_fps: default_target_fps(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;
        let config: EngineConfig =
            toml::from_str(&content).context("Failed to parse config file")?;
        Ok(config)
    }

    /// Config with explicit canvas dimensions, other settings at default.
    pub fn with_size(width: u32, height: u32) -> Self {
        EngineConfig {
            view: ViewConfig { width, height },
            ..Default::default()
        }
    }
}
