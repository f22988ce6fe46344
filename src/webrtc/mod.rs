//! WebRTC transport: continuous encoded video tracks with bitrate shaping.
//!
//! WebRTC layers bypass the buffered pull path entirely: a per-layer track
//! worker pulls frames straight from the stream on the codec's cadence. The
//! manager owns a dedicated runtime thread so codec async primitives never
//! touch the host's loop; offers cross back via the view's pending-offers
//! queue.

pub mod codec;
pub mod manager;
pub mod sdp;
pub mod track;

pub use codec::{DefaultEncoderFactory, EncoderFactory, VideoEncoder};
pub use manager::{OfferCallback, OfferEvent, WebRtcManager};
pub use track::VideoTrackWorker;

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::streams::FrameSource;
use crate::viewport::Viewport;

/// Codec negotiated for a WebRTC layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VideoCodecKind {
    #[default]
    H264,
    Vp8,
    Vp9,
}

impl VideoCodecKind {
    pub fn mime_type(&self) -> &'static str {
        match self {
            VideoCodecKind::H264 => "video/H264",
            VideoCodecKind::Vp8 => "video/VP8",
            VideoCodecKind::Vp9 => "video/VP9",
        }
    }

    /// RTP clock rate, 90 kHz for all video codecs.
    pub fn clock_rate(&self) -> u32 {
        90_000
    }

    pub fn sdp_fmtp(&self) -> &'static str {
        match self {
            VideoCodecKind::H264 => {
                "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
            }
            VideoCodecKind::Vp8 => "",
            VideoCodecKind::Vp9 => "profile-id=0",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            VideoCodecKind::H264 => "H.264",
            VideoCodecKind::Vp8 => "VP8",
            VideoCodecKind::Vp9 => "VP9",
        }
    }
}

impl std::fmt::Display for VideoCodecKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}

/// SDP payload crossing between server and client: `{sdp, type}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RtcSessionPayload {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Host-facing parameters for a WebRTC layer.
#[derive(Clone)]
pub struct WebRtcLayerSpec {
    pub stream: Arc<dyn FrameSource>,
    pub z_index: i32,
    pub codec: VideoCodecKind,
    /// Target bitrate in bits per second.
    pub bitrate: u64,
    /// Output rate; `None` uses the source fps.
    pub target_fps: Option<u32>,
    pub name: String,
    /// Encoder source; `None` uses the built-in H.264 factory.
    pub encoder_factory: Option<Arc<dyn EncoderFactory>>,
}

impl WebRtcLayerSpec {
    pub fn new(stream: Arc<dyn FrameSource>) -> Self {
        WebRtcLayerSpec {
            stream,
            z_index: 0,
            codec: VideoCodecKind::H264,
            bitrate: 5_000_000,
            target_fps: None,
            name: String::new(),
            encoder_factory: None,
        }
    }
}

/// The "layer" of the WebRTC path: carries the stream, codec parameters and
/// the viewport snapshot the track worker crops against. Updated on every
/// viewport-change event.
pub struct WebRtcLayerConfig {
    pub stream: Arc<dyn FrameSource>,
    pub z_index: i32,
    pub codec: VideoCodecKind,
    pub bitrate: u64,
    pub target_fps: Option<u32>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub name: String,
    pub encoder_factory: Arc<dyn EncoderFactory>,
    viewport: Mutex<Viewport>,
}

impl WebRtcLayerConfig {
    pub fn from_spec(spec: WebRtcLayerSpec, width: u32, height: u32) -> Self {
        let name = if spec.name.is_empty() {
            format!("WebRTC-{}", spec.z_index)
        } else {
            spec.name
        };
        WebRtcLayerConfig {
            stream: spec.stream,
            z_index: spec.z_index,
            codec: spec.codec,
            bitrate: spec.bitrate,
            target_fps: spec.target_fps,
            width: Some(width),
            height: Some(height),
            name,
            encoder_factory: spec
                .encoder_factory
                .unwrap_or_else(|| Arc::new(DefaultEncoderFactory)),
            viewport: Mutex::new(Viewport::default()),
        }
    }

    pub fn set_viewport(&self, viewport: Viewport) {
        *self.viewport.lock() = viewport;
    }

    pub fn viewport(&self) -> Viewport {
        *self.viewport.lock()
    }

    pub fn viewport_zoom(&self) -> f64 {
        self.viewport.lock().zoom
    }

    /// Output rate for encoding: the explicit target if set, else the source
    /// fps bounded by its max fps, else 30. The rate is intentionally not
    /// scaled by playback speed - the stream advances through media time
    /// itself, and the encoder just needs a steady cadence.
    pub fn get_effective_fps(&self) -> f64 {
        if let Some(fps) = self.target_fps {
            return fps.max(1) as f64;
        }
        if let Some(base) = self.stream.fps() {
            if base > 0.0 {
                if let Some(cap) = self.stream.max_fps() {
                    return base.min(cap).max(1.0);
                }
                return base.max(1.0);
            }
        }
        30.0
    }

    /// Project the current viewport onto source pixels, clamped to a legal
    /// non-empty rectangle.
    pub fn get_crop_rect(&self, source_width: u32, source_height: u32) -> (u32, u32, u32, u32) {
        self.viewport.lock().crop_rect(source_width, source_height)
    }
}

impl std::fmt::Debug for WebRtcLayerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcLayerConfig")
            .field("name", &self.name)
            .field("codec", &self.codec)
            .field("bitrate", &self.bitrate)
            .field("z_index", &self.z_index)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Frame, PixelFormat};
    use crate::streams::{FrameOutput, GeneratorStream};

    fn test_stream() -> Arc<dyn FrameSource> {
        Arc::new(GeneratorStream::new(Arc::new(|_| {
            Some(FrameOutput::Single(
                Frame::new(vec![0u8; 12], 2, 2, PixelFormat::Rgb8).unwrap(),
            ))
        })))
    }

    #[test]
    fn codec_properties() {
        assert_eq!(VideoCodecKind::H264.mime_type(), "video/H264");
        assert_eq!(VideoCodecKind::Vp8.mime_type(), "video/VP8");
        assert_eq!(VideoCodecKind::Vp9.mime_type(), "video/VP9");
        assert_eq!(VideoCodecKind::H264.clock_rate(), 90_000);
        assert!(VideoCodecKind::Vp8.sdp_fmtp().is_empty());
    }

    #[test]
    fn effective_fps_prefers_explicit_target() {
        let mut spec = WebRtcLayerSpec::new(test_stream());
        spec.target_fps = Some(24);
        let config = WebRtcLayerConfig::from_spec(spec, 640, 360);
        assert_eq!(config.get_effective_fps(), 24.0);
    }

    #[test]
    fn effective_fps_defaults_without_source_rate() {
        // Generator streams have no intrinsic fps.
        let config = WebRtcLayerConfig::from_spec(WebRtcLayerSpec::new(test_stream()), 640, 360);
        assert_eq!(config.get_effective_fps(), 30.0);
    }

    #[test]
    fn crop_rect_follows_viewport() {
        let config = WebRtcLayerConfig::from_spec(WebRtcLayerSpec::new(test_stream()), 640, 360);
        config.set_viewport(Viewport::new(0.25, 0.25, 0.5, 0.5, 2.0));
        assert!(config.viewport_zoom() > 1.0);
        let (x1, y1, x2, y2) = config.get_crop_rect(640, 480);
        assert_eq!((x1, y1, x2, y2), (160, 120, 480, 360));
    }

    #[test]
    fn session_payload_serializes_type_field() {
        let payload = RtcSessionPayload {
            sdp: "v=0".into(),
            kind: "offer".into(),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "offer");
        assert_eq!(json["sdp"], "v=0");
    }
}
