//! framestack - multi-layer real-time video compositing and transport engine.
//!
//! The engine ingests frames from heterogeneous sources (decoded video files,
//! cameras, generator closures, derived views of other layers), stacks them
//! into independently-paced layers with per-layer filter pipelines, viewport
//! cropping and parallax depth, and delivers each layer to a remote client
//! over one of two transports: pull-based JPEG/PNG-over-message delivery or a
//! continuous WebRTC video track with bitrate shaping.
//!
//! The crate is embedded in a host process. The host owns the client
//! connection ([`protocol::ClientSink`]), dispatches inbound events
//! ([`protocol::ClientEvent`]) to the [`view::View`], and supplies the codec
//! collaborators (video decoders, camera devices, filter kernels, and - for
//! VP8/VP9 WebRTC layers - video encoders).

pub mod config;
pub mod error;
pub mod filter;
pub mod frame;
pub mod layer;
pub mod metrics;
pub mod protocol;
pub mod streams;
pub mod timing;
pub mod view;
pub mod viewport;
pub mod webrtc;

pub use config::EngineConfig;
pub use error::EngineError;
pub use filter::{FilterPipeline, FrameFilter};
pub use frame::{Frame, PixelFormat};
pub use layer::{FullscreenScale, Layer, LayerMask, LayerSpec};
pub use protocol::{ClientCommand, ClientEvent, ClientSink};
pub use streams::{
    CameraDevice, CameraStream, FrameOutput, FrameSource, GeneratorStream, VideoDecoder,
    VideoFileStream, VideoOptions,
};
pub use view::View;
pub use viewport::Viewport;
pub use webrtc::{VideoCodecKind, WebRtcLayerSpec};
