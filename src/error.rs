use thiserror::Error;

/// Synchronous validation failures surfaced to the embedding host.
///
/// Everything else in the engine degrades to "no frame this tick" and is
/// logged instead of propagated; see the per-module error policies.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("layer requires a source (stream, url, image, or source layer)")]
    MissingSource,

    #[error("layer can only have one source type")]
    MultipleSources,

    #[error("source layer '{0}' not found")]
    UnknownSourceLayer(String),

    #[error("jpeg quality {0} out of range 1-100")]
    InvalidJpegQuality(u8),

    #[error("layer buffer size must be at least 1")]
    InvalidBufferSize,

    #[error("layer depth must be finite and non-negative, got {0}")]
    InvalidDepth(f64),

    #[error("webrtc subsystem unavailable: {0}")]
    WebRtcUnavailable(String),
}
