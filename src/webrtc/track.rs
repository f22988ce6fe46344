//! Per-layer video track feeding.
//!
//! Each WebRTC connection has one worker that pulls raw frames from the
//! layer's stream on the codec cadence, crops to the config viewport,
//! resizes, encodes and writes samples onto a `TrackLocalStaticSample`. Any
//! failure degrades to an encoded black frame so the track never stalls the
//! codec.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{debug, warn};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::codec::VideoEncoder;
use super::WebRtcLayerConfig;
use crate::frame::Frame;
use crate::timing::now_secs;

/// Fallback frame size when the config has no target and the stream has not
/// produced anything yet.
const FALLBACK_WIDTH: u32 = 1920;
const FALLBACK_HEIGHT: u32 = 1080;

pub struct VideoTrackWorker {
    track: Arc<TrackLocalStaticSample>,
    config: Arc<WebRtcLayerConfig>,
    encoder: Box<dyn VideoEncoder>,
}

impl VideoTrackWorker {
    /// Build the track and its encoder for one connection.
    pub fn new(config: Arc<WebRtcLayerConfig>) -> Result<Self> {
        let capability = RTCRtpCodecCapability {
            mime_type: config.codec.mime_type().to_owned(),
            clock_rate: config.codec.clock_rate(),
            channels: 0,
            sdp_fmtp_line: config.codec.sdp_fmtp().to_owned(),
            rtcp_feedback: vec![],
        };
        let track = Arc::new(TrackLocalStaticSample::new(
            capability,
            format!("video-{}", config.name),
            "framestack".to_owned(),
        ));
        let encoder = config
            .encoder_factory
            .create(config.codec, config.get_effective_fps())?;
        Ok(VideoTrackWorker {
            track,
            config,
            encoder,
        })
    }

    pub fn track(&self) -> Arc<TrackLocalStaticSample> {
        self.track.clone()
    }

    /// Feed samples until the worker is aborted by the manager.
    pub async fn run(mut self) {
        let start = Instant::now();
        let mut frame_count: u64 = 0;

        loop {
            let elapsed = start.elapsed().as_secs_f64();
            // Presentation timestamp at the 90 kHz RTP time base.
            let pts = (elapsed * self.config.codec.clock_rate() as f64) as u32;

            let frame = self.acquire_frame();
            let fps = self.config.get_effective_fps();

            let data = match self.encoder.encode(&frame) {
                Ok(data) => data,
                Err(e) => {
                    warn!(layer = %self.config.name, error = %e, "encode failed, sending black frame");
                    let black = self.black_frame();
                    match self.encoder.encode(&black) {
                        Ok(data) => data,
                        Err(e) => {
                            debug!(layer = %self.config.name, error = %e, "black frame encode failed");
                            tokio::time::sleep(Duration::from_secs_f64(1.0 / fps)).await;
                            continue;
                        }
                    }
                }
            };

            if !data.is_empty() {
                let sample = Sample {
                    data,
                    duration: Duration::from_secs_f64(1.0 / fps),
                    packet_timestamp: pts,
                    ..Default::default()
                };
                // Fails until negotiation completes; the loop just keeps
                // pacing and retries with the next frame.
                if let Err(e) = self.track.write_sample(&sample).await {
                    debug!(layer = %self.config.name, error = %e, "write_sample failed");
                }
            }

            frame_count += 1;

            // Throttle to the effective rate.
            let target_time = frame_count as f64 / fps;
            let elapsed = start.elapsed().as_secs_f64();
            if elapsed < target_time {
                tokio::time::sleep(Duration::from_secs_f64(target_time - elapsed)).await;
            }
        }
    }

    fn black_frame(&self) -> Frame {
        Frame::black(
            self.config.width.unwrap_or(FALLBACK_WIDTH),
            self.config.height.unwrap_or(FALLBACK_HEIGHT),
        )
    }

    /// Produce the next raw frame: live frame, else the stream's last frame,
    /// else black. Applies the config crop while zoomed and resizes to the
    /// configured output size.
    fn acquire_frame(&self) -> Frame {
        let stream = &self.config.stream;

        // First-time auto-start; a user-controlled pause is respected.
        if !stream.is_running() && !stream.is_paused() {
            debug!(layer = %self.config.name, "starting stream for track");
            stream.start();
        }

        let (output, _) = stream.get_frame(now_secs());
        let frame = output
            .and_then(|o| o.select(None))
            .or_else(|| stream.last_frame());

        let Some(mut frame) = frame else {
            return self.black_frame();
        };

        if self.config.viewport_zoom() > 1.0 {
            let (x1, y1, x2, y2) = self.config.get_crop_rect(frame.width, frame.height);
            match frame.cropped(x1, y1, x2, y2) {
                Ok(cropped) => frame = cropped,
                Err(e) => debug!(layer = %self.config.name, error = %e, "track crop failed"),
            }
        }

        // Encoder input is three-channel; grayscale broadcasts, alpha drops.
        let mut frame = frame.to_rgb();

        if let (Some(width), Some(height)) = (self.config.width, self.config.height) {
            if frame.width != width || frame.height != height {
                match frame.resized(width, height) {
                    Ok(resized) => frame = resized,
                    Err(e) => {
                        debug!(layer = %self.config.name, error = %e, "track resize failed");
                        return self.black_frame();
                    }
                }
            }
        }

        frame
    }
}
