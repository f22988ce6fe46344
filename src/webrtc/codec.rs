//! Encoder seam and process-wide bitrate state for WebRTC layers.
//!
//! The bitrate defaults are process-wide: they are set from the connection
//! being created and read by the built-in factory at encoder construction.
//! In a process with several views the last-set bitrate wins; a host that
//! needs per-connection isolation supplies its own [`EncoderFactory`].

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use openh264::encoder::{BitRate, Encoder, EncoderConfig, FrameRate};
use openh264::formats::YUVSlices;
use openh264::OpenH264API;
use tracing::info;

use super::VideoCodecKind;
use crate::frame::Frame;

static DEFAULT_BITRATE: AtomicU64 = AtomicU64::new(5_000_000);
static MIN_BITRATE: AtomicU64 = AtomicU64::new(2_500_000);
static MAX_BITRATE: AtomicU64 = AtomicU64::new(10_000_000);

/// Default/min/max encoder bitrate in force for new encoders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitrateDefaults {
    pub default: u64,
    pub min: u64,
    pub max: u64,
}

/// Set the process-wide encoder bitrate range to
/// `(target, target/2, target*2)`. Called before every peer-connection
/// creation so the encoder built for it picks the value up.
pub fn set_bitrate_defaults(bitrate_bps: u64) {
    DEFAULT_BITRATE.store(bitrate_bps, Ordering::SeqCst);
    MIN_BITRATE.store(bitrate_bps / 2, Ordering::SeqCst);
    MAX_BITRATE.store(bitrate_bps.saturating_mul(2), Ordering::SeqCst);
    info!(
        kbps = bitrate_bps / 1000,
        min_kbps = bitrate_bps / 2000,
        max_kbps = bitrate_bps * 2 / 1000,
        "codec bitrate defaults set"
    );
}

pub fn bitrate_defaults() -> BitrateDefaults {
    BitrateDefaults {
        default: DEFAULT_BITRATE.load(Ordering::SeqCst),
        min: MIN_BITRATE.load(Ordering::SeqCst),
        max: MAX_BITRATE.load(Ordering::SeqCst),
    }
}

/// Raw frame to encoded bitstream. One encoder per track worker.
pub trait VideoEncoder: Send {
    fn encode(&mut self, frame: &Frame) -> Result<Bytes>;
}

/// Builds encoders for WebRTC tracks. The built-in factory covers H.264;
/// VP8/VP9 encoders come from the host.
pub trait EncoderFactory: Send + Sync {
    fn create(&self, codec: VideoCodecKind, fps: f64) -> Result<Box<dyn VideoEncoder>>;
}

/// Built-in factory backed by the bundled H.264 encoder.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultEncoderFactory;

impl EncoderFactory for DefaultEncoderFactory {
    fn create(&self, codec: VideoCodecKind, fps: f64) -> Result<Box<dyn VideoEncoder>> {
        match codec {
            VideoCodecKind::H264 => Ok(Box::new(OpenH264Encoder::new(fps)?)),
            VideoCodecKind::Vp8 | VideoCodecKind::Vp9 => bail!(
                "no built-in {} encoder; supply an encoder factory on the layer config",
                codec.display_name()
            ),
        }
    }
}

/// H.264 encoder producing Annex-B bitstreams.
pub struct OpenH264Encoder {
    encoder: Encoder,
}

impl OpenH264Encoder {
    pub fn new(fps: f64) -> Result<Self> {
        let api = OpenH264API::from_source();
        let config = EncoderConfig::new()
            .max_frame_rate(FrameRate::from_hz(fps.max(1.0) as f32))
            .bitrate(BitRate::from_bps(bitrate_defaults().default as u32));
        let encoder = Encoder::with_api_config(api, config).context("h264 encoder init")?;
        Ok(OpenH264Encoder { encoder })
    }
}

impl VideoEncoder for OpenH264Encoder {
    fn encode(&mut self, frame: &Frame) -> Result<Bytes> {
        let rgb = frame.to_rgb();
        let w = rgb.width as usize;
        let h = rgb.height as usize;
        let yuv_data = rgb_to_yuv420(&rgb.data, rgb.width, rgb.height);

        let y_size = w * h;
        let uv_size = (w / 2) * (h / 2);
        let (y_plane, rest) = yuv_data.split_at(y_size);
        let (u_plane, v_plane) = rest.split_at(uv_size);
        let yuv = YUVSlices::new((y_plane, u_plane, v_plane), (w, h), (w, w / 2, w / 2));

        let encoded = self.encoder.encode(&yuv).context("h264 encode")?.to_vec();
        Ok(Bytes::from(ensure_annex_b(encoded)))
    }
}

// BT.601 limited-range weights, fixed-point with 8 fractional bits.
const LUMA_WEIGHTS: [i32; 3] = [66, 129, 25];
const CB_WEIGHTS: [i32; 3] = [-38, -74, 112];
const CR_WEIGHTS: [i32; 3] = [112, -94, -18];

fn weigh(px: &[u8], weights: [i32; 3], bias: i32) -> u8 {
    let dot = weights[0] * px[0] as i32 + weights[1] * px[1] as i32 + weights[2] * px[2] as i32;
    (((dot + 128) >> 8) + bias).clamp(0, 255) as u8
}

/// Pack an RGB frame into planar YUV420 (BT.601), one chroma sample per
/// 2x2 block.
fn rgb_to_yuv420(rgb: &[u8], width: u32, height: u32) -> Vec<u8> {
    let w = width as usize;
    let h = height as usize;
    let chroma_w = w / 2;
    let chroma_h = h / 2;

    let mut planes = Vec::with_capacity(w * h + 2 * chroma_w * chroma_h);

    // Luma plane, full resolution.
    planes.extend(rgb.chunks_exact(3).map(|px| weigh(px, LUMA_WEIGHTS, 16)));

    // Chroma planes, sampled from each block's top-left pixel.
    for weights in [CB_WEIGHTS, CR_WEIGHTS] {
        for block_row in 0..chroma_h {
            let row_base = block_row * 2 * w;
            for block_col in 0..chroma_w {
                let px = (row_base + block_col * 2) * 3;
                planes.push(weigh(&rgb[px..px + 3], weights, 128));
            }
        }
    }

    planes
}

const NAL_START_CODE: [u8; 4] = [0, 0, 0, 1];

fn has_start_code(data: &[u8]) -> bool {
    matches!(data, [0, 0, 1, ..] | [0, 0, 0, 1, ..])
}

/// The RTP payloader expects Annex-B (start-code) format. Some encoder
/// builds emit AVCC (length-prefixed) buffers instead; walk the length
/// prefixes and emit each NAL unit behind a start code.
fn ensure_annex_b(bitstream: Vec<u8>) -> Vec<u8> {
    if has_start_code(&bitstream) || bitstream.len() < 4 {
        return bitstream;
    }

    let mut annex_b = Vec::with_capacity(bitstream.len() + NAL_START_CODE.len() * 8);
    let mut rest = bitstream.as_slice();
    while let [a, b, c, d, tail @ ..] = rest {
        let unit_len = u32::from_be_bytes([*a, *b, *c, *d]) as usize;
        if unit_len > tail.len() {
            break; // malformed length prefix
        }
        let (unit, remaining) = tail.split_at(unit_len);
        if !unit.is_empty() {
            annex_b.extend_from_slice(&NAL_START_CODE);
            annex_b.extend_from_slice(unit);
        }
        rest = remaining;
    }
    annex_b
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitrate_defaults_follow_target() {
        set_bitrate_defaults(4_000_000);
        let defaults = bitrate_defaults();
        assert_eq!(defaults.default, 4_000_000);
        assert_eq!(defaults.min, 2_000_000);
        assert_eq!(defaults.max, 8_000_000);
    }

    #[test]
    fn annex_b_input_passes_through() {
        let data = vec![0, 0, 0, 1, 0x67, 0x42, 0, 0, 0, 1, 0x68, 0xce];
        assert_eq!(ensure_annex_b(data.clone()), data);
    }

    #[test]
    fn avcc_input_is_rewritten() {
        // Two NAL units with 4-byte big-endian length prefixes.
        let data = vec![0, 0, 0, 2, 0x67, 0x42, 0, 0, 0, 1, 0x68];
        let out = ensure_annex_b(data);
        assert_eq!(out, vec![0, 0, 0, 1, 0x67, 0x42, 0, 0, 0, 1, 0x68]);
    }

    #[test]
    fn default_factory_rejects_vpx_without_host_encoder() {
        let factory = DefaultEncoderFactory;
        assert!(factory.create(VideoCodecKind::Vp8, 30.0).is_err());
        assert!(factory.create(VideoCodecKind::Vp9, 30.0).is_err());
    }

    #[test]
    fn yuv_conversion_has_planar_layout() {
        // 2x2 white square: Y is bright, U/V sit near the neutral 128.
        let rgb = vec![255u8; 2 * 2 * 3];
        let yuv = rgb_to_yuv420(&rgb, 2, 2);
        assert_eq!(yuv.len(), 4 + 1 + 1);
        assert!(yuv[..4].iter().all(|&y| y > 200));
        assert!((yuv[4] as i32 - 128).abs() <= 2);
        assert!((yuv[5] as i32 - 128).abs() <= 2);
    }
}
