//! Owned pixel buffers and the image operations the pipeline needs:
//! cropping, resize-to-target, and JPEG/PNG encoding to data URLs.

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use fast_image_resize::images::Image as ResizeImage;
use fast_image_resize::{FilterType, PixelType, ResizeAlg, ResizeOptions, Resizer};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder};

use crate::timing::now_secs;

/// Packed pixel layout of a [`Frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Gray8,
    Rgb8,
    Rgba8,
}

impl PixelFormat {
    pub fn channels(self) -> usize {
        match self {
            PixelFormat::Gray8 => 1,
            PixelFormat::Rgb8 => 3,
            PixelFormat::Rgba8 => 4,
        }
    }

    fn resize_pixel_type(self) -> PixelType {
        match self {
            PixelFormat::Gray8 => PixelType::U8,
            PixelFormat::Rgb8 => PixelType::U8x3,
            PixelFormat::Rgba8 => PixelType::U8x4,
        }
    }
}

/// An owned video frame: packed pixels plus capture timestamp.
///
/// The payload is a [`Bytes`] buffer so clones are cheap and frames can be
/// handed to stream callbacks without copying.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Capture time in seconds on the engine's monotonic clock.
    pub timestamp: f64,
}

impl Frame {
    pub fn new(data: impl Into<Bytes>, width: u32, height: u32, format: PixelFormat) -> Result<Self> {
        let data = data.into();
        let expected = width as usize * height as usize * format.channels();
        if data.len() != expected {
            bail!(
                "frame buffer is {} bytes, expected {} for {}x{} {:?}",
                data.len(),
                expected,
                width,
                height,
                format
            );
        }
        Ok(Frame {
            data,
            width,
            height,
            format,
            timestamp: now_secs(),
        })
    }

    /// An all-black RGB frame, used by the WebRTC track when no content is
    /// available yet.
    pub fn black(width: u32, height: u32) -> Self {
        Frame {
            data: Bytes::from(vec![0u8; width as usize * height as usize * 3]),
            width,
            height,
            format: PixelFormat::Rgb8,
            timestamp: now_secs(),
        }
    }

    pub fn aspect_ratio(&self) -> f64 {
        if self.height == 0 {
            return 1.0;
        }
        self.width as f64 / self.height as f64
    }

    /// Copy out the rectangle `[x1, x2) x [y1, y2)`.
    pub fn cropped(&self, x1: u32, y1: u32, x2: u32, y2: u32) -> Result<Frame> {
        if x2 <= x1 || y2 <= y1 || x2 > self.width || y2 > self.height {
            bail!(
                "invalid crop ({x1},{y1})-({x2},{y2}) for {}x{} frame",
                self.width,
                self.height
            );
        }
        let channels = self.format.channels();
        let src_stride = self.width as usize * channels;
        let out_w = (x2 - x1) as usize;
        let out_h = (y2 - y1) as usize;
        let mut out = Vec::with_capacity(out_w * out_h * channels);
        for row in y1 as usize..y2 as usize {
            let start = row * src_stride + x1 as usize * channels;
            out.extend_from_slice(&self.data[start..start + out_w * channels]);
        }
        Ok(Frame {
            data: Bytes::from(out),
            width: x2 - x1,
            height: y2 - y1,
            format: self.format,
            timestamp: self.timestamp,
        })
    }

    /// Bilinear resize to the given dimensions.
    pub fn resized(&self, width: u32, height: u32) -> Result<Frame> {
        if width == 0 || height == 0 {
            bail!("cannot resize to {}x{}", width, height);
        }
        if width == self.width && height == self.height {
            return Ok(self.clone());
        }
        let pixel_type = self.format.resize_pixel_type();
        let src = ResizeImage::from_vec_u8(self.width, self.height, self.data.to_vec(), pixel_type)
            .context("source image for resize")?;
        let mut dst = ResizeImage::new(width, height, pixel_type);
        let mut resizer = Resizer::new();
        resizer
            .resize(
                &src,
                &mut dst,
                &ResizeOptions::new().resize_alg(ResizeAlg::Convolution(FilterType::Bilinear)),
            )
            .context("resize")?;
        Ok(Frame {
            data: Bytes::from(dst.into_vec()),
            width,
            height,
            format: self.format,
            timestamp: self.timestamp,
        })
    }

    /// A three-channel view of the frame: grayscale is broadcast, alpha is
    /// dropped. RGB frames are returned as-is.
    pub fn to_rgb(&self) -> Frame {
        match self.format {
            PixelFormat::Rgb8 => self.clone(),
            PixelFormat::Gray8 => {
                let mut out = Vec::with_capacity(self.data.len() * 3);
                for &v in self.data.iter() {
                    out.extend_from_slice(&[v, v, v]);
                }
                Frame {
                    data: Bytes::from(out),
                    width: self.width,
                    height: self.height,
                    format: PixelFormat::Rgb8,
                    timestamp: self.timestamp,
                }
            }
            PixelFormat::Rgba8 => {
                let mut out = Vec::with_capacity(self.data.len() / 4 * 3);
                for px in self.data.chunks_exact(4) {
                    out.extend_from_slice(&px[..3]);
                }
                Frame {
                    data: Bytes::from(out),
                    width: self.width,
                    height: self.height,
                    format: PixelFormat::Rgb8,
                    timestamp: self.timestamp,
                }
            }
        }
    }

    pub fn to_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        match self.format {
            PixelFormat::Gray8 => {
                JpegEncoder::new_with_quality(&mut out, quality)
                    .write_image(&self.data, self.width, self.height, ExtendedColorType::L8)
                    .context("jpeg encode")?;
            }
            // JPEG has no alpha channel, so RGBA flattens to RGB first.
            _ => {
                let rgb = self.to_rgb();
                JpegEncoder::new_with_quality(&mut out, quality)
                    .write_image(&rgb.data, rgb.width, rgb.height, ExtendedColorType::Rgb8)
                    .context("jpeg encode")?;
            }
        }
        Ok(out)
    }

    pub fn to_png(&self) -> Result<Vec<u8>> {
        let color_type = match self.format {
            PixelFormat::Gray8 => ExtendedColorType::L8,
            PixelFormat::Rgb8 => ExtendedColorType::Rgb8,
            PixelFormat::Rgba8 => ExtendedColorType::Rgba8,
        };
        let mut out = Vec::new();
        PngEncoder::new(&mut out)
            .write_image(&self.data, self.width, self.height, color_type)
            .context("png encode")?;
        Ok(out)
    }

    /// Encode to a `data:image/...;base64,` URL. Returns the URL and the raw
    /// encoded byte length (for bandwidth accounting).
    pub fn to_data_url(&self, use_png: bool, jpeg_quality: u8) -> Result<(String, usize)> {
        let (bytes, mime) = if use_png {
            (self.to_png()?, "png")
        } else {
            (self.to_jpeg(jpeg_quality)?, "jpeg")
        };
        if bytes.is_empty() {
            bail!("encoder produced an empty {mime} buffer");
        }
        let len = bytes.len();
        Ok((
            format!("data:image/{mime};base64,{}", BASE64.encode(&bytes)),
            len,
        ))
    }

    /// Grayscale PNG data URL, used for client-side layer masks.
    pub fn to_mask_data_url(&self) -> Result<String> {
        let gray = match self.format {
            PixelFormat::Gray8 => self.clone(),
            _ => {
                // Luma conversion over the RGB view.
                let rgb = self.to_rgb();
                let mut out = Vec::with_capacity(rgb.data.len() / 3);
                for px in rgb.data.chunks_exact(3) {
                    let luma = 0.299 * px[0] as f64 + 0.587 * px[1] as f64 + 0.114 * px[2] as f64;
                    out.push(luma.round().clamp(0.0, 255.0) as u8);
                }
                Frame {
                    data: Bytes::from(out),
                    width: rgb.width,
                    height: rgb.height,
                    format: PixelFormat::Gray8,
                    timestamp: rgb.timestamp,
                }
            }
        };
        let png = gray.to_png()?;
        Ok(format!("data:image/png;base64,{}", BASE64.encode(&png)))
    }
}
