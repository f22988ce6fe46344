//! A layer: one unit of independently-paced visual content.
//!
//! Each non-piggyback layer owns a background producer that pulls frames
//! from its source, runs the filter pipeline, crops to the depth-weighted
//! viewport, resizes to the display target, encodes, and pushes onto a
//! bounded buffer. Piggyback layers have no producer; frames are injected
//! synchronously from another stream's callback.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::filter::FilterPipeline;
use crate::frame::Frame;
use crate::streams::FrameSource;
use crate::timing::{now_ms, now_secs, FrameMetadata};
use crate::viewport::{effective_viewport, Viewport};

static LAYER_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn allocate_layer_id() -> String {
    format!("layer-{}", LAYER_ID_COUNTER.fetch_add(1, Ordering::Relaxed) + 1)
}

/// How a full-canvas layer scales when the view enters fullscreen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FullscreenScale {
    /// Match the video resolution.
    #[default]
    Video,
    /// Re-render at screen resolution for sharper lines.
    Screen,
}

/// Pixel placement of a layer within the canvas; `None` fields fill the
/// canvas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LayerGeometry {
    pub x: Option<i32>,
    pub y: Option<i32>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// Exactly one source feeds a layer, unless the layer is piggyback-only and
/// receives frames purely through [`Layer::inject_frame`].
#[derive(Clone)]
pub enum LayerSource {
    Stream(Arc<dyn FrameSource>),
    Url(String),
    Image(Frame),
    /// Frames come from another layer's stream; resolved through the view's
    /// layer table at wiring time to avoid reference cycles.
    Derived { source_layer: String },
    /// No own source; frames are injected externally.
    External,
}

impl std::fmt::Debug for LayerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LayerSource::Stream(_) => f.write_str("Stream"),
            LayerSource::Url(url) => f.debug_tuple("Url").field(url).finish(),
            LayerSource::Image(_) => f.write_str("Image"),
            LayerSource::Derived { source_layer } => {
                f.debug_struct("Derived").field("source_layer", source_layer).finish()
            }
            LayerSource::External => f.write_str("External"),
        }
    }
}

/// Mask applied to a layer on the client, as a pre-rendered data URL or a
/// grayscale image.
#[derive(Debug, Clone)]
pub enum LayerMask {
    DataUrl(String),
    Image(Frame),
}

/// Validated layer configuration. Build one, hand it to
/// [`crate::view::View::add_layer`].
#[derive(Clone)]
pub struct LayerSpec {
    /// Display name; defaults to `"Layer {z_index}"`.
    pub name: String,
    pub z_index: i32,
    /// Desired update rate; used when the source has no intrinsic rate.
    pub target_fps: u32,
    pub pipeline: Option<FilterPipeline>,
    pub stream: Option<Arc<dyn FrameSource>>,
    /// Output key for multi-output streams.
    pub stream_output: Option<String>,
    pub url: Option<String>,
    pub image: Option<Frame>,
    /// Id of another layer to derive frames from; implies piggyback.
    pub source_layer: Option<String>,
    pub mask: Option<LayerMask>,
    pub buffer_size: usize,
    pub jpeg_quality: u8,
    /// PNG encoding for transparent layers (slower, supports alpha).
    pub use_png: bool,
    pub x: Option<i32>,
    pub y: Option<i32>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// No producer thread; frames arrive via `inject_frame`.
    pub piggyback: bool,
    /// 0 = screen-locked, 1 = follows viewport, other values = parallax.
    pub depth: f64,
    /// Extra pixels rendered around positioned layers to hide motion seams.
    pub overscan: u32,
    pub fullscreen_scale: FullscreenScale,
}

impl Default for LayerSpec {
    /// Defaults matching a plain full-canvas content layer.
    fn default() -> Self {
        LayerSpec {
            name: String::new(),
            z_index: 0,
            target_fps: 60,
            pipeline: None,
            stream: None,
            stream_output: None,
            url: None,
            image: None,
            source_layer: None,
            mask: None,
            buffer_size: 4,
            jpeg_quality: 85,
            use_png: false,
            x: None,
            y: None,
            width: None,
            height: None,
            piggyback: false,
            depth: 1.0,
            overscan: 0,
            fullscreen_scale: FullscreenScale::Video,
        }
    }
}

/// One buffered, encoded frame ready for delivery.
#[derive(Debug, Clone)]
pub struct BufferedFrame {
    /// Local enqueue timestamp in seconds.
    pub timestamp: f64,
    /// Encoded data URL.
    pub data: String,
    pub metadata: FrameMetadata,
}

#[derive(Debug, Default)]
struct LayerState {
    buffer: VecDeque<BufferedFrame>,
    viewport: Viewport,
    target_width: u32,
    target_height: u32,
    anchor_x: i32,
    anchor_y: i32,
}

struct ProducerHandle {
    thread: thread::JoinHandle<()>,
    done_rx: mpsc::Receiver<()>,
}

pub struct Layer {
    id: String,
    name: String,
    z_index: i32,
    target_fps: u32,
    pipeline: Option<FilterPipeline>,
    source: LayerSource,
    stream_output: Option<String>,
    buffer_size: usize,
    jpeg_quality: u8,
    use_png: bool,
    geometry: Mutex<LayerGeometry>,
    piggyback: bool,
    depth: f64,
    overscan: u32,
    fullscreen_scale: FullscreenScale,
    running: AtomicBool,
    state: Mutex<LayerState>,
    producer: Mutex<Option<ProducerHandle>>,
    frames_produced: AtomicU64,
    frames_dropped: AtomicU64,
}

impl Layer {
    /// Validate a spec and build the layer.
    ///
    /// Exactly one of {stream, url, image, source_layer} must be set unless
    /// the layer is piggyback (at most one then); derived layers are always
    /// piggyback.
    pub fn new(spec: LayerSpec) -> Result<Layer, EngineError> {
        if spec.jpeg_quality == 0 || spec.jpeg_quality > 100 {
            return Err(EngineError::InvalidJpegQuality(spec.jpeg_quality));
        }
        if spec.buffer_size == 0 {
            return Err(EngineError::InvalidBufferSize);
        }
        if !spec.depth.is_finite() || spec.depth < 0.0 {
            return Err(EngineError::InvalidDepth(spec.depth));
        }

        let source_count = spec.stream.is_some() as usize
            + spec.url.is_some() as usize
            + spec.image.is_some() as usize
            + spec.source_layer.is_some() as usize;
        if source_count > 1 {
            return Err(EngineError::MultipleSources);
        }

        let mut piggyback = spec.piggyback;
        let source = if let Some(stream) = spec.stream {
            LayerSource::Stream(stream)
        } else if let Some(url) = spec.url {
            LayerSource::Url(url)
        } else if let Some(image) = spec.image {
            LayerSource::Image(image)
        } else if let Some(source_layer) = spec.source_layer {
            piggyback = true;
            LayerSource::Derived { source_layer }
        } else if piggyback {
            LayerSource::External
        } else {
            return Err(EngineError::MissingSource);
        };

        let z_index = spec.z_index;
        Ok(Layer {
            id: allocate_layer_id(),
            name: if spec.name.is_empty() {
                format!("Layer {z_index}")
            } else {
                spec.name
            },
            z_index,
            target_fps: spec.target_fps.max(1),
            pipeline: spec.pipeline,
            source,
            stream_output: spec.stream_output,
            buffer_size: spec.buffer_size,
            jpeg_quality: spec.jpeg_quality,
            use_png: spec.use_png,
            geometry: Mutex::new(LayerGeometry {
                x: spec.x,
                y: spec.y,
                width: spec.width,
                height: spec.height,
            }),
            piggyback,
            depth: spec.depth,
            overscan: spec.overscan,
            fullscreen_scale: spec.fullscreen_scale,
            running: AtomicBool::new(false),
            state: Mutex::new(LayerState::default()),
            producer: Mutex::new(None),
            frames_produced: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn z_index(&self) -> i32 {
        self.z_index
    }

    pub fn target_fps(&self) -> u32 {
        self.target_fps
    }

    pub fn source(&self) -> &LayerSource {
        &self.source
    }

    pub fn stream(&self) -> Option<&Arc<dyn FrameSource>> {
        match &self.source {
            LayerSource::Stream(stream) => Some(stream),
            _ => None,
        }
    }

    pub fn stream_output(&self) -> Option<&str> {
        self.stream_output.as_deref()
    }

    pub fn pipeline(&self) -> Option<&FilterPipeline> {
        self.pipeline.as_ref()
    }

    pub fn piggyback(&self) -> bool {
        self.piggyback
    }

    pub fn depth(&self) -> f64 {
        self.depth
    }

    pub fn overscan(&self) -> u32 {
        self.overscan
    }

    pub fn fullscreen_scale(&self) -> FullscreenScale {
        self.fullscreen_scale
    }

    pub fn use_png(&self) -> bool {
        self.use_png
    }

    pub fn jpeg_quality(&self) -> u8 {
        self.jpeg_quality
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn geometry(&self) -> LayerGeometry {
        *self.geometry.lock()
    }

    /// Merge non-`None` fields into the layer geometry.
    pub fn apply_geometry(
        &self,
        x: Option<i32>,
        y: Option<i32>,
        width: Option<u32>,
        height: Option<u32>,
    ) {
        let mut geometry = self.geometry.lock();
        if x.is_some() {
            geometry.x = x;
        }
        if y.is_some() {
            geometry.y = y;
        }
        if width.is_some() {
            geometry.width = width;
        }
        if height.is_some() {
            geometry.height = height;
        }
    }

    /// Whether this layer has a static (non-streaming) source.
    pub fn is_static(&self) -> bool {
        matches!(self.source, LayerSource::Url(_) | LayerSource::Image(_))
    }

    /// Source tag used in the layer announcement.
    pub fn source_type(&self) -> &'static str {
        match &self.source {
            LayerSource::Derived { .. } => "derived",
            LayerSource::Stream(stream) => stream.kind(),
            LayerSource::Url(_) => "url",
            LayerSource::Image(_) => "image",
            LayerSource::External => "stream",
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn frames_produced(&self) -> u64 {
        self.frames_produced.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }

    pub fn buffer_len(&self) -> usize {
        self.state.lock().buffer.len()
    }

    /// Start frame production. Starts the underlying stream if present and
    /// spawns the producer worker unless the layer is piggyback. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state.lock().buffer.clear();

        let Some(stream) = self.stream().cloned() else {
            return;
        };
        stream.start();

        if self.piggyback {
            return;
        }

        let (done_tx, done_rx) = mpsc::channel();
        let layer = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("layer-producer-{}", self.id))
            .spawn(move || {
                layer.producer_loop(stream);
                let _ = done_tx.send(());
            });
        match spawned {
            Ok(handle) => {
                *self.producer.lock() = Some(ProducerHandle {
                    thread: handle,
                    done_rx,
                });
            }
            Err(e) => {
                warn!(layer_id = %self.id, error = %e, "failed to spawn producer");
                self.running.store(false, Ordering::SeqCst);
            }
        }
    }

    /// Halt the producer. Does not stop the underlying stream - it may be
    /// shared with other layers. Joins the worker with a 1 s timeout, after
    /// which it is abandoned. Idempotent.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.producer.lock().take() {
            match handle.done_rx.recv_timeout(Duration::from_secs(1)) {
                Ok(()) => {
                    let _ = handle.thread.join();
                }
                Err(_) => {
                    warn!(layer_id = %self.id, "producer did not stop within 1s, abandoning");
                }
            }
        }
    }

    /// Pop the oldest buffered frame, if any.
    pub fn get_buffered_frame(&self) -> Option<BufferedFrame> {
        self.state.lock().buffer.pop_front()
    }

    /// Static content for url/image layers: the URL itself, or the image
    /// encoded as a data URL.
    pub fn get_static_frame(&self) -> Option<String> {
        match &self.source {
            LayerSource::Url(url) => Some(url.clone()),
            LayerSource::Image(image) => image
                .to_data_url(self.use_png, self.jpeg_quality)
                .ok()
                .map(|(url, _)| url),
            _ => None,
        }
    }

    /// Enqueue a pre-encoded frame directly, evicting oldest frames when the
    /// buffer is at capacity. Used by piggyback layers from another stream's
    /// callback, so the frame is available with zero scheduler delay.
    ///
    /// `step_timings` are `(display name, duration ms)` pairs that become
    /// filter-timing entries with start 0 so the client can render them.
    pub fn inject_frame(
        &self,
        encoded: String,
        birth_time: f64,
        step_timings: Option<&[(String, f64)]>,
        anchor: Option<(i32, i32)>,
    ) {
        let mut metadata = FrameMetadata::next();
        metadata.capture_time = birth_time * 1000.0;
        if let Some(timings) = step_timings {
            for (name, duration_ms) in timings {
                metadata.add_filter_timing(name.clone(), 0.0, *duration_ms);
            }
        }
        // Already encoded by the caller.
        metadata.encode_start = now_ms();
        metadata.encode_end = metadata.encode_start;
        metadata.send_time = now_ms();
        // Base64 carries ~4/3 of the binary size.
        metadata.frame_bytes = (encoded.len() * 3 / 4) as u64;

        let timestamp = now_secs();
        let mut state = self.state.lock();
        if let Some((anchor_x, anchor_y)) = anchor {
            metadata.anchor_x = Some(anchor_x);
            metadata.anchor_y = Some(anchor_y);
            state.anchor_x = anchor_x;
            state.anchor_y = anchor_y;
        }
        while state.buffer.len() >= self.buffer_size {
            state.buffer.pop_front();
        }
        metadata.buffer_length = state.buffer.len() + 1;
        metadata.buffer_capacity = self.buffer_size;
        state.buffer.push_back(BufferedFrame {
            timestamp,
            data: encoded,
            metadata,
        });
        drop(state);
        self.frames_produced.fetch_add(1, Ordering::Relaxed);
    }

    /// Replace the layer's viewport snapshot.
    pub fn set_viewport(&self, viewport: Viewport) {
        self.state.lock().viewport = viewport;
    }

    pub fn viewport(&self) -> Viewport {
        self.state.lock().viewport
    }

    /// Set the resize-before-encode target.
    pub fn set_target_size(&self, width: u32, height: u32) {
        let mut state = self.state.lock();
        state.target_width = width;
        state.target_height = height;
    }

    pub fn target_size(&self) -> (u32, u32) {
        let state = self.state.lock();
        (state.target_width, state.target_height)
    }

    /// Anchor position of the most recent overscan frame.
    pub fn anchor(&self) -> (i32, i32) {
        let state = self.state.lock();
        (state.anchor_x, state.anchor_y)
    }

    /// The viewport snapshot weighted by this layer's depth.
    pub fn effective_viewport(&self) -> Viewport {
        let viewport = self.viewport();
        effective_viewport(&viewport, self.depth)
    }

    pub fn effective_zoom(&self) -> f64 {
        self.effective_viewport().zoom
    }

    /// Crop rectangle for the effective viewport in source pixels.
    pub fn effective_crop(&self, source_width: u32, source_height: u32) -> (u32, u32, u32, u32) {
        self.effective_viewport().crop_rect(source_width, source_height)
    }

    /// Effective production rate: source fps scaled by playback speed,
    /// capped by the source's max fps; `target_fps` for sources without an
    /// intrinsic rate. Never below 1.
    pub fn effective_fps(&self) -> f64 {
        if let Some(stream) = self.stream() {
            if let Some(base) = stream.fps() {
                let mut fps = base * stream.playback_speed();
                if let Some(cap) = stream.max_fps() {
                    fps = fps.min(cap);
                }
                return fps.max(1.0);
            }
        }
        self.target_fps as f64
    }

    /// Re-run filter + crop + resize + encode on the source's last frame and
    /// enqueue exactly one frame, clearing the buffer first. Used when the
    /// source is paused but the viewport changed, so the client can repaint
    /// without waiting for the next real frame. Returns whether a frame was
    /// produced.
    pub fn update_from_last_frame(&self) -> bool {
        let Some(stream) = self.stream() else {
            return false;
        };
        let Some(mut frame) = stream.last_frame() else {
            return false;
        };

        let mut metadata = FrameMetadata::next();
        metadata.capture_time = stream.last_frame_timestamp() * 1000.0;

        frame = self.apply_pipeline(frame, &mut metadata);

        let effective = self.effective_viewport();
        if effective.zoom > 1.0 {
            match nav_thumbnail(&frame) {
                Ok(thumb) => metadata.nav_thumbnail = Some(thumb),
                Err(e) => debug!(layer_id = %self.id, error = %e, "nav thumbnail failed"),
            }
            let (x1, y1, x2, y2) = effective.crop_rect(frame.width, frame.height);
            if let Ok(cropped) = frame.cropped(x1, y1, x2, y2) {
                frame = cropped;
            }
        }

        let (target_width, target_height) = self.target_size();
        if target_width > 0
            && target_height > 0
            && (frame.width != target_width || frame.height != target_height)
        {
            if let Ok(resized) = frame.resized(target_width, target_height) {
                frame = resized;
            }
        }

        metadata.frame_width = frame.width;
        metadata.frame_height = frame.height;
        metadata.encode_start = now_ms();
        let (encoded, frame_bytes) = match frame.to_data_url(self.use_png, self.jpeg_quality) {
            Ok(result) => result,
            Err(e) => {
                debug!(layer_id = %self.id, error = %e, "encode failed");
                return false;
            }
        };
        metadata.frame_bytes = frame_bytes as u64;
        metadata.encode_end = now_ms();
        metadata.send_time = now_ms();
        metadata.buffer_length = 1;
        metadata.buffer_capacity = self.buffer_size;

        let timestamp = now_secs();
        let mut state = self.state.lock();
        state.buffer.clear();
        state.buffer.push_back(BufferedFrame {
            timestamp,
            data: encoded,
            metadata,
        });
        drop(state);
        self.frames_produced.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Run the pipeline, recording per-filter timings. On a filter failure
    /// the remaining stages are skipped and the last good frame is used.
    pub(crate) fn apply_pipeline(&self, mut frame: Frame, metadata: &mut FrameMetadata) -> Frame {
        if let Some(pipeline) = &self.pipeline {
            for filter in pipeline.filters() {
                let start = now_ms();
                match filter.apply(&frame) {
                    Ok(filtered) => {
                        frame = filtered;
                        metadata.add_filter_timing(filter.name(), start, now_ms());
                    }
                    Err(e) => {
                        warn!(
                            layer_id = %self.id,
                            filter = filter.name(),
                            error = %e,
                            "filter failed, using last good frame"
                        );
                        break;
                    }
                }
            }
        }
        frame
    }

    /// Background producer: paces the source at the effective fps and keeps
    /// the bounded buffer topped up.
    fn producer_loop(self: Arc<Self>, stream: Arc<dyn FrameSource>) {
        let start_time = now_secs();
        let mut next_frame_time = start_time;
        let mut last_frame_index: Option<u64> = None;

        while self.running.load(Ordering::SeqCst) {
            if self.buffer_len() >= self.buffer_size {
                thread::sleep(Duration::from_millis(1));
                continue;
            }

            let timestamp = now_secs() - start_time;
            let (output, frame_index) = stream.get_frame(timestamp);
            let Some(output) = output else {
                thread::sleep(Duration::from_millis(1));
                continue;
            };
            if last_frame_index == Some(frame_index) {
                thread::sleep(Duration::from_millis(1));
                continue;
            }
            last_frame_index = Some(frame_index);

            let Some(mut frame) = output.select(self.stream_output.as_deref()) else {
                thread::sleep(Duration::from_millis(1));
                continue;
            };

            let mut metadata = FrameMetadata::next();
            metadata.capture_time = stream.last_frame_timestamp() * 1000.0;

            frame = self.apply_pipeline(frame, &mut metadata);

            // Depth-weighted viewport crop. While zoomed, a small thumbnail
            // of the uncropped frame rides along for the navigation window.
            let effective = self.effective_viewport();
            if effective.zoom > 1.0 {
                match nav_thumbnail(&frame) {
                    Ok(thumb) => metadata.nav_thumbnail = Some(thumb),
                    Err(e) => debug!(layer_id = %self.id, error = %e, "nav thumbnail failed"),
                }
                let (x1, y1, x2, y2) = effective.crop_rect(frame.width, frame.height);
                if let Ok(cropped) = frame.cropped(x1, y1, x2, y2) {
                    frame = cropped;
                }
            }

            let (target_width, target_height) = self.target_size();
            if target_width > 0
                && target_height > 0
                && (frame.width > target_width || frame.height > target_height)
            {
                if let Ok(resized) = frame.resized(target_width, target_height) {
                    frame = resized;
                }
            }

            metadata.frame_width = frame.width;
            metadata.frame_height = frame.height;

            metadata.encode_start = now_ms();
            let (encoded, frame_bytes) = match frame.to_data_url(self.use_png, self.jpeg_quality) {
                Ok(result) => result,
                Err(e) => {
                    debug!(layer_id = %self.id, error = %e, "encode failed, dropping frame");
                    continue;
                }
            };
            metadata.frame_bytes = frame_bytes as u64;
            metadata.encode_end = now_ms();
            metadata.send_time = now_ms();

            let effective_fps = self.effective_fps();
            let frame_interval = 1.0 / effective_fps;

            {
                let mut state = self.state.lock();
                metadata.buffer_length = state.buffer.len() + 1;
                metadata.buffer_capacity = self.buffer_size;
                metadata.effective_fps = effective_fps;
                state.buffer.push_back(BufferedFrame {
                    timestamp,
                    data: encoded,
                    metadata,
                });
            }
            self.frames_produced.fetch_add(1, Ordering::Relaxed);

            next_frame_time += frame_interval;
            let sleep_time = next_frame_time - now_secs();
            if sleep_time > 0.0 {
                thread::sleep(Duration::from_secs_f64(sleep_time));
            } else if sleep_time < -frame_interval {
                // Fell more than one interval behind; reset the pacing clock.
                next_frame_time = now_secs();
                self.frames_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

impl std::fmt::Debug for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Layer")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("z_index", &self.z_index)
            .field("source", &self.source)
            .field("piggyback", &self.piggyback)
            .field("depth", &self.depth)
            .finish()
    }
}

/// Aspect-preserving thumbnail of the full frame (~90 px high, JPEG q60),
/// shown in the client's navigation window while zoomed.
fn nav_thumbnail(frame: &Frame) -> anyhow::Result<String> {
    let height = 90u32.min(frame.height.max(1));
    let width = ((frame.width as u64 * height as u64) / frame.height.max(1) as u64).max(1) as u32;
    let thumb = frame.resized(width, height)?;
    let (url, _) = thumb.to_data_url(false, 60)?;
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelFormat;
    use crate::streams::{FrameOutput, GeneratorStream};
    use assert_matches::assert_matches;

    fn solid_frame(value: u8, width: u32, height: u32) -> Frame {
        Frame::new(
            vec![value; (width * height * 3) as usize],
            width,
            height,
            PixelFormat::Rgb8,
        )
        .unwrap()
    }

    fn generator_stream() -> Arc<dyn FrameSource> {
        let stream =
            GeneratorStream::new(Arc::new(|_| Some(FrameOutput::Single(solid_frame(60, 64, 48)))));
        Arc::new(stream)
    }

    fn stream_spec() -> LayerSpec {
        LayerSpec {
            stream: Some(generator_stream()),
            ..LayerSpec::default()
        }
    }

    #[test]
    fn construction_requires_a_source() {
        let err = Layer::new(LayerSpec::default()).unwrap_err();
        assert_matches!(err, EngineError::MissingSource);
    }

    #[test]
    fn construction_rejects_multiple_sources() {
        let spec = LayerSpec {
            stream: Some(generator_stream()),
            url: Some("/static/logo.png".into()),
            ..LayerSpec::default()
        };
        assert_matches!(Layer::new(spec).unwrap_err(), EngineError::MultipleSources);
    }

    #[test]
    fn piggyback_allows_missing_source() {
        let spec = LayerSpec {
            piggyback: true,
            ..LayerSpec::default()
        };
        let layer = Layer::new(spec).unwrap();
        assert!(layer.piggyback());
        assert_matches!(layer.source(), LayerSource::External);
    }

    #[test]
    fn derived_layers_are_always_piggyback() {
        let spec = LayerSpec {
            source_layer: Some("layer-1".into()),
            ..LayerSpec::default()
        };
        let layer = Layer::new(spec).unwrap();
        assert!(layer.piggyback());
        assert_eq!(layer.source_type(), "derived");
    }

    #[test]
    fn construction_validates_quality_and_buffer() {
        let spec = LayerSpec {
            jpeg_quality: 101,
            ..stream_spec()
        };
        assert_matches!(Layer::new(spec).unwrap_err(), EngineError::InvalidJpegQuality(101));

        let spec = LayerSpec {
            buffer_size: 0,
            ..stream_spec()
        };
        assert_matches!(Layer::new(spec).unwrap_err(), EngineError::InvalidBufferSize);
    }

    #[test]
    fn injection_respects_capacity_and_evicts_oldest() {
        let layer = Layer::new(LayerSpec {
            piggyback: true,
            buffer_size: 2,
            ..LayerSpec::default()
        })
        .unwrap();

        for i in 0..5 {
            layer.inject_frame(format!("data:image/jpeg;base64,frame{i}"), i as f64, None, None);
            assert!(layer.buffer_len() <= 2);
        }

        let first = layer.get_buffered_frame().unwrap();
        let second = layer.get_buffered_frame().unwrap();
        assert!(layer.get_buffered_frame().is_none());
        // The two most recent injections survive.
        assert!(first.data.ends_with("frame3"));
        assert!(second.data.ends_with("frame4"));
        assert_eq!(first.metadata.capture_time, 3000.0);
        assert_eq!(second.metadata.capture_time, 4000.0);
    }

    #[test]
    fn injected_step_timings_become_filter_entries() {
        let layer = Layer::new(LayerSpec {
            piggyback: true,
            ..LayerSpec::default()
        })
        .unwrap();
        let timings = vec![("Crop".to_owned(), 0.4), ("Encode".to_owned(), 1.2)];
        layer.inject_frame("data:image/jpeg;base64,x".into(), 1.0, Some(&timings), Some((10, 20)));

        let frame = layer.get_buffered_frame().unwrap();
        assert_eq!(frame.metadata.filter_timings.len(), 2);
        assert_eq!(frame.metadata.filter_timings[0].name, "Crop");
        assert_eq!(frame.metadata.filter_timings[0].start_ms, 0.0);
        assert_eq!(frame.metadata.anchor_x, Some(10));
        assert_eq!(frame.metadata.anchor_y, Some(20));
    }

    #[test]
    fn buffered_frames_come_out_fifo() {
        let layer = Layer::new(LayerSpec {
            piggyback: true,
            buffer_size: 4,
            ..LayerSpec::default()
        })
        .unwrap();
        for i in 0..3 {
            layer.inject_frame(format!("data:image/jpeg;base64,{i}"), i as f64, None, None);
        }
        let mut last_timestamp = f64::MIN;
        while let Some(frame) = layer.get_buffered_frame() {
            assert!(frame.timestamp >= last_timestamp);
            last_timestamp = frame.timestamp;
        }
    }

    #[test]
    fn producer_fills_bounded_buffer() {
        let layer = Arc::new(
            Layer::new(LayerSpec {
                buffer_size: 3,
                target_fps: 240,
                ..stream_spec()
            })
            .unwrap(),
        );
        layer.start();
        // Generator produces on every tick, so the buffer should reach its
        // bound quickly and never exceed it.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while layer.buffer_len() < 3 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(layer.buffer_len(), 3);
        thread::sleep(Duration::from_millis(20));
        assert!(layer.buffer_len() <= 3);
        layer.stop();
        assert!(layer.frames_produced() >= 3);
    }

    #[test]
    fn stop_halts_production() {
        let layer = Arc::new(Layer::new(stream_spec()).unwrap());
        layer.start();
        layer.stop();
        while layer.get_buffered_frame().is_some() {}
        let produced = layer.frames_produced();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(layer.frames_produced(), produced);
        assert!(layer.get_buffered_frame().is_none());
    }

    #[test]
    fn effective_viewport_honors_depth() {
        let layer = Layer::new(LayerSpec {
            depth: 0.0,
            ..stream_spec()
        })
        .unwrap();
        layer.set_viewport(Viewport::new(0.25, 0.25, 0.5, 0.5, 2.0));
        assert_eq!(layer.effective_viewport(), Viewport::default());

        let layer = Layer::new(stream_spec()).unwrap();
        let viewport = Viewport::new(0.25, 0.25, 0.5, 0.5, 2.0);
        layer.set_viewport(viewport);
        assert_eq!(layer.effective_viewport(), viewport);
    }

    #[test]
    fn update_from_last_frame_without_stream_fails() {
        let layer = Layer::new(LayerSpec {
            piggyback: true,
            ..LayerSpec::default()
        })
        .unwrap();
        assert!(!layer.update_from_last_frame());
    }

    #[test]
    fn update_from_last_frame_produces_single_zoomed_frame() {
        let stream = Arc::new(GeneratorStream::new(Arc::new(|_| {
            Some(FrameOutput::Single(solid_frame(90, 128, 96)))
        })));
        stream.start();
        stream.get_frame(0.0);
        stream.pause();

        let layer = Layer::new(LayerSpec {
            stream: Some(stream),
            ..LayerSpec::default()
        })
        .unwrap();
        layer.set_target_size(64, 48);
        layer.set_viewport(Viewport::new(0.25, 0.25, 0.5, 0.5, 2.0));

        // Fill the buffer with stale frames first; the refresh replaces them.
        layer.inject_frame("data:image/jpeg;base64,stale".into(), 0.0, None, None);
        assert!(layer.update_from_last_frame());
        assert_eq!(layer.buffer_len(), 1);

        let frame = layer.get_buffered_frame().unwrap();
        let thumb = frame.metadata.nav_thumbnail.as_deref().unwrap();
        assert!(thumb.starts_with("data:image/jpeg;base64,"));
        assert_eq!(frame.metadata.frame_width, 64);
        assert_eq!(frame.metadata.frame_height, 48);
    }

    #[test]
    fn static_layer_produces_no_frames() {
        let layer = Arc::new(
            Layer::new(LayerSpec {
                url: Some("/static/banner.png".into()),
                ..LayerSpec::default()
            })
            .unwrap(),
        );
        assert!(layer.is_static());
        layer.start();
        thread::sleep(Duration::from_millis(30));
        layer.stop();
        assert_eq!(layer.frames_produced(), 0);
        assert_eq!(layer.get_static_frame().as_deref(), Some("/static/banner.png"));
    }
}
