//! The view: owns the layer stack, the shared viewport, the client event
//! plumbing, and both transports.
//!
//! Pull delivery answers `frame-request` events from the bounded per-layer
//! buffers, falling back to one-off production on a blocking worker. The
//! WebRTC half keeps two deferred queues (configs awaiting start, offers
//! awaiting dispatch) drained by a periodic tick, because offer generation
//! happens on the manager's runtime while dispatch must happen here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::frame::Frame;
use crate::layer::{BufferedFrame, Layer, LayerMask, LayerSpec};
use crate::metrics::{EngineMetrics, FpsCounter};
use crate::protocol::{ClientCommand, ClientEvent, ClientSink, LayerAnnouncement, MouseEventArgs};
use crate::streams::{CallbackHandle, FrameSource};
use crate::timing::{now_ms, now_secs, FrameMetadata};
use crate::viewport::Viewport;
use crate::webrtc::manager::{OfferEvent, WebRtcManager};
use crate::webrtc::{RtcSessionPayload, WebRtcLayerConfig, WebRtcLayerSpec};

static WEBRTC_LAYER_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Viewport change delivered to a registered handler.
#[derive(Debug, Clone)]
pub struct ViewportChangeEvent {
    pub viewport: Viewport,
    pub prev_viewport: Viewport,
}

pub type MouseHandler = Arc<dyn Fn(&MouseEventArgs) + Send + Sync>;
pub type ViewportHandler = Arc<dyn Fn(&ViewportChangeEvent) + Send + Sync>;

/// Registration of a derived layer on its ancestor stream, kept for
/// deregistration on removal.
struct DerivedHook {
    stream: Arc<dyn FrameSource>,
    handle: CallbackHandle,
}

struct ViewInner {
    config: EngineConfig,
    sink: Arc<dyn ClientSink>,
    width: AtomicU32,
    height: AtomicU32,
    layers: Mutex<HashMap<String, Arc<Layer>>>,
    /// Layer ids ordered by z-index, ties broken by insertion order.
    layer_order: Mutex<Vec<String>>,
    viewport: Mutex<Viewport>,
    metrics: EngineMetrics,
    fps_counter: FpsCounter,
    pending_requests: Mutex<HashMap<String, JoinHandle<()>>>,
    derived_hooks: Mutex<HashMap<String, DerivedHook>>,
    webrtc_manager: Mutex<Option<Arc<WebRtcManager>>>,
    webrtc_layers: Mutex<HashMap<String, Arc<WebRtcLayerConfig>>>,
    pending_webrtc_configs: Mutex<HashMap<String, Arc<WebRtcLayerConfig>>>,
    pending_webrtc_offers: Mutex<HashMap<String, RtcSessionPayload>>,
    component_ready: AtomicBool,
    svg_template: Mutex<String>,
    svg_values: Mutex<HashMap<String, String>>,
    mouse_move_handler: Mutex<Option<MouseHandler>>,
    mouse_click_handler: Mutex<Option<MouseHandler>>,
    viewport_handler: Mutex<Option<ViewportHandler>>,
    tickers: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to one view instance. Clones share state.
#[derive(Clone)]
pub struct View {
    inner: Arc<ViewInner>,
}

impl View {
    /// Create a view bound to a client sink. Must be called inside the
    /// host's async runtime: the view spawns its periodic ticks here.
    pub fn new(config: EngineConfig, sink: Arc<dyn ClientSink>) -> View {
        let width = config.view.width;
        let height = config.view.height;
        let inner = Arc::new(ViewInner {
            config,
            sink,
            width: AtomicU32::new(width),
            height: AtomicU32::new(height),
            layers: Mutex::new(HashMap::new()),
            layer_order: Mutex::new(Vec::new()),
            viewport: Mutex::new(Viewport::default()),
            metrics: EngineMetrics::default(),
            fps_counter: FpsCounter::default(),
            pending_requests: Mutex::new(HashMap::new()),
            derived_hooks: Mutex::new(HashMap::new()),
            webrtc_manager: Mutex::new(None),
            webrtc_layers: Mutex::new(HashMap::new()),
            pending_webrtc_configs: Mutex::new(HashMap::new()),
            pending_webrtc_offers: Mutex::new(HashMap::new()),
            component_ready: AtomicBool::new(false),
            svg_template: Mutex::new(String::new()),
            svg_values: Mutex::new(HashMap::new()),
            mouse_move_handler: Mutex::new(None),
            mouse_click_handler: Mutex::new(None),
            viewport_handler: Mutex::new(None),
            tickers: Mutex::new(Vec::new()),
        });
        Self::spawn_tickers(&inner);
        View { inner }
    }

    fn spawn_tickers(inner: &Arc<ViewInner>) {
        let pending_interval = Duration::from_millis(inner.config.delivery.pending_tick_ms.max(1));
        let webrtc_interval = Duration::from_millis(inner.config.delivery.webrtc_tick_ms.max(1));

        let weak = Arc::downgrade(inner);
        let pending_ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(pending_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                inner.tick_pending();
            }
        });

        let weak = Arc::downgrade(inner);
        let webrtc_ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(webrtc_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                inner.tick_webrtc();
            }
        });

        inner.tickers.lock().extend([pending_ticker, webrtc_ticker]);
    }

    pub fn width(&self) -> u32 {
        self.inner.width.load(Ordering::SeqCst)
    }

    pub fn height(&self) -> u32 {
        self.inner.height.load(Ordering::SeqCst)
    }

    pub fn viewport(&self) -> Viewport {
        *self.inner.viewport.lock()
    }

    pub fn zoom(&self) -> f64 {
        self.inner.viewport.lock().zoom
    }

    /// A layer spec seeded with this view's configured defaults.
    pub fn layer_spec(&self) -> LayerSpec {
        let defaults = &self.inner.config.layer;
        LayerSpec {
            target_fps: defaults.target_fps,
            buffer_size: defaults.buffer_size,
            jpeg_quality: defaults.jpeg_quality,
            ..LayerSpec::default()
        }
    }

    pub fn layer(&self, layer_id: &str) -> Option<Arc<Layer>> {
        self.inner.layers.lock().get(layer_id).cloned()
    }

    /// Layer ids ordered by z-index.
    pub fn layer_order(&self) -> Vec<String> {
        self.inner.layer_order.lock().clone()
    }

    /// Validate, register and announce a layer. Derived layers are wired to
    /// their ancestor stream here.
    pub fn add_layer(&self, spec: LayerSpec) -> Result<Arc<Layer>, EngineError> {
        if let Some(source_layer) = &spec.source_layer {
            if !self.inner.layers.lock().contains_key(source_layer) {
                return Err(EngineError::UnknownSourceLayer(source_layer.clone()));
            }
        }
        let mask = spec.mask.clone();
        let layer = Arc::new(Layer::new(spec)?);

        {
            let mut layers = self.inner.layers.lock();
            layers.insert(layer.id().to_owned(), Arc::clone(&layer));
        }
        self.inner.refresh_layer_order();

        // Frames are resized to the display footprint before encoding:
        // positioned layers to their own box, full-canvas layers to the view.
        let geometry = layer.geometry();
        let target_width = geometry.width.unwrap_or_else(|| self.width());
        let target_height = geometry.height.unwrap_or_else(|| self.height());
        layer.set_target_size(target_width, target_height);

        self.inner.send_layer_announcement(&layer);

        if let Some(mask) = mask {
            self.inner.send_layer_mask(&layer, mask);
        }

        if let crate::layer::LayerSource::Derived { source_layer } = layer.source() {
            self.inner.setup_derived_layer(&layer, source_layer.clone());
        }

        Ok(layer)
    }

    /// Remove a layer: deregister derived hooks, halt its producer, drop it
    /// client-side. Unknown ids are ignored.
    pub fn remove_layer(&self, layer_id: &str) {
        let Some(layer) = self.inner.layers.lock().remove(layer_id) else {
            return;
        };
        if let Some(hook) = self.inner.derived_hooks.lock().remove(layer_id) {
            hook.stream.remove_on_frame(hook.handle.id());
        }
        layer.stop();
        self.inner.refresh_layer_order();
        self.inner.metrics.remove_layer(layer_id);
        self.inner.sink.send(ClientCommand::RemoveLayer {
            layer_id: layer_id.to_owned(),
        });
    }

    /// Register a WebRTC-transported layer. The connection starts deferred:
    /// on `component-ready`, the first frame request, or the periodic tick.
    pub fn add_webrtc_layer(&self, spec: WebRtcLayerSpec) -> Result<String, EngineError> {
        {
            let mut manager = self.inner.webrtc_manager.lock();
            if manager.is_none() {
                let created = WebRtcManager::new(self.inner.config.webrtc.stun_server.clone())
                    .map_err(|e| EngineError::WebRtcUnavailable(e.to_string()))?;
                *manager = Some(Arc::new(created));
            }
        }

        let layer_id = format!(
            "webrtc-{}",
            WEBRTC_LAYER_COUNTER.fetch_add(1, Ordering::Relaxed) + 1
        );
        let config = Arc::new(WebRtcLayerConfig::from_spec(
            spec,
            self.width(),
            self.height(),
        ));
        config.set_viewport(self.viewport());

        self.inner
            .webrtc_layers
            .lock()
            .insert(layer_id.clone(), Arc::clone(&config));
        self.inner
            .pending_webrtc_configs
            .lock()
            .insert(layer_id.clone(), config);

        Ok(layer_id)
    }

    /// Remove a WebRTC layer and close its connection.
    pub fn remove_webrtc_layer(&self, layer_id: &str) {
        self.inner.webrtc_layers.lock().remove(layer_id);
        self.inner.pending_webrtc_configs.lock().remove(layer_id);
        self.inner.pending_webrtc_offers.lock().remove(layer_id);
        if let Some(manager) = self.inner.webrtc_manager.lock().clone() {
            manager.close_connection(layer_id);
        }
        self.inner.sink.send(ClientCommand::RemoveWebRtcLayer {
            layer_id: layer_id.to_owned(),
        });
    }

    /// Dispatch one client-originated event.
    pub fn dispatch(&self, event: ClientEvent) {
        match event {
            ClientEvent::FrameRequest { layer_id } => self.handle_frame_request(&layer_id),
            ClientEvent::MouseMove(args) => self.inner.handle_mouse(&args, false),
            ClientEvent::MouseClick(args) => self.inner.handle_mouse(&args, true),
            ClientEvent::ViewportChange(viewport) => self.handle_viewport_change(viewport),
            ClientEvent::SizeChanged { width, height } => self.handle_size_changed(width, height),
            ClientEvent::ComponentReady => self.handle_component_ready(),
            ClientEvent::WebRtcAnswer { layer_id, answer } => {
                self.handle_webrtc_answer(&layer_id, answer)
            }
        }
    }

    /// Answer a frame request for one layer: buffered frame if available,
    /// otherwise a one-off production on a blocking worker. Requests for a
    /// layer with one already in flight are dropped; the client retries.
    pub fn handle_frame_request(&self, layer_id: &str) {
        // Frame requests prove the client is alive, so use the first one as
        // a start trigger for any WebRTC connections still waiting.
        if !self.inner.pending_webrtc_configs.lock().is_empty() {
            self.inner.start_pending_webrtc();
        }

        let Some(layer) = self.layer(layer_id) else {
            return;
        };
        if layer.is_static() {
            return;
        }

        {
            let pending = self.inner.pending_requests.lock();
            if let Some(task) = pending.get(layer_id) {
                if !task.is_finished() {
                    return;
                }
            }
        }

        if let Some(frame) = layer.get_buffered_frame() {
            self.inner.deliver_frame(layer.id(), frame);
            return;
        }

        let inner = Arc::clone(&self.inner);
        let task_layer = Arc::clone(&layer);
        let task_id = layer_id.to_owned();
        let task = tokio::spawn(async move {
            let produced = tokio::task::spawn_blocking({
                let layer = Arc::clone(&task_layer);
                move || produce_frame_sync(&layer)
            })
            .await
            .ok()
            .flatten();
            if let Some(frame) = produced {
                inner.deliver_frame(task_layer.id(), frame);
            }
            inner.pending_requests.lock().remove(&task_id);
        });
        self.inner
            .pending_requests
            .lock()
            .insert(layer_id.to_owned(), task);
    }

    /// Broadcast a viewport change to every layer and WebRTC config. Paused
    /// streams get a one-frame refresh so the client can repaint.
    pub fn handle_viewport_change(&self, viewport: Viewport) {
        let prev_viewport = {
            let mut current = self.inner.viewport.lock();
            let prev = *current;
            *current = viewport;
            prev
        };

        let layers: Vec<Arc<Layer>> = self.inner.layers.lock().values().cloned().collect();
        for layer in layers {
            layer.set_viewport(viewport);
            if let Some(stream) = layer.stream() {
                if stream.is_paused() {
                    layer.update_from_last_frame();
                }
            }
        }

        let configs: Vec<Arc<WebRtcLayerConfig>> =
            self.inner.webrtc_layers.lock().values().cloned().collect();
        for config in configs {
            config.set_viewport(viewport);
        }

        let handler = self.inner.viewport_handler.lock().clone();
        if let Some(handler) = handler {
            handler(&ViewportChangeEvent {
                viewport,
                prev_viewport,
            });
        }
    }

    /// Change the display size and retarget full-canvas layers.
    pub fn set_size(&self, width: u32, height: u32) {
        self.inner.apply_size(width, height);
        self.inner.sink.send(ClientCommand::SetSize { width, height });
    }

    /// The client resized itself (e.g. fullscreen); track the new size
    /// without echoing a command back.
    pub fn handle_size_changed(&self, width: u32, height: u32) {
        self.inner.apply_size(width, height);
    }

    /// Retarget full-canvas layers for fullscreen, honoring each layer's
    /// fullscreen-scale mode. Positioned layers keep their explicit size.
    pub fn set_fullscreen_mode(
        &self,
        active: bool,
        screen_width: u32,
        screen_height: u32,
        video_width: u32,
        video_height: u32,
    ) {
        let layers: Vec<Arc<Layer>> = self.inner.layers.lock().values().cloned().collect();
        for layer in layers {
            let geometry = layer.geometry();
            if geometry.width.is_some() || geometry.height.is_some() {
                continue;
            }
            if active {
                match layer.fullscreen_scale() {
                    crate::layer::FullscreenScale::Screen if screen_width > 0 && screen_height > 0 => {
                        layer.set_target_size(screen_width, screen_height);
                    }
                    _ => {
                        let width = if video_width > 0 { video_width } else { self.width() };
                        let height = if video_height > 0 { video_height } else { self.height() };
                        layer.set_target_size(width, height);
                    }
                }
            } else {
                layer.set_target_size(self.width(), self.height());
            }
        }
    }

    /// Move/resize a layer and mirror the change to the client.
    pub fn update_layer_position(
        &self,
        layer_id: &str,
        x: Option<i32>,
        y: Option<i32>,
        width: Option<u32>,
        height: Option<u32>,
    ) {
        let Some(layer) = self.layer(layer_id) else {
            return;
        };
        layer.apply_geometry(x, y, width, height);
        self.inner.sink.send(ClientCommand::UpdateLayerPosition {
            layer_id: layer_id.to_owned(),
            x,
            y,
            width,
            height,
        });
    }

    pub fn on_mouse_move(&self, handler: MouseHandler) -> &Self {
        *self.inner.mouse_move_handler.lock() = Some(handler);
        self
    }

    pub fn on_mouse_click(&self, handler: MouseHandler) -> &Self {
        *self.inner.mouse_click_handler.lock() = Some(handler);
        self
    }

    pub fn on_viewport_change(&self, handler: ViewportHandler) -> &Self {
        *self.inner.viewport_handler.lock() = Some(handler);
        self
    }

    /// Set the SVG overlay template. Placeholders use `{name}` syntax.
    pub fn set_svg(&self, template: impl Into<String>, values: HashMap<String, String>) {
        *self.inner.svg_template.lock() = template.into();
        *self.inner.svg_values.lock() = values;
        self.inner.send_svg();
    }

    /// Update placeholder values; optimized for frequent calls such as
    /// mouse tracking.
    pub fn update_svg_values(&self, values: impl IntoIterator<Item = (String, String)>) {
        {
            let mut current = self.inner.svg_values.lock();
            current.extend(values);
        }
        self.inner.send_svg();
    }

    pub fn set_zoom(&self, zoom: f64, center_x: Option<f64>, center_y: Option<f64>) {
        self.inner.sink.send(ClientCommand::SetZoom {
            zoom,
            center_x,
            center_y,
        });
    }

    pub fn reset_zoom(&self) {
        self.inner.sink.send(ClientCommand::ResetZoom);
    }

    fn handle_component_ready(&self) {
        self.inner.component_ready.store(true, Ordering::SeqCst);
        self.inner.start_pending_webrtc();
    }

    /// Whether the client has signalled `component-ready`.
    pub fn is_component_ready(&self) -> bool {
        self.inner.component_ready.load(Ordering::SeqCst)
    }

    fn handle_webrtc_answer(&self, layer_id: &str, answer: RtcSessionPayload) {
        if let Some(manager) = self.inner.webrtc_manager.lock().clone() {
            manager.handle_answer(layer_id, answer);
        }
    }

    /// Start every non-static layer.
    pub fn start(&self) {
        let layers: Vec<Arc<Layer>> = self.inner.layers.lock().values().cloned().collect();
        for layer in layers {
            if !layer.is_static() {
                layer.start();
            }
        }
        self.inner.sink.send(ClientCommand::Start);
    }

    /// Stop all layers and cancel in-flight deliveries. After this returns
    /// no further frame is emitted for any layer.
    pub fn stop(&self) {
        let layers: Vec<Arc<Layer>> = self.inner.layers.lock().values().cloned().collect();
        for layer in layers {
            layer.stop();
        }
        let mut pending = self.inner.pending_requests.lock();
        for (_, task) in pending.drain() {
            task.abort();
        }
        drop(pending);
        self.inner.sink.send(ClientCommand::Stop);
    }

    /// Stop everything and release the periodic ticks and the WebRTC
    /// runtime. The view is unusable afterwards.
    pub fn shutdown(&self) {
        self.stop();
        for ticker in self.inner.tickers.lock().drain(..) {
            ticker.abort();
        }
        if let Some(manager) = self.inner.webrtc_manager.lock().take() {
            manager.shutdown();
        }
    }

    /// Aggregate performance snapshot.
    pub fn get_metrics(&self) -> Value {
        let layers: Vec<Arc<Layer>> = self.inner.layers.lock().values().cloned().collect();
        for layer in layers {
            let actual_fps = self.inner.fps_counter.fps();
            self.inner.metrics.update_layer(layer.id(), |metrics| {
                metrics.buffer_depth = layer.buffer_len();
                metrics.buffer_size = layer.buffer_size();
                metrics.frames_produced = layer.frames_produced();
                metrics.frames_dropped = layer.frames_dropped();
                metrics.target_fps = layer.target_fps() as f64;
                metrics.actual_fps = actual_fps;
            });
        }
        self.inner.metrics.snapshot()
    }

    pub fn frames_delivered(&self, layer_id: &str) -> u64 {
        self.inner.metrics.frames_delivered(layer_id)
    }

    #[cfg(test)]
    fn pending_request_count(&self) -> usize {
        self.inner.pending_requests.lock().len()
    }
}

impl ViewInner {
    fn refresh_layer_order(&self) {
        let layers = self.layers.lock();
        let mut order = self.layer_order.lock();
        // Stable sort keeps insertion order between equal z-indices.
        let mut ids: Vec<String> = order.iter().filter(|id| layers.contains_key(*id)).cloned().collect();
        for id in layers.keys() {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        ids.sort_by_key(|id| layers.get(id).map(|l| l.z_index()).unwrap_or(0));
        *order = ids;
    }

    fn apply_size(&self, width: u32, height: u32) {
        self.width.store(width, Ordering::SeqCst);
        self.height.store(height, Ordering::SeqCst);
        let layers: Vec<Arc<Layer>> = self.layers.lock().values().cloned().collect();
        for layer in layers {
            let geometry = layer.geometry();
            if geometry.width.is_none() && geometry.height.is_none() {
                layer.set_target_size(width, height);
            }
        }
    }

    fn deliver_frame(&self, layer_id: &str, frame: BufferedFrame) {
        self.sink.send(ClientCommand::UpdateLayer {
            layer_id: layer_id.to_owned(),
            data: frame.data,
            metadata: frame.metadata.to_payload(),
        });
        self.fps_counter.tick();
        self.metrics.record_delivery(layer_id);
    }

    fn send_layer_announcement(&self, layer: &Arc<Layer>) {
        let geometry = layer.geometry();
        let static_content = if layer.is_static() {
            layer.get_static_frame()
        } else {
            None
        };
        self.sink.send(ClientCommand::AddLayer(LayerAnnouncement {
            id: layer.id().to_owned(),
            name: layer.name().to_owned(),
            z_index: layer.z_index(),
            target_fps: layer.target_fps(),
            is_static: layer.is_static(),
            source_type: layer.source_type().to_owned(),
            image_format: if layer.use_png() { "PNG" } else { "JPEG" }.to_owned(),
            x: geometry.x,
            y: geometry.y,
            width: geometry.width,
            height: geometry.height,
            depth: layer.depth(),
            overscan: layer.overscan(),
            static_content,
        }));
    }

    fn send_layer_mask(&self, layer: &Arc<Layer>, mask: LayerMask) {
        let mask_data = match mask {
            LayerMask::DataUrl(url) => url,
            LayerMask::Image(image) => match image.to_mask_data_url() {
                Ok(url) => url,
                Err(e) => {
                    warn!(layer_id = %layer.id(), error = %e, "mask encode failed");
                    return;
                }
            },
        };
        self.sink.send(ClientCommand::SetLayerMask {
            layer_id: layer.id().to_owned(),
            mask: mask_data,
        });
    }

    fn handle_mouse(&self, args: &MouseEventArgs, click: bool) {
        let handler = if click {
            self.mouse_click_handler.lock().clone()
        } else {
            self.mouse_move_handler.lock().clone()
        };
        if let Some(handler) = handler {
            handler(args);
        }
    }

    /// Render `{placeholder}` names against the value map; skipped while
    /// any placeholder is still missing a value.
    fn send_svg(&self) {
        let template = self.svg_template.lock().clone();
        if template.is_empty() {
            return;
        }
        let values = self.svg_values.lock().clone();
        let Some(rendered) = render_svg_template(&template, &values) else {
            return;
        };
        self.sink.send(ClientCommand::UpdateSvg { svg: rendered });
    }

    /// Garbage-collect finished pull tasks. The hard cap is the escape
    /// hatch against producer livelock under a misbehaving source.
    fn tick_pending(&self) {
        let mut pending = self.pending_requests.lock();
        pending.retain(|_, task| !task.is_finished());
        if pending.len() > self.config.delivery.pending_limit {
            warn!(
                pending = pending.len(),
                "too many pending frame requests, clearing"
            );
            for (_, task) in pending.drain() {
                task.abort();
            }
        }
    }

    /// Drain deferred WebRTC work: start queued configs, then dispatch
    /// queued offers to the client.
    fn tick_webrtc(self: &Arc<Self>) {
        self.start_pending_webrtc();

        let offers: Vec<(String, RtcSessionPayload)> =
            self.pending_webrtc_offers.lock().drain().collect();
        for (layer_id, offer) in offers {
            let Some(config) = self.webrtc_layers.lock().get(&layer_id).cloned() else {
                continue;
            };
            self.sink.send(ClientCommand::SetupWebRtcLayer {
                layer_id,
                offer,
                z_index: config.z_index,
                name: config.name.clone(),
            });
        }
    }

    fn start_pending_webrtc(self: &Arc<Self>) {
        let configs: Vec<(String, Arc<WebRtcLayerConfig>)> =
            self.pending_webrtc_configs.lock().drain().collect();
        for (layer_id, config) in configs {
            self.start_webrtc_connection(layer_id, config);
        }
    }

    fn start_webrtc_connection(self: &Arc<Self>, layer_id: String, config: Arc<WebRtcLayerConfig>) {
        let Some(manager) = self.webrtc_manager.lock().clone() else {
            return;
        };
        let weak = self.weak_self();
        let on_offer = Arc::new(move |event: OfferEvent| {
            let Some(inner) = weak.upgrade() else { return };
            match event.offer {
                Some(offer) => {
                    // Queued for the periodic tick; the callback runs on the
                    // manager's runtime and must not touch the client.
                    inner
                        .pending_webrtc_offers
                        .lock()
                        .insert(event.layer_id, offer);
                }
                None => {
                    // Setup failed; re-queue so the tick retries, as long as
                    // the layer is still registered.
                    let config = inner.webrtc_layers.lock().get(&event.layer_id).cloned();
                    if let Some(config) = config {
                        inner
                            .pending_webrtc_configs
                            .lock()
                            .insert(event.layer_id, config);
                    }
                }
            }
        });
        manager.create_connection(&layer_id, config, on_offer);
    }

    /// Resolve the nearest ancestor stream by walking source-layer links,
    /// then register the synchronous processing callback on it.
    fn setup_derived_layer(self: &Arc<Self>, layer: &Arc<Layer>, source_layer_id: String) {
        let source_stream = {
            let layers = self.layers.lock();
            let mut current = Some(source_layer_id);
            let mut found: Option<Arc<dyn FrameSource>> = None;
            while let Some(id) = current {
                match layers.get(&id).map(|l| (l.stream().cloned(), l.source().clone())) {
                    Some((Some(stream), _)) => {
                        found = Some(stream);
                        break;
                    }
                    Some((None, crate::layer::LayerSource::Derived { source_layer })) => {
                        current = Some(source_layer);
                    }
                    _ => break,
                }
            }
            found
        };

        let Some(stream) = source_stream else {
            warn!(
                layer_id = %layer.id(),
                "derived layer has no dynamic source stream in its chain, layer stays inert"
            );
            return;
        };

        let weak_layer = Arc::downgrade(layer);
        let handle = stream.on_frame(Arc::new(move |frame, timestamp| {
            let Some(layer) = weak_layer.upgrade() else {
                return;
            };
            process_derived_frame(&layer, frame, timestamp);
        }));

        self.derived_hooks.lock().insert(
            layer.id().to_owned(),
            DerivedHook { stream, handle },
        );
    }

    fn weak_self(self: &Arc<Self>) -> Weak<ViewInner> {
        Arc::downgrade(self)
    }
}

/// One-off frame production for the pull path, run on a blocking worker.
fn produce_frame_sync(layer: &Layer) -> Option<BufferedFrame> {
    let stream = layer.stream()?;
    let mut metadata = FrameMetadata::next();

    let timestamp = now_secs();
    let (output, _) = stream.get_frame(timestamp);
    let mut frame = output?.select(layer.stream_output())?;

    frame = layer.apply_pipeline(frame, &mut metadata);

    metadata.frame_width = frame.width;
    metadata.frame_height = frame.height;
    metadata.encode_start = now_ms();
    let (encoded, frame_bytes) = match frame.to_data_url(false, layer.jpeg_quality()) {
        Ok(result) => result,
        Err(e) => {
            debug!(layer_id = %layer.id(), error = %e, "one-off encode failed");
            return None;
        }
    };
    metadata.frame_bytes = frame_bytes as u64;
    metadata.encode_end = now_ms();
    metadata.send_time = now_ms();

    Some(BufferedFrame {
        timestamp,
        data: encoded,
        metadata,
    })
}

/// Crop, filter, resize, encode and inject one source frame into a derived
/// layer. Runs inside the source's callback, on the producing thread.
fn process_derived_frame(layer: &Arc<Layer>, frame: &Frame, timestamp: f64) {
    let geometry = layer.geometry();
    let overscan = layer.overscan() as i64;
    let layer_x = geometry.x.unwrap_or(0) as i64;
    let layer_y = geometry.y.unwrap_or(0) as i64;
    let layer_w = geometry.width.map(i64::from).unwrap_or(frame.width as i64);
    let layer_h = geometry.height.map(i64::from).unwrap_or(frame.height as i64);

    // Crop the layer's box, expanded by the overscan border, clamped to the
    // source frame.
    let crop_x = (layer_x - overscan).max(0);
    let crop_y = (layer_y - overscan).max(0);
    let x2 = (crop_x + layer_w + 2 * overscan).min(frame.width as i64);
    let y2 = (crop_y + layer_h + 2 * overscan).min(frame.height as i64);
    if x2 <= crop_x || y2 <= crop_y {
        return;
    }

    let mut step_timings: Vec<(String, f64)> = Vec::new();

    let crop_start = now_ms();
    let mut processed =
        match frame.cropped(crop_x as u32, crop_y as u32, x2 as u32, y2 as u32) {
            Ok(cropped) => cropped,
            Err(e) => {
                debug!(layer_id = %layer.id(), error = %e, "derived crop failed");
                return;
            }
        };
    step_timings.push(("Crop".to_owned(), now_ms() - crop_start));

    if let Some(pipeline) = layer.pipeline() {
        for filter in pipeline.filters() {
            let start = now_ms();
            match filter.apply(&processed) {
                Ok(filtered) => {
                    processed = filtered;
                    step_timings.push((filter.name().to_owned(), now_ms() - start));
                }
                Err(e) => {
                    debug!(layer_id = %layer.id(), filter = filter.name(), error = %e, "derived filter failed");
                    break;
                }
            }
        }
    }

    let (target_width, target_height) = layer.target_size();
    if target_width > 0
        && target_height > 0
        && (processed.width != target_width || processed.height != target_height)
    {
        if let Ok(resized) = processed.resized(target_width, target_height) {
            processed = resized;
        }
    }

    let encode_start = now_ms();
    let encoded = match processed.to_data_url(layer.use_png(), layer.jpeg_quality()) {
        Ok((url, _)) => url,
        Err(e) => {
            debug!(layer_id = %layer.id(), error = %e, "derived encode failed");
            return;
        }
    };
    step_timings.push(("Encode".to_owned(), now_ms() - encode_start));

    let anchor = if layer.overscan() > 0 {
        Some((layer_x as i32, layer_y as i32))
    } else {
        None
    };
    layer.inject_frame(encoded, timestamp, Some(&step_timings), anchor);
}

/// Substitute `{name}` placeholders; `None` when any name has no value.
fn render_svg_template(template: &str, values: &HashMap<String, String>) -> Option<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let tail = &rest[open + 1..];
        let close = tail.find('}')?;
        let name = &tail[..close];
        out.push_str(values.get(name)?);
        rest = &tail[close + 1..];
    }
    out.push_str(rest);
    Some(out)
}
