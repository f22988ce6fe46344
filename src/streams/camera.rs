//! Live camera capture as a frame source.
//!
//! The device driver is a collaborator behind [`CameraDevice`]; the stream
//! owns the capture thread, paces it to the configured rate, and fans new
//! frames out to `on_frame` subscribers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{CallbackHandle, CallbackRegistry, FrameCallback, FrameOutput, FrameSource};
use crate::frame::Frame;
use crate::timing::now_secs;

/// Blocking frame grabber for one capture device.
pub trait CameraDevice: Send {
    /// Device identifier used in logs.
    fn name(&self) -> &str;

    fn grab(&mut self) -> anyhow::Result<Frame>;
}

#[derive(Default)]
struct CaptureState {
    last_frame: Option<Frame>,
    last_timestamp: f64,
    frame_index: u64,
}

struct CameraShared {
    state: Mutex<CaptureState>,
    callbacks: CallbackRegistry,
    running: AtomicBool,
    paused: AtomicBool,
}

/// A capture device attached to the engine. `start` spawns the capture
/// thread; `get_frame` hands out the most recent grab.
pub struct CameraStream {
    device: Arc<Mutex<Box<dyn CameraDevice>>>,
    device_name: String,
    fps: f64,
    shared: Arc<CameraShared>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl CameraStream {
    pub fn new(device: Box<dyn CameraDevice>, fps: f64) -> Self {
        let device_name = device.name().to_owned();
        CameraStream {
            device: Arc::new(Mutex::new(device)),
            device_name,
            fps: fps.max(1.0),
            shared: Arc::new(CameraShared {
                state: Mutex::new(CaptureState::default()),
                callbacks: CallbackRegistry::default(),
                running: AtomicBool::new(false),
                paused: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        }
    }

    fn capture_loop(device: Arc<Mutex<Box<dyn CameraDevice>>>, shared: Arc<CameraShared>, fps: f64, name: String) {
        let interval = Duration::from_secs_f64(1.0 / fps);
        while shared.running.load(Ordering::SeqCst) {
            if shared.paused.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(5));
                continue;
            }
            let grabbed = device.lock().grab();
            match grabbed {
                Ok(mut frame) => {
                    let timestamp = now_secs();
                    frame.timestamp = timestamp;
                    {
                        let mut state = shared.state.lock();
                        state.last_frame = Some(frame.clone());
                        state.last_timestamp = timestamp;
                        state.frame_index += 1;
                    }
                    shared.callbacks.invoke(&frame, timestamp);
                }
                Err(e) => {
                    debug!(device = %name, error = %e, "camera grab failed");
                    thread::sleep(Duration::from_millis(50));
                }
            }
            thread::sleep(interval);
        }
    }
}

impl FrameSource for CameraStream {
    fn start(&self) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.paused.store(false, Ordering::SeqCst);
        let device = Arc::clone(&self.device);
        let shared = Arc::clone(&self.shared);
        let fps = self.fps;
        let name = self.device_name.clone();
        let spawned = thread::Builder::new()
            .name(format!("camera-{name}"))
            .spawn(move || Self::capture_loop(device, shared, fps, name));
        match spawned {
            Ok(handle) => *self.worker.lock() = Some(handle),
            Err(e) => {
                warn!(device = %self.device_name, error = %e, "failed to spawn capture thread");
                self.shared.running.store(false, Ordering::SeqCst);
            }
        }
    }

    fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }

    fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }

    fn pause(&self) {
        self.shared.paused.store(true, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.shared.paused.store(false, Ordering::SeqCst);
    }

    fn get_frame(&self, _now: f64) -> (Option<FrameOutput>, u64) {
        let state = self.shared.state.lock();
        match &state.last_frame {
            Some(frame) if self.is_running() => {
                (Some(FrameOutput::Single(frame.clone())), state.frame_index)
            }
            _ => (None, state.frame_index),
        }
    }

    fn last_frame(&self) -> Option<Frame> {
        self.shared.state.lock().last_frame.clone()
    }

    fn last_frame_timestamp(&self) -> f64 {
        self.shared.state.lock().last_timestamp
    }

    fn on_frame(&self, callback: FrameCallback) -> CallbackHandle {
        self.shared.callbacks.register(callback)
    }

    fn remove_on_frame(&self, id: u64) {
        self.shared.callbacks.remove(id);
    }

    fn fps(&self) -> Option<f64> {
        Some(self.fps)
    }
}
