//! User-supplied rendering callbacks as a frame source.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{CallbackHandle, CallbackRegistry, FrameCallback, FrameOutput, FrameSource};
use crate::frame::Frame;
use crate::timing::now_secs;

/// Rendering callback: wall-clock seconds in, frame (or frame bundle) out.
/// Returning `None` means "nothing to draw this tick".
pub type GeneratorFn = Arc<dyn Fn(f64) -> Option<FrameOutput> + Send + Sync>;

#[derive(Default)]
struct GeneratorState {
    last_frame: Option<Frame>,
    last_timestamp: f64,
    frame_index: u64,
}

/// Frame source driven by a user closure.
///
/// The generator is invoked on every `get_frame` call; each non-`None`
/// result counts as a new distinct frame.
pub struct GeneratorStream {
    render: GeneratorFn,
    max_fps: Option<f64>,
    running: AtomicBool,
    paused: AtomicBool,
    state: Mutex<GeneratorState>,
    callbacks: CallbackRegistry,
}

impl GeneratorStream {
    pub fn new(render: GeneratorFn) -> Self {
        GeneratorStream {
            render,
            max_fps: None,
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            state: Mutex::new(GeneratorState::default()),
            callbacks: CallbackRegistry::default(),
        }
    }

    pub fn with_max_fps(mut self, max_fps: f64) -> Self {
        self.max_fps = Some(max_fps);
        self
    }
}

impl FrameSource for GeneratorStream {
    fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
        self.paused.store(false, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    fn get_frame(&self, now: f64) -> (Option<FrameOutput>, u64) {
        if !self.is_running() || self.is_paused() {
            return (None, self.state.lock().frame_index);
        }
        let output = (self.render)(now);
        let mut state = self.state.lock();
        match output {
            Some(output) => {
                state.frame_index += 1;
                let timestamp = now_secs();
                if let Some(frame) = output.primary() {
                    state.last_frame = Some(frame.clone());
                    state.last_timestamp = timestamp;
                }
                let index = state.frame_index;
                let primary = output.primary().cloned();
                drop(state);
                if let Some(frame) = primary {
                    self.callbacks.invoke(&frame, timestamp);
                }
                (Some(output), index)
            }
            None => (None, state.frame_index),
        }
    }

    fn last_frame(&self) -> Option<Frame> {
        self.state.lock().last_frame.clone()
    }

    fn last_frame_timestamp(&self) -> f64 {
        self.state.lock().last_timestamp
    }

    fn on_frame(&self, callback: FrameCallback) -> CallbackHandle {
        self.callbacks.register(callback)
    }

    fn remove_on_frame(&self, id: u64) {
        self.callbacks.remove(id);
    }

    fn kind(&self) -> &'static str {
        "custom"
    }

    fn max_fps(&self) -> Option<f64> {
        self.max_fps
    }
}
