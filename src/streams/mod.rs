//! Frame sources.
//!
//! Every source implements the [`FrameSource`] contract: wall-clock driven
//! `get_frame` with a monotone frame index, access to the most recent frame
//! for viewport-only redraws while paused, and synchronous `on_frame`
//! callbacks used by derived layers.

mod camera;
mod generator;
mod video;

pub use camera::{CameraDevice, CameraStream};
pub use generator::{GeneratorFn, GeneratorStream};
pub use video::{VideoDecoder, VideoFileStream, VideoOptions};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::frame::Frame;

/// What a source yields per tick: one frame, or a named bundle for
/// multi-output sources. Layers subscribed to a bundle pick their output by
/// key.
#[derive(Debug, Clone)]
pub enum FrameOutput {
    Single(Frame),
    Bundle(BTreeMap<String, Frame>),
}

impl FrameOutput {
    /// Pick the frame a layer should consume: the named output when a key is
    /// given, the sole/first output otherwise.
    pub fn select(&self, output_key: Option<&str>) -> Option<Frame> {
        match self {
            FrameOutput::Single(frame) => Some(frame.clone()),
            FrameOutput::Bundle(outputs) => match output_key {
                Some(key) => outputs.get(key).cloned(),
                None => outputs.values().next().cloned(),
            },
        }
    }

    /// The frame used for `last_frame` bookkeeping and callbacks.
    pub fn primary(&self) -> Option<&Frame> {
        match self {
            FrameOutput::Single(frame) => Some(frame),
            FrameOutput::Bundle(outputs) => outputs.values().next(),
        }
    }
}

/// Synchronous per-frame callback: `(frame, capture_timestamp_seconds)`.
pub type FrameCallback = Arc<dyn Fn(&Frame, f64) + Send + Sync>;

/// Registration handle for an `on_frame` callback. The registry only holds a
/// weak reference, so dropping the handle deregisters the callback.
pub struct CallbackHandle {
    id: u64,
    _callback: FrameCallback,
}

impl CallbackHandle {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl std::fmt::Debug for CallbackHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackHandle").field("id", &self.id).finish()
    }
}

/// Weak-slot callback registry shared by all source implementations.
///
/// Callbacks are invoked inline on the thread that produced the frame; dead
/// slots are pruned on every invoke.
#[derive(Default)]
pub struct CallbackRegistry {
    slots: Mutex<Vec<(u64, Weak<dyn Fn(&Frame, f64) + Send + Sync>)>>,
    next_id: AtomicU64,
}

impl CallbackRegistry {
    pub fn register(&self, callback: FrameCallback) -> CallbackHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.slots.lock().push((id, Arc::downgrade(&callback)));
        CallbackHandle {
            id,
            _callback: callback,
        }
    }

    pub fn remove(&self, id: u64) {
        self.slots.lock().retain(|(slot_id, _)| *slot_id != id);
    }

    pub fn invoke(&self, frame: &Frame, timestamp: f64) {
        let callbacks: Vec<FrameCallback> = {
            let mut slots = self.slots.lock();
            slots.retain(|(_, weak)| weak.strong_count() > 0);
            slots.iter().filter_map(|(_, weak)| weak.upgrade()).collect()
        };
        for callback in callbacks {
            callback(frame, timestamp);
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().iter().filter(|(_, w)| w.strong_count() > 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackRegistry").field("len", &self.len()).finish()
    }
}

/// Uniform frame-producer contract shared by video files, cameras and
/// generators.
///
/// `get_frame` returns the frame appropriate for wall-clock `now` (seconds on
/// the engine's monotonic clock) plus a frame index that increases only when
/// a new distinct frame is produced; callers detect "nothing new yet" by
/// index equality. Source errors are local and degrade to "no frame this
/// tick".
pub trait FrameSource: Send + Sync {
    fn start(&self);

    /// Stop producing. Only the source's owner calls this; layer removal
    /// never stops a shared source.
    fn stop(&self);

    fn is_running(&self) -> bool;

    fn is_paused(&self) -> bool;

    fn pause(&self);

    fn resume(&self);

    fn get_frame(&self, now: f64) -> (Option<FrameOutput>, u64);

    /// Most recently produced frame, kept for viewport-only redraws while
    /// paused.
    fn last_frame(&self) -> Option<Frame>;

    /// Capture time of `last_frame` in seconds.
    fn last_frame_timestamp(&self) -> f64;

    /// Register a synchronous callback invoked inside the source whenever it
    /// produces a new frame.
    fn on_frame(&self, callback: FrameCallback) -> CallbackHandle;

    fn remove_on_frame(&self, id: u64);

    /// Short tag describing the source flavor, used in layer announcements.
    fn kind(&self) -> &'static str {
        "stream"
    }

    /// Intrinsic frame rate, if the source has one.
    fn fps(&self) -> Option<f64> {
        None
    }

    fn playback_speed(&self) -> f64 {
        1.0
    }

    fn max_fps(&self) -> Option<f64> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelFormat;
    use std::sync::atomic::AtomicUsize;

    fn test_frame() -> Frame {
        Frame::new(vec![0u8; 12], 2, 2, PixelFormat::Rgb8).unwrap()
    }

    #[test]
    fn dropped_handle_deregisters() {
        let registry = CallbackRegistry::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        let handle = registry.register(Arc::new(move |_, _| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        }));
        registry.invoke(&test_frame(), 0.0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        drop(handle);
        registry.invoke(&test_frame(), 0.0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn explicit_remove_deregisters() {
        let registry = CallbackRegistry::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        let handle = registry.register(Arc::new(move |_, _| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        }));
        registry.remove(handle.id());
        registry.invoke(&test_frame(), 0.0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn bundle_selects_by_key_or_first() {
        let mut outputs = BTreeMap::new();
        let mut a = test_frame();
        a.timestamp = 1.0;
        let mut b = test_frame();
        b.timestamp = 2.0;
        outputs.insert("alpha".to_owned(), a);
        outputs.insert("beta".to_owned(), b);
        let output = FrameOutput::Bundle(outputs);

        assert_eq!(output.select(Some("beta")).unwrap().timestamp, 2.0);
        assert_eq!(output.select(None).unwrap().timestamp, 1.0);
        assert!(output.select(Some("missing")).is_none());
    }
}
