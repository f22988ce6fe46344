//! Seekable decoded-video playback as a frame source.
//!
//! The codec itself is a collaborator behind the [`VideoDecoder`] trait; this
//! module owns the playback model: media-time advance scaled by playback
//! speed, looping, seeking, and the monotone frame index.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use super::{CallbackHandle, CallbackRegistry, FrameCallback, FrameOutput, FrameSource};
use crate::frame::Frame;
use crate::timing::now_secs;

/// Decoded access to a video file. Implementations wrap whatever codec the
/// host links; `decode_frame` may block.
pub trait VideoDecoder: Send {
    fn fps(&self) -> f64;
    fn frame_count(&self) -> u64;
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    fn decode_frame(&mut self, index: u64) -> anyhow::Result<Frame>;
}

/// Playback options for a [`VideoFileStream`].
#[derive(Debug, Clone)]
pub struct VideoOptions {
    pub looping: bool,
    /// Playback rate multiplier, must be > 0.
    pub playback_speed: f64,
    /// Optional output frame-rate cap applied by consumers.
    pub max_fps: Option<f64>,
}

impl Default for VideoOptions {
    fn default() -> Self {
        VideoOptions {
            looping: false,
            playback_speed: 1.0,
            max_fps: None,
        }
    }
}

struct PlaybackState {
    decoder: Box<dyn VideoDecoder>,
    /// Position inside the media in seconds.
    media_time: f64,
    /// Wall-clock of the previous `get_frame` call; `None` right after
    /// start/resume/seek so playback does not jump.
    last_clock: Option<f64>,
    playback_speed: f64,
    /// Source frame number of the last decoded frame.
    last_decoded: Option<u64>,
    /// Monotone counter bumped whenever the decoded target changes. Stays
    /// strictly monotone across loop wrap and reverse seeks, so index
    /// equality is the only "no new frame" signal.
    frame_index: u64,
    last_frame: Option<Frame>,
    last_timestamp: f64,
}

/// A video file attached to the engine through a [`VideoDecoder`].
pub struct VideoFileStream {
    path: PathBuf,
    looping: bool,
    max_fps: Option<f64>,
    running: AtomicBool,
    paused: AtomicBool,
    state: Mutex<PlaybackState>,
    callbacks: CallbackRegistry,
}

impl VideoFileStream {
    pub fn new(path: impl AsRef<Path>, decoder: Box<dyn VideoDecoder>, options: VideoOptions) -> Self {
        VideoFileStream {
            path: path.as_ref().to_owned(),
            looping: options.looping,
            max_fps: options.max_fps,
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            state: Mutex::new(PlaybackState {
                decoder,
                media_time: 0.0,
                last_clock: None,
                playback_speed: options.playback_speed.max(f64::MIN_POSITIVE),
                last_decoded: None,
                frame_index: 0,
                last_frame: None,
                last_timestamp: 0.0,
            }),
            callbacks: CallbackRegistry::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current playback position in seconds.
    pub fn current_position(&self) -> f64 {
        self.state.lock().media_time
    }

    /// Media duration in seconds.
    pub fn duration(&self) -> f64 {
        let state = self.state.lock();
        let fps = state.decoder.fps();
        if fps <= 0.0 {
            return 0.0;
        }
        state.decoder.frame_count() as f64 / fps
    }

    /// Jump to the given position. The next `get_frame` decodes fresh.
    pub fn seek_to(&self, seconds: f64) {
        let duration = self.duration();
        let mut state = self.state.lock();
        state.media_time = seconds.clamp(0.0, duration);
        state.last_clock = None;
        state.last_decoded = None;
    }

    pub fn set_playback_speed(&self, speed: f64) {
        let mut state = self.state.lock();
        state.playback_speed = speed.max(f64::MIN_POSITIVE);
    }

    pub fn aspect_ratio(&self) -> f64 {
        let state = self.state.lock();
        let h = state.decoder.height();
        if h == 0 {
            return 1.0;
        }
        state.decoder.width() as f64 / h as f64
    }
}

impl FrameSource for VideoFileStream {
    fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.paused.store(false, Ordering::SeqCst);
        self.state.lock().last_clock = None;
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
        self.state.lock().last_clock = None;
    }

    fn get_frame(&self, now: f64) -> (Option<FrameOutput>, u64) {
        if !self.is_running() || self.is_paused() {
            return (None, self.state.lock().frame_index);
        }

        let mut state = self.state.lock();

        // Advance media time by the wall-clock delta scaled by the current
        // speed; this keeps position correct across mid-stream speed changes.
        if let Some(prev) = state.last_clock {
            let delta = (now - prev).max(0.0);
            state.media_time += delta * state.playback_speed;
        }
        state.last_clock = Some(now);

        let fps = state.decoder.fps();
        let frame_count = state.decoder.frame_count();
        if fps <= 0.0 || frame_count == 0 {
            return (None, state.frame_index);
        }

        let mut target = (state.media_time * fps) as u64;
        if target >= frame_count {
            if self.looping {
                let duration = frame_count as f64 / fps;
                state.media_time %= duration;
                target = (state.media_time * fps) as u64 % frame_count;
            } else {
                // Hold the final frame.
                state.media_time = frame_count as f64 / fps;
                target = frame_count - 1;
            }
        }

        if state.last_decoded == Some(target) {
            return (None, state.frame_index);
        }

        match state.decoder.decode_frame(target) {
            Ok(mut frame) => {
                let timestamp = now_secs();
                frame.timestamp = timestamp;
                state.last_decoded = Some(target);
                state.frame_index += 1;
                state.last_frame = Some(frame.clone());
                state.last_timestamp = timestamp;
                let index = state.frame_index;
                drop(state);
                self.callbacks.invoke(&frame, timestamp);
                (Some(FrameOutput::Single(frame)), index)
            }
            Err(e) => {
                debug!(path = %self.path.display(), frame = target, error = %e, "decode failed");
                (None, state.frame_index)
            }
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
        "video"
    }

    fn fps(&self) -> Option<f64> {
        Some(self.state.lock().decoder.fps())
    }

    fn playback_speed(&self) -> f64 {
        self.state.lock().playback_speed
    }

    fn max_fps(&self) -> Option<f64> {
        self.max_fps
    }
}
