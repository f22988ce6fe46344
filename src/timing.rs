//! Per-frame timing metadata.
//!
//! Every frame carries a [`FrameMetadata`] record from capture through
//! filtering, encoding and delivery. All timestamps are milliseconds on a
//! single process-wide monotonic clock so the client can correlate stages.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use once_cell::sync::Lazy;
use serde_json::{json, Value};

static CLOCK_EPOCH: Lazy<Instant> = Lazy::new(Instant::now);
static FRAME_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Milliseconds since the process-wide monotonic epoch.
pub fn now_ms() -> f64 {
    CLOCK_EPOCH.elapsed().as_secs_f64() * 1000.0
}

/// Seconds since the process-wide monotonic epoch.
pub fn now_secs() -> f64 {
    CLOCK_EPOCH.elapsed().as_secs_f64()
}

/// Timing for a single filter stage in a layer's pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterTiming {
    pub name: String,
    pub start_ms: f64,
    pub end_ms: f64,
}

impl FilterTiming {
    pub fn duration_ms(&self) -> f64 {
        self.end_ms - self.start_ms
    }

    fn to_value(&self) -> Value {
        json!({
            "name": self.name,
            "start_ms": self.start_ms,
            "end_ms": self.end_ms,
            "duration_ms": self.duration_ms(),
        })
    }
}

/// Diagnostic record following one frame through the pipeline.
///
/// Created at capture, mutated through the pipeline stages, serialized into
/// the outbound message, discarded after send.
#[derive(Debug, Clone, Default)]
pub struct FrameMetadata {
    /// Globally unique, monotonically increasing sequence id.
    pub frame_id: u64,
    /// When the frame was captured from its source (ms).
    pub capture_time: f64,
    pub filter_timings: Vec<FilterTiming>,
    pub encode_start: f64,
    pub encode_end: f64,
    /// When the frame was handed to the client sink (ms).
    pub send_time: f64,
    /// Small JPEG data URL of the full frame, attached only while zoomed.
    pub nav_thumbnail: Option<String>,
    /// Display coordinate the content was centered on at capture time.
    /// Present only for overscan layers.
    pub anchor_x: Option<i32>,
    pub anchor_y: Option<i32>,
    /// Encoded size in bytes, 0 when unknown.
    pub frame_bytes: u64,
    /// Buffer occupancy at enqueue time (0 capacity means "not buffered").
    pub buffer_length: usize,
    pub buffer_capacity: usize,
    /// Frame dimensions after resize, 0 when unknown.
    pub frame_width: u32,
    pub frame_height: u32,
    /// Effective target fps in force when this frame was produced.
    pub effective_fps: f64,
}

impl FrameMetadata {
    /// Allocate a fresh record with the next sequence id and the current
    /// time as its capture timestamp.
    pub fn next() -> Self {
        FrameMetadata {
            frame_id: FRAME_COUNTER.fetch_add(1, Ordering::Relaxed) + 1,
            capture_time: now_ms(),
            ..Default::default()
        }
    }

    pub fn add_filter_timing(&mut self, name: impl Into<String>, start_ms: f64, end_ms: f64) {
        self.filter_timings.push(FilterTiming {
            name: name.into(),
            start_ms,
            end_ms,
        });
    }

    pub fn encode_duration_ms(&self) -> f64 {
        self.encode_end - self.encode_start
    }

    pub fn total_filter_ms(&self) -> f64 {
        self.filter_timings.iter().map(|f| f.duration_ms()).sum()
    }

    /// Total server-side time from capture to send.
    pub fn processing_ms(&self) -> f64 {
        if self.send_time > 0.0 && self.capture_time > 0.0 {
            self.send_time - self.capture_time
        } else {
            0.0
        }
    }

    /// JSON payload shipped alongside each delivered frame. Optional fields
    /// are omitted when absent to keep per-frame overhead low.
    pub fn to_payload(&self) -> Value {
        let mut map = serde_json::Map::new();
        map.insert("frame_id".into(), json!(self.frame_id));
        map.insert("capture_time".into(), json!(self.capture_time));
        map.insert(
            "filter_timings".into(),
            json!(self.filter_timings.iter().map(|f| f.to_value()).collect::<Vec<_>>()),
        );
        map.insert("encode_start".into(), json!(self.encode_start));
        map.insert("encode_end".into(), json!(self.encode_end));
        map.insert("encode_duration_ms".into(), json!(self.encode_duration_ms()));
        map.insert("send_time".into(), json!(self.send_time));
        map.insert("total_filter_ms".into(), json!(self.total_filter_ms()));
        map.insert("processing_ms".into(), json!(self.processing_ms()));
        if let Some(thumb) = &self.nav_thumbnail {
            map.insert("nav_thumbnail".into(), json!(thumb));
        }
        if let (Some(x), Some(y)) = (self.anchor_x, self.anchor_y) {
            map.insert("anchor_x".into(), json!(x));
            map.insert("anchor_y".into(), json!(y));
        }
        if self.frame_bytes > 0 {
            map.insert("frame_bytes".into(), json!(self.frame_bytes));
        }
        if self.buffer_capacity > 0 {
            map.insert("buffer_length".into(), json!(self.buffer_length));
            map.insert("buffer_capacity".into(), json!(self.buffer_capacity));
        }
        if self.frame_width > 0 && self.frame_height > 0 {
            map.insert("frame_width".into(), json!(self.frame_width));
            map.insert("frame_height".into(), json!(self.frame_height));
        }
        if self.effective_fps > 0.0 {
            map.insert("effective_fps".into(), json!(self.effective_fps));
        }
        Value::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_ids_are_unique_and_increasing() {
        let a = FrameMetadata::next();
        let b = FrameMetadata::next();
        assert!(b.frame_id > a.frame_id);
    }

    #[test]
    fn filter_timings_accumulate() {
        let mut meta = FrameMetadata::next();
        meta.add_filter_timing("blur", 10.0, 14.0);
        meta.add_filter_timing("edge", 14.0, 15.5);
        assert_eq!(meta.filter_timings.len(), 2);
        assert!((meta.total_filter_ms() - 5.5).abs() < 1e-9);
    }

    #[test]
    fn payload_omits_absent_optionals() {
        let meta = FrameMetadata::next();
        let payload = meta.to_payload();
        let map = payload.as_object().unwrap();
        assert!(!map.contains_key("nav_thumbnail"));
        assert!(!map.contains_key("anchor_x"));
        assert!(!map.contains_key("buffer_length"));
        assert!(!map.contains_key("frame_width"));
    }

    #[test]
    fn payload_includes_buffer_state_when_set() {
        let mut meta = FrameMetadata::next();
        meta.buffer_length = 2;
        meta.buffer_capacity = 4;
        meta.frame_width = 320;
        meta.frame_height = 180;
        let payload = meta.to_payload();
        assert_eq!(payload["buffer_length"], 2);
        assert_eq!(payload["buffer_capacity"], 4);
        assert_eq!(payload["frame_width"], 320);
    }

    #[test]
    fn monotonic_clock_advances() {
        let a = now_ms();
        let b = now_ms();
        assert!(b >= a);
    }
}
