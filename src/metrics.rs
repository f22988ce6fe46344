//! Engine performance counters.
//!
//! Per-layer counters plus an aggregate snapshot the host can poll. The fps
//! counter uses a sliding window of delivery intervals.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};

use crate::timing::now_secs;

/// Per-layer delivery and production counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LayerMetrics {
    pub layer_id: String,
    /// Frames currently queued in the layer buffer.
    pub buffer_depth: usize,
    pub buffer_size: usize,
    pub frames_produced: u64,
    pub frames_delivered: u64,
    pub frames_dropped: u64,
    pub target_fps: f64,
    pub actual_fps: f64,
}

/// Aggregate engine metrics, keyed by layer id.
#[derive(Debug)]
pub struct EngineMetrics {
    layers: Mutex<HashMap<String, LayerMetrics>>,
    start_time: Instant,
}

impl Default for EngineMetrics {
    fn default() -> Self {
        EngineMetrics {
            layers: Mutex::new(HashMap::new()),
            start_time: Instant::now(),
        }
    }
}

impl EngineMetrics {
    pub fn record_delivery(&self, layer_id: &str) {
        let mut layers = self.layers.lock();
        let entry = layers.entry(layer_id.to_owned()).or_insert_with(|| LayerMetrics {
            layer_id: layer_id.to_owned(),
            ..Default::default()
        });
        entry.frames_delivered += 1;
    }

    pub fn frames_delivered(&self, layer_id: &str) -> u64 {
        self.layers
            .lock()
            .get(layer_id)
            .map(|m| m.frames_delivered)
            .unwrap_or(0)
    }

    /// Refresh a layer's production-side counters before a snapshot.
    pub fn update_layer<F>(&self, layer_id: &str, update: F)
    where
        F: FnOnce(&mut LayerMetrics),
    {
        let mut layers = self.layers.lock();
        let entry = layers.entry(layer_id.to_owned()).or_insert_with(|| LayerMetrics {
            layer_id: layer_id.to_owned(),
            ..Default::default()
        });
        update(entry);
    }

    pub fn remove_layer(&self, layer_id: &str) {
        self.layers.lock().remove(layer_id);
    }

    /// JSON snapshot with per-layer entries and aggregate totals.
    pub fn snapshot(&self) -> Value {
        let layers = self.layers.lock();
        let total_produced: u64 = layers.values().map(|m| m.frames_produced).sum();
        let total_delivered: u64 = layers.values().map(|m| m.frames_delivered).sum();
        let total_dropped: u64 = layers.values().map(|m| m.frames_dropped).sum();
        let by_layer: HashMap<&str, Value> = layers
            .iter()
            .map(|(id, m)| (id.as_str(), serde_json::to_value(m).unwrap_or(Value::Null)))
            .collect();
        json!({
            "layers": by_layer,
            "total_frames_produced": total_produced,
            "total_frames_delivered": total_delivered,
            "total_frames_dropped": total_dropped,
            "uptime_seconds": (self.start_time.elapsed().as_secs_f64() * 10.0).round() / 10.0,
        })
    }
}

/// Thread-safe fps counter over a sliding window of frame intervals.
#[derive(Debug)]
pub struct FpsCounter {
    window: Mutex<FpsWindow>,
    window_size: usize,
}

#[derive(Debug, Default)]
struct FpsWindow {
    intervals: VecDeque<f64>,
    last_tick: f64,
}

impl Default for FpsCounter {
    fn default() -> Self {
        FpsCounter::new(60)
    }
}

impl FpsCounter {
    pub fn new(window_size: usize) -> Self {
        FpsCounter {
            window: Mutex::new(FpsWindow::default()),
            window_size,
        }
    }

    /// Record one delivered frame.
    pub fn tick(&self) {
        let now = now_secs();
        let mut window = self.window.lock();
        if window.last_tick > 0.0 {
            let interval = now - window.last_tick;
            window.intervals.push_back(interval);
            if window.intervals.len() > self.window_size {
                window.intervals.pop_front();
            }
        }
        window.last_tick = now;
    }

    pub fn fps(&self) -> f64 {
        let window = self.window.lock();
        if window.intervals.len() < 2 {
            return 0.0;
        }
        let avg = window.intervals.iter().sum::<f64>() / window.intervals.len() as f64;
        if avg <= 0.0 {
            return 0.0;
        }
        1.0 / avg
    }

    pub fn reset(&self) {
        let mut window = self.window.lock();
        window.intervals.clear();
        window.last_tick = 0.0;
    }
}
