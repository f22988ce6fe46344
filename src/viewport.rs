//! Normalized viewport state and depth-weighted parallax math.
//!
//! A viewport is a normalized rectangle in [0,1]^2 plus a zoom scalar.
//! Layers weight the shared viewport by their depth: depth 0 is screen-locked,
//! depth 1 follows the viewport exactly, and other depths interpolate or
//! extrapolate the pan/zoom around the content center for parallax.

use serde::{Deserialize, Serialize};

/// Normalized view window over the source content.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default = "default_extent")]
    pub width: f64,
    #[serde(default = "default_extent")]
    pub height: f64,
    #[serde(default = "default_extent")]
    pub zoom: f64,
}

fn default_extent() -> f64 {
    1.0
}

impl Default for Viewport {
    fn default() -> Self {
        Viewport {
            x: 0.0,
            y: 0.0,
            width: 1.0,
            height: 1.0,
            zoom: 1.0,
        }
    }
}

impl Viewport {
    pub fn new(x: f64, y: f64, width: f64, height: f64, zoom: f64) -> Self {
        Viewport {
            x,
            y,
            width,
            height,
            zoom,
        }
    }

    pub fn is_zoomed(&self) -> bool {
        self.zoom > 1.0
    }

    /// Project this viewport onto source pixel bounds, clamped to a legal
    /// non-empty rectangle. Degenerate windows are widened to one pixel.
    pub fn crop_rect(&self, source_width: u32, source_height: u32) -> (u32, u32, u32, u32) {
        let w = source_width as f64;
        let h = source_height as f64;
        let x1 = (self.x * w) as i64;
        let y1 = (self.y * h) as i64;
        let x2 = ((self.x + self.width) * w) as i64;
        let y2 = ((self.y + self.height) * h) as i64;
        let x1 = x1.clamp(0, source_width as i64 - 1);
        let y1 = y1.clamp(0, source_height as i64 - 1);
        let x2 = x2.clamp(x1 + 1, source_width as i64);
        let y2 = y2.clamp(y1 + 1, source_height as i64);
        (x1 as u32, y1 as u32, x2 as u32, y2 as u32)
    }
}

/// Weight a viewport by a layer's depth.
///
/// Depth 0 returns the identity window, depth 1 returns the viewport
/// unchanged, and any other depth scales the pan offset and the zoom excess
/// around the content center (0.5, 0.5). The returned top-left is clamped so
/// the window stays inside [0,1]^2.
pub fn effective_viewport(viewport: &Viewport, depth: f64) -> Viewport {
    if depth == 0.0 {
        return Viewport::default();
    }
    if depth == 1.0 {
        return *viewport;
    }

    let cx = viewport.x + viewport.width / 2.0;
    let cy = viewport.y + viewport.height / 2.0;
    let eff_cx = 0.5 + (cx - 0.5) * depth;
    let eff_cy = 0.5 + (cy - 0.5) * depth;

    let eff_zoom = 1.0 + (viewport.zoom - 1.0) * depth;
    let (eff_w, eff_h) = if eff_zoom > 0.0 {
        (1.0 / eff_zoom, 1.0 / eff_zoom)
    } else {
        (1.0, 1.0)
    };

    Viewport {
        x: (eff_cx - eff_w / 2.0).clamp(0.0, (1.0 - eff_w).max(0.0)),
        y: (eff_cy - eff_h / 2.0).clamp(0.0, (1.0 - eff_h).max(0.0)),
        width: eff_w,
        height: eff_h,
        zoom: eff_zoom,
    }
}
