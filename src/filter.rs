//! Filter pipeline seam.
//!
//! Effect kernels are collaborators supplied by the host; the engine only
//! requires that each one is a pure frame transform that can name itself for
//! the per-frame timing record.

use std::sync::Arc;

use anyhow::Result;

use crate::frame::Frame;

/// A pure `Frame -> Frame` transform.
pub trait FrameFilter: Send + Sync {
    /// Name reported in filter-timing entries.
    fn name(&self) -> &str;

    fn apply(&self, frame: &Frame) -> Result<Frame>;
}

/// An ordered list of filters applied per frame.
#[derive(Clone, Default)]
pub struct FilterPipeline {
    filters: Vec<Arc<dyn FrameFilter>>,
}

impl FilterPipeline {
    pub fn new() -> Self {
        FilterPipeline::default()
    }

    pub fn with(mut self, filter: Arc<dyn FrameFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn push(&mut self, filter: Arc<dyn FrameFilter>) {
        self.filters.push(filter);
    }

    pub fn filters(&self) -> &[Arc<dyn FrameFilter>] {
        &self.filters
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }
}

impl std::fmt::Debug for FilterPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterPipeline")
            .field("filters", &self.filters.iter().map(|x| x.name().to_owned()).collect::<Vec<_>>())
            .finish()
    }
}
