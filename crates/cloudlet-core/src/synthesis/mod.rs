//! Reconstruction of a customized VM from a base image plus an overlay.
//!
//! [`SynthesisEngine::materialize`] writes the whole target image up front.
//! [`SynthesisEngine::on_demand`] returns an [`OnDemandImage`] that applies
//! deltas lazily, one chunk per fault.

mod eager;
mod on_demand;

use std::sync::Arc;

use crate::cancel::CancelFlag;
use crate::channel::ChunkPublisher;
use crate::config::CloudletConfig;
use crate::container::OverlayContainer;
use crate::error::Result;
use crate::image::{ChunkSource, Geometry};

pub use eager::SynthesisStats;
pub use on_demand::OnDemandImage;

pub struct SynthesisEngine {
    container: Arc<OverlayContainer>,
    base: Arc<dyn ChunkSource>,
    publisher: ChunkPublisher,
    max_threads: usize,
    apply_batch: usize,
    cancel: CancelFlag,
}

impl SynthesisEngine {
    /// Pair `container` with the base image it was captured against.
    ///
    /// Fails with `GeometryMismatch` if the base capacities differ from the ones
    /// recorded in the overlay.
    pub fn new(
        container: OverlayContainer,
        base: Arc<dyn ChunkSource>,
        publisher: ChunkPublisher,
        config: &CloudletConfig,
    ) -> Result<Self> {
        container
            .geometry()
            .ensure_matches(&Geometry::of(base.as_ref())?)?;
        Ok(Self {
            container: Arc::new(container),
            base,
            publisher,
            max_threads: config.synthesis.max_threads,
            apply_batch: config.synthesis.apply_batch.max(1),
            cancel: CancelFlag::new(),
        })
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn container(&self) -> &OverlayContainer {
        &self.container
    }

    pub fn geometry(&self) -> Geometry {
        self.container.geometry()
    }

    /// Switch to lazy, fault-driven application.
    pub fn on_demand(self) -> OnDemandImage {
        OnDemandImage::new(self.container, self.base, self.publisher)
    }
}
