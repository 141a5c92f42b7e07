use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{CloudletError, Result};

/// Cooperative whole-session cancellation.
///
/// Sessions poll the flag between chunks; a chunk that has started applying
/// always runs to completion or failure.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// `Err(Cancelled)` once `cancel` has been called.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(CloudletError::Cancelled)
        } else {
            Ok(())
        }
    }
}
