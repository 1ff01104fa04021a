//! Cooperative shutdown token.
//!
//! Cancelling never interrupts an in-flight child migration. Parent migrators observe
//! the token between submissions: they stop scheduling, drain what is running,
//! checkpoint and return an interrupted report. The bulk orchestrator stops starting
//! new parents.

use crate::error::{MigrateError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared shutdown flag. Clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a graceful shutdown.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            tracing::info!("Shutdown requested; draining in-flight work");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Return `MigrateError::Cancelled` once shutdown was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(MigrateError::Cancelled)
        } else {
            Ok(())
        }
    }
}
