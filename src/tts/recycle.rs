//! Periodic inference-session recycling
//!
//! Long streams accumulate internal runtime state that eventually surfaces
//! as audible crackle. After a configurable number of sentences the engine
//! rebuilds the model session in the background and swaps it in atomically
//! between sentences, so synthesis never stalls on the rebuild.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::tts::model::{AcousticModel, ModelFactory};

/// Default sentence count between session rebuilds.
pub const DEFAULT_RECYCLE_SENTENCES: usize = 20;

type BuildHandle = JoinHandle<anyhow::Result<Box<dyn AcousticModel>>>;

pub struct SessionRecycler {
    threshold: usize,
    since_recycle: usize,
    pending: Option<BuildHandle>,
}

impl SessionRecycler {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold: threshold.max(1),
            since_recycle: 0,
            pending: None,
        }
    }

    /// Record one completed synthesis and recycle the live session when due.
    ///
    /// At the threshold: a finished background build is swapped into `live`
    /// (a failed one triggers an inline rebuild); otherwise a background
    /// build is scheduled on the blocking pool and the counter resets while
    /// the current session stays live. A build still in flight leaves the
    /// counter alone so the swap happens on a later sentence.
    pub async fn after_synthesis(
        &mut self,
        live: &Arc<Mutex<Box<dyn AcousticModel>>>,
        factory: &ModelFactory,
    ) {
        self.since_recycle += 1;
        if self.since_recycle < self.threshold {
            return;
        }

        match self.pending.take() {
            Some(handle) if handle.is_finished() => {
                match handle.await {
                    Ok(Ok(model)) => {
                        *live.lock() = model;
                        info!("Swapped in pre-built inference session");
                    }
                    Ok(Err(e)) => {
                        warn!("Background session build failed, rebuilding inline: {e:#}");
                        self.rebuild_inline(live, factory).await;
                    }
                    Err(e) => {
                        warn!("Background session build panicked, rebuilding inline: {e}");
                        self.rebuild_inline(live, factory).await;
                    }
                }
                self.since_recycle = 0;
            }
            Some(handle) => {
                // Still building; keep the current session and check again
                // after the next sentence.
                self.pending = Some(handle);
            }
            None => {
                info!(
                    "Scheduling background session rebuild after {} sentences",
                    self.since_recycle
                );
                let factory = factory.clone();
                self.pending = Some(tokio::task::spawn_blocking(move || factory()));
                self.since_recycle = 0;
            }
        }
    }

    async fn rebuild_inline(
        &self,
        live: &Arc<Mutex<Box<dyn AcousticModel>>>,
        factory: &ModelFactory,
    ) {
        let factory = factory.clone();
        match tokio::task::spawn_blocking(move || factory()).await {
            Ok(Ok(model)) => {
                *live.lock() = model;
                info!("Rebuilt inference session inline");
            }
            Ok(Err(e)) => warn!("Inline session rebuild failed, keeping current session: {e:#}"),
            Err(e) => warn!("Inline session rebuild panicked, keeping current session: {e}"),
        }
    }

    #[cfg(test)]
    fn has_pending(&self) -> bool {
        self.pending.is_some()
    }
}
