//! Per-run context passed to every agent
//!
//! Holds what a planning run shares: the frozen constraints, the key
//! registry, the state handle, and the cancellation flag.

use crate::catalog::Catalog;
use crate::config::TripConfig;
use crate::crypto::KeyRegistry;
use crate::error::{Result, TripError};
use crate::state::StateManager;
use crate::types::TripConstraints;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Clone)]
pub struct RunContext {
    pub run_id: String,
    pub constraints: Arc<TripConstraints>,
    pub registry: Arc<KeyRegistry>,
    pub state: Arc<StateManager>,
    pub config: Arc<TripConfig>,
    pub catalog: Arc<Catalog>,
    cancelled: Arc<AtomicBool>,
}

impl RunContext {
    pub fn new(
        run_id: impl Into<String>,
        constraints: TripConstraints,
        config: Arc<TripConfig>,
        catalog: Arc<Catalog>,
        state: Arc<StateManager>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            constraints: Arc::new(constraints),
            registry: Arc::new(KeyRegistry::new()),
            state,
            config,
            catalog,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share an existing cancellation flag
    pub fn with_cancellation(mut self, cancelled: Arc<AtomicBool>) -> Self {
        self.cancelled = cancelled;
        self
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Fail with [`TripError::Aborted`] once the run is cancelled
    pub fn ensure_active(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(TripError::Aborted(self.run_id.clone()));
        }
        Ok(())
    }

    /// State path under this run: `trips.{run_id}.{suffix}`
    pub fn state_path(&self, suffix: &str) -> String {
        format!("trips.{}.{}", self.run_id, suffix)
    }

    /// Correlation id for one logical operation of this run
    pub fn correlation(&self, topic: &str) -> String {
        format!("{}:{}", self.run_id, topic)
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::las_context;
    use super::*;

    #[test]
    fn test_cancellation() {
        let ctx = las_context();
        assert!(ctx.ensure_active().is_ok());
        let clone = ctx.clone();
        clone.cancel();
        assert!(ctx.is_cancelled());
        assert!(matches!(ctx.ensure_active(), Err(TripError::Aborted(_))));
    }

    #[test]
    fn test_paths_and_correlation() {
        let ctx = las_context();
        assert_eq!(ctx.state_path("itinerary"), "trips.run-test.itinerary");
        assert_eq!(ctx.correlation("cost:flights"), "run-test:cost:flights");
    }
}
