//! Degradation controller.
//!
//! A single timestamp records the last qualifying failure. While the
//! window is open the caches are consulted with freshness checks off and
//! server calls are suppressed; the window closes by itself.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::constants::SAINT_MODE_DURATION_SECS;

#[derive(Debug)]
pub struct SaintMode {
    window: Duration,
    last_failure: Mutex<Option<Instant>>,
}

impl Default for SaintMode {
    fn default() -> Self {
        Self::new(Duration::from_secs(SAINT_MODE_DURATION_SECS))
    }
}

impl SaintMode {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_failure: Mutex::new(None),
        }
    }

    pub fn active(&self) -> bool {
        matches!(*self.last_failure.lock(), Some(at) if at.elapsed() < self.window)
    }

    pub fn trip(&self) {
        tracing::warn!("entering saint mode for {:?}", self.window);
        *self.last_failure.lock() = Some(Instant::now());
    }
}
