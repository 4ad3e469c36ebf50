//! Injected time source.
//!
//! All queue timing goes through one `Clock` handle backed by the runtime
//! clock, so paused-time tests drive the whole subsystem deterministically
//! and nothing reads wall time directly.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Clone, Debug)]
pub struct Clock {
    origin: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Clock {
            origin: Instant::now(),
        }
    }

    /// Seconds since this clock was created. Monotonic.
    pub fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    pub async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
