// Motor safety watchdog
// Stops any motor that has not been commanded within the timeout. This is what
// keeps the vehicle safe when a client disconnects or stalls mid-drive; closing
// a session never stops motors by itself.
//
// Sweeps run on the control task, the same place every other PWM write
// happens. Never call this from another thread.

use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::config::WATCHDOG_MAX_INTERVAL;
use crate::motor::MotorRegistry;

#[derive(Debug, Clone, Copy)]
pub struct Watchdog {
    timeout: Duration,
    interval: Duration,
}

impl Watchdog {
    pub fn new(timeout: Duration) -> Self {
        let interval = (timeout / 2)
            .min(WATCHDOG_MAX_INTERVAL)
            .max(Duration::from_millis(1));
        Self { timeout, interval }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Sweep period: at most half the timeout
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Stop every running motor whose last update is older than the timeout
    ///
    /// Returns how many motors were stopped. A motor whose stop fails is
    /// skipped and stays marked running, so the next sweep retries it.
    pub fn sweep(&self, registry: &mut MotorRegistry, now: Instant) -> usize {
        let mut stopped = 0;
        for motor in registry.motors_mut().filter(|m| m.running()) {
            let age = now.saturating_duration_since(motor.last_update());
            if age <= self.timeout {
                continue;
            }
            match motor.stop() {
                Ok(()) => {
                    info!("Watchdog stopped {} ({:?} since last command)", motor.name(), age);
                    stopped += 1;
                }
                Err(e) => warn!("Watchdog failed to stop {}: {}", motor.name(), e),
            }
        }
        stopped
    }
}
