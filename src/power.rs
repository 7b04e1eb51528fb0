// Motor-driver power: enable line, sleep/wake, idle auto-sleep
//
// The enable line (D8) gates the motor-driver boards. Pulling it low cuts
// drive power entirely; the vehicle is "asleep" until an admin wakes it.

use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::config::DRIVER_ENABLE_PIN;
use crate::motor::{Board, MotorRegistry, OutputLine};

pub struct PowerManager {
    enable: Option<Box<dyn OutputLine>>,
    asleep: bool,
    last_active: Instant,
    idle_timeout: Duration,
}

impl PowerManager {
    /// Claim the enable line and power the drivers up
    pub fn new(board: &dyn Board, idle_timeout: Duration) -> Self {
        let enable = match board.claim_output(DRIVER_ENABLE_PIN) {
            Ok(line) => Some(line),
            Err(e) => {
                warn!("Driver enable line unavailable: {}", e);
                None
            }
        };
        let mut power = Self {
            enable,
            asleep: true,
            last_active: Instant::now(),
            idle_timeout,
        };
        power.wake();
        power
    }

    pub fn wake(&mut self) {
        self.set_enable(true);
        if self.asleep {
            info!("Motor drivers powered up");
        }
        self.asleep = false;
        self.last_active = Instant::now();
    }

    /// Stop everything and cut driver power
    pub fn shutdown(&mut self, registry: &mut MotorRegistry) {
        registry.stop_all();
        self.set_enable(false);
        if !self.asleep {
            info!("Motor drivers powered down");
        }
        self.asleep = true;
        self.last_active = Instant::now();
    }

    pub fn is_asleep(&self) -> bool {
        self.asleep
    }

    pub fn mark_active(&mut self, now: Instant) {
        self.last_active = now;
    }

    pub fn should_sleep(&self, now: Instant) -> bool {
        !self.asleep && now.saturating_duration_since(self.last_active) > self.idle_timeout
    }

    fn set_enable(&mut self, high: bool) {
        if let Some(line) = self.enable.as_mut() {
            if let Err(e) = line.set_level(high) {
                warn!("Failed to drive enable line: {}", e);
            }
        }
    }
}
