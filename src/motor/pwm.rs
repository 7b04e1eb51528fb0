// Hardware output lines
//
// The control core never touches registers directly. A `Board` hands out
// PWM channels and plain digital outputs; dropping a line releases the pin.
// `SimulatedBoard` stands in for the microcontroller on a host and records
// every output level so the motor logic can be checked against it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

/// Highest GPIO number on the target (ESP32-S3)
pub const MAX_GPIO: u8 = 48;

/// A pin could not be turned into an output
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("PWM init failed on pin {pin}: {reason}")]
pub struct PwmInitError {
    pub pin: u8,
    pub reason: String,
}

/// A write to an already-initialized line failed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PwmError {
    #[error("Write to pin {pin} failed")]
    WriteFailed { pin: u8 },
}

/// One PWM output with a 16-bit duty scale
pub trait PwmChannel: Send {
    fn set_duty(&mut self, duty: u16) -> Result<(), PwmError>;
    fn duty(&self) -> u16;
    fn pin(&self) -> u8;
}

/// One on/off output
pub trait OutputLine: Send {
    fn set_level(&mut self, high: bool) -> Result<(), PwmError>;
    fn is_high(&self) -> bool;
    fn pin(&self) -> u8;
}

/// Source of hardware lines
pub trait Board: Send {
    fn claim_pwm(&self, pin: u8, freq_hz: u32) -> Result<Box<dyn PwmChannel>, PwmInitError>;
    fn claim_output(&self, pin: u8) -> Result<Box<dyn OutputLine>, PwmInitError>;
}

#[derive(Debug, Default)]
struct BoardState {
    /// Claimed pin -> current level (duty for PWM, 0/1 for digital)
    claimed: HashMap<u8, u16>,
    broken_pins: HashSet<u8>,
    failing_writes: HashSet<u8>,
}

/// Host-side stand-in for the vehicle board
#[derive(Debug, Clone, Default)]
pub struct SimulatedBoard {
    state: Arc<Mutex<BoardState>>,
}

impl SimulatedBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every future claim of `pin` fail, as a dead or reserved pin would
    pub fn break_pin(&self, pin: u8) {
        self.state.lock().broken_pins.insert(pin);
    }

    /// Make writes to `pin` fail while still letting it be claimed
    pub fn fail_writes(&self, pin: u8, failing: bool) {
        let mut state = self.state.lock();
        if failing {
            state.failing_writes.insert(pin);
        } else {
            state.failing_writes.remove(&pin);
        }
    }

    /// Current duty of a claimed PWM pin
    pub fn duty(&self, pin: u8) -> Option<u16> {
        self.state.lock().claimed.get(&pin).copied()
    }

    /// Current level of a claimed digital pin
    pub fn level(&self, pin: u8) -> Option<bool> {
        self.duty(pin).map(|v| v != 0)
    }

    pub fn is_claimed(&self, pin: u8) -> bool {
        self.state.lock().claimed.contains_key(&pin)
    }

    pub fn claimed_pins(&self) -> Vec<u8> {
        let mut pins: Vec<u8> = self.state.lock().claimed.keys().copied().collect();
        pins.sort_unstable();
        pins
    }

    fn claim(&self, pin: u8) -> Result<SimLine, PwmInitError> {
        let mut state = self.state.lock();
        if pin > MAX_GPIO || state.broken_pins.contains(&pin) {
            return Err(PwmInitError {
                pin,
                reason: "invalid pin".to_string(),
            });
        }
        if state.claimed.contains_key(&pin) {
            return Err(PwmInitError {
                pin,
                reason: "pin already in use".to_string(),
            });
        }
        state.claimed.insert(pin, 0);
        Ok(SimLine {
            pin,
            level: 0,
            state: Arc::clone(&self.state),
        })
    }
}

impl Board for SimulatedBoard {
    fn claim_pwm(&self, pin: u8, freq_hz: u32) -> Result<Box<dyn PwmChannel>, PwmInitError> {
        debug!("Claim PWM pin {} at {} Hz", pin, freq_hz);
        Ok(Box::new(self.claim(pin)?))
    }

    fn claim_output(&self, pin: u8) -> Result<Box<dyn OutputLine>, PwmInitError> {
        debug!("Claim output pin {}", pin);
        Ok(Box::new(self.claim(pin)?))
    }
}

#[derive(Debug)]
struct SimLine {
    pin: u8,
    level: u16,
    state: Arc<Mutex<BoardState>>,
}

impl SimLine {
    fn write(&mut self, level: u16) -> Result<(), PwmError> {
        let mut state = self.state.lock();
        if state.failing_writes.contains(&self.pin) {
            return Err(PwmError::WriteFailed { pin: self.pin });
        }
        state.claimed.insert(self.pin, level);
        self.level = level;
        Ok(())
    }
}

impl PwmChannel for SimLine {
    fn set_duty(&mut self, duty: u16) -> Result<(), PwmError> {
        self.write(duty)
    }

    fn duty(&self) -> u16 {
        self.level
    }

    fn pin(&self) -> u8 {
        self.pin
    }
}

impl OutputLine for SimLine {
    fn set_level(&mut self, high: bool) -> Result<(), PwmError> {
        self.write(u16::from(high))
    }

    fn is_high(&self) -> bool {
        self.level != 0
    }

    fn pin(&self) -> u8 {
        self.pin
    }
}

impl Drop for SimLine {
    fn drop(&mut self) {
        // deinit: output goes low and the pin is free again
        self.state.lock().claimed.remove(&self.pin);
    }
}
