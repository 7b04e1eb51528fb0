// A single H-bridge motor on two PWM lines
//
// Line A drives forward, line B drives reverse. At most one of them carries a
// non-zero duty at any time.

use std::time::Instant;

use tracing::{debug, warn};

use super::pwm::{Board, PwmChannel, PwmError};
use crate::config::{motor_pins, DEFAULT_MIN_POWER, MAX_DUTY, PWM_FREQ_HZ};
use crate::messages::Direction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotorKind {
    /// Continuously variable drive, value is power in [0, 1]
    Axis,
    /// On/off at a fixed duty, value is treated as a flag
    Function,
}

struct MotorLines {
    fwd: Box<dyn PwmChannel>,
    rev: Box<dyn PwmChannel>,
}

pub struct Motor {
    name: String,
    kind: MotorKind,
    motor_num: Option<u8>,
    reversed: bool,
    min_power: u16,
    running: bool,
    last_update: Instant,
    // None when the pins could not be claimed: the motor is a silent sink
    lines: Option<MotorLines>,
}

impl Motor {
    /// Build a motor on the pin pair for `motor_num`
    ///
    /// Never fails. If the number has no pin pair or a pin cannot be claimed
    /// the motor is still created (so lookups by name keep working) but it
    /// never actuates.
    pub fn new(name: &str, kind: MotorKind, motor_num: Option<u8>, board: &dyn Board) -> Self {
        let lines = match motor_num.and_then(motor_pins) {
            Some((a, b)) => {
                let claimed = board
                    .claim_pwm(a, PWM_FREQ_HZ)
                    .and_then(|fwd| Ok(MotorLines { fwd, rev: board.claim_pwm(b, PWM_FREQ_HZ)? }));
                match claimed {
                    Ok(lines) => {
                        debug!("Motor {} on pins ({}, {})", name, a, b);
                        Some(lines)
                    }
                    Err(e) => {
                        warn!("Motor {} disabled: {}", name, e);
                        None
                    }
                }
            }
            None => {
                warn!("Motor {} has no valid motor number ({:?}), disabled", name, motor_num);
                None
            }
        };

        Self {
            name: name.to_string(),
            kind,
            motor_num,
            reversed: false,
            min_power: DEFAULT_MIN_POWER,
            running: false,
            last_update: Instant::now(),
            lines,
        }
    }

    /// Duty the motor would output for `value`
    pub fn duty_for(&self, value: f64) -> u16 {
        match self.kind {
            MotorKind::Axis => {
                if value <= 0.0 {
                    return 0;
                }
                let p = value.clamp(0.0, 1.0);
                let span = f64::from(MAX_DUTY - self.min_power);
                (f64::from(self.min_power) + p * span) as u16
            }
            MotorKind::Function => {
                if value > 0.0 {
                    self.min_power
                } else {
                    0
                }
            }
        }
    }

    /// Drive the motor in `direction` at `value` (see `duty_for`)
    pub fn set_output(&mut self, direction: Direction, value: f64) -> Result<(), PwmError> {
        let duty = self.duty_for(value);
        let forward = direction.is_forward() != self.reversed;
        let Some(lines) = self.lines.as_mut() else {
            return Ok(());
        };

        // Release the opposite side before energising the selected one
        if forward {
            lines.rev.set_duty(0)?;
            lines.fwd.set_duty(duty)?;
        } else {
            lines.fwd.set_duty(0)?;
            lines.rev.set_duty(duty)?;
        }

        self.running = duty > 0;
        self.last_update = Instant::now();
        Ok(())
    }

    /// Both lines to zero. Safe to call repeatedly.
    pub fn stop(&mut self) -> Result<(), PwmError> {
        if let Some(lines) = self.lines.as_mut() {
            lines.fwd.set_duty(0)?;
            lines.rev.set_duty(0)?;
        }
        self.running = false;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn motor_num(&self) -> Option<u8> {
        self.motor_num
    }

    pub fn reversed(&self) -> bool {
        self.reversed
    }

    pub fn set_reversed(&mut self, reversed: bool) {
        self.reversed = reversed;
    }

    pub fn min_power(&self) -> u16 {
        self.min_power
    }

    pub fn set_min_power(&mut self, min_power: u16) {
        self.min_power = min_power.min(MAX_DUTY - 1);
    }

    pub fn running(&self) -> bool {
        self.running
    }

    pub fn last_update(&self) -> Instant {
        self.last_update
    }

    /// False when the motor is a no-op sink
    pub fn is_attached(&self) -> bool {
        self.lines.is_some()
    }

    /// Current (forward, reverse) duty
    pub fn duties(&self) -> Option<(u16, u16)> {
        self.lines
            .as_ref()
            .map(|lines| (lines.fwd.duty(), lines.rev.duty()))
    }
}

impl Drop for Motor {
    fn drop(&mut self) {
        // Leave the bridge de-energised before the pins are released
        if let Err(e) = self.stop() {
            warn!("Failed to stop motor {} on release: {}", self.name, e);
        }
    }
}

impl std::fmt::Debug for Motor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Motor")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("motor_num", &self.motor_num)
            .field("reversed", &self.reversed)
            .field("min_power", &self.min_power)
            .field("running", &self.running)
            .field("duties", &self.duties())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::pwm::SimulatedBoard;

    fn axis(board: &SimulatedBoard, min_power: u16) -> Motor {
        let mut m = Motor::new("left", MotorKind::Axis, Some(1), board);
        m.set_min_power(min_power);
        m
    }

    #[test]
    fn test_axis_duty_mapping() {
        let board = SimulatedBoard::new();
        let m = axis(&board, 40000);
        assert_eq!(m.duty_for(0.0), 0);
        assert_eq!(m.duty_for(-0.3), 0);
        assert_eq!(m.duty_for(1.0), MAX_DUTY);
        assert_eq!(m.duty_for(7.0), MAX_DUTY);
        // 40000 + 0.5 * 25535, truncated
        assert_eq!(m.duty_for(0.5), 52767);
    }

    #[test]
    fn test_axis_duty_is_monotonic() {
        let board = SimulatedBoard::new();
        let m = axis(&board, 12345);
        let mut last = 0;
        for power in 0..=100 {
            let duty = m.duty_for(f64::from(power) / 100.0);
            assert!(duty >= last, "duty dropped at power {}", power);
            last = duty;
        }
        assert_eq!(last, MAX_DUTY);
    }

    #[test]
    fn test_set_output_forward_and_reverse() {
        let board = SimulatedBoard::new();
        let mut m = axis(&board, 40000);

        m.set_output(Direction::Fwd, 0.5).unwrap();
        assert!(m.running());
        assert_eq!(board.duty(1), Some(52767));
        assert_eq!(board.duty(2), Some(0));

        m.set_output(Direction::Rev, 0.5).unwrap();
        assert_eq!(board.duty(1), Some(0));
        assert_eq!(board.duty(2), Some(52767));
    }

    #[test]
    fn test_reversed_swaps_lines_not_duty() {
        let board = SimulatedBoard::new();
        let mut m = axis(&board, 40000);
        m.set_reversed(true);

        m.set_output(Direction::Fwd, 0.5).unwrap();
        assert_eq!(m.duties(), Some((0, 52767)));
    }

    #[test]
    fn test_zero_power_is_not_running() {
        let board = SimulatedBoard::new();
        let mut m = axis(&board, 40000);
        m.set_output(Direction::Fwd, 0.8).unwrap();
        m.set_output(Direction::Fwd, 0.0).unwrap();
        assert!(!m.running());
        assert_eq!(m.duties(), Some((0, 0)));
    }

    #[test]
    fn test_function_motor_on_off() {
        let board = SimulatedBoard::new();
        let mut m = Motor::new("bed", MotorKind::Function, Some(3), &board);
        m.set_min_power(30000);

        m.set_output(Direction::Fwd, 1.0).unwrap();
        assert!(m.running());
        assert_eq!(board.duty(5), Some(30000));

        m.set_output(Direction::Fwd, 0.0).unwrap();
        assert!(!m.running());
        assert_eq!(board.duty(5), Some(0));
    }

    #[test]
    fn test_stop_is_idempotent() {
        let board = SimulatedBoard::new();
        let mut m = axis(&board, 40000);
        m.set_output(Direction::Rev, 1.0).unwrap();
        m.stop().unwrap();
        m.stop().unwrap();
        assert!(!m.running());
        assert_eq!(m.duties(), Some((0, 0)));
    }

    #[test]
    fn test_failed_init_is_noop_sink() {
        let board = SimulatedBoard::new();
        board.break_pin(2);
        let mut m = Motor::new("left", MotorKind::Axis, Some(1), &board);

        assert!(!m.is_attached());
        // pin 1 was claimed then released when pin 2 failed
        assert!(!board.is_claimed(1));
        assert!(m.set_output(Direction::Fwd, 1.0).is_ok());
        assert!(!m.running());
        assert!(m.stop().is_ok());
    }

    #[test]
    fn test_unknown_motor_number_is_noop_sink() {
        let board = SimulatedBoard::new();
        let mut m = Motor::new("left", MotorKind::Axis, Some(9), &board);
        assert!(!m.is_attached());
        assert!(m.set_output(Direction::Fwd, 1.0).is_ok());
        assert!(board.claimed_pins().is_empty());
    }

    #[test]
    fn test_write_failure_keeps_running_flag() {
        let board = SimulatedBoard::new();
        let mut m = axis(&board, 40000);
        m.set_output(Direction::Fwd, 1.0).unwrap();

        board.fail_writes(1, true);
        assert!(m.stop().is_err());
        // still marked running so the watchdog retries
        assert!(m.running());
    }

    #[test]
    fn test_drop_releases_pins() {
        let board = SimulatedBoard::new();
        let m = axis(&board, 40000);
        assert_eq!(board.claimed_pins(), vec![1, 2]);
        drop(m);
        assert!(board.claimed_pins().is_empty());
    }
}
