// Named motors for the configured vehicle type
//
// The registry owns every hardware line of the vehicle. It is only ever used
// from the control task, so none of this is synchronised.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::driver::{Motor, MotorKind};
use super::functions::FunctionOutputs;
use super::pwm::{Board, PwmError};
use crate::config::{motor_pins, DEFAULT_MIN_POWER, MAX_DUTY, MOTOR_PIN_MAP};
use crate::messages::Direction;
use crate::store::{ConfigError, ConfigStore, VehicleConfig};
use crate::vehicle::{vehicle_type, VehicleType};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Unknown motor: {0}")]
    UnknownMotor(String),

    #[error("Motor number {number} assigned to both {first} and {second}")]
    AssignmentConflict {
        number: u8,
        first: String,
        second: String,
    },

    #[error("Motor number {number} for {name} is not in the pin table")]
    InvalidMotorNumber { name: String, number: u8 },

    #[error("Hardware error: {0}")]
    Hardware(#[from] PwmError),

    #[error("Failed to persist configuration: {0}")]
    Persist(#[from] ConfigError),
}

/// Every hardware line of one vehicle configuration
///
/// A layout is built whole and dropped whole; dropping it releases all pins.
pub struct MotorLayout {
    axis_motors: BTreeMap<String, Motor>,
    motor_functions: BTreeMap<String, Motor>,
    functions: FunctionOutputs,
}

impl MotorLayout {
    fn empty() -> Self {
        Self {
            axis_motors: BTreeMap::new(),
            motor_functions: BTreeMap::new(),
            functions: FunctionOutputs::default(),
        }
    }

    fn build(vehicle: &VehicleType, cfg: &VehicleConfig, board: &dyn Board) -> Self {
        let numbers = allocate_motor_numbers(vehicle, &cfg.motor_numbers);

        let make = |name: &str, kind: MotorKind| {
            let mut motor = Motor::new(name, kind, numbers.get(name).copied(), board);
            motor.set_min_power(cfg.motor_min.get(name).copied().unwrap_or(DEFAULT_MIN_POWER));
            motor.set_reversed(cfg.motor_reversed.get(name).copied().unwrap_or(false));
            (name.to_string(), motor)
        };

        let axis_motors = vehicle
            .axis_motors
            .iter()
            .map(|name| make(name, MotorKind::Axis))
            .collect();
        let motor_functions = vehicle
            .motor_functions
            .iter()
            .map(|name| make(name, MotorKind::Function))
            .collect();

        Self {
            axis_motors,
            motor_functions,
            functions: FunctionOutputs::new(vehicle.functions, board),
        }
    }

    fn motor_mut(&mut self, name: &str) -> Option<&mut Motor> {
        self.axis_motors
            .get_mut(name)
            .or_else(|| self.motor_functions.get_mut(name))
    }
}

/// Give every motor of `vehicle` a motor number
///
/// Persisted numbers are kept when they are valid and not taken; everyone
/// else gets the lowest free number from the pin table.
fn allocate_motor_numbers(vehicle: &VehicleType, persisted: &BTreeMap<String, u8>) -> HashMap<String, u8> {
    let mut numbers = HashMap::new();
    let mut used = HashSet::new();

    for name in vehicle.motor_names() {
        if let Some(&num) = persisted.get(name) {
            if motor_pins(num).is_some() && used.insert(num) {
                numbers.insert(name.to_string(), num);
            }
        }
    }

    for name in vehicle.motor_names() {
        if numbers.contains_key(name) {
            continue;
        }
        match MOTOR_PIN_MAP.iter().map(|(num, _)| *num).find(|num| !used.contains(num)) {
            Some(num) => {
                used.insert(num);
                numbers.insert(name.to_string(), num);
            }
            None => warn!("No free motor number for {}", name),
        }
    }
    numbers
}

pub struct MotorRegistry {
    board: Box<dyn Board>,
    store: Box<dyn ConfigStore>,
    settings: VehicleConfig,
    vehicle: &'static VehicleType,
    layout: MotorLayout,
    timeout: Duration,
}

impl MotorRegistry {
    /// Build the registry for the vehicle type named in the persisted config
    pub fn new(board: Box<dyn Board>, store: Box<dyn ConfigStore>, timeout: Duration) -> Self {
        let mut settings = store.load().unwrap_or_else(|e| {
            warn!("Failed to load config, using defaults: {}", e);
            VehicleConfig::default()
        });
        let vehicle = vehicle_type(settings.vehicle_type.as_deref());
        if settings.vehicle_type.as_deref() != Some(vehicle.type_name) {
            warn!(
                "Vehicle type {:?} not found, using {}",
                settings.vehicle_type, vehicle.type_name
            );
        }

        if settings.vehicle_tag.as_deref().is_none_or(str::is_empty) {
            let tag = vehicle.default_tag();
            info!("No vehicle tag configured, using {}", tag);
            settings.vehicle_tag = Some(tag);
            if let Err(e) = store.save(&settings) {
                warn!("Failed to save vehicle tag: {}", e);
            }
        }

        let layout = MotorLayout::build(vehicle, &settings, board.as_ref());
        info!("Motor registry ready for {} ({})", vehicle.friendly_name, vehicle.type_name);

        Self {
            board,
            store,
            settings,
            vehicle,
            layout,
            timeout,
        }
    }

    /// Apply a wire command: power is 0..100
    ///
    /// Axis motors get power/100, function motors and logic functions are on
    /// when power >= 1.
    pub fn set_motor(&mut self, name: &str, dir: Direction, power: f64) -> Result<(), RegistryError> {
        if let Some(motor) = self.layout.axis_motors.get_mut(name) {
            motor.set_output(dir, power / 100.0)?;
        } else if let Some(motor) = self.layout.motor_functions.get_mut(name) {
            motor.set_output(dir, if power >= 1.0 { 1.0 } else { 0.0 })?;
        } else if !self.layout.functions.set(name, power >= 1.0)? {
            return Err(RegistryError::UnknownMotor(name.to_string()));
        }
        Ok(())
    }

    /// Signed drive for an axis motor, `value` in [-1, 1]
    pub fn set_axis(&mut self, name: &str, value: f64) -> Result<(), RegistryError> {
        let motor = self
            .layout
            .axis_motors
            .get_mut(name)
            .ok_or_else(|| RegistryError::UnknownMotor(name.to_string()))?;
        let dir = if value >= 0.0 { Direction::Fwd } else { Direction::Rev };
        motor.set_output(dir, value.abs())?;
        Ok(())
    }

    pub fn set_motor_function(&mut self, name: &str, dir: Direction, on: bool) -> Result<(), RegistryError> {
        let motor = self
            .layout
            .motor_functions
            .get_mut(name)
            .ok_or_else(|| RegistryError::UnknownMotor(name.to_string()))?;
        motor.set_output(dir, if on { 1.0 } else { 0.0 })?;
        Ok(())
    }

    pub fn set_function(&mut self, name: &str, on: bool) -> Result<(), RegistryError> {
        if self.layout.functions.set(name, on)? {
            Ok(())
        } else {
            Err(RegistryError::UnknownMotor(name.to_string()))
        }
    }

    /// Stop one motor (or switch off one logic function)
    pub fn stop_motor(&mut self, name: &str) -> Result<(), RegistryError> {
        match self.layout.motor_mut(name) {
            Some(motor) => Ok(motor.stop()?),
            None => self.set_function(name, false),
        }
    }

    pub fn stop_axis(&mut self, name: &str) -> Result<(), RegistryError> {
        match self.layout.axis_motors.get_mut(name) {
            Some(motor) => Ok(motor.stop()?),
            None => Err(RegistryError::UnknownMotor(name.to_string())),
        }
    }

    pub fn stop_motor_function(&mut self, name: &str) -> Result<(), RegistryError> {
        match self.layout.motor_functions.get_mut(name) {
            Some(motor) => Ok(motor.stop()?),
            None => Err(RegistryError::UnknownMotor(name.to_string())),
        }
    }

    /// Stop every motor and switch off every logic function
    ///
    /// A failing motor does not keep the others running.
    pub fn stop_all(&mut self) {
        for motor in self.motors_mut() {
            if let Err(e) = motor.stop() {
                warn!("Failed to stop {}: {}", motor.name(), e);
            }
        }
        self.layout.functions.all_off();
    }

    /// Set and persist a motor's duty floor. False for unknown names.
    pub fn update_min_power(&mut self, name: &str, value: i64) -> bool {
        let min_power = value.clamp(0, i64::from(MAX_DUTY) - 1) as u16;
        let Some(motor) = self.layout.motor_mut(name) else {
            return false;
        };
        motor.set_min_power(min_power);
        self.settings.motor_min.insert(name.to_string(), min_power);
        self.persist();
        true
    }

    /// Set and persist a motor's reversed flag. False for unknown names.
    pub fn update_reversed(&mut self, name: &str, reversed: bool) -> bool {
        let Some(motor) = self.layout.motor_mut(name) else {
            return false;
        };
        motor.set_reversed(reversed);
        self.settings.motor_reversed.insert(name.to_string(), reversed);
        self.persist();
        true
    }

    /// Live name -> motor number table
    pub fn get_motor_assignments(&self) -> BTreeMap<String, u8> {
        self.motors()
            .filter_map(|m| m.motor_num().map(|num| (m.name().to_string(), num)))
            .collect()
    }

    /// Replace the motor number table and rebuild every motor from scratch
    ///
    /// On error nothing changes: not the live motors, not the persisted table.
    pub fn set_motor_assignments(&mut self, assignments: BTreeMap<String, u8>) -> Result<(), RegistryError> {
        validate_assignments(self.vehicle, &assignments)?;

        let mut settings = self.settings.clone();
        settings.motor_numbers = assignments;
        self.store.save(&settings)?;
        self.settings = settings;

        // Old lines must be released before the new layout claims the pins
        drop(std::mem::replace(&mut self.layout, MotorLayout::empty()));
        self.layout = MotorLayout::build(self.vehicle, &self.settings, self.board.as_ref());

        info!("Motor assignments changed: {:?}", self.get_motor_assignments());
        Ok(())
    }

    pub fn motor(&self, name: &str) -> Option<&Motor> {
        self.layout
            .axis_motors
            .get(name)
            .or_else(|| self.layout.motor_functions.get(name))
    }

    pub fn function_state(&self, name: &str) -> Option<bool> {
        self.layout.functions.get(name)
    }

    pub fn motors(&self) -> impl Iterator<Item = &Motor> {
        self.layout
            .axis_motors
            .values()
            .chain(self.layout.motor_functions.values())
    }

    pub fn motors_mut(&mut self) -> impl Iterator<Item = &mut Motor> {
        self.layout
            .axis_motors
            .values_mut()
            .chain(self.layout.motor_functions.values_mut())
    }

    pub fn any_running(&self) -> bool {
        self.motors().any(Motor::running)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn vehicle(&self) -> &'static VehicleType {
        self.vehicle
    }

    pub fn settings(&self) -> &VehicleConfig {
        &self.settings
    }

    fn persist(&self) {
        if let Err(e) = self.store.save(&self.settings) {
            warn!("Failed to save motor settings: {}", e);
        }
    }
}

/// Numbers must be in the pin table and pairwise unique; names must exist
fn validate_assignments(vehicle: &VehicleType, assignments: &BTreeMap<String, u8>) -> Result<(), RegistryError> {
    let mut seen: HashMap<u8, &str> = HashMap::new();
    for (name, &number) in assignments {
        if !vehicle.motor_names().any(|n| n == name.as_str()) {
            return Err(RegistryError::UnknownMotor(name.clone()));
        }
        if motor_pins(number).is_none() {
            return Err(RegistryError::InvalidMotorNumber {
                name: name.clone(),
                number,
            });
        }
        if let Some(first) = seen.insert(number, name) {
            return Err(RegistryError::AssignmentConflict {
                number,
                first: first.to_string(),
                second: name.clone(),
            });
        }
    }
    debug!("Motor assignments valid: {:?}", assignments);
    Ok(())
}
