// Motor control for the vehicle
//
// Provides:
// - Hardware line abstraction and a simulated board
// - H-bridge motor with duty-cycle mapping
// - Logic (non-motor) outputs
// - Registry of named motors for the configured vehicle type

mod driver;
mod functions;
pub mod pwm;
pub mod registry;

pub use driver::{Motor, MotorKind};
pub use functions::FunctionOutputs;
pub use pwm::{Board, OutputLine, PwmChannel, PwmError, PwmInitError, SimulatedBoard};
pub use registry::{MotorLayout, MotorRegistry, RegistryError};
