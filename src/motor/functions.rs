// On/off logic outputs that are not motors (lights, siren, ...)

use std::collections::BTreeMap;

use tracing::{debug, warn};

use super::pwm::{Board, OutputLine, PwmError};
use crate::config::FUNCTION_PIN_BASE;

struct LogicFunction {
    line: Option<Box<dyn OutputLine>>,
    on: bool,
}

#[derive(Default)]
pub struct FunctionOutputs {
    functions: BTreeMap<String, LogicFunction>,
}

impl FunctionOutputs {
    /// Claim one output per name on consecutive pins from `FUNCTION_PIN_BASE`
    pub fn new(names: &[&str], board: &dyn Board) -> Self {
        let functions = names
            .iter()
            .enumerate()
            .map(|(idx, name)| {
                let pin = FUNCTION_PIN_BASE.saturating_add(idx as u8);
                let line = match board.claim_output(pin) {
                    Ok(line) => Some(line),
                    Err(e) => {
                        warn!("Function {} disabled: {}", name, e);
                        None
                    }
                };
                (name.to_string(), LogicFunction { line, on: false })
            })
            .collect();
        Self { functions }
    }

    /// Switch a function. Returns `Ok(false)` for unknown names.
    pub fn set(&mut self, name: &str, on: bool) -> Result<bool, PwmError> {
        let Some(function) = self.functions.get_mut(name) else {
            return Ok(false);
        };
        if let Some(line) = function.line.as_mut() {
            line.set_level(on)?;
        }
        debug!("Function {} -> {}", name, if on { "on" } else { "off" });
        function.on = on;
        Ok(true)
    }

    pub fn get(&self, name: &str) -> Option<bool> {
        self.functions.get(name).map(|f| f.on)
    }

    /// Switch every function off, continuing past failures
    pub fn all_off(&mut self) {
        let names: Vec<String> = self.functions.keys().cloned().collect();
        for name in names {
            if let Err(e) = self.set(&name, false) {
                warn!("Failed to switch off {}: {}", name, e);
            }
        }
    }
}
