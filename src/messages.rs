// Message types shared by the socket and datagram channels
//
// Wire schema: {"action":"set"|"stop"|"stop_all", "name"?:string, "dir"?:"fwd"|"rev", "power"?:number}

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};

pub const ERR_BUSY: &str = "Vehicle is busy";
pub const ERR_FORCE_DISCONNECT: &str = "Force disconnect by admin";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Fwd,
    Rev,
}

impl Direction {
    pub fn is_forward(self) -> bool {
        self == Direction::Fwd
    }
}

/// Command from a client -> control task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Command {
    Set {
        name: String,
        #[serde(default)]
        dir: Direction,
        /// 0..100, out of range values are clamped when applied
        #[serde(default, deserialize_with = "number_or_numeric_string")]
        power: f64,
    },
    /// A missing name stops nothing but is still echoed
    Stop {
        #[serde(default)]
        name: String,
    },
    StopAll,
}

/// Accepts `50` as well as `"50"`; older web clients send form values
fn number_or_numeric_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Power {
        Number(f64),
        Text(String),
    }

    match Power::deserialize(deserializer)? {
        Power::Number(power) => Ok(power),
        Power::Text(text) => text
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("power is not a number: {:?}", text))),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("Malformed command: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Command payload is not a JSON object")]
    NotAnObject,
}

impl Command {
    /// Parse one text frame. Anything but a single command object is rejected.
    pub fn parse(text: &str) -> Result<Self, CommandError> {
        let value: Value = serde_json::from_str(text)?;
        if !value.is_object() {
            return Err(CommandError::NotAnObject);
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Parse a datagram: one command object or an array of them
    ///
    /// Invalid entries inside an array are skipped; the rest still apply.
    pub fn parse_batch(payload: &[u8]) -> Result<Vec<Self>, CommandError> {
        let value: Value = serde_json::from_slice(payload)?;
        match value {
            Value::Array(items) => Ok(items
                .into_iter()
                .filter(Value::is_object)
                .filter_map(|item| serde_json::from_value(item).ok())
                .collect()),
            Value::Object(_) => Ok(vec![serde_json::from_value(value)?]),
            _ => Err(CommandError::NotAnObject),
        }
    }

    /// stop / stop_all are echoed to the other open sockets
    pub fn is_stop(&self) -> bool {
        matches!(self, Command::Stop { .. } | Command::StopAll)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// `{"error": "..."}` sent to a socket before it is closed
pub fn error_payload(message: &str) -> String {
    json!({ "error": message }).to_string()
}

/// Served on GET /status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleStatus {
    #[serde(rename = "type")]
    pub vehicle_type: Option<String>,
    pub tag: Option<String>,
    #[serde(rename = "vehicleName")]
    pub vehicle_name: Option<String>,
    pub busy: bool,
    pub asleep: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_set() {
        let cmd = Command::parse(r#"{"action":"set","name":"left","dir":"rev","power":75}"#).unwrap();
        assert_eq!(
            cmd,
            Command::Set {
                name: "left".into(),
                dir: Direction::Rev,
                power: 75.0
            }
        );
    }

    #[test]
    fn test_parse_set_defaults() {
        let cmd = Command::parse(r#"{"action":"set","name":"bed"}"#).unwrap();
        assert_eq!(
            cmd,
            Command::Set {
                name: "bed".into(),
                dir: Direction::Fwd,
                power: 0.0
            }
        );
    }

    #[test]
    fn test_parse_power_as_string() {
        let cmd = Command::parse(r#"{"action":"set","name":"left","power":"50"}"#).unwrap();
        assert_eq!(
            cmd,
            Command::Set {
                name: "left".into(),
                dir: Direction::Fwd,
                power: 50.0
            }
        );
        assert!(Command::parse(r#"{"action":"set","name":"left","power":"fast"}"#).is_err());
        assert!(Command::parse(r#"{"action":"set","name":"left","power":true}"#).is_err());
    }

    #[test]
    fn test_parse_stop_without_name() {
        let cmd = Command::parse(r#"{"action":"stop"}"#).unwrap();
        assert_eq!(cmd, Command::Stop { name: String::new() });
        assert!(cmd.is_stop());
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(matches!(Command::parse("not json"), Err(CommandError::Malformed(_))));
        assert!(matches!(Command::parse("[1,2]"), Err(CommandError::NotAnObject)));
        assert!(matches!(Command::parse("42"), Err(CommandError::NotAnObject)));
        assert!(Command::parse(r#"{"action":"fly"}"#).is_err());
        assert!(Command::parse(r#"{"action":"set","name":"l","dir":"up"}"#).is_err());
    }

    #[test]
    fn test_parse_batch() {
        let one = Command::parse_batch(br#"{"action":"stop_all"}"#).unwrap();
        assert_eq!(one, vec![Command::StopAll]);

        let many = Command::parse_batch(
            br#"[{"action":"stop","name":"left"}, 7, {"action":"bogus"}, {"action":"stop_all"}]"#,
        )
        .unwrap();
        assert_eq!(
            many,
            vec![Command::Stop { name: "left".into() }, Command::StopAll]
        );

        assert!(Command::parse_batch(b"\"hello\"").is_err());
        assert!(Command::parse_batch(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn test_broadcast_serialization() {
        let stop = Command::Stop { name: "left".into() };
        assert_eq!(stop.to_json().unwrap(), r#"{"action":"stop","name":"left"}"#);
        assert_eq!(Command::StopAll.to_json().unwrap(), r#"{"action":"stop_all"}"#);
        assert!(stop.is_stop());
    }

    #[test]
    fn test_error_payload() {
        assert_eq!(error_payload(ERR_BUSY), r#"{"error":"Vehicle is busy"}"#);
    }
}
