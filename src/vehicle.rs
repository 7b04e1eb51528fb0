// Vehicle types and their motor/function layouts
//
// Axis motors are driven variably (usually the left/right tracks).
// Motor functions are on/off motors at a fixed power (bed, blade, lift...).
// Functions are non-motor logic outputs such as lights or a siren.

use serde::Serialize;

use crate::store::random_tag;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VehicleType {
    pub type_name: &'static str,
    pub friendly_name: &'static str,
    pub tag_name: &'static str,
    pub axis_motors: &'static [&'static str],
    pub motor_functions: &'static [&'static str],
    pub functions: &'static [&'static str],
}

impl VehicleType {
    /// Every motor name, axis motors first
    pub fn motor_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.axis_motors
            .iter()
            .chain(self.motor_functions.iter())
            .copied()
    }

    /// A fresh tag for a board of this type, e.g. `crane-Q7K2XD`
    pub fn default_tag(&self) -> String {
        format!("{}-{}", self.tag_name, random_tag())
    }
}

const fn vehicle(
    type_name: &'static str,
    friendly_name: &'static str,
    tag_name: &'static str,
    axis_motors: &'static [&'static str],
    motor_functions: &'static [&'static str],
    functions: &'static [&'static str],
) -> VehicleType {
    VehicleType {
        type_name,
        friendly_name,
        tag_name,
        axis_motors,
        motor_functions,
        functions,
    }
}

pub const VEHICLE_TYPES: &[VehicleType] = &[
    vehicle("loader", "Loader", "loader", &["left", "right"], &["bed"], &[]),
    vehicle("dozer", "Dozer", "dozer", &["left", "right"], &["blade"], &[]),
    vehicle(
        "transgripper",
        "Transgripper",
        "transgripper",
        &["left", "right"],
        &["lift", "grab"],
        &[],
    ),
    vehicle(
        "emergency_speedster",
        "Emergency Speedster",
        "speedster",
        &["left", "right"],
        &[],
        &["lights", "siren"],
    ),
    vehicle(
        "power_sweeper",
        "Power Sweeper",
        "sweeper",
        &["left", "right"],
        &["intake", "bed"],
        &[],
    ),
    vehicle("skip_track", "Skip Track", "skiptrack", &["left", "right"], &["lift"], &[]),
    vehicle("elevator", "Elevator", "elevator", &[], &["updown"], &[]),
    vehicle("monorail", "Monorail", "monorail", &["travel"], &["bed"], &[]),
    vehicle(
        "tower_crane",
        "Tower Crane",
        "crane",
        &["rotate", "winch"],
        &[],
        &["trolley", "holding"],
    ),
    vehicle("forklift", "Forklift", "forklift", &["left", "right"], &["lift"], &[]),
    vehicle("fire_rescue", "Fire Rescue", "rescue", &["left", "right"], &["claw"], &[]),
    vehicle(
        "police_defender",
        "Police Defender",
        "defender",
        &["left", "right"],
        &["raise"],
        &[],
    ),
    vehicle("dump_truck", "Dump Truck", "dumptruck", &["left", "right"], &["bed"], &[]),
    vehicle("x2_dual_drive", "X2 Dual Drive", "x2", &["winch", "winch2"], &[], &[]),
];

/// Find a vehicle type by name, falling back to the first entry
///
/// A missing or unknown type must never stop the vehicle from booting.
pub fn vehicle_type(type_name: Option<&str>) -> &'static VehicleType {
    type_name
        .and_then(|name| VEHICLE_TYPES.iter().find(|v| v.type_name == name))
        .unwrap_or(&VEHICLE_TYPES[0])
}
