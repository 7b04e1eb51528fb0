// Timeouts, ports, pin table, duty scale
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

// PWM output scale (duty_u16) and carrier frequency
pub const MAX_DUTY: u16 = 65535;
pub const PWM_FREQ_HZ: u32 = 2000;

// Duty floor used for a motor with no persisted minimum
pub const DEFAULT_MIN_POWER: u16 = 40000;

// Motor number -> (forward pin, reverse pin)
// D0/D1, D2/D3, D4/D5, D6/D7 on the board header
pub const MOTOR_PIN_MAP: [(u8, (u8, u8)); 4] = [(1, (1, 2)), (2, (3, 4)), (3, (5, 6)), (4, (43, 44))];

// Logic functions (lights, siren...) get pins FUNCTION_PIN_BASE + index
pub const FUNCTION_PIN_BASE: u8 = 10;

// Motor-driver enable line (D8)
pub const DRIVER_ENABLE_PIN: u8 = 7;

// A motor with no update for this long is stopped by the watchdog
pub const MOTOR_TIMEOUT: Duration = Duration::from_millis(200);

// Upper bound on the watchdog sweep period
pub const WATCHDOG_MAX_INTERVAL: Duration = Duration::from_millis(100);

// How often the control task drains queued datagram commands
pub const QUEUE_DRAIN_INTERVAL: Duration = Duration::from_millis(10);

// Auto-sleep after this long without a command
pub const IDLE_SLEEP_TIMEOUT: Duration = Duration::from_secs(300);
pub const POWER_CHECK_INTERVAL: Duration = Duration::from_secs(1);

// Datagram channel
pub const UDP_PORT: u16 = 9999;
pub const UDP_RECV_BUF: usize = 1024;
pub const UDP_READ_TIMEOUT: Duration = Duration::from_millis(100);

// Per-source token bucket: RATE tokens/sec up to CAPACITY
pub const RATE: f64 = 50.0;
pub const CAPACITY: f64 = 100.0;

pub const COMMAND_QUEUE_CAPACITY: usize = 100;

// Largest socket frame payload we are willing to buffer
pub const MAX_FRAME_PAYLOAD: u64 = 64 * 1024;

pub const DEFAULT_CONFIG_PATH: &str = "variables/config.json";

/// Look up the pin pair for a motor number
pub fn motor_pins(motor_num: u8) -> Option<(u8, u8)> {
    MOTOR_PIN_MAP
        .iter()
        .find(|(num, _)| *num == motor_num)
        .map(|(_, pins)| *pins)
}

/// Command line for the vehicle runtime binary
#[derive(Debug, Clone, Parser)]
#[command(
    name = "rok-vehicle",
    about = "Motor control runtime for a Rok vehicle (simulated board)",
    after_help = "Motor and function outputs drive an in-memory simulated board; no GPIO or PWM hardware is touched."
)]
pub struct Args {
    /// Persisted vehicle configuration (JSON)
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Address for the HTTP/WebSocket listener
    #[arg(long, default_value = "0.0.0.0:80")]
    pub listen: SocketAddr,

    /// UDP port for datagram commands
    #[arg(long, default_value_t = UDP_PORT)]
    pub udp_port: u16,

    /// Motor safety timeout in milliseconds
    #[arg(long, default_value_t = MOTOR_TIMEOUT.as_millis() as u64)]
    pub timeout_ms: u64,

    /// Disable the datagram command channel
    #[arg(long)]
    pub no_udp: bool,
}

impl Args {
    pub fn motor_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_motor_pins_lookup() {
        assert_eq!(motor_pins(1), Some((1, 2)));
        assert_eq!(motor_pins(4), Some((43, 44)));
        assert_eq!(motor_pins(0), None);
        assert_eq!(motor_pins(99), None);
    }

    #[test]
    fn test_help_mentions_simulated_board() {
        use clap::CommandFactory;
        let help = Args::command().render_help().to_string();
        assert!(help.contains("simulated board"), "{}", help);
        let long = Args::command().render_long_help().to_string();
        assert!(long.contains("no GPIO or PWM hardware"), "{}", long);
    }

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["rok-vehicle"]);
        assert_eq!(args.udp_port, 9999);
        assert_eq!(args.motor_timeout(), MOTOR_TIMEOUT);
        assert!(!args.no_udp);
    }
}
