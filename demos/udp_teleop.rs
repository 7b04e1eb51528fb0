// Keyboard teleop over the datagram channel: WASD drive, B bed, R/F speed, Q quit
use clap::Parser;
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use rok_vehicle_runtime::messages::{Command, Direction};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tracing::info;

const POWERS: [f64; 3] = [40.0, 70.0, 100.0]; // percent
const INPUT_TIMEOUT_MS: u64 = 100; // Release the motors after this much time with no input

#[derive(Debug, Parser)]
#[command(about = "Drive a vehicle with the keyboard over UDP")]
struct Args {
    /// Vehicle datagram address
    #[arg(default_value = "192.168.4.1:9999")]
    target: SocketAddr,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let args = Args::parse();

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(args.target).await?;
    info!("Sending to {}", args.target);
    info!("Controls: WASD=drive, B=bed, R/F=speed, Q=quit");
    info!("Speed: LOW");

    enable_raw_mode()?;
    let result = run_teleop(&socket).await;
    disable_raw_mode()?;

    // Leave the vehicle stopped however we exit
    socket.send(Command::StopAll.to_json()?.as_bytes()).await?;
    result
}

fn set(name: &str, value: f64) -> Command {
    Command::Set {
        name: name.to_string(),
        dir: if value >= 0.0 { Direction::Fwd } else { Direction::Rev },
        power: value.abs(),
    }
}

async fn run_teleop(socket: &UdpSocket) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut speed_idx: usize = 0;

    // Signed track powers, -100..100
    let mut left = 0.0;
    let mut right = 0.0;
    let mut bed = false;
    let mut last_input = Instant::now();

    loop {
        // Poll for key with 20ms timeout (50Hz effective rate)
        if event::poll(Duration::from_millis(20))? {
            if let Event::Key(KeyEvent { code, kind, .. }) = event::read()? {
                let pressed = kind == KeyEventKind::Press || kind == KeyEventKind::Repeat;
                let power = POWERS[speed_idx];

                match code {
                    KeyCode::Char('w') if pressed => {
                        (left, right) = (power, power);
                        last_input = Instant::now();
                    }
                    KeyCode::Char('s') if pressed => {
                        (left, right) = (-power, -power);
                        last_input = Instant::now();
                    }
                    // Spin in place
                    KeyCode::Char('a') if pressed => {
                        (left, right) = (-power, power);
                        last_input = Instant::now();
                    }
                    KeyCode::Char('d') if pressed => {
                        (left, right) = (power, -power);
                        last_input = Instant::now();
                    }
                    KeyCode::Char('b') if pressed => {
                        bed = true;
                        last_input = Instant::now();
                    }

                    KeyCode::Char('r') if pressed => {
                        speed_idx = (speed_idx + 1).min(POWERS.len() - 1);
                        print_speed(speed_idx);
                    }
                    KeyCode::Char('f') if pressed => {
                        speed_idx = speed_idx.saturating_sub(1);
                        print_speed(speed_idx);
                    }

                    KeyCode::Char('q') | KeyCode::Esc if pressed => break,

                    _ => {}
                }
            }
        }

        if last_input.elapsed() > Duration::from_millis(INPUT_TIMEOUT_MS) {
            left = 0.0;
            right = 0.0;
            bed = false;
        }

        // Always send at ~50Hz so the vehicle's watchdog stays fed
        let batch = [
            set("left", left),
            set("right", right),
            set("bed", if bed { 100.0 } else { 0.0 }),
        ];
        socket.send(serde_json::to_string(&batch)?.as_bytes()).await?;
    }

    Ok(())
}

fn print_speed(idx: usize) {
    let label = ["LOW", "MED", "HIGH"][idx];
    info!("Speed: {}", label);
}
