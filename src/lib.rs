pub mod config;
pub mod messages;
pub mod motor;
pub mod power;
pub mod runtime;
pub mod store;
pub mod udp;
pub mod vehicle;
pub mod watchdog;
pub mod ws;
