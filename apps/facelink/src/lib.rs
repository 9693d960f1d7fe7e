pub mod audio;
pub mod config;
pub mod protocol;
pub mod session;
pub mod signaling;
pub mod telemetry;
pub mod transport;
