pub mod config;
pub mod media;
pub mod negotiation;
pub mod protocol;
pub mod session;
pub mod signaling;
pub mod telemetry;
