//! Bridge between wired M-Bus meters and MQTT
//!
//! Meters are polled on a fixed interval, their data records are mapped to
//! named fields by templates and published as plain values, optionally
//! announced to Home Assistant first.

pub mod bridge;
pub mod config;
pub mod mbus;
pub mod mqtt;
pub mod templates;

// Re-export common types for easier access
pub use bridge::{BridgeContext, PollScheduler};
pub use config::Config;
pub use mbus::{MeterBus, SerialBus};
pub use mqtt::MqttManager;
pub use templates::TemplateRegistry;
