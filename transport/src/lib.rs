//! Broker session adapter shared by the device simulator and the bridge.

mod adapter;
mod errors;
pub mod payload;
mod subscriptions;
pub mod topics;

#[cfg(any(test, feature = "test-util"))]
pub mod memory;

pub use adapter::{Connectivity, InboundMessage, MqttTransport, Transport, TransportConfig};
pub use errors::{Error, Result};
pub use rumqttc::QoS;
