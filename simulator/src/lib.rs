pub mod config;
pub mod driver;
pub mod errors;
pub mod iothub;
pub mod publisher;
pub mod telemetry;
pub mod transport;

pub use config::{Config, DeviceIdentity, FailurePolicy, HubSettings};
pub use errors::{Error, Result};
pub use publisher::{DeviceReport, DeviceState};
pub use telemetry::Telemetry;
pub use transport::{Connector, Link, Message};
