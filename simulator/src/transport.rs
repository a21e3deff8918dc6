use crate::config::DeviceIdentity;
use crate::errors::Result;
use crate::telemetry::Telemetry;
use std::future::Future;
use uuid::Uuid;

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_ENCODING_UTF8: &str = "utf-8";

/// A serialized reading plus the metadata the hub needs to route it.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub message_id: Uuid,
    pub payload: String,
    pub content_type: &'static str,
    pub content_encoding: &'static str,
}

impl Message {
    pub fn json(telemetry: &Telemetry) -> Result<Self> {
        Ok(Self {
            message_id: Uuid::new_v4(),
            payload: serde_json::to_string(telemetry)?,
            content_type: CONTENT_TYPE_JSON,
            content_encoding: CONTENT_ENCODING_UTF8,
        })
    }
}

/// Opens links to the ingestion endpoint.
pub trait Connector: Send + Sync + 'static {
    type Link: Link;

    fn connect(
        &self,
        identity: &DeviceIdentity,
        credential: &str,
    ) -> impl Future<Output = Result<Self::Link>> + Send;
}

/// An established device connection. `send` resolves once the endpoint has
/// accepted the message, so callers never have two sends in flight.
pub trait Link: Send + 'static {
    fn send(&mut self, message: &Message) -> impl Future<Output = Result<()>> + Send;

    fn disconnect(self) -> impl Future<Output = ()> + Send;
}
