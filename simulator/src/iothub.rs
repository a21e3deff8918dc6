//! Azure IoT Hub device transport over MQTT 3.1.1.
//!
//! Devices authenticate with a SAS token derived from the shared access key
//! in their connection string and publish device-to-cloud messages on
//! `devices/{id}/messages/events/`, with the message properties carried in
//! the topic's property bag.

use crate::config::{DeviceIdentity, HubSettings};
use crate::errors::{Error, Result};
use crate::transport::{Connector, Link, Message};
use base64::prelude::*;
use chrono::Utc;
use hmac::{Hmac, Mac};
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, QoS, Transport,
};
use sha2::Sha256;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, warn};
use url::form_urlencoded::byte_serialize;

const MQTT_TLS_PORT: u16 = 8883;
const API_VERSION: &str = "2021-04-12";
const DISCONNECT_GRACE: Duration = Duration::from_secs(5);

type HmacSha256 = Hmac<Sha256>;

/// Parsed `HostName=...;DeviceId=...;SharedAccessKey=...` connection string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionString {
    pub host_name: String,
    pub device_id: String,
    pub shared_access_key: String,
}

impl FromStr for ConnectionString {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut host_name = None;
        let mut device_id = None;
        let mut shared_access_key = None;

        for part in s.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            // Segments are never echoed back, one of them may be the key
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| Error::InvalidCredential("segment without '='".to_string()))?;
            match key {
                "HostName" => host_name = Some(value.to_string()),
                "DeviceId" => device_id = Some(value.to_string()),
                "SharedAccessKey" => shared_access_key = Some(value.to_string()),
                "x509" if value.eq_ignore_ascii_case("true") => {
                    return Err(Error::InvalidCredential(
                        "X.509 authentication is not supported".to_string(),
                    ));
                }
                // GatewayHostName, ModuleId and friends don't affect publishing
                _ => {}
            }
        }

        let require = |value: Option<String>, name: &str| {
            value
                .filter(|v| !v.is_empty())
                .ok_or_else(|| Error::InvalidCredential(format!("missing {}", name)))
        };

        Ok(ConnectionString {
            host_name: require(host_name, "HostName")?,
            device_id: require(device_id, "DeviceId")?,
            shared_access_key: require(shared_access_key, "SharedAccessKey")?,
        })
    }
}

fn url_encode(value: &str) -> String {
    byte_serialize(value.as_bytes()).collect()
}

/// Build a device SAS token valid until `expiry` (unix seconds).
pub fn sas_token(
    host_name: &str,
    device_id: &str,
    shared_access_key: &str,
    expiry: i64,
) -> Result<String> {
    let resource_uri = url_encode(&format!("{}/devices/{}", host_name, device_id));
    let key = BASE64_STANDARD.decode(shared_access_key).map_err(|e| {
        Error::InvalidCredential(format!("SharedAccessKey is not valid base64: {}", e))
    })?;

    let mut mac = HmacSha256::new_from_slice(&key)
        .map_err(|e| Error::InvalidCredential(format!("unusable SharedAccessKey: {}", e)))?;
    mac.update(format!("{}\n{}", resource_uri, expiry).as_bytes());
    let signature = BASE64_STANDARD.encode(mac.finalize().into_bytes());

    Ok(format!(
        "SharedAccessSignature sr={}&sig={}&se={}",
        resource_uri,
        url_encode(&signature),
        expiry
    ))
}

/// Unix expiry for a token issued at `now`, saturating instead of wrapping.
pub fn token_expiry(now: i64, ttl: Duration) -> i64 {
    let ttl = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
    now.saturating_add(ttl)
}

/// Device-to-cloud topic with the message properties appended.
pub fn event_topic(device_id: &str, message: &Message) -> String {
    format!(
        "devices/{}/messages/events/$.ct={}&$.ce={}&$.mid={}",
        device_id,
        url_encode(message.content_type),
        url_encode(message.content_encoding),
        message.message_id
    )
}

pub struct IotHubConnector {
    settings: HubSettings,
}

impl IotHubConnector {
    pub fn new(settings: HubSettings) -> Self {
        Self { settings }
    }
}

impl Connector for IotHubConnector {
    type Link = IotHubLink;

    async fn connect(&self, identity: &DeviceIdentity, credential: &str) -> Result<IotHubLink> {
        let conn: ConnectionString = credential.parse()?;
        if conn.device_id != identity.device_id {
            warn!(
                "Connection string for '{}' is issued to device '{}'",
                identity.device_id, conn.device_id
            );
        }

        let expiry = token_expiry(Utc::now().timestamp(), self.settings.sas_token_ttl);
        let password = sas_token(
            &conn.host_name,
            &conn.device_id,
            &conn.shared_access_key,
            expiry,
        )?;
        let username = format!(
            "{}/{}/?api-version={}",
            conn.host_name, conn.device_id, API_VERSION
        );

        let mut mqtt_options = MqttOptions::new(&conn.device_id, &conn.host_name, MQTT_TLS_PORT);
        mqtt_options.set_keep_alive(self.settings.keep_alive);
        mqtt_options.set_clean_session(true);
        mqtt_options.set_credentials(username, password);
        mqtt_options.set_transport(Transport::tls_with_default_config());

        let (client, mut eventloop) = AsyncClient::new(mqtt_options, 10);

        let connect_timeout = self.settings.connect_timeout;
        timeout(connect_timeout, wait_for_connack(&mut eventloop))
            .await
            .map_err(|_| Error::Timeout("connect", connect_timeout))??;

        let (events_tx, events_rx) = mpsc::channel(16);
        let task = tokio::spawn(drive(eventloop, events_tx, conn.device_id.clone()));

        Ok(IotHubLink {
            client,
            events: events_rx,
            task,
            device_id: conn.device_id,
            send_timeout: self.settings.send_timeout,
        })
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<()> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return match ack.code {
                    ConnectReturnCode::Success => Ok(()),
                    code => Err(Error::Refused(format!("{:?}", code))),
                };
            }
            Ok(_) => {}
            Err(ConnectionError::ConnectionRefused(code)) => {
                return Err(Error::Refused(format!("{:?}", code)));
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[derive(Debug)]
enum LinkEvent {
    Published(u16),
    Acked(u16),
    Failed(ConnectionError),
}

/// Polls the MQTT event loop for the lifetime of a link, forwarding packet
/// ids of outgoing publishes, PUBACKs and the first fatal error.
async fn drive(mut eventloop: EventLoop, events: mpsc::Sender<LinkEvent>, device_id: String) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                debug!("[{}] PUBACK for packet {}", device_id, ack.pkid);
                if events.send(LinkEvent::Acked(ack.pkid)).await.is_err() {
                    break;
                }
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                if events.send(LinkEvent::Published(pkid)).await.is_err() {
                    break;
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("[{}] DISCONNECT flushed", device_id);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                error!("[{}] MQTT eventloop error: {}", device_id, e);
                let _ = events.send(LinkEvent::Failed(e)).await;
                break;
            }
        }
    }
}

pub struct IotHubLink {
    client: AsyncClient,
    events: mpsc::Receiver<LinkEvent>,
    task: JoinHandle<()>,
    device_id: String,
    send_timeout: Duration,
}

impl Link for IotHubLink {
    async fn send(&mut self, message: &Message) -> Result<()> {
        let topic = event_topic(&self.device_id, message);
        self.client
            .publish(
                topic,
                QoS::AtLeastOnce,
                false,
                message.payload.as_bytes().to_vec(),
            )
            .await?;

        wait_for_puback(&mut self.events, self.send_timeout, &self.device_id).await
    }

    async fn disconnect(mut self) {
        if let Err(e) = self.client.disconnect().await {
            debug!("[{}] disconnect request not queued: {}", self.device_id, e);
        }
        if timeout(DISCONNECT_GRACE, &mut self.task).await.is_err() {
            warn!(
                "[{}] eventloop did not stop within {:?}, aborting",
                self.device_id, DISCONNECT_GRACE
            );
        }
    }
}

/// Wait for the PUBACK of the publish that was just queued. Its packet id is
/// learned from the outgoing event; acks for any other id are stale.
async fn wait_for_puback(
    events: &mut mpsc::Receiver<LinkEvent>,
    send_timeout: Duration,
    device_id: &str,
) -> Result<()> {
    let acked = async {
        let mut pkid = None;
        loop {
            match events.recv().await {
                Some(LinkEvent::Published(id)) => pkid = Some(id),
                Some(LinkEvent::Acked(id)) if pkid == Some(id) => return Ok(()),
                Some(LinkEvent::Acked(id)) => {
                    debug!("[{}] ignoring stale PUBACK for packet {}", device_id, id);
                }
                Some(LinkEvent::Failed(e)) => return Err(e.into()),
                None => return Err(Error::LinkClosed),
            }
        }
    };

    timeout(send_timeout, acked)
        .await
        .map_err(|_| Error::Timeout("send", send_timeout))?
}

impl Drop for IotHubLink {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    const KEY: &str = "bm90LWEtcmVhbC1kZXZpY2Uta2V5LTAxMjM0NTY3ODk=";

    #[test]
    fn test_parse_connection_string() {
        let conn: ConnectionString = format!(
            "HostName=skateway-hub.azure-devices.net;DeviceId=nac-device;SharedAccessKey={}",
            KEY
        )
        .parse()
        .unwrap();

        assert_eq!(conn.host_name, "skateway-hub.azure-devices.net");
        assert_eq!(conn.device_id, "nac-device");
        // Trailing '=' padding must survive the key=value split
        assert_eq!(conn.shared_access_key, KEY);
    }

    #[test]
    fn test_parse_ignores_unknown_segments() {
        let conn: ConnectionString =
            "HostName=h.azure-devices.net; DeviceId=d ;GatewayHostName=edge;SharedAccessKey=a2V5;"
                .parse()
                .unwrap();

        assert_eq!(conn.device_id, "d");
        assert_eq!(conn.shared_access_key, "a2V5");
    }

    #[test]
    fn test_parse_rejects_incomplete() {
        let err = "HostName=h.azure-devices.net;DeviceId=d"
            .parse::<ConnectionString>()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidCredential(ref m) if m.contains("SharedAccessKey")));

        assert!("garbage".parse::<ConnectionString>().is_err());
        assert!("HostName=h;DeviceId=d;x509=true"
            .parse::<ConnectionString>()
            .is_err());
    }

    #[test]
    fn test_sas_token() {
        let token = sas_token(
            "skateway-hub.azure-devices.net",
            "nac-device",
            KEY,
            1_767_225_600,
        )
        .unwrap();

        assert_eq!(
            token,
            "SharedAccessSignature sr=skateway-hub.azure-devices.net%2Fdevices%2Fnac-device\
             &sig=dsVvfFfOQNzUuzck%2BbrKOcFi%2BUIbGFP0xEhEc8R1wlU%3D&se=1767225600"
        );
    }

    #[test]
    fn test_sas_token_rejects_bad_key() {
        let err = sas_token("h", "d", "not base64!", 0).unwrap_err();
        assert!(matches!(err, Error::InvalidCredential(_)));
    }

    #[test]
    fn test_token_expiry_saturates() {
        assert_eq!(token_expiry(1_000, Duration::from_secs(60)), 1_060);
        assert_eq!(token_expiry(1_000, Duration::from_secs(u64::MAX)), i64::MAX);
        assert_eq!(
            token_expiry(1_700_000_000, Duration::from_secs(i64::MAX as u64)),
            i64::MAX
        );
    }

    #[tokio::test]
    async fn test_puback_for_own_packet_completes_send() {
        let (tx, mut rx) = mpsc::channel(16);
        tx.send(LinkEvent::Published(7)).await.unwrap();
        tx.send(LinkEvent::Acked(7)).await.unwrap();

        let acked = wait_for_puback(&mut rx, Duration::from_secs(5), "nac-device").await;
        assert!(acked.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_puback_is_not_credited() {
        let (tx, mut rx) = mpsc::channel(16);
        // Late ack for an earlier publish arrives after ours went out
        tx.send(LinkEvent::Acked(3)).await.unwrap();
        tx.send(LinkEvent::Published(4)).await.unwrap();
        tx.send(LinkEvent::Acked(3)).await.unwrap();

        let err = wait_for_puback(&mut rx, Duration::from_secs(5), "nac-device")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout("send", d) if d == Duration::from_secs(5)));
        drop(tx);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_puback_times_out() {
        let (tx, mut rx) = mpsc::channel(16);
        tx.send(LinkEvent::Published(1)).await.unwrap();

        let err = wait_for_puback(&mut rx, Duration::from_secs(30), "nac-device")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout("send", _)));
        assert!(err.is_retryable());
        drop(tx);
    }

    #[tokio::test]
    async fn test_closed_eventloop_maps_to_link_closed() {
        let (tx, mut rx) = mpsc::channel::<LinkEvent>(16);
        drop(tx);

        let err = wait_for_puback(&mut rx, Duration::from_secs(5), "nac-device")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LinkClosed));
    }

    #[tokio::test]
    async fn test_eventloop_failure_fails_send() {
        let (tx, mut rx) = mpsc::channel(16);
        tx.send(LinkEvent::Published(2)).await.unwrap();
        tx.send(LinkEvent::Failed(ConnectionError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset by peer",
        ))))
        .await
        .unwrap();

        let err = wait_for_puback(&mut rx, Duration::from_secs(5), "nac-device")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
    }

    #[test]
    fn test_event_topic_property_bag() {
        let message = Message {
            message_id: Uuid::nil(),
            payload: "{}".to_string(),
            content_type: "application/json",
            content_encoding: "utf-8",
        };

        assert_eq!(
            event_topic("dows-lake-device", &message),
            "devices/dows-lake-device/messages/events/\
             $.ct=application%2Fjson&$.ce=utf-8&$.mid=00000000-0000-0000-0000-000000000000"
        );
    }
}
