use std::collections::HashMap;
use std::env;
use std::ops::RangeInclusive;
use std::str::FromStr;
use std::time::Duration;

/// Compiled-in device set: (device id, location, credential variable).
pub const DEVICES: [(&str, &str, &str); 3] = [
    ("dows-lake-device", "Dows Lake", "DEVICE_DOWS_LAKE"),
    ("fifth-avenue-device", "Fifth Avenue", "DEVICE_FIFTH_AVENUE"),
    ("nac-device", "NAC", "DEVICE_NAC"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub location: String,
    pub credential_key: String,
}

impl DeviceIdentity {
    pub fn new(device_id: &str, location: &str, credential_key: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            location: location.to_string(),
            credential_key: credential_key.to_string(),
        }
    }
}

/// What a device does after its connection or a send fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// End the device task on the first transport error.
    Stop,
    /// Reconnect with exponential backoff, giving up after `max_attempts`
    /// consecutive failures.
    Reconnect {
        max_attempts: u32,
        initial_backoff: Duration,
        max_backoff: Duration,
    },
}

/// Connection parameters for the IoT Hub MQTT transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubSettings {
    pub connect_timeout: Duration,
    pub send_timeout: Duration,
    pub keep_alive: Duration,
    pub sas_token_ttl: Duration,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            send_timeout: Duration::from_secs(30),
            keep_alive: Duration::from_secs(60),
            sas_token_ttl: Duration::from_secs(86_400),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub devices: Vec<DeviceIdentity>,
    pub send_interval: Duration,
    pub failure_policy: FailurePolicy,
    pub hub: HubSettings,
    credentials: HashMap<String, String>,
}

impl Config {
    pub fn new(devices: Vec<DeviceIdentity>) -> Self {
        Self {
            devices,
            send_interval: Duration::from_secs(10),
            failure_policy: FailurePolicy::Stop,
            hub: HubSettings::default(),
            credentials: HashMap::new(),
        }
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from any key/value source. Malformed or
    /// out-of-range numbers fall back to their defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let devices = DEVICES
            .iter()
            .map(|(id, location, key)| DeviceIdentity::new(id, location, key))
            .collect();
        let mut config = Config::new(devices);

        let credential_keys: Vec<String> = config
            .devices
            .iter()
            .map(|d| d.credential_key.clone())
            .collect();
        for key in credential_keys {
            if let Some(value) = lookup(&key) {
                config = config.with_credential(&key, &value);
            }
        }

        config.send_interval = parse_secs(&lookup, "SEND_INTERVAL_SECS", 10, 1..=86_400);

        config.failure_policy = match lookup("FAILURE_POLICY").as_deref().map(str::trim) {
            Some(policy) if policy.eq_ignore_ascii_case("reconnect") => FailurePolicy::Reconnect {
                max_attempts: parse_or(&lookup, "RECONNECT_MAX_ATTEMPTS", 5),
                initial_backoff: Duration::from_millis(parse_or(
                    &lookup,
                    "RECONNECT_BACKOFF_MS",
                    1_000,
                )),
                max_backoff: Duration::from_millis(parse_or(
                    &lookup,
                    "RECONNECT_MAX_BACKOFF_MS",
                    30_000,
                )),
            },
            _ => FailurePolicy::Stop,
        };

        config.hub = HubSettings {
            connect_timeout: parse_secs(&lookup, "CONNECT_TIMEOUT_SECS", 30, 1..=3_600),
            send_timeout: parse_secs(&lookup, "SEND_TIMEOUT_SECS", 30, 1..=3_600),
            // MQTT carries keep-alive as a u16
            keep_alive: parse_secs(&lookup, "MQTT_KEEP_ALIVE_SECS", 60, 5..=65_535),
            sas_token_ttl: parse_secs(&lookup, "SAS_TOKEN_TTL_SECS", 86_400, 60..=31_536_000),
        };

        config
    }

    /// Register a credential. Blank values are ignored so they read as missing.
    pub fn with_credential(mut self, key: &str, value: &str) -> Self {
        let value = value.trim();
        if !value.is_empty() {
            self.credentials.insert(key.to_string(), value.to_string());
        }
        self
    }

    pub fn credential(&self, identity: &DeviceIdentity) -> Option<&str> {
        self.credentials
            .get(&identity.credential_key)
            .map(String::as_str)
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    lookup(key)
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}

/// Whole seconds; values outside `range` count as malformed.
fn parse_secs<F>(lookup: &F, key: &str, default: u64, range: RangeInclusive<u64>) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    let secs = parse_or(lookup, key, default);
    Duration::from_secs(if range.contains(&secs) { secs } else { default })
}
