use crate::config::{Config, DeviceIdentity, FailurePolicy};
use crate::errors::{Error, Result};
use crate::telemetry::Telemetry;
use crate::transport::{Connector, Link, Message};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Disconnected,
    Connecting,
    Streaming,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceState::Disconnected => "disconnected",
            DeviceState::Connecting => "connecting",
            DeviceState::Streaming => "streaming",
        };
        f.write_str(name)
    }
}

/// How a device task ended.
#[derive(Debug)]
pub struct DeviceReport {
    pub device_id: String,
    pub messages_sent: u64,
    /// `Ok` when the task stopped because it was cancelled.
    pub result: Result<()>,
}

struct Device<'a> {
    identity: &'a DeviceIdentity,
    state: DeviceState,
}

impl Device<'_> {
    fn transition(&mut self, next: DeviceState) {
        debug!("[{}] {} -> {}", self.identity.device_id, self.state, next);
        self.state = next;
    }
}

/// Run one device until `cancel` fires or its transport fails for good.
pub async fn run_device<C: Connector>(
    identity: DeviceIdentity,
    config: Arc<Config>,
    connector: Arc<C>,
    cancel: CancellationToken,
) -> DeviceReport {
    let mut messages_sent = 0;
    let result = publish(&identity, &config, &*connector, &cancel, &mut messages_sent).await;

    DeviceReport {
        device_id: identity.device_id,
        messages_sent,
        result,
    }
}

async fn publish<C: Connector>(
    identity: &DeviceIdentity,
    config: &Config,
    connector: &C,
    cancel: &CancellationToken,
    messages_sent: &mut u64,
) -> Result<()> {
    let Some(credential) = config.credential(identity) else {
        let err = Error::MissingCredential(identity.credential_key.clone());
        error!("[{}] {}", identity.device_id, err);
        return Err(err);
    };

    let mut device = Device {
        identity,
        state: DeviceState::Disconnected,
    };
    let mut rng = StdRng::from_entropy();
    let mut failures = 0u32;

    loop {
        info!(
            "Connecting device '{}' ({}) to IoT Hub...",
            identity.device_id, identity.location
        );
        device.transition(DeviceState::Connecting);

        let connected = tokio::select! {
            _ = cancel.cancelled() => {
                device.transition(DeviceState::Disconnected);
                return Ok(());
            }
            connected = connector.connect(identity, credential) => connected,
        };

        let sent_before = *messages_sent;
        let outcome = match connected {
            Ok(mut link) => {
                info!(
                    "Device '{}' connected. Sending telemetry every {:?}.",
                    identity.device_id, config.send_interval
                );
                device.transition(DeviceState::Streaming);

                let outcome = stream(
                    identity,
                    config.send_interval,
                    &mut link,
                    &mut rng,
                    cancel,
                    messages_sent,
                )
                .await;

                // Released on every exit path out of the stream
                link.disconnect().await;
                info!("Device '{}' disconnected.", identity.device_id);
                outcome
            }
            Err(e) => Err(e),
        };
        device.transition(DeviceState::Disconnected);

        let err = match outcome {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        error!("[{}] {}", identity.device_id, err);

        if *messages_sent > sent_before {
            failures = 0;
        }
        failures += 1;

        let backoff = match retry_delay(config.failure_policy, &err, failures) {
            Some(backoff) => backoff,
            None => return Err(err),
        };
        warn!(
            "[{}] Reconnecting in {:?} (attempt {})",
            identity.device_id, backoff, failures
        );

        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(backoff) => {}
        }
    }
}

/// Generate, send, wait; until cancelled or a send fails.
async fn stream<L: Link>(
    identity: &DeviceIdentity,
    send_interval: Duration,
    link: &mut L,
    rng: &mut StdRng,
    cancel: &CancellationToken,
    messages_sent: &mut u64,
) -> Result<()> {
    let mut ticker = interval(send_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Stopping device '{}'...", identity.device_id);
                return Ok(());
            }
            _ = ticker.tick() => {}
        }

        let telemetry = Telemetry::generate(rng, &identity.device_id, &identity.location);
        let message = Message::json(&telemetry)?;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Stopping device '{}' mid-send...", identity.device_id);
                return Ok(());
            }
            sent = link.send(&message) => sent?,
        }

        *messages_sent += 1;
        info!("[{}] Sent: {}", identity.device_id, message.payload);
    }
}

/// Backoff before the next connection attempt, or `None` to give up.
fn retry_delay(policy: FailurePolicy, err: &Error, failures: u32) -> Option<Duration> {
    match policy {
        FailurePolicy::Stop => None,
        FailurePolicy::Reconnect {
            max_attempts,
            initial_backoff,
            max_backoff,
        } => {
            if !err.is_retryable() || failures > max_attempts {
                return None;
            }
            let factor = 2u32.saturating_pow(failures.saturating_sub(1));
            Some(initial_backoff.saturating_mul(factor).min(max_backoff))
        }
    }
}
