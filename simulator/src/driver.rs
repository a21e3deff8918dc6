use crate::config::Config;
use crate::publisher::{run_device, DeviceReport};
use crate::transport::Connector;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Start one publisher task per configured device and wait for all of them.
///
/// Returns one report per device in configuration order. A device that fails
/// never affects the others; the call only returns once every task has ended,
/// which in normal operation means `cancel` fired.
pub async fn run<C: Connector>(
    config: Arc<Config>,
    connector: Arc<C>,
    cancel: CancellationToken,
) -> Vec<DeviceReport> {
    let mut tasks = JoinSet::new();
    for identity in config.devices.iter().cloned() {
        tasks.spawn(run_device(
            identity,
            config.clone(),
            connector.clone(),
            cancel.clone(),
        ));
    }
    info!("Started {} device task(s)", tasks.len());

    let mut reports = Vec::with_capacity(config.devices.len());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(report) => reports.push(report),
            Err(e) => error!("Device task failed to complete: {}", e),
        }
    }

    reports.sort_by_key(|report| {
        config
            .devices
            .iter()
            .position(|d| d.device_id == report.device_id)
    });
    reports
}
