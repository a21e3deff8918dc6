use skateway_simulator::driver;
use skateway_simulator::iothub::IotHubConnector;
use skateway_simulator::Config;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env is fine, the variables may come from the environment
    let dotenv = dotenvy::dotenv();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Ok(path) = dotenv {
        info!("Loaded environment from {}", path.display());
    }

    let config = Arc::new(Config::from_env());

    info!("Starting Skateway sensor simulator");
    info!(
        "Devices: {}, interval: {:?}, failure policy: {:?}",
        config.devices.len(),
        config.send_interval,
        config.failure_policy
    );

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received shutdown signal");
                shutdown.cancel();
            }
            Err(e) => error!("Unable to listen for shutdown signal: {}", e),
        }
    });

    let connector = Arc::new(IotHubConnector::new(config.hub.clone()));
    let reports = driver::run(config, connector, cancel).await;

    for report in &reports {
        match &report.result {
            Ok(()) => info!(
                "Device '{}' stopped after {} message(s)",
                report.device_id, report.messages_sent
            ),
            Err(e) => warn!(
                "Device '{}' ended after {} message(s): {}",
                report.device_id, report.messages_sent, e
            ),
        }
    }

    info!("Sensor simulator stopped");
    Ok(())
}
