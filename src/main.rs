use std::sync::Arc;

use anyhow::{Context, Result};
use mitmrelay::{config::Config, listener, telemetry, ListenerContext};
use tokio::signal;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Install ring as the default CryptoProvider before any TLS usage.
    // Required because both ring and aws-lc-rs features are enabled via rustls defaults.
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");

    telemetry::init_telemetry();

    let config = Config::from_env().context("Failed to load configuration")?;
    let ctx = Arc::new(ListenerContext::new(config).context("Failed to initialize listener context")?);

    info!("mitmrelayd starting");

    tokio::select! {
        result = listener::run(ctx) => {
            result.context("Listener loop exited")?;
        }
        _ = signal::ctrl_c() => {
            info!("received ctrl-c, shutting down");
        }
    }

    Ok(())
}
