//! Signal-generator service entry point

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use services_common::config::SignalConfig;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "signal_generator=info,services_common=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = SignalConfig::from_env()?;
    info!(symbol = %config.symbol, "starting signal generator");
    signal_generator::run(config).await
}
