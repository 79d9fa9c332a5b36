//! Depth-collector service entry point

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use services_common::config::DepthConfig;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "depth_collector=info,services_common=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = DepthConfig::from_env()?;
    info!(
        security_id = %config.security_id,
        symbol = %config.symbol,
        "starting depth collector"
    );
    depth_collector::run(config).await
}
