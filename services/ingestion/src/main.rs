//! Ingestion service entry point

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use services_common::config::IngestionConfig;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ingestion=info,services_common=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = IngestionConfig::from_env()?;
    info!(source = config.data_source.as_str(), "starting ingestion service");
    ingestion::run(config).await
}
