//! Tick-writer service entry point

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use services_common::config::WriterConfig;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tick_writer=info,services_common=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = WriterConfig::from_env()?;
    info!(
        batch_size = config.batch_size,
        batch_timeout_secs = config.batch_timeout.as_secs(),
        "starting tick writer"
    );
    tick_writer::run(config).await
}
