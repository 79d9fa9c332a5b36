//! Depth snapshot subscriber
//!
//! Listens on `depth_snapshots:<symbol>` and pushes every decoded
//! snapshot into the rolling buffer. A dropped pub/sub connection is
//! re-subscribed with a short delay; malformed payloads are logged and
//! skipped.

use anyhow::Result;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use services_common::DepthSnapshotMsg;

use crate::buffer::RollingBuffer;

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(5);

/// Run the subscriber until shutdown.
pub async fn run(
    redis_url: String,
    symbol: String,
    buffer: Arc<RollingBuffer>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let channel = format!("depth_snapshots:{symbol}");
    let client = redis::Client::open(redis_url.as_str())?;

    loop {
        if *shutdown.borrow() {
            return Ok(());
        }

        let mut pubsub = match client.get_async_pubsub().await {
            Ok(pubsub) => pubsub,
            Err(e) => {
                warn!(error = %e, "pub/sub connect failed");
                tokio::select! {
                    _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => continue,
                    _ = shutdown.changed() => return Ok(()),
                }
            }
        };
        if let Err(e) = pubsub.subscribe(&channel).await {
            warn!(channel = %channel, error = %e, "subscribe failed");
            tokio::time::sleep(RESUBSCRIBE_DELAY).await;
            continue;
        }
        info!(channel = %channel, "subscribed to depth snapshots");

        let mut stream = pubsub.on_message();
        loop {
            tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                message = stream.next() => {
                    let Some(message) = message else {
                        warn!("pub/sub stream ended, resubscribing");
                        break;
                    };
                    let payload: String = match message.get_payload() {
                        Ok(payload) => payload,
                        Err(e) => {
                            warn!(error = %e, "unreadable pub/sub payload");
                            continue;
                        }
                    };
                    match serde_json::from_str::<DepthSnapshotMsg>(&payload) {
                        Ok(snapshot) => buffer.push(snapshot),
                        Err(e) => warn!(error = %e, "malformed depth snapshot"),
                    }
                }
            }
        }
        tokio::time::sleep(RESUBSCRIBE_DELAY).await;
    }
}
