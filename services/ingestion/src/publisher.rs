//! Durable bus publisher
//!
//! Publishes wire-encoded ticks to the `ticks` queue with persistent
//! delivery. The queue and its dead-letter sibling are declared up front
//! so consumers can bind before the first tick. A lost broker connection
//! is retried forever with capped backoff; the bounded channel feeding
//! this task is what turns that stall into feed backpressure.

use anyhow::{Context, Result};
use lapin::{
    options::{BasicPublishOptions, QueueDeclareOptions},
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::pipeline::PipelineCounters;

pub const TICKS_QUEUE: &str = "ticks";
pub const TICKS_DLQ: &str = "ticks.dlq";

/// AMQP persistent delivery mode.
const DELIVERY_PERSISTENT: u8 = 2;

const BACKOFF_START: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Declare the tick queue and its dead-letter sibling on a channel.
pub async fn declare_queues(channel: &Channel) -> Result<()> {
    let options = QueueDeclareOptions {
        durable: true,
        ..QueueDeclareOptions::default()
    };
    channel
        .queue_declare(TICKS_QUEUE, options, FieldTable::default())
        .await
        .context("declaring ticks queue")?;
    channel
        .queue_declare(TICKS_DLQ, options, FieldTable::default())
        .await
        .context("declaring ticks dead-letter queue")?;
    Ok(())
}

/// Publisher with lazy reconnect.
pub struct TickPublisher {
    url: String,
    channel: Option<Channel>,
}

impl TickPublisher {
    pub fn new(url: String) -> Self {
        Self { url, channel: None }
    }

    async fn channel(&mut self) -> Result<&Channel> {
        let stale = !matches!(&self.channel, Some(ch) if ch.status().connected());
        if stale {
            let connection = Connection::connect(&self.url, ConnectionProperties::default())
                .await
                .context("connecting to message bus")?;
            let channel = connection
                .create_channel()
                .await
                .context("opening bus channel")?;
            declare_queues(&channel).await?;
            info!(queue = TICKS_QUEUE, "bus publisher connected");
            self.channel = Some(channel);
        }
        // The branch above just filled it.
        self.channel.as_ref().context("bus channel unavailable")
    }

    async fn try_publish(&mut self, payload: &[u8]) -> Result<()> {
        let channel = self.channel().await?;
        channel
            .basic_publish(
                "",
                TICKS_QUEUE,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default()
                    .with_delivery_mode(DELIVERY_PERSISTENT)
                    .with_content_type("application/octet-stream".into()),
            )
            .await
            .context("publishing tick")?
            .await
            .context("awaiting publish confirm")?;
        Ok(())
    }

    /// Publish one payload, retrying with capped backoff until the bus
    /// accepts it. Callers bound the stall through their channel.
    pub async fn publish(&mut self, payload: &[u8], counters: &Arc<PipelineCounters>) {
        let mut backoff = BACKOFF_START;
        loop {
            match self.try_publish(payload).await {
                Ok(()) => {
                    counters.record_published();
                    return;
                }
                Err(e) => {
                    self.channel = None;
                    counters.record_publish_retry();
                    warn!(error = %e, retry_in_secs = backoff.as_secs(), "bus publish failed");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(BACKOFF_CAP);
                }
            }
        }
    }
}
