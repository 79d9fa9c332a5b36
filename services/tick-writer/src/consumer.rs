//! Bus consumer with batch-and-flush semantics
//!
//! Messages accumulate until the batch fills or the timeout lapses, then
//! one UPSERT lands the whole batch and a multiple-ack releases it. A
//! database failure nacks the batch back onto the durable queue and backs
//! off exponentially; nothing is dropped. Payloads that repeatedly fail
//! to decode are poison, not data loss; after three attempts they move
//! to `ticks.dlq` so the batch keeps flowing.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::time::Duration;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{error, info, warn};

use services_common::config::WriterConfig;
use services_common::health::HealthReporter;
use services_common::shutdown::{shutdown_channel, spawn_signal_listener};
use services_common::types::decode_wire;
use services_common::EnrichedTick;

use crate::db;

pub const TICKS_QUEUE: &str = "ticks";
pub const TICKS_DLQ: &str = "ticks.dlq";

const PARSE_ATTEMPTS_HEADER: &str = "x-parse-attempts";
const MAX_PARSE_ATTEMPTS: i64 = 3;
const DELIVERY_PERSISTENT: u8 = 2;

const BUS_CONNECT_ATTEMPTS: u32 = 10;
const BUS_CONNECT_DELAY: Duration = Duration::from_secs(5);

const DB_BACKOFF_START: Duration = Duration::from_secs(1);
const DB_BACKOFF_CAP: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
struct WriterCounters {
    batches_written: u64,
    rows_written: u64,
    batch_failures: u64,
    decode_failures: u64,
    dead_lettered: u64,
    last_batch_size: usize,
    last_batch_time: Option<DateTime<Utc>>,
}

impl WriterCounters {
    fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "time": Utc::now(),
            "batches_written": self.batches_written,
            "rows_written": self.rows_written,
            "batch_failures": self.batch_failures,
            "decode_failures": self.decode_failures,
            "dead_lettered": self.dead_lettered,
            "last_batch_size": self.last_batch_size,
            "last_batch_time": self.last_batch_time,
        })
    }
}

enum SessionEnd {
    Shutdown,
    ConnectionLost,
}

/// Run the worker until shutdown.
pub async fn run(config: WriterConfig) -> Result<()> {
    let pool = db::connect(&config.database_url).await?;
    services_common::schema::run_migrations(&pool).await?;

    let reporter = match redis::Client::open(config.redis_url.as_str()) {
        Ok(client) => match client.get_connection_manager().await {
            Ok(conn) => Some(HealthReporter::new(conn, "tick-writer")),
            Err(e) => {
                warn!(error = %e, "redis unavailable, heartbeat disabled");
                None
            }
        },
        Err(e) => {
            warn!(error = %e, "redis url rejected, heartbeat disabled");
            None
        }
    };

    let (shutdown_tx, shutdown_rx) = shutdown_channel();
    spawn_signal_listener(shutdown_tx);

    let mut counters = WriterCounters::default();
    let mut connect_failures: u32 = 0;
    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        let channel = match open_channel(&config).await {
            Ok(channel) => {
                connect_failures = 0;
                channel
            }
            Err(e) => {
                connect_failures += 1;
                if connect_failures >= BUS_CONNECT_ATTEMPTS {
                    return Err(e.context("bus connection attempts exhausted"));
                }
                warn!(error = %e, attempt = connect_failures, "bus connect failed");
                sleep(BUS_CONNECT_DELAY).await;
                continue;
            }
        };

        match consume_session(
            &config,
            &pool,
            &channel,
            reporter.as_ref(),
            shutdown_rx.clone(),
            &mut counters,
        )
        .await
        {
            Ok(SessionEnd::Shutdown) => break,
            Ok(SessionEnd::ConnectionLost) => {
                warn!("bus session lost, reconnecting");
                sleep(BUS_CONNECT_DELAY).await;
            }
            Err(e) => {
                error!(error = %e, "consumer session failed");
                sleep(BUS_CONNECT_DELAY).await;
            }
        }
    }

    info!(health = %counters.snapshot(), "tick writer stopped");
    Ok(())
}

async fn open_channel(config: &WriterConfig) -> Result<Channel> {
    let connection = Connection::connect(&config.rabbitmq_url, ConnectionProperties::default())
        .await
        .context("connecting to message bus")?;
    let channel = connection
        .create_channel()
        .await
        .context("opening bus channel")?;
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
        .context("declaring dead-letter queue")?;
    channel
        .basic_qos(config.prefetch_count, BasicQosOptions::default())
        .await
        .context("setting prefetch")?;
    info!(
        queue = TICKS_QUEUE,
        prefetch = config.prefetch_count,
        "bus consumer connected"
    );
    Ok(channel)
}

async fn consume_session(
    config: &WriterConfig,
    pool: &sqlx::PgPool,
    channel: &Channel,
    reporter: Option<&HealthReporter>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
    counters: &mut WriterCounters,
) -> Result<SessionEnd> {
    let mut consumer = channel
        .basic_consume(
            TICKS_QUEUE,
            "tick-writer",
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .context("starting consumer")?;

    let mut batch: Vec<(Delivery, EnrichedTick)> = Vec::with_capacity(config.batch_size);
    let mut deadline = Instant::now() + config.batch_timeout;
    let mut db_backoff = DB_BACKOFF_START;

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                // Finish the batch in hand, ack it, and exit. No backoff
                // on the way out: an unreachable database means the nack
                // returns the batch to the durable queue.
                flush(pool, reporter, &mut batch, counters, &mut db_backoff, false).await;
                return Ok(SessionEnd::Shutdown);
            }
            _ = sleep_until(deadline) => {
                flush(pool, reporter, &mut batch, counters, &mut db_backoff, true).await;
                deadline = Instant::now() + config.batch_timeout;
            }
            delivery = consumer.next() => {
                let delivery = match delivery {
                    None => {
                        flush(pool, reporter, &mut batch, counters, &mut db_backoff, false).await;
                        return Ok(SessionEnd::ConnectionLost);
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "delivery error");
                        flush(pool, reporter, &mut batch, counters, &mut db_backoff, false).await;
                        return Ok(SessionEnd::ConnectionLost);
                    }
                    Some(Ok(delivery)) => delivery,
                };

                match decode_wire(&delivery.data) {
                    Ok(tick) => {
                        batch.push((delivery, tick));
                        if batch.len() >= config.batch_size {
                            flush(pool, reporter, &mut batch, counters, &mut db_backoff, true).await;
                            deadline = Instant::now() + config.batch_timeout;
                        }
                    }
                    Err(e) => {
                        counters.decode_failures += 1;
                        if let Err(dlq_err) =
                            quarantine(channel, delivery, counters).await
                        {
                            warn!(error = %dlq_err, decode_error = %e, "poison handling failed");
                        } else {
                            warn!(error = %e, "undecodable payload quarantined");
                        }
                    }
                }
            }
        }
    }
}

/// Write the batch and ack it; on failure nack it back and, unless the
/// session is ending, back off before the redelivery arrives.
async fn flush(
    pool: &sqlx::PgPool,
    reporter: Option<&HealthReporter>,
    batch: &mut Vec<(Delivery, EnrichedTick)>,
    counters: &mut WriterCounters,
    db_backoff: &mut Duration,
    allow_backoff: bool,
) {
    if batch.is_empty() {
        return;
    }
    let size = batch.len();
    let ticks: Vec<EnrichedTick> = batch.iter().map(|(_, tick)| tick.clone()).collect();

    match db::insert_ticks(pool, &ticks).await {
        Ok(rows) => {
            // One multiple-ack covers every delivery up to the newest tag.
            if let Some((last, _)) = batch.last() {
                if let Err(e) = last
                    .acker
                    .ack(BasicAckOptions { multiple: true })
                    .await
                {
                    warn!(error = %e, "batch ack failed, expect redelivery");
                }
            }
            counters.batches_written += 1;
            counters.rows_written += rows;
            counters.last_batch_size = size;
            counters.last_batch_time = Some(Utc::now());
            *db_backoff = DB_BACKOFF_START;
            info!(rows, batch = size, "batch flushed");
            batch.clear();
            if let Some(reporter) = reporter {
                reporter.publish(&counters.snapshot()).await;
            }
        }
        Err(e) => {
            counters.batch_failures += 1;
            if let Some((last, _)) = batch.last() {
                if let Err(nack_err) = last
                    .acker
                    .nack(BasicNackOptions {
                        multiple: true,
                        requeue: true,
                        ..BasicNackOptions::default()
                    })
                    .await
                {
                    warn!(error = %nack_err, "batch nack failed");
                }
            }
            batch.clear();
            error!(
                error = %e,
                batch = size,
                backoff_secs = db_backoff.as_secs(),
                "batch write failed, nacked for redelivery"
            );
            if allow_backoff {
                sleep(*db_backoff).await;
                *db_backoff = (*db_backoff * 2).min(DB_BACKOFF_CAP);
            }
        }
    }
}

fn parse_attempts(delivery: &Delivery) -> i64 {
    delivery
        .properties
        .headers()
        .as_ref()
        .and_then(|headers| headers.inner().get(PARSE_ATTEMPTS_HEADER))
        .and_then(|value| match value {
            AMQPValue::LongLongInt(v) => Some(*v),
            AMQPValue::LongInt(v) => Some(i64::from(*v)),
            AMQPValue::ShortInt(v) => Some(i64::from(*v)),
            _ => None,
        })
        .unwrap_or(0)
}

/// Dead-letter routing target for a payload that just failed to decode.
fn quarantine_target(prior_attempts: i64) -> &'static str {
    if prior_attempts + 1 >= MAX_PARSE_ATTEMPTS {
        TICKS_DLQ
    } else {
        TICKS_QUEUE
    }
}

/// Route an undecodable payload: retry via requeue-with-counter, then
/// dead-letter once the attempt budget is spent. Always acks the
/// original so the batch never blocks on poison.
async fn quarantine(
    channel: &Channel,
    delivery: Delivery,
    counters: &mut WriterCounters,
) -> Result<()> {
    let prior_attempts = parse_attempts(&delivery);
    let attempts = prior_attempts + 1;
    let target = quarantine_target(prior_attempts);
    if target == TICKS_DLQ {
        counters.dead_lettered += 1;
    }

    let mut headers = FieldTable::default();
    headers.insert(PARSE_ATTEMPTS_HEADER.into(), AMQPValue::LongLongInt(attempts));
    channel
        .basic_publish(
            "",
            target,
            BasicPublishOptions::default(),
            &delivery.data,
            BasicProperties::default()
                .with_delivery_mode(DELIVERY_PERSISTENT)
                .with_headers(headers),
        )
        .await
        .context("republishing poison payload")?
        .await
        .context("awaiting poison publish confirm")?;

    delivery
        .acker
        .ack(BasicAckOptions::default())
        .await
        .context("acking poison payload")?;
    Ok(())
}
