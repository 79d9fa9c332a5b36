//! Pipeline orchestration
//!
//! transport → decode → merge → enrich → publish, with bounded channels
//! between stages. The instrument cache loads once before the feed opens;
//! a process that cannot resolve instruments has nothing useful to do and
//! aborts. On shutdown the feed stops reading, the stages drain, and the
//! publisher gets a bounded window to flush its buffer.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use services_common::config::IngestionConfig;
use services_common::credentials::{CredentialProvider, TokenFileFormat};
use services_common::health::HealthReporter;
use services_common::shutdown::{shutdown_channel, spawn_signal_listener};
use services_common::types::encode_wire;
use services_common::{DataSource, ExchangeSegment, InstrumentCache};

use crate::dhan::websocket::{
    DhanFeedConfig, DhanWebSocketFeed, SubscriptionEntry, SubscriptionMode,
};
use crate::enricher::Enricher;
use crate::kite::websocket::{KiteFeedConfig, KiteWebSocketFeed};
use crate::merger::{TickMerger, DEFAULT_STATE_CAP};
use crate::publisher::TickPublisher;

/// Stage channel bounds. The publish buffer is the backpressure budget:
/// when the bus stalls and this fills, the transport stops reading.
const FEED_CHANNEL_CAPACITY: usize = 10_000;
const PUBLISH_CHANNEL_CAPACITY: usize = 10_000;

const HEALTH_INTERVAL: Duration = Duration::from_secs(30);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Pipeline counters, exported through the health key.
#[derive(Debug, Default)]
pub struct PipelineCounters {
    frames_received: AtomicU64,
    frames_parsed: AtomicU64,
    frames_failed: AtomicU64,
    ticks_merged: AtomicU64,
    resolve_failures: AtomicU64,
    published: AtomicU64,
    publish_retries: AtomicU64,
    reconnects: AtomicU64,
}

impl PipelineCounters {
    pub fn record_frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_frame_parsed(&self) {
        self.frames_parsed.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_frame_failed(&self) {
        self.frames_failed.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_tick_merged(&self) {
        self.ticks_merged.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_resolve_failure(&self) {
        self.resolve_failures.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_publish_retry(&self) {
        self.publish_retries.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frames_parsed(&self) -> u64 {
        self.frames_parsed.load(Ordering::Relaxed)
    }
    pub fn resolve_failures(&self) -> u64 {
        self.resolve_failures.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "time": Utc::now(),
            "frames_received": self.frames_received.load(Ordering::Relaxed),
            "frames_parsed": self.frames_parsed.load(Ordering::Relaxed),
            "frames_failed": self.frames_failed.load(Ordering::Relaxed),
            "ticks_merged": self.ticks_merged.load(Ordering::Relaxed),
            "resolve_failures": self.resolve_failures.load(Ordering::Relaxed),
            "published": self.published.load(Ordering::Relaxed),
            "publish_retries": self.publish_retries.load(Ordering::Relaxed),
            "reconnects": self.reconnects.load(Ordering::Relaxed),
        })
    }
}

/// Run the ingestion pipeline to completion.
pub async fn run(config: IngestionConfig) -> Result<()> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&config.database_url)
        .await
        .context("connecting to database")?;
    services_common::schema::run_migrations(&pool).await?;

    let redis = match redis::Client::open(config.redis_url.as_str()) {
        Ok(client) => match client.get_connection_manager().await {
            Ok(conn) => Some(conn),
            Err(e) => {
                warn!(error = %e, "redis unavailable, health reporting disabled");
                None
            }
        },
        Err(e) => {
            warn!(error = %e, "redis url rejected, health reporting disabled");
            None
        }
    };

    let cache = Arc::new(
        InstrumentCache::load_with_fallback(&pool, redis.clone())
            .await
            .context("instrument cache unavailable, aborting")?,
    );
    if cache.is_empty() {
        anyhow::bail!("instrument cache is empty, nothing to subscribe");
    }

    let counters = Arc::new(PipelineCounters::default());
    let (shutdown_tx, shutdown_rx) = shutdown_channel();
    spawn_signal_listener(shutdown_tx);

    let (tick_tx, mut tick_rx) = mpsc::channel(PUBLISH_CHANNEL_CAPACITY);
    let enricher = Enricher::new(cache.clone());

    let (feed_task, stage_task) = match config.data_source {
        DataSource::Dhan => spawn_dhan_stages(
            &config,
            cache.clone(),
            enricher,
            tick_tx,
            counters.clone(),
            redis.clone(),
            shutdown_rx.clone(),
        )?,
        DataSource::Kite => spawn_kite_stages(
            &config,
            cache.clone(),
            enricher,
            tick_tx,
            counters.clone(),
            redis.clone(),
            shutdown_rx.clone(),
        )?,
    };

    let publisher_counters = counters.clone();
    let rabbitmq_url = config.rabbitmq_url.clone();
    let publisher_task = tokio::spawn(async move {
        let mut publisher = TickPublisher::new(rabbitmq_url);
        while let Some(tick) = tick_rx.recv().await {
            match encode_wire(&tick) {
                Ok(payload) => publisher.publish(&payload, &publisher_counters).await,
                Err(e) => error!(error = %e, "tick serialization failed"),
            }
        }
    });

    if let Some(redis) = redis {
        spawn_health_task(redis, counters.clone(), shutdown_rx);
    }

    info!(
        source = config.data_source.as_str(),
        instruments = cache.len(),
        "ingestion pipeline started"
    );

    let feed_result = feed_task.await.context("feed task panicked")?;

    // The feed stopped reading; give the remaining stages a bounded
    // window to drain their buffers. A bus outage can hold the publisher
    // (and therefore the stage ahead of it) indefinitely, so the window
    // also covers the stage task.
    let drain = async {
        let _ = stage_task.await;
        let _ = publisher_task.await;
    };
    if timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        warn!(
            timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "drain window expired, buffered ticks dropped"
        );
    }

    info!(health = %counters.snapshot(), "ingestion pipeline stopped");
    feed_result
}

type FeedHandle = JoinHandle<Result<()>>;
type StageHandle = JoinHandle<()>;

fn spawn_dhan_stages(
    config: &IngestionConfig,
    cache: Arc<InstrumentCache>,
    enricher: Enricher,
    tick_tx: mpsc::Sender<services_common::EnrichedTick>,
    counters: Arc<PipelineCounters>,
    redis: Option<redis::aio::ConnectionManager>,
    shutdown: watch::Receiver<bool>,
) -> Result<(FeedHandle, StageHandle)> {
    let entries: Vec<SubscriptionEntry> = cache
        .instruments()
        .filter_map(|inst| {
            let security_id = inst.security_id.clone()?;
            let segment = inst
                .segment
                .as_deref()
                .and_then(ExchangeSegment::parse)
                .unwrap_or(ExchangeSegment::NseFno);
            Some(SubscriptionEntry {
                security_id,
                segment,
            })
        })
        .collect();
    if entries.is_empty() {
        anyhow::bail!("no instruments carry a security_id, cannot subscribe");
    }

    let credentials = Arc::new(CredentialProvider::new(
        config.dhan_token_file.clone(),
        TokenFileFormat::Json,
        None,
        "dhan:access_token",
        redis,
    ));
    let feed = DhanWebSocketFeed::new(
        DhanFeedConfig {
            endpoint: config.feed_endpoint.clone(),
            mode: SubscriptionMode::Full,
            reconnect_attempts: config.reconnect_attempts,
            reconnect_delay: config.reconnect_delay,
            read_idle_timeout: config.read_idle_timeout,
        },
        credentials,
        entries,
        counters.clone(),
        shutdown,
    );

    let (packet_tx, mut packet_rx) = mpsc::channel(FEED_CHANNEL_CAPACITY);
    let feed_task = tokio::spawn(feed.run(packet_tx));

    let stage_task = tokio::spawn(async move {
        let mut merger = TickMerger::new(DEFAULT_STATE_CAP);
        while let Some(packet) = packet_rx.recv().await {
            let Some(tick) = merger.apply(&packet, Utc::now()) else {
                continue;
            };
            counters.record_tick_merged();
            match enricher.enrich(&tick) {
                Some(enriched) => {
                    if tick_tx.send(enriched).await.is_err() {
                        break;
                    }
                }
                None => {
                    counters.record_resolve_failure();
                    debug!(
                        security_id = %tick.security_id,
                        "unknown security id, tick dropped"
                    );
                }
            }
        }
    });

    Ok((feed_task, stage_task))
}

fn spawn_kite_stages(
    config: &IngestionConfig,
    cache: Arc<InstrumentCache>,
    enricher: Enricher,
    tick_tx: mpsc::Sender<services_common::EnrichedTick>,
    counters: Arc<PipelineCounters>,
    redis: Option<redis::aio::ConnectionManager>,
    shutdown: watch::Receiver<bool>,
) -> Result<(FeedHandle, StageHandle)> {
    let api_key = config
        .kite_api_key
        .clone()
        .context("KITE_API_KEY required for the kite feed")?;
    let tokens: Vec<u32> = cache.instruments().map(|i| i.instrument_token).collect();

    let credentials = Arc::new(CredentialProvider::new(
        config.kite_token_file.clone(),
        TokenFileFormat::Plain,
        Some(api_key.clone()),
        "kite:access_token",
        redis,
    ));
    let feed = KiteWebSocketFeed::new(
        KiteFeedConfig {
            endpoint: config.feed_endpoint.clone(),
            api_key,
            reconnect_attempts: config.reconnect_attempts,
            reconnect_delay: config.reconnect_delay,
            read_idle_timeout: config.read_idle_timeout,
        },
        credentials,
        tokens,
        counters.clone(),
        shutdown,
    );

    let (kite_tx, mut kite_rx) = mpsc::channel(FEED_CHANNEL_CAPACITY);
    let feed_task = tokio::spawn(feed.run(kite_tx));

    let stage_task = tokio::spawn(async move {
        while let Some(tick) = kite_rx.recv().await {
            counters.record_tick_merged();
            match enricher.enrich_kite(&tick, Utc::now()) {
                Some(enriched) => {
                    if tick_tx.send(enriched).await.is_err() {
                        break;
                    }
                }
                None => {
                    counters.record_resolve_failure();
                    debug!(
                        token = tick.instrument_token,
                        "unknown instrument token, tick dropped"
                    );
                }
            }
        }
    });

    Ok((feed_task, stage_task))
}

fn spawn_health_task(
    redis: redis::aio::ConnectionManager,
    counters: Arc<PipelineCounters>,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let reporter = HealthReporter::new(redis, "ingestion");
        let mut interval = tokio::time::interval(HEALTH_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => reporter.publish(&counters.snapshot()).await,
                _ = shutdown.changed() => break,
            }
        }
    });
}
