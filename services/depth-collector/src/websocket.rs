//! Depth feed transport and collector loop
//!
//! One symbol per process: subscribe with request code 23, pair incoming
//! bid/ask frames into snapshots, persist all levels, then publish the
//! compact view. Repeated connect cycles that never produce a data frame
//! are an entitlement problem, not a flaky network, and abort the process
//! so the operator sees it.

use anyhow::{Context, Result};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use sqlx::PgPool;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use services_common::config::DepthConfig;
use services_common::credentials::{CredentialProvider, TokenFileFormat};
use services_common::health::HealthReporter;
use services_common::shutdown::{shutdown_channel, spawn_signal_listener};
use services_common::FeedError;

use crate::assembler::{AssemblyOutcome, SnapshotAssembler};
use crate::parser::{parse_frame, split_frames, DepthFrame};
use crate::persistence;
use crate::publisher::SnapshotPublisher;

const HEALTH_INTERVAL: Duration = Duration::from_secs(30);

/// Consecutive zero-data sessions treated as an entitlement failure.
const MAX_ZERO_DATA_SESSIONS: u32 = 2;

#[derive(Debug, Default)]
pub struct DepthCounters {
    frames_received: AtomicU64,
    frames_parsed: AtomicU64,
    frames_failed: AtomicU64,
    snapshots_completed: AtomicU64,
    snapshots_discarded: AtomicU64,
    rows_written: AtomicU64,
    publish_failures: AtomicU64,
    reconnects: AtomicU64,
}

impl DepthCounters {
    fn snapshot(&self) -> serde_json::Value {
        json!({
            "time": Utc::now(),
            "frames_received": self.frames_received.load(Ordering::Relaxed),
            "frames_parsed": self.frames_parsed.load(Ordering::Relaxed),
            "frames_failed": self.frames_failed.load(Ordering::Relaxed),
            "snapshots_completed": self.snapshots_completed.load(Ordering::Relaxed),
            "snapshots_discarded": self.snapshots_discarded.load(Ordering::Relaxed),
            "rows_written": self.rows_written.load(Ordering::Relaxed),
            "publish_failures": self.publish_failures.load(Ordering::Relaxed),
            "reconnects": self.reconnects.load(Ordering::Relaxed),
        })
    }
}

enum SessionEnd {
    Shutdown,
    Disconnected,
}

/// Run the depth collector until shutdown.
pub async fn run(config: DepthConfig) -> Result<()> {
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&config.database_url)
        .await
        .context("connecting to database")?;
    services_common::schema::run_migrations(&pool).await?;

    let redis = redis::Client::open(config.redis_url.as_str())
        .context("redis url rejected")?
        .get_connection_manager()
        .await
        .context("connecting to redis")?;
    let publisher = SnapshotPublisher::new(redis.clone(), &config.symbol);
    let reporter = HealthReporter::new(redis.clone(), "depth-collector");

    let credentials = Arc::new(CredentialProvider::new(
        config.dhan_token_file.clone(),
        TokenFileFormat::Json,
        None,
        "dhan:access_token",
        Some(redis),
    ));

    let counters = Arc::new(DepthCounters::default());
    let (shutdown_tx, mut shutdown_rx) = shutdown_channel();
    spawn_signal_listener(shutdown_tx);

    {
        let counters = counters.clone();
        let reporter = reporter.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEALTH_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => reporter.publish(&counters.snapshot()).await,
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    info!(
        security_id = %config.security_id,
        symbol = %config.symbol,
        channel = publisher.channel(),
        "depth collector started"
    );

    let mut attempts: u32 = 0;
    let mut zero_data_sessions: u32 = 0;
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let parsed_before = counters.frames_parsed.load(Ordering::Relaxed);
        let end = run_session(
            &config,
            &credentials,
            &pool,
            &publisher,
            &counters,
            &mut shutdown_rx,
        )
        .await;
        let produced_data = counters.frames_parsed.load(Ordering::Relaxed) > parsed_before;

        match end {
            Ok(SessionEnd::Shutdown) => break,
            Ok(SessionEnd::Disconnected) => warn!("depth session ended"),
            Err(e) => error!(error = %e, "depth session failed"),
        }

        if produced_data {
            attempts = 0;
            zero_data_sessions = 0;
        } else {
            zero_data_sessions += 1;
            if zero_data_sessions >= MAX_ZERO_DATA_SESSIONS {
                return Err(FeedError::AuthExpired(format!(
                    "{zero_data_sessions} connect cycles with no depth frames; \
                     check token entitlement for the depth feed"
                ))
                .into());
            }
        }

        attempts += 1;
        counters.reconnects.fetch_add(1, Ordering::Relaxed);
        if attempts > config.reconnect_attempts {
            return Err(FeedError::ReconnectExhausted(config.reconnect_attempts).into());
        }
        tokio::select! {
            _ = tokio::time::sleep(config.reconnect_delay) => {}
            _ = shutdown_rx.changed() => break,
        }
    }

    info!(health = %counters.snapshot(), "depth collector stopped");
    Ok(())
}

async fn run_session(
    config: &DepthConfig,
    credentials: &Arc<CredentialProvider>,
    pool: &PgPool,
    publisher: &SnapshotPublisher,
    counters: &Arc<DepthCounters>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<SessionEnd> {
    let creds = credentials.refresh().await?;
    let ws_url = format!(
        "{}?version=2&token={}&clientId={}&authType=2",
        config.feed_endpoint,
        creds.access_token.trim(),
        creds.client_id.trim()
    );
    url::Url::parse(&ws_url).context("invalid depth feed URL")?;

    let (ws, response) = connect_async(ws_url.as_str())
        .await
        .map_err(|e| FeedError::ConnectionFailed(e.to_string()))?;
    info!(status = %response.status(), "depth feed connected");
    let (mut write, mut read) = ws.split();

    let subscription = json!({
        "RequestCode": 23,
        "InstrumentCount": 1,
        "InstrumentList": [{
            "ExchangeSegment": config.exchange_segment.as_str(),
            "SecurityId": &config.security_id,
        }],
    });
    write.send(Message::Text(subscription.to_string())).await?;
    info!(security_id = %config.security_id, "depth subscription sent");

    let mut assembler = SnapshotAssembler::new();
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                let _ = write.send(Message::Close(None)).await;
                return Ok(SessionEnd::Shutdown);
            }
            next = timeout(config.read_idle_timeout, read.next()) => {
                let message = match next {
                    Err(_) => {
                        warn!("read-idle budget exceeded on depth feed");
                        return Ok(SessionEnd::Disconnected);
                    }
                    Ok(None) => return Ok(SessionEnd::Disconnected),
                    Ok(Some(Err(e))) => {
                        error!(error = %e, "depth websocket error");
                        return Ok(SessionEnd::Disconnected);
                    }
                    Ok(Some(Ok(message))) => message,
                };

                match message {
                    Message::Binary(data) => {
                        for raw in split_frames(&data) {
                            counters.frames_received.fetch_add(1, Ordering::Relaxed);
                            let frame = match parse_frame(raw) {
                                Ok(frame) => frame,
                                Err(e) => {
                                    counters.frames_failed.fetch_add(1, Ordering::Relaxed);
                                    debug!(error = %e, "depth frame dropped");
                                    continue;
                                }
                            };
                            counters.frames_parsed.fetch_add(1, Ordering::Relaxed);

                            if let DepthFrame::Disconnect { reason_code, .. } = frame {
                                warn!(reason_code, "depth server disconnect frame");
                                return Ok(SessionEnd::Disconnected);
                            }

                            match assembler.on_frame(frame, Utc::now()) {
                                AssemblyOutcome::Complete(snapshot) => {
                                    counters
                                        .snapshots_completed
                                        .fetch_add(1, Ordering::Relaxed);
                                    match persistence::insert_snapshot(pool, &snapshot).await {
                                        Ok(rows) => {
                                            counters
                                                .rows_written
                                                .fetch_add(rows, Ordering::Relaxed);
                                        }
                                        Err(e) => {
                                            error!(error = %e, "depth persistence failed");
                                        }
                                    }
                                    if !publisher.publish(&snapshot).await {
                                        counters
                                            .publish_failures
                                            .fetch_add(1, Ordering::Relaxed);
                                    }
                                }
                                AssemblyOutcome::DiscardedStale => {
                                    counters
                                        .snapshots_discarded
                                        .fetch_add(1, Ordering::Relaxed);
                                }
                                AssemblyOutcome::Pending => {}
                            }
                        }
                    }
                    Message::Ping(payload) => {
                        write.send(Message::Pong(payload)).await?;
                    }
                    Message::Text(text) => debug!(message = %text, "depth text message"),
                    Message::Close(_) => return Ok(SessionEnd::Disconnected),
                    _ => {}
                }
            }
        }
    }
}
