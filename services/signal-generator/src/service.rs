//! Service loop
//!
//! Wires the subscriber, the 10-second evaluation timer, persistence,
//! state publication, and the alert sink. Evaluations for one symbol run
//! strictly in sequence on this task, which gives the tracked-level
//! lifecycle single-writer semantics.

use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use services_common::config::SignalConfig;
use services_common::health::HealthReporter;
use services_common::shutdown::{shutdown_channel, spawn_signal_listener};

use crate::alerts::AlertSink;
use crate::analyzer::SignalEngine;
use crate::buffer::RollingBuffer;
use crate::persistence::{self, SignalRow};
use crate::subscriber;

const HEALTH_INTERVAL: Duration = Duration::from_secs(30);

/// Default futures tick size used for level matching.
const DEFAULT_TICK_SIZE: f64 = 0.05;

pub async fn run(config: SignalConfig) -> Result<()> {
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
    let reporter = HealthReporter::new(redis.clone(), "signal-generator");

    let buffer = Arc::new(RollingBuffer::default());
    let mut engine = SignalEngine::new(buffer.clone(), DEFAULT_TICK_SIZE);
    let mut alerts = AlertSink::new(config.alert_webhook_url.clone(), &config.symbol);

    let (shutdown_tx, mut shutdown_rx) = shutdown_channel();
    spawn_signal_listener(shutdown_tx);

    let subscriber_task = tokio::spawn(subscriber::run(
        config.redis_url.clone(),
        config.symbol.clone(),
        buffer.clone(),
        shutdown_rx.clone(),
    ));

    alerts.startup().await;
    info!(
        symbol = %config.symbol,
        security_id = %config.security_id,
        interval_secs = config.evaluation_interval.as_secs(),
        "signal generator started"
    );

    let mut evaluations: u64 = 0;
    let mut persist_failures: u64 = 0;
    let mut interval = tokio::time::interval(config.evaluation_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut health_interval = tokio::time::interval(HEALTH_INTERVAL);

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = health_interval.tick() => {
                reporter
                    .publish(&serde_json::json!({
                        "time": Utc::now(),
                        "buffered_snapshots": buffer.len(),
                        "evaluations": evaluations,
                        "persist_failures": persist_failures,
                    }))
                    .await;
            }
            _ = interval.tick() => {
                let now = Utc::now();
                let Some(evaluation) = engine.evaluate(now) else {
                    continue;
                };
                evaluations += 1;
                let transitioned = evaluation.transitioned;
                let current_price = evaluation.current_price;
                info!(
                    price = current_price,
                    key_levels = evaluation.key_levels.len(),
                    absorptions = evaluation.absorptions.len(),
                    pressure_60s = evaluation.pressure.pressure_60s,
                    state = evaluation.pressure.market_state.as_str(),
                    "evaluation complete"
                );

                let row = SignalRow::from_evaluation(evaluation, &config.security_id);
                if let Err(e) = persistence::insert_signal(&pool, &row).await {
                    persist_failures += 1;
                    error!(error = %e, "signal row not persisted");
                }
                persistence::publish_state(&redis, &config.symbol, &row).await;

                for level in &row.key_levels {
                    alerts.key_level(level, current_price, now).await;
                }
                for absorption in &row.absorptions {
                    alerts.absorption(absorption, current_price, now).await;
                }
                let pressure = crate::metrics::PressureReport {
                    pressure_30s: row.pressure_30s,
                    pressure_60s: row.pressure_60s,
                    pressure_120s: row.pressure_120s,
                    market_state: row.market_state,
                };
                alerts.pressure(&pressure, transitioned, current_price, now).await;
            }
        }
    }

    alerts.shutdown().await;
    if let Err(e) = subscriber_task.await {
        warn!(error = %e, "subscriber task join failed");
    }
    info!(evaluations, "signal generator stopped");
    Ok(())
}
