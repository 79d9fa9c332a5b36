//! Signal persistence and state publication
//!
//! One `depth_signals` row per evaluation; the identical record also
//! lands under `signal_state:<symbol>` with a 60 s TTL for real-time
//! consumers. The nested lists are stored as JSON documents.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde::Serialize;
use sqlx::PgPool;
use std::time::Duration;
use tokio::time::timeout;
use tracing::warn;

use crate::analyzer::Evaluation;
use crate::metrics::{AbsorptionReport, KeyLevelReport, MarketState};

const STATE_TTL_SECONDS: u64 = 60;
const CACHE_OP_BUDGET: Duration = Duration::from_secs(2);
const SQL_TIMEOUT: Duration = Duration::from_secs(30);

/// The persisted evaluation record.
#[derive(Debug, Serialize)]
pub struct SignalRow {
    pub time: DateTime<Utc>,
    pub security_id: String,
    pub current_price: f64,
    pub key_levels: Vec<KeyLevelReport>,
    pub absorptions: Vec<AbsorptionReport>,
    pub pressure_30s: f64,
    pub pressure_60s: f64,
    pub pressure_120s: f64,
    pub market_state: MarketState,
}

impl SignalRow {
    pub fn from_evaluation(evaluation: Evaluation, security_id: &str) -> Self {
        Self {
            time: evaluation.time,
            security_id: security_id.to_string(),
            current_price: evaluation.current_price,
            key_levels: evaluation.key_levels,
            absorptions: evaluation.absorptions,
            pressure_30s: evaluation.pressure.pressure_30s,
            pressure_60s: evaluation.pressure.pressure_60s,
            pressure_120s: evaluation.pressure.pressure_120s,
            market_state: evaluation.pressure.market_state,
        }
    }
}

/// Insert one evaluation row. The composite key absorbs replays of the
/// same evaluation instant.
pub async fn insert_signal(pool: &PgPool, row: &SignalRow) -> Result<()> {
    let key_levels = serde_json::to_value(&row.key_levels).context("key_levels to json")?;
    let absorptions = serde_json::to_value(&row.absorptions).context("absorptions to json")?;

    let query = sqlx::query(
        r"
        INSERT INTO depth_signals (
            time, security_id, current_price, key_levels, absorptions,
            pressure_30s, pressure_60s, pressure_120s, market_state
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (time, security_id) DO NOTHING
        ",
    )
    .bind(row.time)
    .bind(&row.security_id)
    .bind(row.current_price)
    .bind(key_levels)
    .bind(absorptions)
    .bind(row.pressure_30s)
    .bind(row.pressure_60s)
    .bind(row.pressure_120s)
    .bind(row.market_state.as_str());

    timeout(SQL_TIMEOUT, query.execute(pool))
        .await
        .context("signal insert timed out")?
        .context("signal insert failed")?;
    Ok(())
}

/// Refresh the real-time state key. Best-effort with the cache budget.
pub async fn publish_state(
    redis: &redis::aio::ConnectionManager,
    symbol: &str,
    row: &SignalRow,
) {
    let key = format!("signal_state:{symbol}");
    let payload = match serde_json::to_string(row) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "signal state serialization failed");
            return;
        }
    };
    let mut conn = redis.clone();
    let op = conn.set_ex::<_, _, ()>(&key, payload, STATE_TTL_SECONDS);
    match timeout(CACHE_OP_BUDGET, op).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(key = %key, error = %e, "signal state publish failed"),
        Err(_) => warn!(key = %key, "signal state publish timed out"),
    }
}
