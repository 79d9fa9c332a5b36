//! Time-series schema management
//!
//! Idempotent, run by every binary at startup. Plain tables are created
//! unconditionally; hypertable conversion and compression/retention
//! policies need the timescaledb extension and are applied best-effort so
//! a vanilla Postgres still works for development.

use anyhow::{Context, Result};
use sqlx::PgPool;
use tracing::{debug, info, warn};

/// Create tables, hypertables, and lifecycle policies.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    info!("running schema migrations");

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS instruments (
            instrument_token BIGINT PRIMARY KEY,
            security_id TEXT UNIQUE,
            trading_symbol TEXT NOT NULL,
            exchange TEXT NOT NULL,
            segment TEXT,
            instrument_type TEXT,
            expiry DATE,
            strike DOUBLE PRECISION,
            tick_size DOUBLE PRECISION,
            lot_size INTEGER,
            source TEXT,
            is_active BOOLEAN NOT NULL DEFAULT TRUE
        )
        ",
    )
    .execute(pool)
    .await
    .context("creating instruments table")?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS ticks (
            time TIMESTAMPTZ NOT NULL,
            last_trade_time TIMESTAMPTZ,
            instrument_token BIGINT NOT NULL,
            trading_symbol TEXT,
            exchange TEXT,
            segment TEXT,
            instrument_type TEXT,
            last_price DOUBLE PRECISION,
            last_traded_quantity INTEGER,
            average_traded_price DOUBLE PRECISION,
            volume_traded BIGINT,
            oi BIGINT,
            oi_day_high BIGINT,
            oi_day_low BIGINT,
            day_open DOUBLE PRECISION,
            day_high DOUBLE PRECISION,
            day_low DOUBLE PRECISION,
            day_close DOUBLE PRECISION,
            change DOUBLE PRECISION,
            change_percent DOUBLE PRECISION,
            total_buy_quantity BIGINT,
            total_sell_quantity BIGINT,
            bid_prices DOUBLE PRECISION[],
            bid_quantities BIGINT[],
            bid_orders INTEGER[],
            ask_prices DOUBLE PRECISION[],
            ask_quantities BIGINT[],
            ask_orders INTEGER[],
            tradable BOOLEAN NOT NULL DEFAULT TRUE,
            mode TEXT,
            bid_ask_spread DOUBLE PRECISION,
            mid_price DOUBLE PRECISION,
            order_imbalance BIGINT,
            PRIMARY KEY (time, instrument_token)
        )
        ",
    )
    .execute(pool)
    .await
    .context("creating ticks table")?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS depth_levels_200 (
            time TIMESTAMPTZ NOT NULL,
            security_id TEXT NOT NULL,
            side TEXT NOT NULL CHECK (side IN ('bid', 'ask')),
            level_num INTEGER NOT NULL CHECK (level_num BETWEEN 1 AND 200),
            price DOUBLE PRECISION NOT NULL,
            quantity BIGINT NOT NULL,
            orders INTEGER NOT NULL,
            PRIMARY KEY (time, security_id, side, level_num)
        )
        ",
    )
    .execute(pool)
    .await
    .context("creating depth_levels_200 table")?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS depth_signals (
            time TIMESTAMPTZ NOT NULL,
            security_id TEXT NOT NULL,
            current_price DOUBLE PRECISION NOT NULL,
            key_levels JSONB NOT NULL DEFAULT '[]',
            absorptions JSONB NOT NULL DEFAULT '[]',
            pressure_30s DOUBLE PRECISION NOT NULL,
            pressure_60s DOUBLE PRECISION NOT NULL,
            pressure_120s DOUBLE PRECISION NOT NULL,
            market_state TEXT NOT NULL CHECK (market_state IN ('bullish', 'bearish', 'neutral')),
            PRIMARY KEY (time, security_id)
        )
        ",
    )
    .execute(pool)
    .await
    .context("creating depth_signals table")?;

    apply_timeseries_policies(pool).await;

    info!("schema migrations completed");
    Ok(())
}

/// Hypertable conversion plus compression and retention windows:
/// ticks 7 d / 90 d, depth_levels_200 7 d / 60 d, depth_signals 1 d / 60 d.
async fn apply_timeseries_policies(pool: &PgPool) {
    let statements = [
        "SELECT create_hypertable('ticks', 'time', if_not_exists => TRUE)",
        "SELECT create_hypertable('depth_levels_200', 'time', if_not_exists => TRUE)",
        "SELECT create_hypertable('depth_signals', 'time', if_not_exists => TRUE)",
        "ALTER TABLE ticks SET (timescaledb.compress, timescaledb.compress_segmentby = 'instrument_token')",
        "ALTER TABLE depth_levels_200 SET (timescaledb.compress, timescaledb.compress_segmentby = 'security_id')",
        "ALTER TABLE depth_signals SET (timescaledb.compress, timescaledb.compress_segmentby = 'security_id')",
        "SELECT add_compression_policy('ticks', INTERVAL '7 days', if_not_exists => TRUE)",
        "SELECT add_compression_policy('depth_levels_200', INTERVAL '7 days', if_not_exists => TRUE)",
        "SELECT add_compression_policy('depth_signals', INTERVAL '1 day', if_not_exists => TRUE)",
        "SELECT add_retention_policy('ticks', INTERVAL '90 days', if_not_exists => TRUE)",
        "SELECT add_retention_policy('depth_levels_200', INTERVAL '60 days', if_not_exists => TRUE)",
        "SELECT add_retention_policy('depth_signals', INTERVAL '60 days', if_not_exists => TRUE)",
    ];

    for statement in statements {
        if let Err(e) = sqlx::query(statement).execute(pool).await {
            warn!(statement, error = %e, "timescale policy skipped");
        } else {
            debug!(statement, "timescale policy applied");
        }
    }
}
