//! Bulk writes into the `ticks` hypertable

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, QueryBuilder};
use std::time::Duration;
use tokio::time::timeout;

use services_common::EnrichedTick;

/// Per-statement budget for a batch write.
const SQL_BATCH_TIMEOUT: Duration = Duration::from_secs(30);

pub async fn connect(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await
        .context("connecting to database")
}

/// One batched UPSERT for the whole tick batch. Re-deliveries rewrite the
/// same `(time, instrument_token)` row, which keeps replays idempotent.
pub async fn insert_ticks(pool: &PgPool, ticks: &[EnrichedTick]) -> Result<u64> {
    if ticks.is_empty() {
        return Ok(0);
    }

    let mut builder: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(
        "INSERT INTO ticks (
            time, last_trade_time, instrument_token, trading_symbol, exchange,
            segment, instrument_type, last_price, last_traded_quantity,
            average_traded_price, volume_traded, oi, oi_day_high, oi_day_low,
            day_open, day_high, day_low, day_close, change, change_percent,
            total_buy_quantity, total_sell_quantity, bid_prices, bid_quantities,
            bid_orders, ask_prices, ask_quantities, ask_orders, tradable, mode,
            bid_ask_spread, mid_price, order_imbalance
        ) ",
    );

    builder.push_values(ticks, |mut row, tick| {
        row.push_bind(tick.time)
            .push_bind(tick.last_trade_time)
            .push_bind(i64::from(tick.instrument_token))
            .push_bind(tick.trading_symbol.as_deref())
            .push_bind(tick.exchange.as_deref())
            .push_bind(tick.segment.as_deref())
            .push_bind(tick.instrument_type.as_deref())
            .push_bind(tick.last_price)
            .push_bind(tick.last_traded_quantity)
            .push_bind(tick.average_traded_price)
            .push_bind(tick.volume_traded)
            .push_bind(tick.oi)
            .push_bind(tick.oi_day_high)
            .push_bind(tick.oi_day_low)
            .push_bind(tick.day_open)
            .push_bind(tick.day_high)
            .push_bind(tick.day_low)
            .push_bind(tick.day_close)
            .push_bind(tick.change)
            .push_bind(tick.change_percent)
            .push_bind(tick.total_buy_quantity)
            .push_bind(tick.total_sell_quantity)
            .push_bind(tick.bid_prices.to_vec())
            .push_bind(tick.bid_quantities.to_vec())
            .push_bind(tick.bid_orders.to_vec())
            .push_bind(tick.ask_prices.to_vec())
            .push_bind(tick.ask_quantities.to_vec())
            .push_bind(tick.ask_orders.to_vec())
            .push_bind(tick.tradable)
            .push_bind(tick.mode.as_deref())
            .push_bind(tick.bid_ask_spread)
            .push_bind(tick.mid_price)
            .push_bind(tick.order_imbalance);
    });

    builder.push(
        " ON CONFLICT (time, instrument_token) DO UPDATE SET
            last_price = EXCLUDED.last_price,
            last_traded_quantity = EXCLUDED.last_traded_quantity,
            average_traded_price = EXCLUDED.average_traded_price,
            volume_traded = EXCLUDED.volume_traded,
            oi = EXCLUDED.oi,
            oi_day_high = EXCLUDED.oi_day_high,
            oi_day_low = EXCLUDED.oi_day_low,
            day_open = EXCLUDED.day_open,
            day_high = EXCLUDED.day_high,
            day_low = EXCLUDED.day_low,
            day_close = EXCLUDED.day_close,
            change = EXCLUDED.change,
            change_percent = EXCLUDED.change_percent,
            total_buy_quantity = EXCLUDED.total_buy_quantity,
            total_sell_quantity = EXCLUDED.total_sell_quantity,
            bid_prices = EXCLUDED.bid_prices,
            bid_quantities = EXCLUDED.bid_quantities,
            bid_orders = EXCLUDED.bid_orders,
            ask_prices = EXCLUDED.ask_prices,
            ask_quantities = EXCLUDED.ask_quantities,
            ask_orders = EXCLUDED.ask_orders,
            bid_ask_spread = EXCLUDED.bid_ask_spread,
            mid_price = EXCLUDED.mid_price,
            order_imbalance = EXCLUDED.order_imbalance",
    );

    let result = timeout(SQL_BATCH_TIMEOUT, builder.build().execute(pool))
        .await
        .context("tick batch write timed out")?
        .context("tick batch write failed")?;
    Ok(result.rows_affected())
}
