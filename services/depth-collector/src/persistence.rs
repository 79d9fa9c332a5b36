//! Level persistence
//!
//! Every level of a completed snapshot lands in `depth_levels_200` in one
//! batched statement. The composite key already identifies the row, so a
//! duplicate timestamp (reconnect replay, stacked frames) is a no-op via
//! `ON CONFLICT DO NOTHING`.

use anyhow::{Context, Result};
use sqlx::{PgPool, QueryBuilder};
use std::time::Duration;
use tokio::time::timeout;

use crate::assembler::DepthSnapshot;
use crate::parser::DepthLevel;

const SQL_BATCH_TIMEOUT: Duration = Duration::from_secs(30);

struct LevelRow<'a> {
    side: &'static str,
    level_num: i32,
    level: &'a DepthLevel,
}

/// Insert all bid and ask levels of one snapshot. Returns rows inserted
/// (duplicates conflict away silently).
pub async fn insert_snapshot(pool: &PgPool, snapshot: &DepthSnapshot) -> Result<u64> {
    let rows: Vec<LevelRow<'_>> = snapshot
        .bids
        .iter()
        .enumerate()
        .map(|(i, level)| LevelRow {
            side: "bid",
            level_num: i as i32 + 1,
            level,
        })
        .chain(snapshot.asks.iter().enumerate().map(|(i, level)| LevelRow {
            side: "ask",
            level_num: i as i32 + 1,
            level,
        }))
        .collect();
    if rows.is_empty() {
        return Ok(0);
    }

    let mut builder: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(
        "INSERT INTO depth_levels_200 (time, security_id, side, level_num, price, quantity, orders) ",
    );
    builder.push_values(&rows, |mut row, entry| {
        row.push_bind(snapshot.time)
            .push_bind(&snapshot.security_id)
            .push_bind(entry.side)
            .push_bind(entry.level_num)
            .push_bind(entry.level.price)
            .push_bind(entry.level.quantity)
            .push_bind(entry.level.orders);
    });
    builder.push(" ON CONFLICT (time, security_id, side, level_num) DO NOTHING");

    let result = timeout(SQL_BATCH_TIMEOUT, builder.build().execute(pool))
        .await
        .context("depth batch write timed out")?
        .context("depth batch write failed")?;
    Ok(result.rows_affected())
}
