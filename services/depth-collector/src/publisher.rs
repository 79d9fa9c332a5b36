//! Top-of-book publication
//!
//! A compact view (best bid/ask plus the top 20 levels per side) goes
//! out on `depth_snapshots:<symbol>` after each persisted snapshot.
//! Publication is best-effort with the standard 2 s cache budget; a slow
//! or absent Redis never holds up persistence.

use std::time::Duration;
use tokio::time::timeout;
use tracing::warn;

use services_common::types::{DepthLevelMsg, DepthSnapshotMsg};

use crate::assembler::DepthSnapshot;
use crate::parser::DepthLevel;

const TOP_LEVELS: usize = 20;
const CACHE_OP_BUDGET: Duration = Duration::from_secs(2);

/// Build the compact channel payload from a full snapshot.
pub fn top_of_book(snapshot: &DepthSnapshot) -> Option<DepthSnapshotMsg> {
    let best_bid = snapshot.bids.first()?.price;
    let best_ask = snapshot.asks.first()?.price;
    Some(DepthSnapshotMsg {
        time: snapshot.time,
        current_price: best_bid,
        best_bid,
        best_ask,
        spread: best_ask - best_bid,
        top_bids: compact(&snapshot.bids),
        top_asks: compact(&snapshot.asks),
    })
}

fn compact(levels: &[DepthLevel]) -> Vec<DepthLevelMsg> {
    levels
        .iter()
        .take(TOP_LEVELS)
        .map(|level| DepthLevelMsg {
            price: level.price,
            qty: level.quantity,
            orders: i64::from(level.orders),
        })
        .collect()
}

/// Publishes top-of-book views on the snapshot channel.
pub struct SnapshotPublisher {
    redis: redis::aio::ConnectionManager,
    channel: String,
}

impl SnapshotPublisher {
    pub fn new(redis: redis::aio::ConnectionManager, symbol: &str) -> Self {
        Self {
            redis,
            channel: format!("depth_snapshots:{symbol}"),
        }
    }

    /// Best-effort publish; returns whether the message went out.
    pub async fn publish(&self, snapshot: &DepthSnapshot) -> bool {
        let Some(message) = top_of_book(snapshot) else {
            return false;
        };
        let payload = match serde_json::to_string(&message) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "snapshot payload serialization failed");
                return false;
            }
        };
        let mut conn = self.redis.clone();
        let mut cmd = redis::cmd("PUBLISH");
        cmd.arg(&self.channel).arg(payload);
        let op = cmd.query_async::<_, i64>(&mut conn);
        match timeout(CACHE_OP_BUDGET, op).await {
            Ok(Ok(_subscribers)) => true,
            Ok(Err(e)) => {
                warn!(channel = %self.channel, error = %e, "snapshot publish failed");
                false
            }
            Err(_) => {
                warn!(channel = %self.channel, "snapshot publish timed out");
                false
            }
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}
