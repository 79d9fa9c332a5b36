//! Component health reporting
//!
//! Each process writes a JSON blob under `health:<component>` with a 60 s
//! TTL; a stale or missing key means the component is down. Cache writes
//! are best-effort with a 2 s budget and never fail the caller.

use redis::AsyncCommands;
use std::time::Duration;
use tokio::time::timeout;
use tracing::warn;

const HEALTH_TTL_SECONDS: u64 = 60;
const CACHE_OP_BUDGET: Duration = Duration::from_secs(2);

/// Publishes periodic liveness blobs for one component.
#[derive(Clone)]
pub struct HealthReporter {
    redis: redis::aio::ConnectionManager,
    key: String,
}

impl HealthReporter {
    pub fn new(redis: redis::aio::ConnectionManager, component: &str) -> Self {
        Self {
            redis,
            key: format!("health:{component}"),
        }
    }

    /// Write the blob with the standard TTL. Failures are logged and
    /// swallowed; health reporting must never take a component down.
    pub async fn publish(&self, blob: &serde_json::Value) {
        let body = blob.to_string();
        let mut conn = self.redis.clone();
        let op = conn.set_ex::<_, _, ()>(&self.key, body, HEALTH_TTL_SECONDS);
        match timeout(CACHE_OP_BUDGET, op).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(key = %self.key, error = %e, "health publish failed"),
            Err(_) => warn!(key = %self.key, "health publish timed out"),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}
