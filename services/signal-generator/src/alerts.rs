//! Notification sink
//!
//! Filtered events go to a webhook as JSON: a readable `text` field plus
//! the structured payload for machine consumers. Five-second timeout, no
//! retries, failures logged; alerting must never take the analyzer
//! down. A five-minute cooldown keyed on `(kind, price bucket, side)`
//! deduplicates; suppressed events are still persisted upstream.
//! Startup and shutdown notices bypass the filters.

use chrono::{DateTime, Duration, Utc};
use rustc_hash::FxHashMap;
use serde_json::json;
use tracing::{debug, warn};

use crate::metrics::{AbsorptionReport, KeyLevelReport, PressureReport};

/// Cooldown window for deduplication.
pub const ALERT_COOLDOWN_SECONDS: i64 = 300;

/// Key-level alert bars: strength and proven age.
pub const KEY_LEVEL_MIN_STRENGTH: f64 = 3.0;
pub const KEY_LEVEL_MIN_AGE_SECONDS: i64 = 10;
/// Absorption alert bars: reduction with price confirmation.
pub const ABSORPTION_MIN_REDUCTION_PCT: f64 = 70.0;
/// Pressure alert bar on the primary window.
pub const PRESSURE_MIN_MAGNITUDE: f64 = 0.4;

const WEBHOOK_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    KeyLevel,
    Absorption,
    Pressure,
}

impl SignalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::KeyLevel => "key_level",
            Self::Absorption => "absorption",
            Self::Pressure => "pressure",
        }
    }
}

/// Dedup key: alerts with the same kind, rounded price, and side share a
/// cooldown.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AlertKey {
    pub kind: SignalKind,
    pub price_bucket: i64,
    pub side: String,
}

/// Pure filter: does a key level clear the alert bar?
pub fn key_level_qualifies(report: &KeyLevelReport) -> bool {
    report.strength_ratio >= KEY_LEVEL_MIN_STRENGTH
        && report.age_seconds >= KEY_LEVEL_MIN_AGE_SECONDS
}

/// Pure filter: does an absorption clear the alert bar?
pub fn absorption_qualifies(report: &AbsorptionReport) -> bool {
    report.reduction_pct >= ABSORPTION_MIN_REDUCTION_PCT && report.breakthrough
}

/// Pure filter: does a pressure reading clear the alert bar?
pub fn pressure_qualifies(report: &PressureReport, transitioned: bool) -> bool {
    transitioned && report.pressure_60s.abs() >= PRESSURE_MIN_MAGNITUDE
}

pub struct AlertSink {
    client: reqwest::Client,
    webhook_url: Option<String>,
    symbol: String,
    recent: FxHashMap<AlertKey, DateTime<Utc>>,
}

impl AlertSink {
    pub fn new(webhook_url: Option<String>, symbol: &str) -> Self {
        if webhook_url.is_none() {
            warn!("ALERT_WEBHOOK_URL not set, alerts disabled");
        }
        let client = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            webhook_url,
            symbol: symbol.to_string(),
            recent: FxHashMap::default(),
        }
    }

    /// True when the key is outside its cooldown window.
    fn cooldown_open(&self, key: &AlertKey, now: DateTime<Utc>) -> bool {
        match self.recent.get(key) {
            Some(last) => {
                now.signed_duration_since(*last) >= Duration::seconds(ALERT_COOLDOWN_SECONDS)
            }
            None => true,
        }
    }

    /// Send a key-level alert if it qualifies and is not cooling down.
    pub async fn key_level(
        &mut self,
        report: &KeyLevelReport,
        current_price: f64,
        now: DateTime<Utc>,
    ) -> bool {
        if !key_level_qualifies(report) {
            return false;
        }
        let key = AlertKey {
            kind: SignalKind::KeyLevel,
            price_bucket: report.price.round() as i64,
            side: report.side.book_side().to_string(),
        };
        if !self.cooldown_open(&key, now) {
            debug!(?key, "key-level alert suppressed by cooldown");
            return false;
        }
        let body = json!({
            "text": format!(
                "*{} {}* at {:.2}: {} orders ({:.1}x avg), {} tests, {}s old (last {:.2})",
                self.symbol,
                report.side.as_str().to_uppercase(),
                report.price,
                report.orders,
                report.strength_ratio,
                report.tests,
                report.age_seconds,
                current_price,
            ),
            "kind": SignalKind::KeyLevel.as_str(),
            "symbol": self.symbol.as_str(),
            "price": report.price,
            "side": report.side.as_str(),
            "orders": report.orders,
            "strength_ratio": report.strength_ratio,
            "age_seconds": report.age_seconds,
            "status": report.status.as_str(),
            "tests": report.tests,
            "current_price": current_price,
        });
        self.deliver(key, body, now).await
    }

    /// Send an absorption alert if it qualifies and is not cooling down.
    pub async fn absorption(
        &mut self,
        report: &AbsorptionReport,
        current_price: f64,
        now: DateTime<Utc>,
    ) -> bool {
        if !absorption_qualifies(report) {
            return false;
        }
        let key = AlertKey {
            kind: SignalKind::Absorption,
            price_bucket: report.price.round() as i64,
            side: report.side.book_side().to_string(),
        };
        if !self.cooldown_open(&key, now) {
            debug!(?key, "absorption alert suppressed by cooldown");
            return false;
        }
        let body = json!({
            "text": format!(
                "*{} {} BREAKING* at {:.2}: orders {} -> {} ({:.0}% absorbed), last {:.2}",
                self.symbol,
                report.side.as_str().to_uppercase(),
                report.price,
                report.orders_before,
                report.orders_now,
                report.reduction_pct,
                current_price,
            ),
            "kind": SignalKind::Absorption.as_str(),
            "symbol": self.symbol.as_str(),
            "price": report.price,
            "side": report.side.as_str(),
            "orders_before": report.orders_before,
            "orders_now": report.orders_now,
            "reduction_pct": report.reduction_pct,
            "breakthrough": report.breakthrough,
            "current_price": current_price,
        });
        self.deliver(key, body, now).await
    }

    /// Send a pressure-shift alert if it qualifies and is not cooling
    /// down.
    pub async fn pressure(
        &mut self,
        report: &PressureReport,
        transitioned: bool,
        current_price: f64,
        now: DateTime<Utc>,
    ) -> bool {
        if !pressure_qualifies(report, transitioned) {
            return false;
        }
        let key = AlertKey {
            kind: SignalKind::Pressure,
            price_bucket: 0,
            side: report.market_state.as_str().to_string(),
        };
        if !self.cooldown_open(&key, now) {
            debug!(?key, "pressure alert suppressed by cooldown");
            return false;
        }
        let body = json!({
            "text": format!(
                "*{} pressure shift to {}*: 30s {:+.3} / 60s {:+.3} / 120s {:+.3}, last {:.2}",
                self.symbol,
                report.market_state.as_str().to_uppercase(),
                report.pressure_30s,
                report.pressure_60s,
                report.pressure_120s,
                current_price,
            ),
            "kind": SignalKind::Pressure.as_str(),
            "symbol": self.symbol.as_str(),
            "pressure_30s": report.pressure_30s,
            "pressure_60s": report.pressure_60s,
            "pressure_120s": report.pressure_120s,
            "market_state": report.market_state.as_str(),
            "current_price": current_price,
        });
        self.deliver(key, body, now).await
    }

    /// Startup notice; unconditional.
    pub async fn startup(&self) {
        let stamp = Utc::now().with_timezone(&services_common::ist_offset());
        let body = json!({
            "text": format!(
                "Signal generator online at {}, monitoring {} depth",
                stamp.format("%Y-%m-%d %H:%M:%S IST"),
                self.symbol,
            ),
            "kind": "lifecycle",
            "event": "startup",
            "symbol": self.symbol.as_str(),
            "time": Utc::now(),
        });
        self.post(&body).await;
    }

    /// Shutdown notice; unconditional.
    pub async fn shutdown(&self) {
        let stamp = Utc::now().with_timezone(&services_common::ist_offset());
        let body = json!({
            "text": format!(
                "Signal generator offline at {} ({})",
                stamp.format("%Y-%m-%d %H:%M:%S IST"),
                self.symbol,
            ),
            "kind": "lifecycle",
            "event": "shutdown",
            "symbol": self.symbol.as_str(),
            "time": Utc::now(),
        });
        self.post(&body).await;
    }

    async fn deliver(
        &mut self,
        key: AlertKey,
        body: serde_json::Value,
        now: DateTime<Utc>,
    ) -> bool {
        if self.post(&body).await {
            // The cooldown starts only once the sink actually got the
            // event; a failed post may retry next evaluation.
            self.recent.insert(key, now);
            true
        } else {
            false
        }
    }

    async fn post(&self, body: &serde_json::Value) -> bool {
        let Some(url) = self.webhook_url.as_deref() else {
            return false;
        };
        match self.client.post(url).json(body).send().await {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                warn!(status = %response.status(), "alert webhook rejected");
                false
            }
            Err(e) => {
                warn!(error = %e, "alert webhook failed");
                false
            }
        }
    }
}

/// Test hook: seed a cooldown entry as if an alert had just been sent.
#[cfg(test)]
impl AlertSink {
    fn mark_sent(&mut self, key: AlertKey, at: DateTime<Utc>) {
        self.recent.insert(key, at);
    }
}
