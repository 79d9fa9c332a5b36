//! Evaluation engine
//!
//! Pure computation over the rolling buffer: one `evaluate` call per
//! 10-second cycle produces the signal row plus the alert-relevant
//! context (state transition flag). IO stays in the service loop.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

use crate::buffer::RollingBuffer;
use crate::metrics::{
    calculate_pressure, detect_absorptions, key_level_reports, observe_candidates,
    AbsorptionReport, KeyLevelReport, MarketState, PressureReport, ABSORPTION_LOOKBACK_MAX,
    ABSORPTION_LOOKBACK_MIN,
};
use crate::tracking::LevelTracker;

/// Snapshots required before evaluations start (about six seconds of
/// feed at 5 Hz).
pub const MIN_SNAPSHOTS: usize = 30;

/// One evaluation's full output.
#[derive(Debug)]
pub struct Evaluation {
    pub time: DateTime<Utc>,
    pub current_price: f64,
    pub key_levels: Vec<KeyLevelReport>,
    pub absorptions: Vec<AbsorptionReport>,
    pub pressure: PressureReport,
    /// Market state changed in this evaluation.
    pub transitioned: bool,
}

pub struct SignalEngine {
    buffer: Arc<RollingBuffer>,
    tracker: LevelTracker,
    last_state: MarketState,
}

impl SignalEngine {
    pub fn new(buffer: Arc<RollingBuffer>, tick_size: f64) -> Self {
        Self {
            buffer,
            tracker: LevelTracker::new(tick_size),
            last_state: MarketState::Neutral,
        }
    }

    /// Run one evaluation. `None` until the buffer warms up.
    pub fn evaluate(&mut self, now: DateTime<Utc>) -> Option<Evaluation> {
        if self.buffer.len() < MIN_SNAPSHOTS {
            return None;
        }
        let current = self.buffer.latest()?;
        let current_price = current.current_price;

        // Order matters: record candidate observations first, then run
        // absorption detection against the pre-crossing statuses, and
        // only then let the lifecycle mark crossed levels broken. A
        // breakthrough absorption and the broken transition land in the
        // same evaluation.
        let mean_orders = observe_candidates(&current, &mut self.tracker, now);

        let lookback = self.buffer.slice_between(
            now - Duration::seconds(ABSORPTION_LOOKBACK_MAX),
            now - Duration::seconds(ABSORPTION_LOOKBACK_MIN),
        );
        let recent_prices: Vec<f64> = self
            .buffer
            .slice_since(now - Duration::seconds(ABSORPTION_LOOKBACK_MAX))
            .iter()
            .map(|s| s.current_price)
            .collect();
        let absorptions =
            detect_absorptions(&self.tracker, &lookback, &recent_prices, current_price);

        self.tracker.update_statuses(current_price, now);
        self.tracker.gc(current_price, now);
        let key_levels = match mean_orders {
            Some(mean) => key_level_reports(&self.tracker, mean, now),
            None => Vec::new(),
        };

        let pressure = calculate_pressure(
            &self.buffer.slice_since(now - Duration::seconds(30)),
            &self.buffer.slice_since(now - Duration::seconds(60)),
            &self.buffer.slice_since(now - Duration::seconds(120)),
        );

        let transitioned = pressure.market_state != self.last_state;
        self.last_state = pressure.market_state;

        Some(Evaluation {
            time: current.time,
            current_price,
            key_levels,
            absorptions,
            pressure,
            transitioned,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use services_common::{DepthLevelMsg, DepthSnapshotMsg};

    fn push_snapshots(buffer: &RollingBuffer, base: DateTime<Utc>, n: usize, bid_orders: i64) {
        for i in 0..n {
            buffer.push(DepthSnapshotMsg {
                time: base + Duration::milliseconds(i as i64 * 200),
                current_price: 23450.0,
                best_bid: 23449.0,
                best_ask: 23451.0,
                spread: 2.0,
                top_bids: vec![DepthLevelMsg {
                    price: 23449.0,
                    qty: 10_000,
                    orders: bid_orders,
                }],
                top_asks: vec![DepthLevelMsg {
                    price: 23451.0,
                    qty: 10_000,
                    orders: 2_000,
                }],
            });
        }
    }

    #[test]
    fn evaluation_waits_for_warmup() {
        let buffer = Arc::new(RollingBuffer::default());
        let mut engine = SignalEngine::new(buffer.clone(), 0.05);
        let now = Utc::now();
        push_snapshots(&buffer, now, 10, 5_000);
        assert!(engine.evaluate(now).is_none());
    }

    #[test]
    fn transition_flag_fires_once_per_state_change() {
        let buffer = Arc::new(RollingBuffer::default());
        let mut engine = SignalEngine::new(buffer.clone(), 0.05);
        let t0 = Utc::now();
        push_snapshots(&buffer, t0 - Duration::seconds(30), 60, 5_000);

        let eval = engine.evaluate(t0).unwrap();
        // (5000 - 2000) / 7000 goes bullish from the initial neutral.
        assert_eq!(eval.pressure.market_state, MarketState::Bullish);
        assert_abs_diff_eq!(eval.pressure.pressure_60s, 0.429, epsilon = 1e-9);
        assert!(eval.transitioned);

        let eval = engine.evaluate(t0 + Duration::seconds(10)).unwrap();
        assert_eq!(eval.pressure.market_state, MarketState::Bullish);
        assert!(!eval.transitioned);
    }
}
