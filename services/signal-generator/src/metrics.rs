//! Metric computation
//!
//! Three metrics per evaluation, all derived from the current snapshot
//! and the rolling buffer: key levels (order concentrations vs. the mean
//! of nearby levels), absorptions (sharp order reduction at a tracked
//! level, with or without a breakthrough), and directional pressure over
//! 30/60/120-second windows.

use serde::Serialize;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use services_common::{DepthLevelMsg, DepthSnapshotMsg};

use crate::tracking::{LevelSide, LevelStatus, LevelTracker};

/// Candidate threshold: orders at a level vs. mean orders per level.
pub const LEVEL_DETECTION_RATIO: f64 = 2.5;
/// Only levels within this many price units of mid are considered.
pub const LEVEL_WINDOW: f64 = 100.0;
/// Order reduction that qualifies as absorption.
pub const ABSORPTION_REDUCTION_RATIO: f64 = 0.60;
/// Absorption lookback bounds, seconds before now.
pub const ABSORPTION_LOOKBACK_MAX: i64 = 60;
pub const ABSORPTION_LOOKBACK_MIN: i64 = 30;
/// Levels per side feeding the pressure ratio.
pub const PRESSURE_TOP_LEVELS: usize = 20;
/// Primary-window threshold separating bullish/bearish from neutral.
pub const PRESSURE_STATE_THRESHOLD: f64 = 0.3;

/// One key level as persisted and alerted.
#[derive(Debug, Clone, Serialize)]
pub struct KeyLevelReport {
    pub price: f64,
    pub side: LevelSide,
    pub orders: i64,
    pub strength_ratio: f64,
    pub age_seconds: i64,
    pub status: LevelStatus,
    pub tests: u32,
}

/// One absorption event.
#[derive(Debug, Clone, Serialize)]
pub struct AbsorptionReport {
    pub price: f64,
    pub side: LevelSide,
    pub orders_before: i64,
    pub orders_now: i64,
    pub reduction_pct: f64,
    pub breakthrough: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketState {
    Bullish,
    Bearish,
    Neutral,
}

impl MarketState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bullish => "bullish",
            Self::Bearish => "bearish",
            Self::Neutral => "neutral",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PressureReport {
    pub pressure_30s: f64,
    pub pressure_60s: f64,
    pub pressure_120s: f64,
    pub market_state: MarketState,
}

/// Metric (a), step one: find order concentrations near mid and record
/// them on the tracker. Returns the mean orders per in-window level, the
/// baseline for strength ratios. Lifecycle transitions run separately so
/// absorption detection can still see pre-crossing statuses.
pub fn observe_candidates(
    snapshot: &DepthSnapshotMsg,
    tracker: &mut LevelTracker,
    now: DateTime<Utc>,
) -> Option<f64> {
    let mid = snapshot.mid();
    let in_window = |level: &&DepthLevelMsg| {
        (level.price - mid).abs() <= LEVEL_WINDOW && level.orders > 0
    };

    let window_orders: Vec<i64> = snapshot
        .top_bids
        .iter()
        .filter(in_window)
        .chain(snapshot.top_asks.iter().filter(in_window))
        .map(|level| level.orders)
        .collect();
    if window_orders.is_empty() {
        return None;
    }
    let mean_orders = window_orders.iter().sum::<i64>() as f64 / window_orders.len() as f64;
    if mean_orders <= 0.0 {
        return None;
    }
    let threshold = LEVEL_DETECTION_RATIO * mean_orders;

    for level in snapshot.top_bids.iter().filter(in_window) {
        if level.orders as f64 >= threshold {
            tracker.observe(level.price, LevelSide::Support, level.orders, now);
        }
    }
    for level in snapshot.top_asks.iter().filter(in_window) {
        if level.orders as f64 >= threshold {
            tracker.observe(level.price, LevelSide::Resistance, level.orders, now);
        }
    }
    Some(mean_orders)
}

/// Metric (a), step two: report every tracked level still forming,
/// active, or breaking, with strength against the current baseline.
pub fn key_level_reports(
    tracker: &LevelTracker,
    mean_orders: f64,
    now: DateTime<Utc>,
) -> Vec<KeyLevelReport> {
    if mean_orders <= 0.0 {
        return Vec::new();
    }
    tracker
        .levels()
        .iter()
        .filter(|level| level.status != LevelStatus::Broken)
        .map(|level| KeyLevelReport {
            price: level.price,
            side: level.side,
            orders: level.current_orders,
            strength_ratio: level.current_orders as f64 / mean_orders,
            age_seconds: level.age_seconds(now),
            status: level.status,
            tests: level.tests,
        })
        .collect()
}

/// Metric (b): for active or breaking levels, compare current orders with
/// the count observed 30–60 s back. A ≥60 % reduction is an absorption;
/// it is a breakthrough when price crossed the level inside the window,
/// otherwise a cancellation (orders pulled without a touch).
pub fn detect_absorptions(
    tracker: &LevelTracker,
    lookback: &[Arc<DepthSnapshotMsg>],
    recent_prices: &[f64],
    current_price: f64,
) -> Vec<AbsorptionReport> {
    let mut reports = Vec::new();
    for level in tracker.levels() {
        if !matches!(level.status, LevelStatus::Active | LevelStatus::Breaking) {
            continue;
        }
        let Some(orders_before) = orders_at_price(lookback, level.price) else {
            continue;
        };
        if orders_before <= 0 {
            continue;
        }
        let orders_now = level.current_orders;
        let reduction = (orders_before - orders_now) as f64 / orders_before as f64;
        if reduction < ABSORPTION_REDUCTION_RATIO {
            continue;
        }

        let crossed_in_window = recent_prices
            .iter()
            .chain(std::iter::once(&current_price))
            .any(|&price| match level.side {
                LevelSide::Resistance => price > level.price,
                LevelSide::Support => price < level.price,
            });

        reports.push(AbsorptionReport {
            price: level.price,
            side: level.side,
            orders_before,
            orders_now,
            reduction_pct: (reduction * 100.0).round(),
            breakthrough: crossed_in_window,
        });
    }
    reports
}

/// Order count at a price in the oldest lookback snapshot quoting it.
fn orders_at_price(snapshots: &[Arc<DepthSnapshotMsg>], price: f64) -> Option<i64> {
    const PRICE_TOLERANCE: f64 = 0.5;
    for snapshot in snapshots {
        let hit = snapshot
            .top_bids
            .iter()
            .chain(snapshot.top_asks.iter())
            .find(|level| (level.price - price).abs() <= PRICE_TOLERANCE);
        if let Some(level) = hit {
            return Some(level.orders);
        }
    }
    None
}

/// Metric (c): mean per-snapshot order imbalance over each window,
/// restricted to the top 20 levels per side, clamped to [-1, 1].
pub fn calculate_pressure(
    window_30s: &[Arc<DepthSnapshotMsg>],
    window_60s: &[Arc<DepthSnapshotMsg>],
    window_120s: &[Arc<DepthSnapshotMsg>],
) -> PressureReport {
    let pressure_30s = window_pressure(window_30s);
    let pressure_60s = window_pressure(window_60s);
    let pressure_120s = window_pressure(window_120s);

    let market_state = if pressure_60s > PRESSURE_STATE_THRESHOLD {
        MarketState::Bullish
    } else if pressure_60s < -PRESSURE_STATE_THRESHOLD {
        MarketState::Bearish
    } else {
        MarketState::Neutral
    };

    PressureReport {
        pressure_30s,
        pressure_60s,
        pressure_120s,
        market_state,
    }
}

fn window_pressure(snapshots: &[Arc<DepthSnapshotMsg>]) -> f64 {
    let ratios: Vec<f64> = snapshots
        .iter()
        .filter_map(|snapshot| {
            let bids: i64 = snapshot
                .top_bids
                .iter()
                .take(PRESSURE_TOP_LEVELS)
                .map(|l| l.orders)
                .sum();
            let asks: i64 = snapshot
                .top_asks
                .iter()
                .take(PRESSURE_TOP_LEVELS)
                .map(|l| l.orders)
                .sum();
            let total = bids + asks;
            (total > 0).then(|| (bids - asks) as f64 / total as f64)
        })
        .collect();
    if ratios.is_empty() {
        return 0.0;
    }
    let mean = ratios.iter().sum::<f64>() / ratios.len() as f64;
    round3(mean.clamp(-1.0, 1.0))
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use chrono::Duration;

    fn level(price: f64, orders: i64) -> DepthLevelMsg {
        DepthLevelMsg {
            price,
            qty: 10_000,
            orders,
        }
    }

    fn snapshot_with_orders(
        time: DateTime<Utc>,
        price: f64,
        bid_orders: i64,
        ask_orders: i64,
    ) -> DepthSnapshotMsg {
        DepthSnapshotMsg {
            time,
            current_price: price,
            best_bid: price - 1.0,
            best_ask: price + 1.0,
            spread: 2.0,
            top_bids: vec![level(price - 1.0, bid_orders)],
            top_asks: vec![level(price + 1.0, ask_orders)],
        }
    }

    /// Mean 200 with a 520-order standout: four 120-order levels plus the
    /// candidate sum to 1000 over five levels.
    fn key_level_snapshot(time: DateTime<Utc>) -> DepthSnapshotMsg {
        DepthSnapshotMsg {
            time,
            current_price: 23460.0,
            best_bid: 23459.0,
            best_ask: 23461.0,
            spread: 2.0,
            top_bids: vec![
                level(23450.0, 520),
                level(23449.0, 120),
                level(23448.0, 120),
            ],
            top_asks: vec![level(23470.0, 120), level(23471.0, 120)],
        }
    }

    fn run_key_levels(
        snapshot: &DepthSnapshotMsg,
        tracker: &mut LevelTracker,
        now: DateTime<Utc>,
    ) -> Vec<KeyLevelReport> {
        let Some(mean) = observe_candidates(snapshot, tracker, now) else {
            return Vec::new();
        };
        tracker.update_statuses(snapshot.current_price, now);
        tracker.gc(snapshot.current_price, now);
        key_level_reports(tracker, mean, now)
    }

    #[test]
    fn standout_level_is_detected_and_activates() {
        let t0 = Utc::now();
        let mut tracker = LevelTracker::new(0.05);

        let reports = run_key_levels(&key_level_snapshot(t0), &mut tracker, t0);
        assert_eq!(reports.len(), 1);
        assert_abs_diff_eq!(reports[0].price, 23450.0, epsilon = 1e-9);
        assert_eq!(reports[0].status, LevelStatus::Forming);

        // Persisted eight seconds: active at strength 2.6, no broken state.
        let t1 = t0 + Duration::seconds(8);
        let reports = run_key_levels(&key_level_snapshot(t1), &mut tracker, t1);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].status, LevelStatus::Active);
        assert_eq!(reports[0].side, LevelSide::Support);
        assert_eq!(reports[0].orders, 520);
        assert_abs_diff_eq!(reports[0].strength_ratio, 2.6, epsilon = 1e-9);
        assert_eq!(reports[0].age_seconds, 8);
    }

    #[test]
    fn levels_outside_the_hundred_point_window_are_ignored() {
        let t0 = Utc::now();
        let mut tracker = LevelTracker::new(0.05);
        let mut snapshot = key_level_snapshot(t0);
        // Push the standout 150 points below mid.
        snapshot.top_bids[0] = level(23310.0, 520);
        let reports = run_key_levels(&snapshot, &mut tracker, t0);
        assert!(reports.is_empty());
    }

    #[test]
    fn absorption_with_breakthrough_reports_reduction() {
        let t0 = Utc::now();
        let mut tracker = LevelTracker::new(0.05);
        tracker.observe(23500.0, LevelSide::Resistance, 3200, t0);
        let t1 = t0 + Duration::seconds(40);
        tracker.observe(23500.0, LevelSide::Resistance, 704, t1);
        tracker.update_statuses(23480.0, t1); // active, not yet crossed

        let lookback = vec![Arc::new(DepthSnapshotMsg {
            time: t0,
            current_price: 23490.0,
            best_bid: 23489.0,
            best_ask: 23491.0,
            spread: 2.0,
            top_bids: Vec::new(),
            top_asks: vec![level(23500.0, 3200)],
        })];

        let reports =
            detect_absorptions(&tracker, &lookback, &[23490.0, 23505.0], 23512.0);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].orders_before, 3200);
        assert_eq!(reports[0].orders_now, 704);
        assert_abs_diff_eq!(reports[0].reduction_pct, 78.0, epsilon = 1e-9);
        assert!(reports[0].breakthrough);
    }

    #[test]
    fn order_pull_without_touch_is_a_cancellation() {
        let t0 = Utc::now();
        let mut tracker = LevelTracker::new(0.05);
        tracker.observe(23500.0, LevelSide::Resistance, 3200, t0);
        let t1 = t0 + Duration::seconds(40);
        tracker.observe(23500.0, LevelSide::Resistance, 900, t1);
        tracker.update_statuses(23470.0, t1);

        let lookback = vec![Arc::new(DepthSnapshotMsg {
            time: t0,
            current_price: 23470.0,
            best_bid: 23469.0,
            best_ask: 23471.0,
            spread: 2.0,
            top_bids: Vec::new(),
            top_asks: vec![level(23500.0, 3200)],
        })];

        let reports = detect_absorptions(&tracker, &lookback, &[23470.0, 23472.0], 23471.0);
        assert_eq!(reports.len(), 1);
        assert!(!reports[0].breakthrough);
    }

    #[test]
    fn small_reductions_do_not_qualify() {
        let t0 = Utc::now();
        let mut tracker = LevelTracker::new(0.05);
        tracker.observe(23500.0, LevelSide::Resistance, 3200, t0);
        let t1 = t0 + Duration::seconds(40);
        tracker.observe(23500.0, LevelSide::Resistance, 2000, t1);
        tracker.update_statuses(23480.0, t1);

        let lookback = vec![Arc::new(DepthSnapshotMsg {
            time: t0,
            current_price: 23490.0,
            best_bid: 23489.0,
            best_ask: 23491.0,
            spread: 2.0,
            top_bids: Vec::new(),
            top_asks: vec![level(23500.0, 3200)],
        })];
        let reports = detect_absorptions(&tracker, &lookback, &[23490.0], 23490.0);
        assert!(reports.is_empty());
    }

    #[test]
    fn pressure_reflects_top_twenty_order_imbalance() {
        let t0 = Utc::now();
        let window: Vec<Arc<DepthSnapshotMsg>> = (0..10)
            .map(|i| {
                Arc::new(snapshot_with_orders(
                    t0 + Duration::seconds(i),
                    23450.0,
                    4300,
                    2200,
                ))
            })
            .collect();
        let report = calculate_pressure(&window, &window, &window);
        // (4300 - 2200) / 6500 = 0.323: bullish, but short of the 0.4
        // alert bar.
        assert_abs_diff_eq!(report.pressure_60s, 0.323, epsilon = 1e-9);
        assert_eq!(report.market_state, MarketState::Bullish);

        let strong: Vec<Arc<DepthSnapshotMsg>> = (0..10)
            .map(|i| {
                Arc::new(snapshot_with_orders(
                    t0 + Duration::seconds(i),
                    23450.0,
                    5000,
                    2000,
                ))
            })
            .collect();
        let report = calculate_pressure(&strong, &strong, &strong);
        assert_abs_diff_eq!(report.pressure_60s, 0.429, epsilon = 1e-9);
    }

    #[test]
    fn pressure_is_clamped_and_neutral_when_empty() {
        let t0 = Utc::now();
        let one_sided: Vec<Arc<DepthSnapshotMsg>> = vec![Arc::new(snapshot_with_orders(
            t0, 23450.0, 5000, 0,
        ))];
        let report = calculate_pressure(&one_sided, &one_sided, &one_sided);
        assert_abs_diff_eq!(report.pressure_60s, 1.0, epsilon = 1e-9);

        let report = calculate_pressure(&[], &[], &[]);
        assert_abs_diff_eq!(report.pressure_60s, 0.0, epsilon = 1e-9);
        assert_eq!(report.market_state, MarketState::Neutral);
    }

    #[test]
    fn bearish_state_below_negative_threshold() {
        let t0 = Utc::now();
        let window: Vec<Arc<DepthSnapshotMsg>> = vec![Arc::new(snapshot_with_orders(
            t0, 23450.0, 2000, 5000,
        ))];
        let report = calculate_pressure(&window, &window, &window);
        assert_eq!(report.market_state, MarketState::Bearish);
    }
}
