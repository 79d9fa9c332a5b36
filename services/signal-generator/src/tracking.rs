//! Tracked level lifecycle
//!
//! A level that concentrates enough resting orders gets a `TrackedLevel`
//! and moves through forming → active → breaking → broken. Transitions:
//! active after persisting five seconds, breaking when orders fall 60 %
//! from peak, broken on a confirmed price crossing, garbage-collected a
//! minute after breaking down. The analyzer is the single writer, so no
//! locking here.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Seconds a level must persist before it counts as active.
pub const ACTIVATION_AGE_SECONDS: i64 = 5;
/// Order-count drop from peak that flips a level to breaking.
pub const BREAKING_DROP_RATIO: f64 = 0.60;
/// Price proximity, in price units, that counts as a test.
pub const TEST_PROXIMITY: f64 = 5.0;
/// Broken levels linger this long before collection.
pub const BROKEN_RETENTION_SECONDS: i64 = 60;
/// Levels this far from the market are abandoned.
const MAX_TRACKING_DISTANCE: f64 = 150.0;
/// Levels unseen in the book for this long are abandoned.
const UNSEEN_RETENTION_SECONDS: i64 = 180;

/// Which side of the market the level defends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LevelSide {
    Support,
    Resistance,
}

impl LevelSide {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Support => "support",
            Self::Resistance => "resistance",
        }
    }

    /// The book side the resting orders sit on.
    pub fn book_side(self) -> &'static str {
        match self {
            Self::Support => "bid",
            Self::Resistance => "ask",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LevelStatus {
    Forming,
    Active,
    Breaking,
    Broken,
}

impl LevelStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Forming => "forming",
            Self::Active => "active",
            Self::Breaking => "breaking",
            Self::Broken => "broken",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrackedLevel {
    pub price: f64,
    pub side: LevelSide,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub peak_orders: i64,
    pub current_orders: i64,
    pub status: LevelStatus,
    pub tests: u32,
    pub broken_at: Option<DateTime<Utc>>,
}

impl TrackedLevel {
    fn new(price: f64, side: LevelSide, orders: i64, now: DateTime<Utc>) -> Self {
        Self {
            price,
            side,
            first_seen: now,
            last_seen: now,
            peak_orders: orders,
            current_orders: orders,
            status: LevelStatus::Forming,
            tests: 0,
            broken_at: None,
        }
    }

    pub fn age_seconds(&self, now: DateTime<Utc>) -> i64 {
        now.signed_duration_since(self.first_seen).num_seconds()
    }

    fn observe(&mut self, orders: i64, now: DateTime<Utc>) {
        self.current_orders = orders;
        self.peak_orders = self.peak_orders.max(orders);
        self.last_seen = now;
    }

    fn crossed_by(&self, price: f64) -> bool {
        match self.side {
            LevelSide::Resistance => price > self.price,
            LevelSide::Support => price < self.price,
        }
    }

    fn update_status(&mut self, current_price: f64, now: DateTime<Utc>) {
        if self.status == LevelStatus::Broken {
            return;
        }

        if self.crossed_by(current_price) {
            self.status = LevelStatus::Broken;
            self.broken_at = Some(now);
            return;
        }

        if (current_price - self.price).abs() <= TEST_PROXIMITY {
            self.tests += 1;
        }

        let dropped = self.peak_orders > 0
            && (self.peak_orders - self.current_orders) as f64
                >= BREAKING_DROP_RATIO * self.peak_orders as f64;
        if dropped && self.status != LevelStatus::Forming {
            self.status = LevelStatus::Breaking;
        } else if self.age_seconds(now) >= ACTIVATION_AGE_SECONDS
            && self.status == LevelStatus::Forming
        {
            self.status = LevelStatus::Active;
        }
    }
}

/// All tracked levels for one symbol. Matching is by price to one tick.
pub struct LevelTracker {
    tick_size: f64,
    levels: Vec<TrackedLevel>,
}

impl LevelTracker {
    pub fn new(tick_size: f64) -> Self {
        Self {
            tick_size: tick_size.max(f64::EPSILON),
            levels: Vec::new(),
        }
    }

    /// Record that a candidate level was seen with this many orders.
    pub fn observe(&mut self, price: f64, side: LevelSide, orders: i64, now: DateTime<Utc>) {
        let tick = self.tick_size;
        match self
            .levels
            .iter_mut()
            .find(|l| (l.price - price).abs() <= tick && l.side == side)
        {
            Some(level) => level.observe(orders, now),
            None => self.levels.push(TrackedLevel::new(price, side, orders, now)),
        }
    }

    /// Run lifecycle transitions against the current market price.
    pub fn update_statuses(&mut self, current_price: f64, now: DateTime<Utc>) {
        for level in &mut self.levels {
            level.update_status(current_price, now);
        }
    }

    /// Drop levels that no longer matter: broken past retention, drifted
    /// out of range, or absent from the book too long.
    pub fn gc(&mut self, current_price: f64, now: DateTime<Utc>) {
        self.levels.retain(|level| {
            if let Some(broken_at) = level.broken_at {
                if now.signed_duration_since(broken_at).num_seconds() >= BROKEN_RETENTION_SECONDS {
                    return false;
                }
            }
            if (level.price - current_price).abs() > MAX_TRACKING_DISTANCE {
                return false;
            }
            now.signed_duration_since(level.last_seen).num_seconds() < UNSEEN_RETENTION_SECONDS
        });
    }

    pub fn levels(&self) -> &[TrackedLevel] {
        &self.levels
    }

    pub fn find(&self, price: f64, side: LevelSide) -> Option<&TrackedLevel> {
        self.levels
            .iter()
            .find(|l| (l.price - price).abs() <= self.tick_size && l.side == side)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn level_activates_after_five_seconds() {
        let t0 = Utc::now();
        let mut tracker = LevelTracker::new(0.05);
        tracker.observe(23450.0, LevelSide::Support, 520, t0);
        tracker.update_statuses(23460.0, t0);
        assert_eq!(tracker.levels()[0].status, LevelStatus::Forming);

        let t1 = t0 + Duration::seconds(8);
        tracker.observe(23450.0, LevelSide::Support, 530, t1);
        tracker.update_statuses(23460.0, t1);
        assert_eq!(tracker.levels()[0].status, LevelStatus::Active);
    }

    #[test]
    fn sixty_percent_order_drop_marks_breaking() {
        let t0 = Utc::now();
        let mut tracker = LevelTracker::new(0.05);
        tracker.observe(23500.0, LevelSide::Resistance, 3200, t0);
        let t1 = t0 + Duration::seconds(10);
        tracker.observe(23500.0, LevelSide::Resistance, 3200, t1);
        tracker.update_statuses(23480.0, t1);
        assert_eq!(tracker.levels()[0].status, LevelStatus::Active);

        let t2 = t0 + Duration::seconds(20);
        tracker.observe(23500.0, LevelSide::Resistance, 1200, t2);
        tracker.update_statuses(23480.0, t2);
        assert_eq!(tracker.levels()[0].status, LevelStatus::Breaking);
    }

    #[test]
    fn crossing_breaks_resistance_from_below() {
        let t0 = Utc::now();
        let mut tracker = LevelTracker::new(0.05);
        tracker.observe(23500.0, LevelSide::Resistance, 3200, t0);
        let t1 = t0 + Duration::seconds(10);
        tracker.observe(23500.0, LevelSide::Resistance, 704, t1);
        tracker.update_statuses(23512.0, t1);
        assert_eq!(tracker.levels()[0].status, LevelStatus::Broken);
        assert!(tracker.levels()[0].broken_at.is_some());
    }

    #[test]
    fn tests_count_approaches_without_crossing() {
        let t0 = Utc::now();
        let mut tracker = LevelTracker::new(0.05);
        tracker.observe(23450.0, LevelSide::Support, 520, t0);
        tracker.update_statuses(23453.0, t0); // within 5 units, above support
        tracker.update_statuses(23470.0, t0); // far away
        tracker.update_statuses(23451.0, t0); // close again
        assert_eq!(tracker.levels()[0].tests, 2);
        assert_ne!(tracker.levels()[0].status, LevelStatus::Broken);
    }

    #[test]
    fn broken_levels_are_collected_after_a_minute() {
        let t0 = Utc::now();
        let mut tracker = LevelTracker::new(0.05);
        tracker.observe(23500.0, LevelSide::Resistance, 3200, t0);
        tracker.update_statuses(23512.0, t0);
        assert_eq!(tracker.levels()[0].status, LevelStatus::Broken);

        tracker.gc(23512.0, t0 + Duration::seconds(30));
        assert_eq!(tracker.levels().len(), 1);
        tracker.gc(23512.0, t0 + Duration::seconds(61));
        assert!(tracker.levels().is_empty());
    }

    #[test]
    fn far_away_levels_are_abandoned() {
        let t0 = Utc::now();
        let mut tracker = LevelTracker::new(0.05);
        tracker.observe(23450.0, LevelSide::Support, 520, t0);
        tracker.gc(23700.0, t0);
        assert!(tracker.levels().is_empty());
    }

    #[test]
    fn levels_match_by_price_within_one_tick() {
        let t0 = Utc::now();
        let mut tracker = LevelTracker::new(0.05);
        tracker.observe(23450.00, LevelSide::Support, 520, t0);
        tracker.observe(23450.05, LevelSide::Support, 540, t0);
        assert_eq!(tracker.levels().len(), 1);
        assert_eq!(tracker.levels()[0].current_orders, 540);
        tracker.observe(23450.20, LevelSide::Support, 100, t0);
        assert_eq!(tracker.levels().len(), 2);
    }
}
