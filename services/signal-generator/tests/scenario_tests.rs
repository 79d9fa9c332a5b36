//! Analyzer scenarios over synthetic depth streams

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

use approx::assert_abs_diff_eq;
use signal_generator::analyzer::SignalEngine;
use signal_generator::buffer::RollingBuffer;
use signal_generator::metrics::MarketState;
use signal_generator::tracking::{LevelSide, LevelStatus};
use services_common::{DepthLevelMsg, DepthSnapshotMsg};

fn level(price: f64, orders: i64) -> DepthLevelMsg {
    DepthLevelMsg {
        price,
        qty: 20_000,
        orders,
    }
}

/// Book with a resistance wall at 23500 and four plain levels per side.
fn wall_snapshot(time: DateTime<Utc>, price: f64, wall_orders: i64) -> DepthSnapshotMsg {
    DepthSnapshotMsg {
        time,
        current_price: price,
        best_bid: price - 1.0,
        best_ask: price + 1.0,
        spread: 2.0,
        top_bids: vec![
            level(price - 1.0, 120),
            level(price - 2.0, 120),
            level(price - 3.0, 120),
            level(price - 4.0, 120),
        ],
        top_asks: vec![
            level(23500.0, wall_orders),
            level(price + 2.0, 120),
            level(price + 3.0, 120),
            level(price + 4.0, 120),
        ],
    }
}

fn balanced_snapshot(time: DateTime<Utc>, bid_orders: i64, ask_orders: i64) -> DepthSnapshotMsg {
    DepthSnapshotMsg {
        time,
        current_price: 23450.0,
        best_bid: 23449.0,
        best_ask: 23451.0,
        spread: 2.0,
        top_bids: vec![level(23449.0, bid_orders)],
        top_asks: vec![level(23451.0, ask_orders)],
    }
}

#[test]
fn resistance_wall_is_tracked_through_activation() {
    let buffer = Arc::new(RollingBuffer::default());
    let mut engine = SignalEngine::new(buffer.clone(), 0.05);
    let t0 = Utc::now();

    for i in 0..=35 {
        buffer.push(wall_snapshot(t0 + Duration::seconds(i), 23480.0, 3200));
    }
    let eval = engine.evaluate(t0 + Duration::seconds(35)).unwrap();
    let wall = eval
        .key_levels
        .iter()
        .find(|l| (l.price - 23500.0).abs() < 0.1)
        .expect("wall detected");
    assert_eq!(wall.side, LevelSide::Resistance);
    assert_eq!(wall.status, LevelStatus::Forming);
    assert_eq!(wall.orders, 3200);

    for i in 36..=45 {
        buffer.push(wall_snapshot(t0 + Duration::seconds(i), 23480.0, 3200));
    }
    let eval = engine.evaluate(t0 + Duration::seconds(45)).unwrap();
    let wall = eval
        .key_levels
        .iter()
        .find(|l| (l.price - 23500.0).abs() < 0.1)
        .expect("wall still tracked");
    assert_eq!(wall.status, LevelStatus::Active);
    assert_eq!(wall.age_seconds, 10);
}

#[test]
fn absorption_breakthrough_fires_when_the_wall_collapses() {
    let buffer = Arc::new(RollingBuffer::default());
    let mut engine = SignalEngine::new(buffer.clone(), 0.05);
    let t0 = Utc::now();

    // The wall holds at 3200 orders while price sits below it.
    for i in 0..=35 {
        buffer.push(wall_snapshot(t0 + Duration::seconds(i), 23480.0, 3200));
    }
    engine.evaluate(t0 + Duration::seconds(35)).unwrap();
    for i in 36..=59 {
        buffer.push(wall_snapshot(t0 + Duration::seconds(i), 23480.0, 3200));
    }
    engine.evaluate(t0 + Duration::seconds(45)).unwrap();

    // Then collapses to 704 orders as price punches through.
    for i in 60..=70 {
        buffer.push(wall_snapshot(t0 + Duration::seconds(i), 23512.0, 704));
    }
    let eval = engine.evaluate(t0 + Duration::seconds(70)).unwrap();

    assert_eq!(eval.absorptions.len(), 1);
    let absorption = &eval.absorptions[0];
    assert_abs_diff_eq!(absorption.price, 23500.0, epsilon = 1e-9);
    assert_eq!(absorption.side, LevelSide::Resistance);
    assert_eq!(absorption.orders_before, 3200);
    assert_eq!(absorption.orders_now, 704);
    assert_abs_diff_eq!(absorption.reduction_pct, 78.0, epsilon = 1e-9);
    assert!(absorption.breakthrough);

    // The crossing retires the level from the key-level output.
    assert!(!eval
        .key_levels
        .iter()
        .any(|l| (l.price - 23500.0).abs() < 0.1));
}

#[test]
fn pressure_transition_classifies_market_state() {
    let buffer = Arc::new(RollingBuffer::default());
    let mut engine = SignalEngine::new(buffer.clone(), 0.05);
    let t0 = Utc::now();

    // Balanced book: neutral baseline.
    for i in 0..60 {
        buffer.push(balanced_snapshot(t0 + Duration::seconds(i), 3000, 3000));
    }
    let eval = engine.evaluate(t0 + Duration::seconds(59)).unwrap();
    assert_eq!(eval.pressure.market_state, MarketState::Neutral);
    assert_abs_diff_eq!(eval.pressure.pressure_60s, 0.0, epsilon = 1e-9);

    // Bids lean in hard over the next minute.
    for i in 60..180 {
        buffer.push(balanced_snapshot(t0 + Duration::seconds(i), 5000, 2000));
    }
    let eval = engine.evaluate(t0 + Duration::seconds(179)).unwrap();
    assert_eq!(eval.pressure.market_state, MarketState::Bullish);
    assert!(eval.transitioned);
    assert_abs_diff_eq!(eval.pressure.pressure_60s, 0.429, epsilon = 1e-9);
    for pressure in [
        eval.pressure.pressure_30s,
        eval.pressure.pressure_60s,
        eval.pressure.pressure_120s,
    ] {
        assert!((-1.0..=1.0).contains(&pressure));
    }

    // Same lean next cycle: state holds, no new transition.
    for i in 180..190 {
        buffer.push(balanced_snapshot(t0 + Duration::seconds(i), 5000, 2000));
    }
    let eval = engine.evaluate(t0 + Duration::seconds(189)).unwrap();
    assert_eq!(eval.pressure.market_state, MarketState::Bullish);
    assert!(!eval.transitioned);
}
