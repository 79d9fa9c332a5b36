//! Depth signal generator
//!
//! Consumes the compact depth snapshots published by the collector,
//! keeps a rolling two-minute window per symbol, and every ten seconds
//! derives three microstructure metrics: key price levels with a tracked
//! lifecycle, order absorptions at those levels, and directional
//! pressure over three windows. Each evaluation persists one
//! `depth_signals` row, refreshes the real-time state key, and pushes
//! filtered, deduplicated events to the notification webhook.

pub mod alerts;
pub mod analyzer;
pub mod buffer;
pub mod metrics;
pub mod persistence;
pub mod service;
pub mod subscriber;
pub mod tracking;

pub use service::run;
