//! 200-level depth collector
//!
//! A dedicated WebSocket delivers the full book as two frames per
//! snapshot (bid side, ask side). Every level of a completed snapshot is
//! persisted to `depth_levels_200`, and a compact top-20 view is
//! published on the cache channel for the signal analyzer. One symbol per
//! process instance.

pub mod assembler;
pub mod parser;
pub mod persistence;
pub mod publisher;
pub mod websocket;

pub use websocket::run;
