//! Tick-feed ingestion pipeline
//!
//! Transport → decoder → merger → enricher → bus publisher, each stage
//! joined by a bounded channel so a slow bus backpressures all the way to
//! the WebSocket reads. The Dhan feed is the default; `DATA_SOURCE=kite`
//! switches to the Kite binary protocol.

pub mod dhan;
pub mod enricher;
pub mod kite;
pub mod merger;
pub mod pipeline;
pub mod publisher;

pub use pipeline::{run, PipelineCounters};
