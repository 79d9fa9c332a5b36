//! Shared building blocks for the market-data pipeline services
//!
//! Each service binary (ingestion, tick-writer, depth-collector,
//! signal-generator) composes the pieces here: the instrument cache,
//! normalized tick types and their bus wire codec, environment-driven
//! configuration, feed credentials, and the Redis health reporter.

pub mod config;
pub mod credentials;
pub mod errors;
pub mod health;
pub mod instruments;
pub mod schema;
pub mod segments;
pub mod shutdown;
pub mod types;

pub use config::DataSource;
pub use errors::{ConfigError, FeedError, WireError};
pub use instruments::{Instrument, InstrumentCache};
pub use segments::ExchangeSegment;
pub use types::{
    decode_wire, encode_wire, ist_offset, DepthLevelMsg, DepthLevelQuote, DepthSnapshotMsg,
    EnrichedTick, NormalizedTick, WIRE_VERSION,
};
