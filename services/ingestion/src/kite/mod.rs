//! Kite market-feed protocol, selected with `DATA_SOURCE=kite`.
//!
//! Unlike the Dhan feed this protocol is big-endian, frames several
//! packets per message behind a count/length preamble, and quotes prices
//! in paise. Ticks arrive already keyed by `instrument_token`, so they
//! bypass the merger and go straight to enrichment.

pub mod parser;
pub mod websocket;

pub use parser::{parse_packet, split_packets, KiteMode, KiteTick};
pub use websocket::{KiteFeedConfig, KiteWebSocketFeed};
