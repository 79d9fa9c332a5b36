//! Dhan market-feed protocol: binary frame decoding and the WebSocket
//! transport that speaks it.

pub mod parser;
pub mod websocket;

pub use parser::{parse_packet, split_frames, DecodeError, FrameHeader, TickPacket};
pub use websocket::{
    build_subscription_messages, DhanFeedConfig, DhanWebSocketFeed, SubscriptionEntry,
    SubscriptionMode, MAX_INSTRUMENTS_PER_MESSAGE,
};
