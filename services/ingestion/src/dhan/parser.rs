//! Binary packet decoding for the Dhan live market feed
//!
//! All integers and price floats are little-endian. Every frame starts
//! with the 8-byte response header; the one-byte response code selects the
//! payload layout. Zero or negative wire values mean "not provided" and
//! decode to `None`.
//!
//! Decoding is a pure function of the frame bytes: identical input always
//! yields the identical record, and a malformed frame yields a typed
//! error for the caller to count and drop, never a torn-down connection.

use byteorder::{LittleEndian, ReadBytesExt};
use chrono::{DateTime, Utc};
use std::io::Cursor;
use thiserror::Error;

use services_common::types::{epoch_to_utc, round2, DepthLevelQuote};
use services_common::ExchangeSegment;

pub const RESPONSE_INDEX: u8 = 1;
pub const RESPONSE_TICKER: u8 = 2;
pub const RESPONSE_QUOTE: u8 = 4;
pub const RESPONSE_OI: u8 = 5;
pub const RESPONSE_PREV_CLOSE: u8 = 6;
pub const RESPONSE_MARKET_STATUS: u8 = 7;
pub const RESPONSE_FULL: u8 = 8;
pub const RESPONSE_DISCONNECT: u8 = 50;

/// Frame sizes inclusive of the 8-byte header.
pub const HEADER_SIZE: usize = 8;
const INDEX_SIZE: usize = 16;
const TICKER_SIZE: usize = 16;
const QUOTE_SIZE: usize = 51;
const OI_SIZE: usize = 12;
const PREV_CLOSE_SIZE: usize = 16;
const FULL_SIZE: usize = 163;
const DISCONNECT_SIZE: usize = 10;

const DEPTH_LEVELS: usize = 5;
const DEPTH_LEVEL_SIZE: usize = 20;
const DEPTH_OFFSET: usize = 62;

/// Typed decode failures. These are counted and dropped by the transport.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame too short for code {code:?}: {actual} bytes, need {expected}")]
    TooShort {
        code: Option<u8>,
        expected: usize,
        actual: usize,
    },

    #[error("unknown response code {0}")]
    UnknownResponseCode(u8),

    #[error("truncated frame: {0}")]
    Truncated(#[from] std::io::Error),
}

/// Common 8-byte response header.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameHeader {
    pub response_code: u8,
    pub message_length: i16,
    pub segment_code: u8,
    pub segment: Option<ExchangeSegment>,
    pub security_id: String,
}

/// Quote-level trade fields shared by quote and full packets.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuoteFields {
    pub last_price: Option<f64>,
    pub last_traded_quantity: Option<i32>,
    pub last_trade_time: Option<DateTime<Utc>>,
    pub average_traded_price: Option<f64>,
    pub volume_traded: Option<i64>,
    pub total_sell_quantity: Option<i64>,
    pub total_buy_quantity: Option<i64>,
    pub day_open: Option<f64>,
    pub day_close: Option<f64>,
    pub day_high: Option<f64>,
    pub day_low: Option<f64>,
}

/// One 20-byte wire depth level carrying both sides.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PacketDepthLevel {
    pub bid: DepthLevelQuote,
    pub ask: DepthLevelQuote,
}

/// A decoded feed frame.
#[derive(Debug, Clone, PartialEq)]
pub enum TickPacket {
    Index {
        header: FrameHeader,
        value: Option<f64>,
        time: Option<DateTime<Utc>>,
    },
    Ticker {
        header: FrameHeader,
        last_price: Option<f64>,
        last_trade_time: Option<DateTime<Utc>>,
    },
    Quote {
        header: FrameHeader,
        fields: QuoteFields,
    },
    Oi {
        header: FrameHeader,
        oi: Option<i64>,
    },
    PrevClose {
        header: FrameHeader,
        prev_close: Option<f64>,
        prev_oi: Option<i64>,
    },
    /// Market status frames are acknowledged and otherwise ignored.
    MarketStatus { header: FrameHeader },
    Full {
        header: FrameHeader,
        fields: QuoteFields,
        oi: Option<i64>,
        oi_day_high: Option<i64>,
        oi_day_low: Option<i64>,
        depth: [PacketDepthLevel; 5],
    },
    Disconnect {
        header: FrameHeader,
        reason_code: i16,
    },
}

impl TickPacket {
    pub fn header(&self) -> &FrameHeader {
        match self {
            Self::Index { header, .. }
            | Self::Ticker { header, .. }
            | Self::Quote { header, .. }
            | Self::Oi { header, .. }
            | Self::PrevClose { header, .. }
            | Self::MarketStatus { header }
            | Self::Full { header, .. }
            | Self::Disconnect { header, .. } => header,
        }
    }
}

fn pos_price(v: f32) -> Option<f64> {
    (v > 0.0).then(|| round2(f64::from(v)))
}

fn pos_i16(v: i16) -> Option<i32> {
    (v > 0).then_some(i32::from(v))
}

fn pos_i32(v: i32) -> Option<i64> {
    (v > 0).then_some(i64::from(v))
}

fn ensure_len(data: &[u8], expected: usize, code: Option<u8>) -> Result<(), DecodeError> {
    if data.len() < expected {
        return Err(DecodeError::TooShort {
            code,
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

fn parse_header(cur: &mut Cursor<&[u8]>) -> Result<FrameHeader, DecodeError> {
    let response_code = cur.read_u8()?;
    let message_length = cur.read_i16::<LittleEndian>()?;
    let segment_code = cur.read_u8()?;
    let security_id = cur.read_i32::<LittleEndian>()?;
    Ok(FrameHeader {
        response_code,
        message_length,
        segment_code,
        segment: ExchangeSegment::from_code(segment_code),
        security_id: security_id.to_string(),
    })
}

fn parse_quote_fields(cur: &mut Cursor<&[u8]>) -> Result<QuoteFields, DecodeError> {
    let last_price = cur.read_f32::<LittleEndian>()?;
    let last_traded_qty = cur.read_i16::<LittleEndian>()?;
    let ltt_epoch = cur.read_i32::<LittleEndian>()?;
    let avg_price = cur.read_f32::<LittleEndian>()?;
    let volume = cur.read_i32::<LittleEndian>()?;
    let sell_qty = cur.read_i32::<LittleEndian>()?;
    let buy_qty = cur.read_i32::<LittleEndian>()?;
    Ok(QuoteFields {
        last_price: pos_price(last_price),
        last_traded_quantity: pos_i16(last_traded_qty),
        last_trade_time: epoch_to_utc(i64::from(ltt_epoch)),
        average_traded_price: pos_price(avg_price),
        volume_traded: pos_i32(volume),
        total_sell_quantity: pos_i32(sell_qty),
        total_buy_quantity: pos_i32(buy_qty),
        ..QuoteFields::default()
    })
}

fn parse_ohlc(cur: &mut Cursor<&[u8]>, fields: &mut QuoteFields) -> Result<(), DecodeError> {
    fields.day_open = pos_price(cur.read_f32::<LittleEndian>()?);
    fields.day_close = pos_price(cur.read_f32::<LittleEndian>()?);
    fields.day_high = pos_price(cur.read_f32::<LittleEndian>()?);
    fields.day_low = pos_price(cur.read_f32::<LittleEndian>()?);
    Ok(())
}

fn parse_depth_level(cur: &mut Cursor<&[u8]>) -> Result<PacketDepthLevel, DecodeError> {
    let bid_qty = cur.read_i32::<LittleEndian>()?;
    let ask_qty = cur.read_i32::<LittleEndian>()?;
    let bid_orders = cur.read_i16::<LittleEndian>()?;
    let ask_orders = cur.read_i16::<LittleEndian>()?;
    let bid_price = cur.read_f32::<LittleEndian>()?;
    let ask_price = cur.read_f32::<LittleEndian>()?;
    Ok(PacketDepthLevel {
        bid: DepthLevelQuote {
            price: pos_price(bid_price),
            quantity: pos_i32(bid_qty),
            orders: pos_i16(bid_orders),
        },
        ask: DepthLevelQuote {
            price: pos_price(ask_price),
            quantity: pos_i32(ask_qty),
            orders: pos_i16(ask_orders),
        },
    })
}

/// Decode a single frame into a typed packet.
pub fn parse_packet(data: &[u8]) -> Result<TickPacket, DecodeError> {
    ensure_len(data, HEADER_SIZE, None)?;
    let mut cur = Cursor::new(data);
    let header = parse_header(&mut cur)?;
    let code = header.response_code;

    match code {
        RESPONSE_INDEX => {
            ensure_len(data, INDEX_SIZE, Some(code))?;
            let value = cur.read_f32::<LittleEndian>()?;
            let time_epoch = cur.read_i32::<LittleEndian>()?;
            Ok(TickPacket::Index {
                header,
                value: pos_price(value),
                time: epoch_to_utc(i64::from(time_epoch)),
            })
        }
        RESPONSE_TICKER => {
            ensure_len(data, TICKER_SIZE, Some(code))?;
            let last_price = cur.read_f32::<LittleEndian>()?;
            let ltt_epoch = cur.read_i32::<LittleEndian>()?;
            Ok(TickPacket::Ticker {
                header,
                last_price: pos_price(last_price),
                last_trade_time: epoch_to_utc(i64::from(ltt_epoch)),
            })
        }
        RESPONSE_QUOTE => {
            ensure_len(data, QUOTE_SIZE, Some(code))?;
            let mut fields = parse_quote_fields(&mut cur)?;
            parse_ohlc(&mut cur, &mut fields)?;
            Ok(TickPacket::Quote { header, fields })
        }
        RESPONSE_OI => {
            ensure_len(data, OI_SIZE, Some(code))?;
            let oi = cur.read_i32::<LittleEndian>()?;
            Ok(TickPacket::Oi {
                header,
                oi: pos_i32(oi),
            })
        }
        RESPONSE_PREV_CLOSE => {
            ensure_len(data, PREV_CLOSE_SIZE, Some(code))?;
            let prev_close = cur.read_f32::<LittleEndian>()?;
            let prev_oi = cur.read_i32::<LittleEndian>()?;
            Ok(TickPacket::PrevClose {
                header,
                prev_close: pos_price(prev_close),
                prev_oi: pos_i32(prev_oi),
            })
        }
        RESPONSE_MARKET_STATUS => Ok(TickPacket::MarketStatus { header }),
        RESPONSE_FULL => {
            ensure_len(data, FULL_SIZE, Some(code))?;
            let mut fields = parse_quote_fields(&mut cur)?;
            let oi = cur.read_i32::<LittleEndian>()?;
            let oi_high = cur.read_i32::<LittleEndian>()?;
            let oi_low = cur.read_i32::<LittleEndian>()?;
            parse_ohlc(&mut cur, &mut fields)?;

            debug_assert_eq!(cur.position() as usize, DEPTH_OFFSET);
            let mut depth = [PacketDepthLevel::default(); DEPTH_LEVELS];
            for level in &mut depth {
                *level = parse_depth_level(&mut cur)?;
            }
            debug_assert_eq!(
                cur.position() as usize,
                DEPTH_OFFSET + DEPTH_LEVELS * DEPTH_LEVEL_SIZE
            );

            Ok(TickPacket::Full {
                header,
                fields,
                oi: pos_i32(oi),
                oi_day_high: pos_i32(oi_high),
                oi_day_low: pos_i32(oi_low),
                depth,
            })
        }
        RESPONSE_DISCONNECT => {
            ensure_len(data, DISCONNECT_SIZE, Some(code))?;
            let reason_code = cur.read_i16::<LittleEndian>()?;
            Ok(TickPacket::Disconnect {
                header,
                reason_code,
            })
        }
        other => Err(DecodeError::UnknownResponseCode(other)),
    }
}

/// Split a WebSocket message into frames using the header's message
/// length. The server stacks frames in one message during bursts; a
/// nonsensical length field hands the remainder to the decoder as a
/// single frame so the error is counted there.
pub fn split_frames(data: &[u8]) -> Vec<&[u8]> {
    let mut frames = Vec::with_capacity(4);
    let mut rest = data;
    while rest.len() >= HEADER_SIZE {
        let declared = i16::from_le_bytes([rest[1], rest[2]]);
        let len = usize::try_from(declared).unwrap_or(0);
        if len < HEADER_SIZE || len > rest.len() {
            frames.push(rest);
            return frames;
        }
        frames.push(&rest[..len]);
        rest = &rest[len..];
    }
    if !rest.is_empty() {
        frames.push(rest);
    }
    frames
}
