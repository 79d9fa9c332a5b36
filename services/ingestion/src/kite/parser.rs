//! Kite binary tick decoding
//!
//! Message layout: `count u16`, then per packet `length u16` + payload,
//! all big-endian. Packet length selects the mode: 8 LTP, 28 index quote,
//! 32 index full, 44 quote, 184 full (with 5+5 depth levels of 12 bytes
//! at offset 64). Prices are int32 paise; divide by 100.

use byteorder::{BigEndian, ReadBytesExt};
use chrono::{DateTime, Utc};
use std::io::Cursor;

use services_common::types::{epoch_to_utc, round2, DepthLevelQuote};

use crate::dhan::parser::DecodeError;

const LTP_SIZE: usize = 8;
const INDEX_QUOTE_SIZE: usize = 28;
const INDEX_FULL_SIZE: usize = 32;
const QUOTE_SIZE: usize = 44;
const FULL_SIZE: usize = 184;

const DEPTH_OFFSET: u64 = 64;
const PRICE_DIVISOR: f64 = 100.0;

/// Richness of a decoded Kite packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KiteMode {
    Ltp,
    Quote,
    Full,
    Index,
}

impl KiteMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ltp => "ltp",
            Self::Quote => "quote",
            Self::Full => "full",
            Self::Index => "index",
        }
    }
}

/// One decoded Kite tick. Complete per packet; no merging required.
#[derive(Debug, Clone, PartialEq)]
pub struct KiteTick {
    pub instrument_token: u32,
    pub mode: KiteMode,
    pub last_price: Option<f64>,
    pub last_traded_quantity: Option<i32>,
    pub average_traded_price: Option<f64>,
    pub volume_traded: Option<i64>,
    pub total_buy_quantity: Option<i64>,
    pub total_sell_quantity: Option<i64>,
    pub day_open: Option<f64>,
    pub day_high: Option<f64>,
    pub day_low: Option<f64>,
    /// On this feed the close field is the previous session's close.
    pub prev_close: Option<f64>,
    pub last_trade_time: Option<DateTime<Utc>>,
    pub oi: Option<i64>,
    pub oi_day_high: Option<i64>,
    pub oi_day_low: Option<i64>,
    pub exchange_time: Option<DateTime<Utc>>,
    pub bids: [DepthLevelQuote; 5],
    pub asks: [DepthLevelQuote; 5],
}

impl KiteTick {
    fn new(instrument_token: u32, mode: KiteMode) -> Self {
        Self {
            instrument_token,
            mode,
            last_price: None,
            last_traded_quantity: None,
            average_traded_price: None,
            volume_traded: None,
            total_buy_quantity: None,
            total_sell_quantity: None,
            day_open: None,
            day_high: None,
            day_low: None,
            prev_close: None,
            last_trade_time: None,
            oi: None,
            oi_day_high: None,
            oi_day_low: None,
            exchange_time: None,
            bids: [DepthLevelQuote::default(); 5],
            asks: [DepthLevelQuote::default(); 5],
        }
    }
}

fn price(raw: i32) -> Option<f64> {
    (raw > 0).then(|| round2(f64::from(raw) / PRICE_DIVISOR))
}

fn pos(raw: i32) -> Option<i64> {
    (raw > 0).then_some(i64::from(raw))
}

/// Split one WebSocket message into its packets.
pub fn split_packets(data: &[u8]) -> Result<Vec<&[u8]>, DecodeError> {
    if data.len() < 2 {
        return Err(DecodeError::TooShort {
            code: None,
            expected: 2,
            actual: data.len(),
        });
    }
    let count = usize::from(u16::from_be_bytes([data[0], data[1]]));
    let mut packets = Vec::with_capacity(count);
    let mut offset = 2;
    for _ in 0..count {
        if offset + 2 > data.len() {
            return Err(DecodeError::TooShort {
                code: None,
                expected: offset + 2,
                actual: data.len(),
            });
        }
        let len = usize::from(u16::from_be_bytes([data[offset], data[offset + 1]]));
        offset += 2;
        if offset + len > data.len() {
            return Err(DecodeError::TooShort {
                code: None,
                expected: offset + len,
                actual: data.len(),
            });
        }
        packets.push(&data[offset..offset + len]);
        offset += len;
    }
    Ok(packets)
}

/// Decode one packet. The packet length implies the mode.
pub fn parse_packet(packet: &[u8]) -> Result<KiteTick, DecodeError> {
    let mut cur = Cursor::new(packet);
    let token = cur.read_u32::<BigEndian>()?;

    match packet.len() {
        LTP_SIZE => {
            let mut tick = KiteTick::new(token, KiteMode::Ltp);
            tick.last_price = price(cur.read_i32::<BigEndian>()?);
            Ok(tick)
        }
        INDEX_QUOTE_SIZE | INDEX_FULL_SIZE => {
            let mut tick = KiteTick::new(token, KiteMode::Index);
            tick.last_price = price(cur.read_i32::<BigEndian>()?);
            tick.day_high = price(cur.read_i32::<BigEndian>()?);
            tick.day_low = price(cur.read_i32::<BigEndian>()?);
            tick.day_open = price(cur.read_i32::<BigEndian>()?);
            tick.prev_close = price(cur.read_i32::<BigEndian>()?);
            let _change = cur.read_i32::<BigEndian>()?;
            if packet.len() == INDEX_FULL_SIZE {
                tick.exchange_time = epoch_to_utc(i64::from(cur.read_i32::<BigEndian>()?));
            }
            Ok(tick)
        }
        QUOTE_SIZE | FULL_SIZE => {
            let mode = if packet.len() == FULL_SIZE {
                KiteMode::Full
            } else {
                KiteMode::Quote
            };
            let mut tick = KiteTick::new(token, mode);
            tick.last_price = price(cur.read_i32::<BigEndian>()?);
            tick.last_traded_quantity = {
                let v = cur.read_i32::<BigEndian>()?;
                (v > 0).then_some(v)
            };
            tick.average_traded_price = price(cur.read_i32::<BigEndian>()?);
            tick.volume_traded = pos(cur.read_i32::<BigEndian>()?);
            tick.total_buy_quantity = pos(cur.read_i32::<BigEndian>()?);
            tick.total_sell_quantity = pos(cur.read_i32::<BigEndian>()?);
            tick.day_open = price(cur.read_i32::<BigEndian>()?);
            tick.day_high = price(cur.read_i32::<BigEndian>()?);
            tick.day_low = price(cur.read_i32::<BigEndian>()?);
            tick.prev_close = price(cur.read_i32::<BigEndian>()?);

            if mode == KiteMode::Full {
                tick.last_trade_time = epoch_to_utc(i64::from(cur.read_i32::<BigEndian>()?));
                tick.oi = pos(cur.read_i32::<BigEndian>()?);
                tick.oi_day_high = pos(cur.read_i32::<BigEndian>()?);
                tick.oi_day_low = pos(cur.read_i32::<BigEndian>()?);
                tick.exchange_time = epoch_to_utc(i64::from(cur.read_i32::<BigEndian>()?));

                debug_assert_eq!(cur.position(), DEPTH_OFFSET);
                for i in 0..10 {
                    let quantity = cur.read_i32::<BigEndian>()?;
                    let level_price = cur.read_i32::<BigEndian>()?;
                    let orders = cur.read_i16::<BigEndian>()?;
                    let _padding = cur.read_i16::<BigEndian>()?;
                    let level = DepthLevelQuote {
                        price: price(level_price),
                        quantity: pos(quantity),
                        orders: (orders > 0).then_some(i32::from(orders)),
                    };
                    if i < 5 {
                        tick.bids[i] = level;
                    } else {
                        tick.asks[i - 5] = level;
                    }
                }
            }
            Ok(tick)
        }
        other => Err(DecodeError::TooShort {
            code: None,
            expected: QUOTE_SIZE,
            actual: other,
        }),
    }
}
