//! Tick and depth records shared across the pipeline
//!
//! `NormalizedTick` is the merger's per-security snapshot of feed state.
//! `EnrichedTick` is the resolved, derived form that travels over the bus
//! and lands in the `ticks` hypertable; its serde field order is the
//! canonical wire order, so new fields are appended, never inserted.

use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::WireError;
use crate::segments::ExchangeSegment;

/// Version byte prefixed to every bus payload.
pub const WIRE_VERSION: u8 = 1;

/// Exchange timezone offset (IST, UTC+5:30).
pub fn ist_offset() -> FixedOffset {
    // 19800 s east is always within FixedOffset bounds.
    FixedOffset::east_opt(5 * 3600 + 1800).expect("IST offset in range")
}

/// Convert a wire epoch (Unix seconds) to a UTC instant. Zero and negative
/// epochs mean "not provided" on this feed.
pub fn epoch_to_utc(secs: i64) -> Option<DateTime<Utc>> {
    if secs <= 0 {
        return None;
    }
    Utc.timestamp_opt(secs, 0).single()
}

/// One side of a quoted depth level. Zeroes on the wire mean "no data" and
/// are mapped to `None`, matching the nullable array columns in `ticks`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DepthLevelQuote {
    pub price: Option<f64>,
    pub quantity: Option<i64>,
    pub orders: Option<i32>,
}

/// Merged per-security tick state, pre-enrichment.
///
/// Identity is the feed-native `security_id` plus segment; the enricher
/// resolves this to an `instrument_token` or drops the tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedTick {
    pub security_id: String,
    pub exchange_segment: ExchangeSegment,
    pub time: DateTime<Utc>,
    pub last_trade_time: Option<DateTime<Utc>>,

    pub last_price: Option<f64>,
    pub last_traded_quantity: Option<i32>,
    pub average_traded_price: Option<f64>,

    pub volume_traded: Option<i64>,
    pub total_buy_quantity: Option<i64>,
    pub total_sell_quantity: Option<i64>,

    pub oi: Option<i64>,
    pub oi_day_high: Option<i64>,
    pub oi_day_low: Option<i64>,

    pub day_open: Option<f64>,
    pub day_high: Option<f64>,
    pub day_low: Option<f64>,
    pub day_close: Option<f64>,
    pub prev_close: Option<f64>,

    pub bids: [DepthLevelQuote; 5],
    pub asks: [DepthLevelQuote; 5],

    /// "ltp", "quote" or "full", per the richest packet merged in.
    pub mode: String,
}

impl NormalizedTick {
    /// Empty snapshot for a security; the merger folds packets into this.
    pub fn new(security_id: String, segment: ExchangeSegment, time: DateTime<Utc>) -> Self {
        Self {
            security_id,
            exchange_segment: segment,
            time,
            last_trade_time: None,
            last_price: None,
            last_traded_quantity: None,
            average_traded_price: None,
            volume_traded: None,
            total_buy_quantity: None,
            total_sell_quantity: None,
            oi: None,
            oi_day_high: None,
            oi_day_low: None,
            day_open: None,
            day_high: None,
            day_low: None,
            day_close: None,
            prev_close: None,
            bids: [DepthLevelQuote::default(); 5],
            asks: [DepthLevelQuote::default(); 5],
            mode: "quote".to_string(),
        }
    }
}

/// Fully resolved tick, canonical bus payload and `ticks` row shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedTick {
    pub time: DateTime<Utc>,
    pub last_trade_time: Option<DateTime<Utc>>,

    pub instrument_token: u32,
    pub trading_symbol: Option<String>,
    pub exchange: Option<String>,
    pub segment: Option<String>,
    pub instrument_type: Option<String>,

    pub last_price: Option<f64>,
    pub last_traded_quantity: Option<i32>,
    pub average_traded_price: Option<f64>,

    pub volume_traded: Option<i64>,
    pub oi: Option<i64>,
    pub oi_day_high: Option<i64>,
    pub oi_day_low: Option<i64>,

    pub day_open: Option<f64>,
    pub day_high: Option<f64>,
    pub day_low: Option<f64>,
    pub day_close: Option<f64>,

    pub change: Option<f64>,
    pub change_percent: Option<f64>,

    pub total_buy_quantity: Option<i64>,
    pub total_sell_quantity: Option<i64>,

    pub bid_prices: [Option<f64>; 5],
    pub bid_quantities: [Option<i64>; 5],
    pub bid_orders: [Option<i32>; 5],
    pub ask_prices: [Option<f64>; 5],
    pub ask_quantities: [Option<i64>; 5],
    pub ask_orders: [Option<i32>; 5],

    pub tradable: bool,
    pub mode: Option<String>,

    pub bid_ask_spread: Option<f64>,
    pub mid_price: Option<f64>,
    pub order_imbalance: Option<i64>,
}

/// Round to two decimals, the tick-feed price precision.
pub fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Round to four decimals, used for percentage fields.
pub fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

/// Best-bid/best-ask spread, absent unless both sides quote.
pub fn spread(best_bid: Option<f64>, best_ask: Option<f64>) -> Option<f64> {
    match (best_bid, best_ask) {
        (Some(b), Some(a)) if b > 0.0 && a > 0.0 => Some(round2(a - b)),
        _ => None,
    }
}

/// Midpoint of the top of book.
pub fn mid_price(best_bid: Option<f64>, best_ask: Option<f64>) -> Option<f64> {
    match (best_bid, best_ask) {
        (Some(b), Some(a)) if b > 0.0 && a > 0.0 => Some(round2((a + b) / 2.0)),
        _ => None,
    }
}

/// Total buy quantity minus total sell quantity.
pub fn order_imbalance(total_buy: Option<i64>, total_sell: Option<i64>) -> Option<i64> {
    match (total_buy, total_sell) {
        (Some(b), Some(s)) => Some(b - s),
        _ => None,
    }
}

/// Encode an enriched tick into the bus wire format: one version byte
/// followed by the canonical JSON body.
pub fn encode_wire(tick: &EnrichedTick) -> Result<Vec<u8>, serde_json::Error> {
    let mut buf = Vec::with_capacity(1024);
    buf.push(WIRE_VERSION);
    serde_json::to_writer(&mut buf, tick)?;
    Ok(buf)
}

/// Decode a bus payload produced by [`encode_wire`].
pub fn decode_wire(payload: &[u8]) -> Result<EnrichedTick, WireError> {
    let (&version, body) = payload.split_first().ok_or(WireError::Empty)?;
    if version != WIRE_VERSION {
        return Err(WireError::UnsupportedVersion(version));
    }
    Ok(serde_json::from_slice(body)?)
}

/// One level of the compact top-of-book payload on
/// `depth_snapshots:<symbol>`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DepthLevelMsg {
    pub price: f64,
    pub qty: i64,
    pub orders: i64,
}

/// Compact snapshot published per completed 200-level snapshot: best
/// bid/ask plus the top 20 levels each side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthSnapshotMsg {
    pub time: DateTime<Utc>,
    pub current_price: f64,
    pub best_bid: f64,
    pub best_ask: f64,
    pub spread: f64,
    pub top_bids: Vec<DepthLevelMsg>,
    pub top_asks: Vec<DepthLevelMsg>,
}

impl DepthSnapshotMsg {
    /// Midpoint of the published top of book.
    pub fn mid(&self) -> f64 {
        (self.best_bid + self.best_ask) / 2.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn sample_tick() -> EnrichedTick {
        EnrichedTick {
            time: Utc.with_ymd_and_hms(2025, 12, 1, 9, 30, 0).unwrap(),
            last_trade_time: None,
            instrument_token: 256265,
            trading_symbol: Some("NIFTY25DECFUT".to_string()),
            exchange: Some("NSE".to_string()),
            segment: Some("NSE_FNO".to_string()),
            instrument_type: Some("FUT".to_string()),
            last_price: Some(24500.0),
            last_traded_quantity: Some(50),
            average_traded_price: Some(24480.5),
            volume_traded: Some(500_000),
            oi: Some(15_000_000),
            oi_day_high: None,
            oi_day_low: None,
            day_open: Some(24400.0),
            day_high: Some(24520.0),
            day_low: Some(24380.0),
            day_close: None,
            change: Some(50.0),
            change_percent: Some(0.2045),
            total_buy_quantity: Some(1_200_000),
            total_sell_quantity: Some(900_000),
            bid_prices: [Some(24498.0), None, None, None, None],
            bid_quantities: [Some(100_000), None, None, None, None],
            bid_orders: [Some(50), None, None, None, None],
            ask_prices: [Some(24502.0), None, None, None, None],
            ask_quantities: [Some(120_000), None, None, None, None],
            ask_orders: [Some(60), None, None, None, None],
            tradable: true,
            mode: Some("full".to_string()),
            bid_ask_spread: Some(4.0),
            mid_price: Some(24500.0),
            order_imbalance: Some(300_000),
        }
    }

    #[test]
    fn wire_round_trip_preserves_tick() {
        let tick = sample_tick();
        let payload = encode_wire(&tick).unwrap();
        assert_eq!(payload[0], WIRE_VERSION);
        let decoded = decode_wire(&payload).unwrap();
        assert_eq!(decoded, tick);
    }

    #[test]
    fn wire_rejects_unknown_version() {
        let tick = sample_tick();
        let mut payload = encode_wire(&tick).unwrap();
        payload[0] = 9;
        assert!(matches!(
            decode_wire(&payload),
            Err(WireError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn wire_rejects_empty_payload() {
        assert!(matches!(decode_wire(&[]), Err(WireError::Empty)));
    }

    #[test]
    fn derived_fields_need_both_sides() {
        assert_eq!(spread(Some(24498.0), None), None);
        assert_eq!(mid_price(None, Some(24502.0)), None);
        assert_abs_diff_eq!(
            spread(Some(24498.0), Some(24502.0)).unwrap(),
            4.0,
            epsilon = 1e-9
        );
        assert_abs_diff_eq!(
            mid_price(Some(24498.0), Some(24502.0)).unwrap(),
            24500.0,
            epsilon = 1e-9
        );
        assert_eq!(
            order_imbalance(Some(1_200_000), Some(900_000)),
            Some(300_000)
        );
    }

    #[test]
    fn epoch_zero_means_absent() {
        assert_eq!(epoch_to_utc(0), None);
        assert_eq!(epoch_to_utc(-5), None);
        assert!(epoch_to_utc(1_750_000_000).is_some());
    }

    #[test]
    fn ist_offset_is_five_thirty() {
        assert_eq!(ist_offset().local_minus_utc(), 5 * 3600 + 1800);
    }
}
