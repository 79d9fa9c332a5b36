//! Per-security packet merger
//!
//! The feed spreads one instrument's state across several partial packets:
//! prev-close (code 6) arrives once near the open, OI (code 5) and ticker
//! (code 2) trickle in, and quote (code 4) / full (code 8) carry the bulk.
//! The merger keeps a bounded per-security state map and emits one
//! `NormalizedTick` snapshot whenever a quote or full packet lands.
//!
//! The map is capped and evicts the least-recently-touched security, so a
//! subscription churning through many ids cannot grow memory unbounded.

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;

use services_common::types::{DepthLevelQuote, NormalizedTick};

use crate::dhan::parser::{QuoteFields, TickPacket};

/// Default bound on tracked securities.
pub const DEFAULT_STATE_CAP: usize = 10_000;

#[derive(Debug, Default)]
struct PartialState {
    prev_close: Option<f64>,
    prev_oi: Option<i64>,
    oi: Option<i64>,
    oi_day_high: Option<i64>,
    oi_day_low: Option<i64>,
    last_price: Option<f64>,
    last_trade_time: Option<DateTime<Utc>>,
    touch: u64,
}

/// Folds partial packets into per-security state and emits snapshots.
pub struct TickMerger {
    states: FxHashMap<String, PartialState>,
    cap: usize,
    clock: u64,
}

impl TickMerger {
    pub fn new(cap: usize) -> Self {
        Self {
            states: FxHashMap::default(),
            cap: cap.max(1),
            clock: 0,
        }
    }

    /// Number of securities currently tracked.
    pub fn tracked(&self) -> usize {
        self.states.len()
    }

    fn touch<'a>(
        states: &'a mut FxHashMap<String, PartialState>,
        cap: usize,
        clock: u64,
        security_id: &str,
    ) -> &'a mut PartialState {
        if !states.contains_key(security_id) && states.len() >= cap {
            // Evict the least-recently-touched entry. The scan only runs
            // at the cap, which steady subscriptions never reach.
            if let Some(oldest) = states
                .iter()
                .min_by_key(|(_, s)| s.touch)
                .map(|(k, _)| k.clone())
            {
                states.remove(&oldest);
            }
        }
        let state = states.entry(security_id.to_string()).or_default();
        state.touch = clock;
        state
    }

    /// Fold one packet in. Returns a snapshot when the packet completes one.
    pub fn apply(&mut self, packet: &TickPacket, now: DateTime<Utc>) -> Option<NormalizedTick> {
        self.clock += 1;
        let clock = self.clock;
        match packet {
            TickPacket::PrevClose {
                header,
                prev_close,
                prev_oi,
            } => {
                let state = Self::touch(&mut self.states, self.cap, clock, &header.security_id);
                state.prev_close = *prev_close;
                state.prev_oi = *prev_oi;
                None
            }
            TickPacket::Oi { header, oi } => {
                let state = Self::touch(&mut self.states, self.cap, clock, &header.security_id);
                state.oi = *oi;
                None
            }
            TickPacket::Ticker {
                header,
                last_price,
                last_trade_time,
            } => {
                let state = Self::touch(&mut self.states, self.cap, clock, &header.security_id);
                state.last_price = *last_price;
                state.last_trade_time = *last_trade_time;
                None
            }
            TickPacket::Quote { header, fields } => {
                let segment = header.segment?;
                let state = Self::touch(&mut self.states, self.cap, clock, &header.security_id);
                let mut tick = snapshot_from_fields(
                    header.security_id.clone(),
                    segment,
                    fields,
                    state,
                    now,
                );
                tick.oi = state.oi;
                tick.mode = "quote".to_string();
                Some(tick)
            }
            TickPacket::Full {
                header,
                fields,
                oi,
                oi_day_high,
                oi_day_low,
                depth,
            } => {
                let segment = header.segment?;
                let state = Self::touch(&mut self.states, self.cap, clock, &header.security_id);
                state.oi = oi.or(state.oi);
                state.oi_day_high = *oi_day_high;
                state.oi_day_low = *oi_day_low;
                let mut tick = snapshot_from_fields(
                    header.security_id.clone(),
                    segment,
                    fields,
                    state,
                    now,
                );
                tick.oi = *oi;
                tick.oi_day_high = *oi_day_high;
                tick.oi_day_low = *oi_day_low;
                for (i, level) in depth.iter().enumerate() {
                    tick.bids[i] = level.bid;
                    tick.asks[i] = level.ask;
                }
                tick.mode = "full".to_string();
                Some(tick)
            }
            // Index values have no downstream consumer; status and
            // disconnect frames are handled by the transport.
            TickPacket::Index { .. }
            | TickPacket::MarketStatus { .. }
            | TickPacket::Disconnect { .. } => None,
        }
    }
}

fn snapshot_from_fields(
    security_id: String,
    segment: services_common::ExchangeSegment,
    fields: &QuoteFields,
    state: &PartialState,
    now: DateTime<Utc>,
) -> NormalizedTick {
    let time = fields.last_trade_time.unwrap_or(now);
    let mut tick = NormalizedTick::new(security_id, segment, time);
    tick.last_trade_time = fields.last_trade_time;
    tick.last_price = fields.last_price.or(state.last_price);
    tick.last_traded_quantity = fields.last_traded_quantity;
    tick.average_traded_price = fields.average_traded_price;
    tick.volume_traded = fields.volume_traded;
    tick.total_buy_quantity = fields.total_buy_quantity;
    tick.total_sell_quantity = fields.total_sell_quantity;
    tick.day_open = fields.day_open;
    tick.day_high = fields.day_high;
    tick.day_low = fields.day_low;
    tick.day_close = fields.day_close;
    tick.prev_close = state.prev_close;
    tick.bids = [DepthLevelQuote::default(); 5];
    tick.asks = [DepthLevelQuote::default(); 5];
    tick
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dhan::parser::{FrameHeader, PacketDepthLevel, RESPONSE_FULL, RESPONSE_OI,
        RESPONSE_PREV_CLOSE, RESPONSE_QUOTE, RESPONSE_TICKER};
    use approx::assert_abs_diff_eq;
    use services_common::ExchangeSegment;

    fn header(code: u8, security_id: &str) -> FrameHeader {
        FrameHeader {
            response_code: code,
            message_length: 0,
            segment_code: 2,
            segment: Some(ExchangeSegment::NseFno),
            security_id: security_id.to_string(),
        }
    }

    fn quote_fields(last: f64) -> QuoteFields {
        QuoteFields {
            last_price: Some(last),
            last_traded_quantity: Some(50),
            last_trade_time: None,
            average_traded_price: Some(last - 10.0),
            volume_traded: Some(500_000),
            total_sell_quantity: Some(900_000),
            total_buy_quantity: Some(1_200_000),
            day_open: Some(last - 100.0),
            day_close: None,
            day_high: Some(last + 20.0),
            day_low: Some(last - 120.0),
        }
    }

    #[test]
    fn prev_close_flows_into_later_snapshots() {
        let mut merger = TickMerger::new(DEFAULT_STATE_CAP);
        let now = Utc::now();

        let none = merger.apply(
            &TickPacket::PrevClose {
                header: header(RESPONSE_PREV_CLOSE, "49229"),
                prev_close: Some(24450.0),
                prev_oi: Some(14_500_000),
            },
            now,
        );
        assert!(none.is_none());

        let tick = merger
            .apply(
                &TickPacket::Quote {
                    header: header(RESPONSE_QUOTE, "49229"),
                    fields: quote_fields(24500.0),
                },
                now,
            )
            .expect("quote emits a snapshot");
        assert_abs_diff_eq!(tick.prev_close.unwrap(), 24450.0, epsilon = 1e-9);
        assert_eq!(tick.mode, "quote");
    }

    #[test]
    fn oi_and_ticker_packets_accumulate_without_emitting() {
        let mut merger = TickMerger::new(DEFAULT_STATE_CAP);
        let now = Utc::now();

        assert!(merger
            .apply(
                &TickPacket::Oi {
                    header: header(RESPONSE_OI, "49229"),
                    oi: Some(15_000_000),
                },
                now,
            )
            .is_none());
        assert!(merger
            .apply(
                &TickPacket::Ticker {
                    header: header(RESPONSE_TICKER, "49229"),
                    last_price: Some(24510.0),
                    last_trade_time: None,
                },
                now,
            )
            .is_none());

        let tick = merger
            .apply(
                &TickPacket::Quote {
                    header: header(RESPONSE_QUOTE, "49229"),
                    fields: quote_fields(24500.0),
                },
                now,
            )
            .unwrap();
        assert_eq!(tick.oi, Some(15_000_000));
    }

    #[test]
    fn full_packet_carries_depth_and_its_own_oi() {
        let mut merger = TickMerger::new(DEFAULT_STATE_CAP);
        let now = Utc::now();
        let mut depth = [PacketDepthLevel::default(); 5];
        depth[0].bid.price = Some(24498.0);
        depth[0].bid.quantity = Some(100_000);
        depth[0].ask.price = Some(24502.0);

        let tick = merger
            .apply(
                &TickPacket::Full {
                    header: header(RESPONSE_FULL, "49229"),
                    fields: quote_fields(24500.0),
                    oi: Some(15_000_000),
                    oi_day_high: Some(15_200_000),
                    oi_day_low: Some(14_800_000),
                    depth,
                },
                now,
            )
            .unwrap();
        assert_eq!(tick.mode, "full");
        assert_eq!(tick.oi_day_high, Some(15_200_000));
        assert_abs_diff_eq!(tick.bids[0].price.unwrap(), 24498.0, epsilon = 1e-9);
        assert_eq!(tick.asks[1].price, None);
    }

    #[test]
    fn state_map_evicts_least_recently_touched_at_cap() {
        let mut merger = TickMerger::new(2);
        let now = Utc::now();

        for sid in ["1", "2"] {
            merger.apply(
                &TickPacket::PrevClose {
                    header: header(RESPONSE_PREV_CLOSE, sid),
                    prev_close: Some(100.0),
                    prev_oi: None,
                },
                now,
            );
        }
        // Touch "1" so "2" becomes the eviction candidate.
        merger.apply(
            &TickPacket::Oi {
                header: header(RESPONSE_OI, "1"),
                oi: Some(10),
            },
            now,
        );
        merger.apply(
            &TickPacket::PrevClose {
                header: header(RESPONSE_PREV_CLOSE, "3"),
                prev_close: Some(300.0),
                prev_oi: None,
            },
            now,
        );
        assert_eq!(merger.tracked(), 2);

        // "1" kept its prev_close; the evicted "2" starts from scratch.
        let tick = merger
            .apply(
                &TickPacket::Quote {
                    header: header(RESPONSE_QUOTE, "1"),
                    fields: quote_fields(100.0),
                },
                now,
            )
            .unwrap();
        assert_eq!(tick.prev_close, Some(100.0));
        let tick = merger
            .apply(
                &TickPacket::Quote {
                    header: header(RESPONSE_QUOTE, "2"),
                    fields: quote_fields(200.0),
                },
                now,
            )
            .unwrap();
        assert_eq!(tick.prev_close, None);
    }
}
