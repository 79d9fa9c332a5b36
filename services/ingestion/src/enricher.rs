//! Tick enrichment
//!
//! Resolves feed identifiers against the instrument cache, annotates
//! instrument metadata, and computes the derived fields stored alongside
//! the raw tick. A tick whose identifier does not resolve is dropped;
//! the caller counts it and moves on.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use services_common::types::{
    mid_price, order_imbalance, round2, round4, spread, EnrichedTick, NormalizedTick,
};
use services_common::InstrumentCache;

use crate::kite::parser::KiteTick;

pub struct Enricher {
    cache: Arc<InstrumentCache>,
}

impl Enricher {
    pub fn new(cache: Arc<InstrumentCache>) -> Self {
        Self { cache }
    }

    /// Enrich a merged Dhan tick. `None` means the security id did not
    /// resolve and the tick must be dropped.
    pub fn enrich(&self, tick: &NormalizedTick) -> Option<EnrichedTick> {
        let (token, meta) = self.cache.resolve_security_id(&tick.security_id)?;

        let (change, change_percent) = change_fields(tick.last_price, tick.prev_close);

        let bid_prices = core::array::from_fn(|i| tick.bids[i].price);
        let bid_quantities = core::array::from_fn(|i| tick.bids[i].quantity);
        let bid_orders = core::array::from_fn(|i| tick.bids[i].orders);
        let ask_prices = core::array::from_fn(|i| tick.asks[i].price);
        let ask_quantities = core::array::from_fn(|i| tick.asks[i].quantity);
        let ask_orders = core::array::from_fn(|i| tick.asks[i].orders);

        Some(EnrichedTick {
            time: tick.time,
            last_trade_time: tick.last_trade_time,
            instrument_token: token,
            trading_symbol: Some(meta.trading_symbol.clone()),
            exchange: Some(meta.exchange.clone()),
            segment: meta.segment.clone(),
            instrument_type: meta.instrument_type.clone(),
            last_price: tick.last_price,
            last_traded_quantity: tick.last_traded_quantity,
            average_traded_price: tick.average_traded_price,
            volume_traded: tick.volume_traded,
            oi: tick.oi,
            oi_day_high: tick.oi_day_high,
            oi_day_low: tick.oi_day_low,
            day_open: tick.day_open,
            day_high: tick.day_high,
            day_low: tick.day_low,
            day_close: tick.day_close,
            change,
            change_percent,
            total_buy_quantity: tick.total_buy_quantity,
            total_sell_quantity: tick.total_sell_quantity,
            bid_prices,
            bid_quantities,
            bid_orders,
            ask_prices,
            ask_quantities,
            ask_orders,
            tradable: true,
            mode: Some(tick.mode.clone()),
            bid_ask_spread: spread(bid_prices[0], ask_prices[0]),
            mid_price: mid_price(bid_prices[0], ask_prices[0]),
            order_imbalance: order_imbalance(tick.total_buy_quantity, tick.total_sell_quantity),
        })
    }

    /// Enrich a Kite tick, which already carries the canonical token.
    pub fn enrich_kite(&self, tick: &KiteTick, now: DateTime<Utc>) -> Option<EnrichedTick> {
        let meta = self.cache.get_by_token(tick.instrument_token)?;

        let (change, change_percent) = change_fields(tick.last_price, tick.prev_close);

        let bid_prices = core::array::from_fn(|i| tick.bids[i].price);
        let bid_quantities = core::array::from_fn(|i| tick.bids[i].quantity);
        let bid_orders = core::array::from_fn(|i| tick.bids[i].orders);
        let ask_prices = core::array::from_fn(|i| tick.asks[i].price);
        let ask_quantities = core::array::from_fn(|i| tick.asks[i].quantity);
        let ask_orders = core::array::from_fn(|i| tick.asks[i].orders);

        Some(EnrichedTick {
            time: tick.exchange_time.or(tick.last_trade_time).unwrap_or(now),
            last_trade_time: tick.last_trade_time,
            instrument_token: tick.instrument_token,
            trading_symbol: Some(meta.trading_symbol.clone()),
            exchange: Some(meta.exchange.clone()),
            segment: meta.segment.clone(),
            instrument_type: meta.instrument_type.clone(),
            last_price: tick.last_price,
            last_traded_quantity: tick.last_traded_quantity,
            average_traded_price: tick.average_traded_price,
            volume_traded: tick.volume_traded,
            oi: tick.oi,
            oi_day_high: tick.oi_day_high,
            oi_day_low: tick.oi_day_low,
            day_open: tick.day_open,
            day_high: tick.day_high,
            day_low: tick.day_low,
            day_close: tick.prev_close,
            change,
            change_percent,
            total_buy_quantity: tick.total_buy_quantity,
            total_sell_quantity: tick.total_sell_quantity,
            bid_prices,
            bid_quantities,
            bid_orders,
            ask_prices,
            ask_quantities,
            ask_orders,
            tradable: true,
            mode: Some(tick.mode.as_str().to_string()),
            bid_ask_spread: spread(bid_prices[0], ask_prices[0]),
            mid_price: mid_price(bid_prices[0], ask_prices[0]),
            order_imbalance: order_imbalance(tick.total_buy_quantity, tick.total_sell_quantity),
        })
    }
}

fn change_fields(last: Option<f64>, prev_close: Option<f64>) -> (Option<f64>, Option<f64>) {
    match (last, prev_close) {
        (Some(last), Some(prev)) if last > 0.0 && prev > 0.0 => {
            let change = round2(last - prev);
            (Some(change), Some(round4(change / prev * 100.0)))
        }
        _ => (None, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use services_common::types::DepthLevelQuote;
    use services_common::{ExchangeSegment, Instrument};

    fn cache() -> Arc<InstrumentCache> {
        Arc::new(InstrumentCache::from_instruments(vec![Instrument {
            instrument_token: 256265,
            security_id: Some("49229".to_string()),
            trading_symbol: "NIFTY25DECFUT".to_string(),
            exchange: "NSE".to_string(),
            segment: Some("NSE_FNO".to_string()),
            instrument_type: Some("FUT".to_string()),
            expiry: None,
            strike: None,
            tick_size: Some(0.05),
            lot_size: Some(25),
            source: Some("dhan".to_string()),
            is_active: true,
        }]))
    }

    fn full_tick() -> NormalizedTick {
        let mut tick = NormalizedTick::new(
            "49229".to_string(),
            ExchangeSegment::NseFno,
            Utc::now(),
        );
        tick.last_price = Some(24500.0);
        tick.prev_close = Some(24450.0);
        tick.total_buy_quantity = Some(1_200_000);
        tick.total_sell_quantity = Some(900_000);
        tick.bids[0] = DepthLevelQuote {
            price: Some(24498.0),
            quantity: Some(100_000),
            orders: Some(50),
        };
        tick.asks[0] = DepthLevelQuote {
            price: Some(24502.0),
            quantity: Some(120_000),
            orders: Some(60),
        };
        tick.mode = "full".to_string();
        tick
    }

    #[test]
    fn derived_fields_match_quote_arithmetic() {
        let enricher = Enricher::new(cache());
        let enriched = enricher.enrich(&full_tick()).unwrap();

        assert_eq!(enriched.instrument_token, 256265);
        assert_eq!(enriched.trading_symbol.as_deref(), Some("NIFTY25DECFUT"));
        assert_abs_diff_eq!(enriched.bid_ask_spread.unwrap(), 4.0, epsilon = 1e-9);
        assert_abs_diff_eq!(enriched.mid_price.unwrap(), 24500.0, epsilon = 1e-9);
        assert_eq!(enriched.order_imbalance, Some(300_000));
        // change = 24500 - 24450; percent against prev close.
        assert_abs_diff_eq!(enriched.change.unwrap(), 50.0, epsilon = 1e-9);
        assert_abs_diff_eq!(enriched.change_percent.unwrap(), 0.2045, epsilon = 1e-9);
    }

    #[test]
    fn unresolved_security_id_drops_the_tick() {
        let enricher = Enricher::new(cache());
        let mut tick = full_tick();
        tick.security_id = "99999".to_string();
        assert!(enricher.enrich(&tick).is_none());
    }

    #[test]
    fn change_needs_prev_close() {
        let enricher = Enricher::new(cache());
        let mut tick = full_tick();
        tick.prev_close = None;
        let enriched = enricher.enrich(&tick).unwrap();
        assert_eq!(enriched.change, None);
        assert_eq!(enriched.change_percent, None);
    }
}
