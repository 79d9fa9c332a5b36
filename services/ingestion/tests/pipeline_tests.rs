//! Decode → merge → enrich integration tests
//!
//! Drives the pipeline stages with hand-built wire frames and checks the
//! enriched rows that would reach the bus.

use byteorder::{LittleEndian, WriteBytesExt};
use chrono::Utc;
use std::sync::Arc;

use approx::assert_abs_diff_eq;
use ingestion::dhan::parser::{parse_packet, TickPacket};
use ingestion::enricher::Enricher;
use ingestion::merger::{TickMerger, DEFAULT_STATE_CAP};
use ingestion::pipeline::PipelineCounters;
use services_common::types::{decode_wire, encode_wire};
use services_common::{Instrument, InstrumentCache};

fn header(buf: &mut Vec<u8>, code: u8, length: i16, segment: u8, security_id: i32) {
    buf.write_u8(code).unwrap();
    buf.write_i16::<LittleEndian>(length).unwrap();
    buf.write_u8(segment).unwrap();
    buf.write_i32::<LittleEndian>(security_id).unwrap();
}

fn prev_close_frame(security_id: i32, prev_close: f32, prev_oi: i32) -> Vec<u8> {
    let mut buf = Vec::new();
    header(&mut buf, 6, 16, 2, security_id);
    buf.write_f32::<LittleEndian>(prev_close).unwrap();
    buf.write_i32::<LittleEndian>(prev_oi).unwrap();
    buf
}

fn full_frame(security_id: i32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(163);
    header(&mut buf, 8, 163, 2, security_id);
    buf.write_f32::<LittleEndian>(24500.0).unwrap(); // last
    buf.write_i16::<LittleEndian>(50).unwrap();
    buf.write_i32::<LittleEndian>(1_765_000_000).unwrap();
    buf.write_f32::<LittleEndian>(24480.5).unwrap();
    buf.write_i32::<LittleEndian>(500_000).unwrap(); // volume
    buf.write_i32::<LittleEndian>(900_000).unwrap();
    buf.write_i32::<LittleEndian>(1_200_000).unwrap();
    buf.write_i32::<LittleEndian>(15_000_000).unwrap(); // oi
    buf.write_i32::<LittleEndian>(15_200_000).unwrap();
    buf.write_i32::<LittleEndian>(14_800_000).unwrap();
    buf.write_f32::<LittleEndian>(24400.0).unwrap();
    buf.write_f32::<LittleEndian>(0.0).unwrap();
    buf.write_f32::<LittleEndian>(24520.0).unwrap();
    buf.write_f32::<LittleEndian>(24380.0).unwrap();
    for i in 0..5i32 {
        buf.write_i32::<LittleEndian>(100_000 - i * 10_000).unwrap();
        buf.write_i32::<LittleEndian>(120_000 - i * 10_000).unwrap();
        buf.write_i16::<LittleEndian>((50 - i) as i16).unwrap();
        buf.write_i16::<LittleEndian>((60 - i) as i16).unwrap();
        buf.write_f32::<LittleEndian>(24498.0 - i as f32).unwrap();
        buf.write_f32::<LittleEndian>(24502.0 + i as f32).unwrap();
    }
    buf.push(0);
    buf
}

fn nifty_cache() -> Arc<InstrumentCache> {
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

#[test]
fn full_frame_becomes_an_enriched_tick_with_derived_fields() {
    let mut merger = TickMerger::new(DEFAULT_STATE_CAP);
    let enricher = Enricher::new(nifty_cache());
    let now = Utc::now();

    // Prev-close arrives first and only accumulates state.
    let packet = parse_packet(&prev_close_frame(49229, 24450.0, 14_500_000)).unwrap();
    assert!(merger.apply(&packet, now).is_none());

    let packet = parse_packet(&full_frame(49229)).unwrap();
    assert!(matches!(packet, TickPacket::Full { .. }));
    let tick = merger.apply(&packet, now).expect("full packet emits");
    let enriched = enricher.enrich(&tick).expect("security id resolves");

    assert_eq!(enriched.instrument_token, 256265);
    assert_abs_diff_eq!(enriched.last_price.unwrap(), 24500.0, epsilon = 1e-6);
    assert_eq!(enriched.volume_traded, Some(500_000));
    assert_eq!(enriched.oi, Some(15_000_000));

    // All five levels on both sides.
    assert!(enriched.bid_prices.iter().all(|p| p.is_some()));
    assert!(enriched.ask_prices.iter().all(|p| p.is_some()));
    assert_abs_diff_eq!(enriched.bid_prices[0].unwrap(), 24498.0, epsilon = 1e-6);
    assert_eq!(enriched.bid_quantities[0], Some(100_000));
    assert_eq!(enriched.bid_orders[0], Some(50));
    assert_abs_diff_eq!(enriched.ask_prices[0].unwrap(), 24502.0, epsilon = 1e-6);

    // Derived from the top of book and the earlier prev-close.
    assert_abs_diff_eq!(enriched.bid_ask_spread.unwrap(), 4.0, epsilon = 1e-6);
    assert_abs_diff_eq!(enriched.mid_price.unwrap(), 24500.0, epsilon = 1e-6);
    assert_abs_diff_eq!(enriched.change.unwrap(), 50.0, epsilon = 1e-6);
    assert_abs_diff_eq!(enriched.change_percent.unwrap(), 0.2045, epsilon = 1e-9);
    assert_eq!(enriched.order_imbalance, Some(300_000));
}

#[test]
fn unknown_security_id_drops_the_tick_and_counts() {
    let mut merger = TickMerger::new(DEFAULT_STATE_CAP);
    let enricher = Enricher::new(nifty_cache());
    let counters = PipelineCounters::default();
    let now = Utc::now();

    let packet = parse_packet(&full_frame(99999)).unwrap();
    let tick = merger.apply(&packet, now).expect("decode still succeeds");
    if enricher.enrich(&tick).is_none() {
        counters.record_resolve_failure();
    }

    assert_eq!(counters.resolve_failures(), 1);
}

#[test]
fn enriched_ticks_survive_the_bus_wire_format() {
    let mut merger = TickMerger::new(DEFAULT_STATE_CAP);
    let enricher = Enricher::new(nifty_cache());
    let now = Utc::now();

    merger.apply(
        &parse_packet(&prev_close_frame(49229, 24450.0, 14_500_000)).unwrap(),
        now,
    );
    let tick = merger
        .apply(&parse_packet(&full_frame(49229)).unwrap(), now)
        .unwrap();
    let enriched = enricher.enrich(&tick).unwrap();

    let payload = encode_wire(&enriched).unwrap();
    let decoded = decode_wire(&payload).unwrap();
    assert_eq!(decoded, enriched);
}
