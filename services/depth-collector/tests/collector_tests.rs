//! Frame → snapshot → top-of-book integration tests

use byteorder::{LittleEndian, WriteBytesExt};
use chrono::Utc;

use depth_collector::assembler::{AssemblyOutcome, SnapshotAssembler};
use depth_collector::parser::{
    parse_frame, split_frames, RESPONSE_ASK_DEPTH, RESPONSE_BID_DEPTH,
};
use depth_collector::publisher::top_of_book;

fn depth_frame(code: u8, security_id: u32, levels: &[(f32, i32, i32)]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.write_u16::<LittleEndian>((12 + levels.len() * 12) as u16)
        .unwrap();
    buf.write_u8(code).unwrap();
    buf.write_u8(2).unwrap();
    buf.write_u32::<LittleEndian>(security_id).unwrap();
    buf.write_u32::<LittleEndian>(levels.len() as u32).unwrap();
    for (price, qty, orders) in levels {
        buf.write_f32::<LittleEndian>(*price).unwrap();
        buf.write_i32::<LittleEndian>(*qty).unwrap();
        buf.write_i32::<LittleEndian>(*orders).unwrap();
    }
    buf
}

fn ladder(start: f32, step: f32, n: usize) -> Vec<(f32, i32, i32)> {
    (0..n)
        .map(|i| (start + step * i as f32, 1_000 + i as i32, 10 + i as i32))
        .collect()
}

#[test]
fn stacked_message_yields_a_complete_snapshot_and_top_twenty() {
    // One WebSocket message carrying both sides of a 200-level book.
    let bid = depth_frame(RESPONSE_BID_DEPTH, 49543, &ladder(23450.0, -0.5, 200));
    let ask = depth_frame(RESPONSE_ASK_DEPTH, 49543, &ladder(23452.0, 0.5, 200));
    let mut message = bid;
    message.extend_from_slice(&ask);

    let mut assembler = SnapshotAssembler::new();
    let now = Utc::now();
    let mut completed = None;
    for raw in split_frames(&message) {
        let frame = parse_frame(raw).unwrap();
        if let AssemblyOutcome::Complete(snapshot) = assembler.on_frame(frame, now) {
            completed = Some(snapshot);
        }
    }

    let snapshot = completed.expect("bid+ask pair completes");
    assert_eq!(snapshot.security_id, "49543");
    assert_eq!(snapshot.bids.len(), 200);
    assert_eq!(snapshot.asks.len(), 200);
    assert_eq!(snapshot.bids[0].price, 23450.0);
    assert_eq!(snapshot.asks[0].price, 23452.0);

    // 400 rows would land in depth_levels_200; level numbers stay in
    // bounds by construction.
    assert!(snapshot.bids.len() <= 200 && snapshot.asks.len() <= 200);

    let message = top_of_book(&snapshot).expect("two-sided book publishes");
    assert_eq!(message.top_bids.len(), 20);
    assert_eq!(message.top_asks.len(), 20);
    assert_eq!(message.best_bid, 23450.0);
    assert_eq!(message.best_ask, 23452.0);
    assert_eq!(message.current_price, 23450.0);
    assert!((message.spread - 2.0).abs() < 1e-9);
}
