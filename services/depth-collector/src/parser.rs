//! Depth frame decoding
//!
//! Frames start with a 12-byte header: `message_length u16`, response
//! code (41 bid / 51 ask / 50 disconnect), exchange segment, `security_id
//! u32`, `num_rows u32`, then `num_rows` 12-byte level triples `{price
//! f32, quantity i32, orders i32}`, best price first. Little-endian
//! throughout. Empty levels (price ≤ 0) pad the tail of a thin book and
//! are skipped.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;
use thiserror::Error;

pub const RESPONSE_BID_DEPTH: u8 = 41;
pub const RESPONSE_ASK_DEPTH: u8 = 51;
pub const RESPONSE_DISCONNECT: u8 = 50;

pub const DEPTH_HEADER_SIZE: usize = 12;
pub const DEPTH_LEVEL_SIZE: usize = 12;
pub const MAX_DEPTH_LEVELS: usize = 200;

#[derive(Debug, Error)]
pub enum DepthDecodeError {
    #[error("frame too short: {actual} bytes, need {expected}")]
    TooShort { expected: usize, actual: usize },

    #[error("level count {0} exceeds the 200-level book")]
    TooManyRows(u32),

    #[error("unknown response code {0}")]
    UnknownResponseCode(u8),

    #[error("truncated frame: {0}")]
    Truncated(#[from] std::io::Error),
}

/// 12-byte depth frame header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepthHeader {
    pub message_length: u16,
    pub response_code: u8,
    pub segment_code: u8,
    pub security_id: String,
    pub num_rows: u32,
}

/// One decoded book level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthLevel {
    pub price: f64,
    pub quantity: i64,
    pub orders: i32,
}

/// One side of the book, or a server disconnect.
#[derive(Debug, Clone, PartialEq)]
pub enum DepthFrame {
    Bid {
        header: DepthHeader,
        levels: Vec<DepthLevel>,
    },
    Ask {
        header: DepthHeader,
        levels: Vec<DepthLevel>,
    },
    Disconnect {
        header: DepthHeader,
        reason_code: u16,
    },
}

fn parse_header(cur: &mut Cursor<&[u8]>) -> Result<DepthHeader, DepthDecodeError> {
    let message_length = cur.read_u16::<LittleEndian>()?;
    let response_code = cur.read_u8()?;
    let segment_code = cur.read_u8()?;
    let security_id = cur.read_u32::<LittleEndian>()?;
    let num_rows = cur.read_u32::<LittleEndian>()?;
    Ok(DepthHeader {
        message_length,
        response_code,
        segment_code,
        security_id: security_id.to_string(),
        num_rows,
    })
}

fn parse_levels(
    cur: &mut Cursor<&[u8]>,
    num_rows: usize,
) -> Result<Vec<DepthLevel>, DepthDecodeError> {
    let mut levels = Vec::with_capacity(num_rows);
    for _ in 0..num_rows {
        let price = cur.read_f32::<LittleEndian>()?;
        let quantity = cur.read_i32::<LittleEndian>()?;
        let orders = cur.read_i32::<LittleEndian>()?;
        if price > 0.0 {
            levels.push(DepthLevel {
                price: f64::from(price),
                quantity: i64::from(quantity.max(0)),
                orders: orders.max(0),
            });
        }
    }
    Ok(levels)
}

/// Decode one depth frame.
pub fn parse_frame(data: &[u8]) -> Result<DepthFrame, DepthDecodeError> {
    if data.len() < DEPTH_HEADER_SIZE {
        return Err(DepthDecodeError::TooShort {
            expected: DEPTH_HEADER_SIZE,
            actual: data.len(),
        });
    }
    let mut cur = Cursor::new(data);
    let header = parse_header(&mut cur)?;

    match header.response_code {
        RESPONSE_DISCONNECT => {
            if data.len() < DEPTH_HEADER_SIZE + 2 {
                return Err(DepthDecodeError::TooShort {
                    expected: DEPTH_HEADER_SIZE + 2,
                    actual: data.len(),
                });
            }
            let reason_code = cur.read_u16::<LittleEndian>()?;
            Ok(DepthFrame::Disconnect {
                header,
                reason_code,
            })
        }
        RESPONSE_BID_DEPTH | RESPONSE_ASK_DEPTH => {
            if header.num_rows as usize > MAX_DEPTH_LEVELS {
                return Err(DepthDecodeError::TooManyRows(header.num_rows));
            }
            let needed = DEPTH_HEADER_SIZE + header.num_rows as usize * DEPTH_LEVEL_SIZE;
            if data.len() < needed {
                return Err(DepthDecodeError::TooShort {
                    expected: needed,
                    actual: data.len(),
                });
            }
            let levels = parse_levels(&mut cur, header.num_rows as usize)?;
            if header.response_code == RESPONSE_BID_DEPTH {
                Ok(DepthFrame::Bid { header, levels })
            } else {
                Ok(DepthFrame::Ask { header, levels })
            }
        }
        other => Err(DepthDecodeError::UnknownResponseCode(other)),
    }
}

/// Split a WebSocket message into frames. Frame length is derived from
/// `num_rows` in each header; anything that does not line up goes to the
/// decoder whole so the failure is counted there.
pub fn split_frames(data: &[u8]) -> Vec<&[u8]> {
    let mut frames = Vec::with_capacity(2);
    let mut rest = data;
    while rest.len() >= DEPTH_HEADER_SIZE {
        let response_code = rest[2];
        let num_rows = u32::from_le_bytes([rest[8], rest[9], rest[10], rest[11]]) as usize;
        let frame_len = match response_code {
            RESPONSE_DISCONNECT => DEPTH_HEADER_SIZE + 2,
            _ if num_rows <= MAX_DEPTH_LEVELS => DEPTH_HEADER_SIZE + num_rows * DEPTH_LEVEL_SIZE,
            _ => rest.len(),
        };
        if frame_len > rest.len() {
            frames.push(rest);
            return frames;
        }
        frames.push(&rest[..frame_len]);
        rest = &rest[frame_len..];
    }
    if !rest.is_empty() {
        frames.push(rest);
    }
    frames
}
