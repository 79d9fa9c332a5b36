//! Snapshot assembly
//!
//! The feed sends each snapshot as two frames: bid side, then ask side.
//! The assembler holds the bid half until its ask arrives; a half older
//! than two seconds is stale and discarded rather than paired with the
//! wrong side.

use chrono::{DateTime, Duration, Utc};

use crate::parser::{DepthFrame, DepthLevel};

/// Maximum age of an unpaired half-snapshot.
const HALF_SNAPSHOT_WINDOW_MS: i64 = 2_000;

/// A paired bid/ask view of the full book at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct DepthSnapshot {
    pub time: DateTime<Utc>,
    pub security_id: String,
    pub bids: Vec<DepthLevel>,
    pub asks: Vec<DepthLevel>,
}

/// What the assembler did with a frame.
#[derive(Debug)]
pub enum AssemblyOutcome {
    /// Snapshot completed.
    Complete(DepthSnapshot),
    /// Frame stored or ignored, nothing to emit.
    Pending,
    /// A stale half was dropped while handling this frame.
    DiscardedStale,
}

#[derive(Debug, Default)]
pub struct SnapshotAssembler {
    pending_bid: Option<(DateTime<Utc>, String, Vec<DepthLevel>)>,
}

impl SnapshotAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one frame in. `now` stamps bid halves and drives staleness.
    pub fn on_frame(&mut self, frame: DepthFrame, now: DateTime<Utc>) -> AssemblyOutcome {
        match frame {
            DepthFrame::Bid { header, levels } => {
                let stale = self.take_stale(now).is_some();
                self.pending_bid = Some((now, header.security_id, levels));
                if stale {
                    AssemblyOutcome::DiscardedStale
                } else {
                    AssemblyOutcome::Pending
                }
            }
            DepthFrame::Ask { header, levels } => {
                if self.take_stale(now).is_some() {
                    return AssemblyOutcome::DiscardedStale;
                }
                match self.pending_bid.take() {
                    Some((time, security_id, bids)) if security_id == header.security_id => {
                        AssemblyOutcome::Complete(DepthSnapshot {
                            time,
                            security_id,
                            bids,
                            asks: levels,
                        })
                    }
                    _ => AssemblyOutcome::Pending,
                }
            }
            DepthFrame::Disconnect { .. } => AssemblyOutcome::Pending,
        }
    }

    fn take_stale(
        &mut self,
        now: DateTime<Utc>,
    ) -> Option<(DateTime<Utc>, String, Vec<DepthLevel>)> {
        let stale = matches!(
            &self.pending_bid,
            Some((time, _, _))
                if now.signed_duration_since(*time)
                    > Duration::milliseconds(HALF_SNAPSHOT_WINDOW_MS)
        );
        if stale {
            self.pending_bid.take()
        } else {
            None
        }
    }
}
