use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::engine::AuctionSnapshot;

const REALTIME_CHANNEL_CAPACITY: usize = 1024;

// One realtime frame: which auction changed, what kind of change, and the
// public snapshot after it. Bidder maxima never ride the hub; they exist only
// in the audit rows. Slow subscribers that lag past the channel capacity lose
// frames and are expected to refetch the auction.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct RealtimeUpdate {
    pub(crate) auction_id: i64,
    pub(crate) code: &'static str,
    pub(crate) snapshot: AuctionSnapshot,
    pub(crate) at: DateTime<Utc>,
}

pub(crate) struct RealtimeHub {
    tx: broadcast::Sender<RealtimeUpdate>,
}

impl RealtimeHub {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(REALTIME_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<RealtimeUpdate> {
        self.tx.subscribe()
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    // Fire-and-forget. Returns whether anyone was listening; a `false` is
    // normal when no dashboard is attached and must never fail the caller.
    pub(crate) fn publish(
        &self,
        auction_id: i64,
        code: &'static str,
        snapshot: AuctionSnapshot,
        at: DateTime<Utc>,
    ) -> bool {
        let update = RealtimeUpdate {
            auction_id,
            code,
            snapshot,
            at,
        };
        self.tx.send(update).is_ok()
    }
}
