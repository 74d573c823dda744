use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::{Auction, AuctionStatus, BidKind};
use crate::error::RejectReason;

pub(crate) const EVT_BID_ACCEPTED: &str = "BID_ACCEPTED";
pub(crate) const EVT_BID_REJECTED: &str = "BID_REJECTED";
pub(crate) const EVT_STATUS_CHANGED: &str = "STATUS_CHANGED";
pub(crate) const EVT_DELAYED_BIDS_INJECTED: &str = "DELAYED_BIDS_INJECTED";
pub(crate) const EVT_RELISTED: &str = "RELISTED";

pub(crate) const EVENT_CODES: [&str; 5] = [
    EVT_BID_ACCEPTED,
    EVT_BID_REJECTED,
    EVT_STATUS_CHANGED,
    EVT_DELAYED_BIDS_INJECTED,
    EVT_RELISTED,
];

// Derived auction state at the moment an event was recorded. Written into the
// event payload and never read back on any live path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct EventSnapshot {
    pub(crate) status: AuctionStatus,
    pub(crate) current_price_cents: i64,
    pub(crate) current_leader_user_id: Option<i64>,
    pub(crate) bid_count: i64,
    pub(crate) reserve_met: bool,
    pub(crate) closing_window_end: Option<DateTime<Utc>>,
}

impl EventSnapshot {
    pub(crate) fn of(a: &Auction) -> Self {
        Self {
            status: a.status,
            current_price_cents: a.current_price_cents,
            current_leader_user_id: a.current_leader_user_id,
            bid_count: a.bid_count,
            reserve_met: a.reserve_met,
            closing_window_end: a.closing_window_end,
        }
    }
}

// Append-only audit record. One closed variant per kind; each carries only the
// fields that kind needs plus the snapshot taken after the mutation (or, for
// rejections, the untouched state the attempt bounced off).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub(crate) enum AuctionEvent {
    BidAccepted {
        bidder_id: i64,
        amount_cents: i64,
        kind: BidKind,
        snapshot: EventSnapshot,
    },
    BidRejected {
        bidder_id: i64,
        amount_cents: Option<i64>,
        reason: RejectReason,
        snapshot: Option<EventSnapshot>,
    },
    StatusChanged {
        from: AuctionStatus,
        to: AuctionStatus,
        snapshot: EventSnapshot,
    },
    DelayedBidsInjected {
        injected: i64,
        snapshot: EventSnapshot,
    },
    Relisted {
        predecessor_auction_id: i64,
        successor_auction_id: i64,
        snapshot: EventSnapshot,
    },
}

impl AuctionEvent {
    pub(crate) fn code(&self) -> &'static str {
        match self {
            AuctionEvent::BidAccepted { .. } => EVT_BID_ACCEPTED,
            AuctionEvent::BidRejected { .. } => EVT_BID_REJECTED,
            AuctionEvent::StatusChanged { .. } => EVT_STATUS_CHANGED,
            AuctionEvent::DelayedBidsInjected { .. } => EVT_DELAYED_BIDS_INJECTED,
            AuctionEvent::Relisted { .. } => EVT_RELISTED,
        }
    }

    pub(crate) fn bidder_id(&self) -> Option<i64> {
        match self {
            AuctionEvent::BidAccepted { bidder_id, .. } => Some(*bidder_id),
            AuctionEvent::BidRejected { bidder_id, .. } => Some(*bidder_id),
            _ => None,
        }
    }

    pub(crate) fn amount_cents(&self) -> Option<i64> {
        match self {
            AuctionEvent::BidAccepted { amount_cents, .. } => Some(*amount_cents),
            AuctionEvent::BidRejected { amount_cents, .. } => *amount_cents,
            _ => None,
        }
    }
}
