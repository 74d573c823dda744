use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RejectReason;
use crate::increment::{increment_for, min_to_beat};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub(crate) enum AuctionStatus {
    Draft,
    Scheduled,
    Live,
    Closing,
    ClosedNotSold,
    ClosedWaitingOnPayment,
    ClosedPaid,
}

impl AuctionStatus {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            AuctionStatus::Draft => "DRAFT",
            AuctionStatus::Scheduled => "SCHEDULED",
            AuctionStatus::Live => "LIVE",
            AuctionStatus::Closing => "CLOSING",
            AuctionStatus::ClosedNotSold => "CLOSED_NOT_SOLD",
            AuctionStatus::ClosedWaitingOnPayment => "CLOSED_WAITING_ON_PAYMENT",
            AuctionStatus::ClosedPaid => "CLOSED_PAID",
        }
    }

    pub(crate) fn parse(s: &str) -> Option<Self> {
        match s {
            "DRAFT" => Some(AuctionStatus::Draft),
            "SCHEDULED" => Some(AuctionStatus::Scheduled),
            "LIVE" => Some(AuctionStatus::Live),
            "CLOSING" => Some(AuctionStatus::Closing),
            "CLOSED_NOT_SOLD" => Some(AuctionStatus::ClosedNotSold),
            "CLOSED_WAITING_ON_PAYMENT" => Some(AuctionStatus::ClosedWaitingOnPayment),
            "CLOSED_PAID" => Some(AuctionStatus::ClosedPaid),
            _ => None,
        }
    }

    pub(crate) fn is_biddable(&self) -> bool {
        matches!(self, AuctionStatus::Live | AuctionStatus::Closing)
    }

    pub(crate) fn is_closed(&self) -> bool {
        matches!(
            self,
            AuctionStatus::ClosedNotSold
                | AuctionStatus::ClosedWaitingOnPayment
                | AuctionStatus::ClosedPaid
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub(crate) enum BidKind {
    Immediate,
    Delayed,
}

impl BidKind {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            BidKind::Immediate => "IMMEDIATE",
            BidKind::Delayed => "DELAYED",
        }
    }

    pub(crate) fn parse(s: &str) -> Option<Self> {
        match s {
            "IMMEDIATE" => Some(BidKind::Immediate),
            "DELAYED" => Some(BidKind::Delayed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct Auction {
    pub(crate) auction_id: i64,
    pub(crate) listing_id: i64,
    pub(crate) status: AuctionStatus,
    pub(crate) starting_price_cents: i64,
    pub(crate) reserve_price_cents: Option<i64>,
    pub(crate) start_time: Option<DateTime<Utc>>,
    pub(crate) close_time: DateTime<Utc>,
    pub(crate) closing_window_end: Option<DateTime<Utc>>,
    // Derived fields below are written only from Pricing output.
    pub(crate) current_price_cents: i64,
    pub(crate) current_leader_user_id: Option<i64>,
    pub(crate) current_leader_max_cents: Option<i64>,
    pub(crate) bid_count: i64,
    pub(crate) reserve_met: bool,
    pub(crate) relist_of_auction_id: Option<i64>,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) updated_at: DateTime<Utc>,
}

impl Auction {
    pub(crate) fn new_draft(
        auction_id: i64,
        listing_id: i64,
        starting_price_cents: i64,
        reserve_price_cents: Option<i64>,
        close_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            auction_id,
            listing_id,
            status: AuctionStatus::Draft,
            starting_price_cents,
            reserve_price_cents,
            start_time: None,
            close_time,
            closing_window_end: None,
            current_price_cents: starting_price_cents,
            current_leader_user_id: None,
            current_leader_max_cents: None,
            bid_count: 0,
            reserve_met: false,
            relist_of_auction_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub(crate) fn apply_pricing(&mut self, p: &Pricing) {
        self.current_price_cents = p.current_price_cents;
        self.current_leader_user_id = p.current_leader_user_id;
        self.current_leader_max_cents = p.current_leader_max_cents;
        self.bid_count = p.bid_count;
        self.reserve_met = p.reserve_met;
    }
}

// One live max bid per auction x bidder. received_at is set at first receipt
// and never moves; it is the authoritative tie-break timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct LedgerEntry {
    pub(crate) auction_id: i64,
    pub(crate) bidder_id: i64,
    pub(crate) max_bid_cents: i64,
    pub(crate) kind: BidKind,
    pub(crate) received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Pricing {
    pub(crate) current_price_cents: i64,
    pub(crate) current_leader_user_id: Option<i64>,
    pub(crate) current_leader_max_cents: Option<i64>,
    pub(crate) bid_count: i64,
    pub(crate) reserve_met: bool,
}

// Derives leader, visible price, reserve flag and bid count from the Immediate
// entries. Deterministic total order: max desc, receipt asc, bidder id asc.
// The visible price sits one increment above the runner-up, capped at the
// winner's ceiling; a lone bidder pays the starting price. Once the reserve is
// met the price rises to at least the reserve.
pub(crate) fn derive_pricing(
    starting_price_cents: i64,
    reserve_price_cents: Option<i64>,
    entries: &[LedgerEntry],
) -> Pricing {
    let mut active: Vec<&LedgerEntry> = entries
        .iter()
        .filter(|e| e.kind == BidKind::Immediate)
        .collect();
    if active.is_empty() {
        return Pricing {
            current_price_cents: starting_price_cents,
            current_leader_user_id: None,
            current_leader_max_cents: None,
            bid_count: 0,
            reserve_met: false,
        };
    }
    active.sort_by(|a, b| {
        b.max_bid_cents
            .cmp(&a.max_bid_cents)
            .then(a.received_at.cmp(&b.received_at))
            .then(a.bidder_id.cmp(&b.bidder_id))
    });
    let winner = active[0];
    let mut price = match active.get(1) {
        Some(second) => second
            .max_bid_cents
            .saturating_add(increment_for(second.max_bid_cents))
            .min(winner.max_bid_cents),
        None => starting_price_cents.min(winner.max_bid_cents),
    };
    let reserve_met = reserve_price_cents
        .map(|r| winner.max_bid_cents >= r)
        .unwrap_or(false);
    if reserve_met {
        if let Some(r) = reserve_price_cents {
            price = price.max(r);
        }
    }
    Pricing {
        current_price_cents: price,
        current_leader_user_id: Some(winner.bidder_id),
        current_leader_max_cents: Some(winner.max_bid_cents),
        bid_count: active.len() as i64,
        reserve_met,
    }
}

// Staged outcome of one admitted bid. auction_after is the full post-state
// row so persistence and the in-memory apply cannot drift apart.
#[derive(Debug, Clone)]
pub(crate) struct BidEffects {
    pub(crate) auction_id: i64,
    pub(crate) bidder_id: i64,
    pub(crate) submitted_cents: i64,
    pub(crate) submitted_kind: BidKind,
    pub(crate) entry: LedgerEntry,
    pub(crate) entry_is_new: bool,
    pub(crate) auction_after: Auction,
    // False for delayed-mode bids: the ledger row is the only mutation.
    pub(crate) auction_changed: bool,
    pub(crate) at: DateTime<Utc>,
}

// Staged status transition, including the delayed-bid injection that rides
// along with Live -> Closing.
#[derive(Debug, Clone)]
pub(crate) struct TransitionEffects {
    pub(crate) auction_id: i64,
    pub(crate) from: AuctionStatus,
    pub(crate) to: AuctionStatus,
    pub(crate) auction_after: Auction,
    pub(crate) injected_bidders: Vec<i64>,
    pub(crate) at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub(crate) struct RelistEffects {
    pub(crate) predecessor_id: i64,
    pub(crate) successor: Auction,
    pub(crate) at: DateTime<Utc>,
}

// Lock-free read projection served to any caller without touching the engine
// lock once cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct AuctionSnapshot {
    pub(crate) auction_id: i64,
    pub(crate) status: AuctionStatus,
    pub(crate) current_price_cents: i64,
    pub(crate) bid_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) reserve_met: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) closing_window_end: Option<DateTime<Utc>>,
    pub(crate) minimum_next_bid_cents: i64,
}

impl AuctionSnapshot {
    pub(crate) fn of(a: &Auction) -> Self {
        let minimum_next_bid_cents = if a.current_leader_user_id.is_some() {
            min_to_beat(a.current_price_cents)
        } else {
            a.starting_price_cents
        };
        Self {
            auction_id: a.auction_id,
            status: a.status,
            current_price_cents: a.current_price_cents,
            bid_count: a.bid_count,
            reserve_met: a.reserve_price_cents.map(|_| a.reserve_met),
            closing_window_end: a.closing_window_end,
            minimum_next_bid_cents,
        }
    }
}

#[derive(Debug)]
pub(crate) struct EngineState {
    pub(crate) auctions: HashMap<i64, Auction>,
    // auction_id -> bidder_id -> entry
    pub(crate) ledgers: HashMap<i64, HashMap<i64, LedgerEntry>>,
    // predecessor auction_id -> successor auction_id; the relist exactly-once index
    pub(crate) successors: HashMap<i64, i64>,
}

impl EngineState {
    pub(crate) fn new() -> Self {
        Self {
            auctions: HashMap::new(),
            ledgers: HashMap::new(),
            successors: HashMap::new(),
        }
    }

    pub(crate) fn insert_auction(&mut self, a: Auction) {
        if let Some(pred) = a.relist_of_auction_id {
            self.successors.insert(pred, a.auction_id);
        }
        self.auctions.insert(a.auction_id, a);
    }

    pub(crate) fn insert_ledger_entry(&mut self, e: LedgerEntry) {
        self.ledgers
            .entry(e.auction_id)
            .or_default()
            .insert(e.bidder_id, e);
    }

    pub(crate) fn auction(&self, auction_id: i64) -> Option<&Auction> {
        self.auctions.get(&auction_id)
    }

    pub(crate) fn entry(&self, auction_id: i64, bidder_id: i64) -> Option<&LedgerEntry> {
        self.ledgers.get(&auction_id).and_then(|l| l.get(&bidder_id))
    }

    pub(crate) fn ledger_entries(&self, auction_id: i64) -> Vec<LedgerEntry> {
        self.ledgers
            .get(&auction_id)
            .map(|l| l.values().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn max_auction_id(&self) -> i64 {
        self.auctions.keys().copied().max().unwrap_or(0)
    }

    // Validates a bid against the current state and stages its effects.
    // Amount and mode syntax are checked by the caller before the lock; this
    // runs under the per-auction lock and owns the status-dependent rules.
    pub(crate) fn stage_bid(
        &self,
        auction_id: i64,
        bidder_id: i64,
        max_bid_cents: i64,
        kind: BidKind,
        now: DateTime<Utc>,
        quiet_period: Duration,
        delayed_cutoff: Duration,
    ) -> Result<BidEffects, RejectReason> {
        let Some(a) = self.auctions.get(&auction_id) else {
            return Err(RejectReason::AuctionNotFound);
        };
        if !a.status.is_biddable() {
            return Err(RejectReason::AuctionNotBiddable);
        }
        if kind == BidKind::Delayed {
            if a.status != AuctionStatus::Live {
                return Err(RejectReason::DelayedNotLive);
            }
            if now > a.close_time - delayed_cutoff {
                return Err(RejectReason::DelayedCutoffPassed);
            }
        }

        let is_leader = a.current_leader_user_id == Some(bidder_id);
        if !is_leader {
            match a.current_leader_user_id {
                None => {
                    if max_bid_cents < a.starting_price_cents {
                        return Err(RejectReason::BelowStartingPrice);
                    }
                }
                Some(_) => {
                    if max_bid_cents < min_to_beat(a.current_price_cents) {
                        return Err(RejectReason::BelowMinimumIncrement);
                    }
                }
            }
        }

        let existing = self.entry(auction_id, bidder_id);
        let entry_is_new = existing.is_none();
        let entry = match existing {
            // A resubmission may only raise the stored max; the kind follows
            // the submitted mode and received_at never moves.
            Some(e) => LedgerEntry {
                auction_id,
                bidder_id,
                max_bid_cents: e.max_bid_cents.max(max_bid_cents),
                kind,
                received_at: e.received_at,
            },
            None => LedgerEntry {
                auction_id,
                bidder_id,
                max_bid_cents,
                kind,
                received_at: now,
            },
        };

        let mut auction_after = a.clone();
        let mut auction_changed = false;
        if kind == BidKind::Immediate {
            let mut entries = self.ledger_entries(auction_id);
            entries.retain(|e| e.bidder_id != bidder_id);
            entries.push(entry.clone());
            let pricing =
                derive_pricing(a.starting_price_cents, a.reserve_price_cents, &entries);
            auction_after.apply_pricing(&pricing);
            if a.status == AuctionStatus::Closing {
                if let Some(end) = a.closing_window_end {
                    auction_after.closing_window_end = Some(end.max(now + quiet_period));
                }
            }
            auction_after.updated_at = now;
            auction_changed = true;
        }

        Ok(BidEffects {
            auction_id,
            bidder_id,
            submitted_cents: max_bid_cents,
            submitted_kind: kind,
            entry,
            entry_is_new,
            auction_after,
            auction_changed,
            at: now,
        })
    }

    pub(crate) fn apply_bid(&mut self, fx: &BidEffects) {
        self.insert_ledger_entry(fx.entry.clone());
        if fx.auction_changed {
            self.auctions.insert(fx.auction_id, fx.auction_after.clone());
        }
    }

    // Draft -> Live, triggered administratively. Any other status is a
    // re-entrant call and reports no change.
    pub(crate) fn stage_open(
        &self,
        auction_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<TransitionEffects>, RejectReason> {
        let Some(a) = self.auctions.get(&auction_id) else {
            return Err(RejectReason::AuctionNotFound);
        };
        if a.status != AuctionStatus::Draft {
            return Ok(None);
        }
        let mut after = a.clone();
        after.status = AuctionStatus::Live;
        after.start_time = Some(now);
        after.updated_at = now;
        Ok(Some(TransitionEffects {
            auction_id,
            from: AuctionStatus::Draft,
            to: AuctionStatus::Live,
            auction_after: after,
            injected_bidders: Vec::new(),
            at: now,
        }))
    }

    // Time-based transitions: Live -> Closing (with delayed-bid injection) and
    // Closing -> Closed-*. Returns Ok(None) when nothing is due, which is also
    // the answer a racing worker gets after losing the lock race.
    pub(crate) fn stage_transition(
        &self,
        auction_id: i64,
        now: DateTime<Utc>,
        quiet_period: Duration,
    ) -> Result<Option<TransitionEffects>, RejectReason> {
        let Some(a) = self.auctions.get(&auction_id) else {
            return Err(RejectReason::AuctionNotFound);
        };
        match a.status {
            AuctionStatus::Live if now >= a.close_time => {
                let proposed = now + quiet_period;
                let window_end = match a.closing_window_end {
                    Some(existing) if existing > proposed => existing,
                    _ => proposed,
                };
                let entries = self.ledger_entries(auction_id);
                let mut injected_bidders: Vec<i64> = entries
                    .iter()
                    .filter(|e| e.kind == BidKind::Delayed)
                    .map(|e| e.bidder_id)
                    .collect();
                injected_bidders.sort_unstable();
                // Price as if every delayed entry had been immediate all along;
                // received_at carries the original receipt order into the sort.
                let as_immediate: Vec<LedgerEntry> = entries
                    .into_iter()
                    .map(|mut e| {
                        e.kind = BidKind::Immediate;
                        e
                    })
                    .collect();
                let pricing =
                    derive_pricing(a.starting_price_cents, a.reserve_price_cents, &as_immediate);
                let mut after = a.clone();
                after.status = AuctionStatus::Closing;
                after.closing_window_end = Some(window_end);
                after.apply_pricing(&pricing);
                after.updated_at = now;
                Ok(Some(TransitionEffects {
                    auction_id,
                    from: AuctionStatus::Live,
                    to: AuctionStatus::Closing,
                    auction_after: after,
                    injected_bidders,
                    at: now,
                }))
            }
            AuctionStatus::Closing => {
                let window_end = a.closing_window_end.unwrap_or(a.close_time);
                if now < window_end {
                    return Ok(None);
                }
                let unsold = a.bid_count == 0
                    || (a.reserve_price_cents.is_some() && !a.reserve_met);
                let to = if unsold {
                    AuctionStatus::ClosedNotSold
                } else {
                    AuctionStatus::ClosedWaitingOnPayment
                };
                let mut after = a.clone();
                after.status = to;
                after.updated_at = now;
                Ok(Some(TransitionEffects {
                    auction_id,
                    from: AuctionStatus::Closing,
                    to,
                    auction_after: after,
                    injected_bidders: Vec::new(),
                    at: now,
                }))
            }
            _ => Ok(None),
        }
    }

    // ClosedWaitingOnPayment -> ClosedPaid, on confirmation from the payment
    // collaborator. Idempotent: any other status reports no change.
    pub(crate) fn stage_payment(
        &self,
        auction_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<TransitionEffects>, RejectReason> {
        let Some(a) = self.auctions.get(&auction_id) else {
            return Err(RejectReason::AuctionNotFound);
        };
        if a.status != AuctionStatus::ClosedWaitingOnPayment {
            return Ok(None);
        }
        let mut after = a.clone();
        after.status = AuctionStatus::ClosedPaid;
        after.updated_at = now;
        Ok(Some(TransitionEffects {
            auction_id,
            from: AuctionStatus::ClosedWaitingOnPayment,
            to: AuctionStatus::ClosedPaid,
            auction_after: after,
            injected_bidders: Vec::new(),
            at: now,
        }))
    }

    pub(crate) fn apply_transition(&mut self, fx: &TransitionEffects) {
        if !fx.injected_bidders.is_empty() {
            if let Some(ledger) = self.ledgers.get_mut(&fx.auction_id) {
                for bidder_id in &fx.injected_bidders {
                    if let Some(e) = ledger.get_mut(bidder_id) {
                        e.kind = BidKind::Immediate;
                    }
                }
            }
        }
        self.auctions.insert(fx.auction_id, fx.auction_after.clone());
    }

    // Relist eligibility and effects, re-validated in full under the lock.
    // Returns None when the auction is missing, ineligible, still cooling
    // down, or already has a successor.
    pub(crate) fn stage_relist(
        &self,
        auction_id: i64,
        successor_id: i64,
        now: DateTime<Utc>,
        relist_delay: Duration,
        default_duration: Duration,
    ) -> Option<RelistEffects> {
        let a = self.auctions.get(&auction_id)?;
        if a.status != AuctionStatus::ClosedNotSold {
            return None;
        }
        if a.reserve_price_cents.is_none() || a.reserve_met {
            return None;
        }
        if self.successors.contains_key(&auction_id) {
            return None;
        }
        if a.updated_at > now - relist_delay {
            return None;
        }
        let duration = match a.start_time {
            Some(start) => a.close_time - start,
            None => default_duration,
        };
        let successor = Auction {
            auction_id: successor_id,
            listing_id: a.listing_id,
            status: AuctionStatus::Live,
            starting_price_cents: a.starting_price_cents,
            reserve_price_cents: a.reserve_price_cents,
            start_time: Some(now),
            close_time: now + duration,
            closing_window_end: None,
            current_price_cents: a.starting_price_cents,
            current_leader_user_id: None,
            current_leader_max_cents: None,
            bid_count: 0,
            reserve_met: false,
            relist_of_auction_id: Some(auction_id),
            created_at: now,
            updated_at: now,
        };
        Some(RelistEffects {
            predecessor_id: auction_id,
            successor,
            at: now,
        })
    }

    pub(crate) fn apply_relist(&mut self, fx: &RelistEffects) {
        self.successors
            .insert(fx.predecessor_id, fx.successor.auction_id);
        self.auctions
            .insert(fx.successor.auction_id, fx.successor.clone());
    }

    // Auctions whose time-based transition is due, earliest deadline first,
    // capped by the per-tick budget.
    pub(crate) fn due_for_transition(&self, now: DateTime<Utc>, limit: usize) -> Vec<i64> {
        let mut due: Vec<(DateTime<Utc>, i64)> = Vec::new();
        for a in self.auctions.values() {
            match a.status {
                AuctionStatus::Live if now >= a.close_time => {
                    due.push((a.close_time, a.auction_id));
                }
                AuctionStatus::Closing => {
                    let end = a.closing_window_end.unwrap_or(a.close_time);
                    if now >= end {
                        due.push((end, a.auction_id));
                    }
                }
                _ => {}
            }
        }
        due.sort_unstable();
        due.into_iter().take(limit.max(1)).map(|(_, id)| id).collect()
    }

    // Not-sold auctions past the relist cooldown with no successor yet,
    // oldest close decision first.
    pub(crate) fn due_for_relist(
        &self,
        now: DateTime<Utc>,
        relist_delay: Duration,
        limit: usize,
    ) -> Vec<i64> {
        let cutoff = now - relist_delay;
        let mut due: Vec<(DateTime<Utc>, i64)> = Vec::new();
        for a in self.auctions.values() {
            if a.status != AuctionStatus::ClosedNotSold {
                continue;
            }
            if a.reserve_price_cents.is_none() || a.reserve_met {
                continue;
            }
            if self.successors.contains_key(&a.auction_id) {
                continue;
            }
            if a.updated_at > cutoff {
                continue;
            }
            due.push((a.updated_at, a.auction_id));
        }
        due.sort_unstable();
        due.into_iter().take(limit.max(1)).map(|(_, id)| id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const START_PRICE: i64 = 10_000;
    const DAY_SECS: i64 = 86_400;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_735_689_600 + secs, 0).unwrap()
    }

    fn quiet() -> Duration {
        Duration::seconds(300)
    }

    fn cutoff() -> Duration {
        Duration::hours(3)
    }

    fn live_auction(id: i64, reserve: Option<i64>) -> Auction {
        let mut a = Auction::new_draft(id, 900 + id, START_PRICE, reserve, at(DAY_SECS), at(0));
        a.status = AuctionStatus::Live;
        a.start_time = Some(at(0));
        a
    }

    fn engine_with(a: Auction) -> EngineState {
        let mut eng = EngineState::new();
        eng.insert_auction(a);
        eng
    }

    fn place(
        eng: &mut EngineState,
        auction_id: i64,
        bidder_id: i64,
        max: i64,
        kind: BidKind,
        now: DateTime<Utc>,
    ) -> Result<BidEffects, RejectReason> {
        let fx = eng.stage_bid(auction_id, bidder_id, max, kind, now, quiet(), cutoff())?;
        eng.apply_bid(&fx);
        Ok(fx)
    }

    fn advance(
        eng: &mut EngineState,
        auction_id: i64,
        now: DateTime<Utc>,
    ) -> Option<TransitionEffects> {
        let fx = eng.stage_transition(auction_id, now, quiet()).unwrap()?;
        eng.apply_transition(&fx);
        Some(fx)
    }

    #[test]
    fn no_bid_baseline() {
        let eng = engine_with(live_auction(1, None));
        let a = eng.auction(1).unwrap();
        assert_eq!(a.current_price_cents, START_PRICE);
        assert_eq!(a.current_leader_user_id, None);
        assert_eq!(a.bid_count, 0);
        assert!(!a.reserve_met);
        let snap = AuctionSnapshot::of(a);
        assert_eq!(snap.minimum_next_bid_cents, START_PRICE);
        assert_eq!(snap.reserve_met, None);
    }

    #[test]
    fn first_bid_prices_at_starting() {
        let mut eng = engine_with(live_auction(1, None));
        place(&mut eng, 1, 101, 15_000, BidKind::Immediate, at(60)).unwrap();
        let a = eng.auction(1).unwrap();
        assert_eq!(a.current_price_cents, START_PRICE);
        assert_eq!(a.current_leader_user_id, Some(101));
        assert_eq!(a.current_leader_max_cents, Some(15_000));
        assert_eq!(a.bid_count, 1);
    }

    #[test]
    fn second_bid_prices_one_increment_over_runner_up() {
        let mut eng = engine_with(live_auction(1, None));
        place(&mut eng, 1, 101, 15_000, BidKind::Immediate, at(60)).unwrap();
        place(&mut eng, 1, 102, 14_000, BidKind::Immediate, at(120)).unwrap();
        let a = eng.auction(1).unwrap();
        assert_eq!(a.current_price_cents, 14_500);
        assert_eq!(a.current_leader_user_id, Some(101));
        assert_eq!(a.current_leader_max_cents, Some(15_000));
        assert_eq!(a.bid_count, 2);
        let snap = AuctionSnapshot::of(a);
        assert_eq!(snap.minimum_next_bid_cents, 15_000);
    }

    #[test]
    fn reserve_met_lifts_price_to_reserve() {
        let mut eng = engine_with(live_auction(1, Some(20_000)));
        place(&mut eng, 1, 101, 25_000, BidKind::Immediate, at(60)).unwrap();
        let a = eng.auction(1).unwrap();
        assert!(a.reserve_met);
        assert_eq!(a.current_price_cents, 20_000);
        assert_eq!(a.current_leader_max_cents, Some(25_000));
        assert_eq!(AuctionSnapshot::of(a).reserve_met, Some(true));
    }

    #[test]
    fn reserve_unmet_keeps_starting_price() {
        let mut eng = engine_with(live_auction(1, Some(20_000)));
        place(&mut eng, 1, 101, 15_000, BidKind::Immediate, at(60)).unwrap();
        let a = eng.auction(1).unwrap();
        assert!(!a.reserve_met);
        assert_eq!(a.current_price_cents, START_PRICE);
        assert_eq!(AuctionSnapshot::of(a).reserve_met, Some(false));
    }

    #[test]
    fn resubmission_never_lowers_stored_max() {
        let mut eng = engine_with(live_auction(1, None));
        place(&mut eng, 1, 101, 15_000, BidKind::Immediate, at(60)).unwrap();
        let fx = place(&mut eng, 1, 101, 12_000, BidKind::Immediate, at(120)).unwrap();
        assert_eq!(fx.submitted_cents, 12_000);
        assert_eq!(eng.entry(1, 101).unwrap().max_bid_cents, 15_000);
        assert_eq!(eng.auction(1).unwrap().current_price_cents, START_PRICE);
    }

    #[test]
    fn leader_raise_skips_increment_check_and_keeps_price() {
        let mut eng = engine_with(live_auction(1, None));
        place(&mut eng, 1, 101, 15_000, BidKind::Immediate, at(60)).unwrap();
        place(&mut eng, 1, 102, 14_000, BidKind::Immediate, at(120)).unwrap();
        // 14_600 is below min_to_beat(14_500) but the leader is exempt.
        place(&mut eng, 1, 101, 14_600, BidKind::Immediate, at(180)).unwrap();
        let a = eng.auction(1).unwrap();
        assert_eq!(a.current_leader_user_id, Some(101));
        assert_eq!(eng.entry(1, 101).unwrap().max_bid_cents, 15_000);
        assert_eq!(a.current_price_cents, 14_500);
        // A real raise also leaves the visible price at one increment over the
        // runner-up.
        place(&mut eng, 1, 101, 30_000, BidKind::Immediate, at(240)).unwrap();
        assert_eq!(eng.auction(1).unwrap().current_price_cents, 14_500);
        assert_eq!(eng.auction(1).unwrap().current_leader_max_cents, Some(30_000));
    }

    #[test]
    fn challenger_below_min_to_beat_rejected() {
        let mut eng = engine_with(live_auction(1, None));
        place(&mut eng, 1, 101, 15_000, BidKind::Immediate, at(60)).unwrap();
        place(&mut eng, 1, 102, 14_000, BidKind::Immediate, at(120)).unwrap();
        let err = place(&mut eng, 1, 103, 14_900, BidKind::Immediate, at(180)).unwrap_err();
        assert_eq!(err, RejectReason::BelowMinimumIncrement);
        // Exactly min_to_beat is admissible.
        place(&mut eng, 1, 103, 15_000, BidKind::Immediate, at(240)).unwrap();
        let a = eng.auction(1).unwrap();
        // Equal max: the earlier receipt keeps the lead.
        assert_eq!(a.current_leader_user_id, Some(101));
        assert_eq!(a.current_price_cents, 15_000);
        assert_eq!(a.bid_count, 3);
    }

    #[test]
    fn below_starting_rejected_when_no_leader() {
        let mut eng = engine_with(live_auction(1, None));
        let err = place(&mut eng, 1, 101, 9_900, BidKind::Immediate, at(60)).unwrap_err();
        assert_eq!(err, RejectReason::BelowStartingPrice);
        assert_eq!(eng.auction(1).unwrap().bid_count, 0);
    }

    #[test]
    fn ceiling_sized_bids_keep_pricing_total() {
        // Largest whole-dollar amount that fits in cents. Two of them force
        // the runner-up-plus-increment sum past i64; the price must land on
        // the winner's ceiling, not wrap or panic.
        let top = 9_223_372_036_854_775_800;
        let mut eng = engine_with(live_auction(1, None));
        place(&mut eng, 1, 101, top, BidKind::Immediate, at(60)).unwrap();
        place(&mut eng, 1, 102, top, BidKind::Immediate, at(120)).unwrap();
        let a = eng.auction(1).unwrap();
        assert_eq!(a.current_leader_user_id, Some(101));
        assert_eq!(a.current_price_cents, top);
        assert_eq!(AuctionSnapshot::of(a).minimum_next_bid_cents, i64::MAX);
    }

    #[test]
    fn non_leader_resubmission_must_meet_increment() {
        let mut eng = engine_with(live_auction(1, None));
        place(&mut eng, 1, 101, 15_000, BidKind::Immediate, at(60)).unwrap();
        place(&mut eng, 1, 102, 14_000, BidKind::Immediate, at(120)).unwrap();
        // 102 trails; a raise below min_to_beat(14_500) is turned away.
        let err = place(&mut eng, 1, 102, 14_200, BidKind::Immediate, at(180)).unwrap_err();
        assert_eq!(err, RejectReason::BelowMinimumIncrement);
        assert_eq!(eng.entry(1, 102).unwrap().max_bid_cents, 14_000);
    }

    #[test]
    fn tie_break_prefers_earlier_receipt_then_lower_id() {
        let e1 = LedgerEntry {
            auction_id: 1,
            bidder_id: 200,
            max_bid_cents: 15_000,
            kind: BidKind::Immediate,
            received_at: at(10),
        };
        let e2 = LedgerEntry {
            auction_id: 1,
            bidder_id: 100,
            max_bid_cents: 15_000,
            kind: BidKind::Immediate,
            received_at: at(20),
        };
        let p = derive_pricing(START_PRICE, None, &[e2.clone(), e1.clone()]);
        assert_eq!(p.current_leader_user_id, Some(200));

        let e3 = LedgerEntry { received_at: at(10), ..e2 };
        let p = derive_pricing(START_PRICE, None, &[e1, e3]);
        assert_eq!(p.current_leader_user_id, Some(100));
    }

    #[test]
    fn rejects_on_missing_or_unbiddable_auction() {
        let mut eng = engine_with(live_auction(1, None));
        let err = place(&mut eng, 404, 101, 15_000, BidKind::Immediate, at(60)).unwrap_err();
        assert_eq!(err, RejectReason::AuctionNotFound);

        let draft = Auction::new_draft(2, 902, START_PRICE, None, at(DAY_SECS), at(0));
        eng.insert_auction(draft);
        let err = place(&mut eng, 2, 101, 15_000, BidKind::Immediate, at(60)).unwrap_err();
        assert_eq!(err, RejectReason::AuctionNotBiddable);
    }

    #[test]
    fn delayed_timing_rules() {
        let mut eng = engine_with(live_auction(1, None));
        // Exactly at the cutoff is still allowed.
        let exactly = at(DAY_SECS) - cutoff();
        place(&mut eng, 1, 101, 15_000, BidKind::Delayed, exactly).unwrap();
        let err = place(&mut eng, 1, 102, 16_000, BidKind::Delayed, exactly + Duration::seconds(1))
            .unwrap_err();
        assert_eq!(err, RejectReason::DelayedCutoffPassed);

        advance(&mut eng, 1, at(DAY_SECS)).unwrap();
        let err = place(&mut eng, 1, 103, 50_000, BidKind::Delayed, at(DAY_SECS + 10)).unwrap_err();
        assert_eq!(err, RejectReason::DelayedNotLive);
    }

    #[test]
    fn delayed_bid_invisible_until_injection() {
        let mut eng = engine_with(live_auction(1, None));
        place(&mut eng, 1, 101, 15_000, BidKind::Immediate, at(60)).unwrap();
        place(&mut eng, 1, 102, 14_000, BidKind::Immediate, at(120)).unwrap();
        let fx = place(&mut eng, 1, 103, 30_000, BidKind::Delayed, at(180)).unwrap();
        assert!(!fx.auction_changed);
        let a = eng.auction(1).unwrap();
        assert_eq!(a.current_price_cents, 14_500);
        assert_eq!(a.bid_count, 2);
        assert_eq!(a.updated_at, at(120));

        let fx = advance(&mut eng, 1, at(DAY_SECS)).unwrap();
        assert_eq!(fx.to, AuctionStatus::Closing);
        assert_eq!(fx.injected_bidders, vec![103]);
        let a = eng.auction(1).unwrap();
        assert_eq!(a.current_leader_user_id, Some(103));
        // Runner-up is 101 at 15_000; one increment over, capped by 30_000.
        assert_eq!(a.current_price_cents, 15_500);
        assert_eq!(a.bid_count, 3);
        assert!(eng
            .ledger_entries(1)
            .iter()
            .all(|e| e.kind == BidKind::Immediate));
    }

    #[test]
    fn injection_orders_by_original_receipt() {
        let mut eng = engine_with(live_auction(1, None));
        place(&mut eng, 1, 103, 15_000, BidKind::Delayed, at(30)).unwrap();
        place(&mut eng, 1, 101, 15_000, BidKind::Immediate, at(60)).unwrap();
        advance(&mut eng, 1, at(DAY_SECS)).unwrap();
        // Equal max: the delayed bid was received first, so it leads.
        assert_eq!(eng.auction(1).unwrap().current_leader_user_id, Some(103));
    }

    #[test]
    fn injection_runs_once() {
        let mut eng = engine_with(live_auction(1, None));
        place(&mut eng, 1, 103, 30_000, BidKind::Delayed, at(60)).unwrap();
        let fx = advance(&mut eng, 1, at(DAY_SECS)).unwrap();
        assert_eq!(fx.injected_bidders.len(), 1);
        // Second pass while Closing and not yet due: no change at all.
        assert!(eng
            .stage_transition(1, at(DAY_SECS + 1), quiet())
            .unwrap()
            .is_none());
        // Nothing left to convert even at the final close.
        let fx = advance(&mut eng, 1, at(DAY_SECS) + quiet()).unwrap();
        assert!(fx.injected_bidders.is_empty());
        assert_eq!(fx.to, AuctionStatus::ClosedWaitingOnPayment);
    }

    #[test]
    fn live_to_closing_then_waiting_on_payment() {
        let mut eng = engine_with(live_auction(1, None));
        place(&mut eng, 1, 101, 15_000, BidKind::Immediate, at(60)).unwrap();
        assert!(eng
            .stage_transition(1, at(DAY_SECS - 1), quiet())
            .unwrap()
            .is_none());

        let fx = advance(&mut eng, 1, at(DAY_SECS)).unwrap();
        assert_eq!((fx.from, fx.to), (AuctionStatus::Live, AuctionStatus::Closing));
        let a = eng.auction(1).unwrap();
        assert_eq!(a.closing_window_end, Some(at(DAY_SECS) + quiet()));

        assert!(eng
            .stage_transition(1, at(DAY_SECS + 10), quiet())
            .unwrap()
            .is_none());
        let fx = advance(&mut eng, 1, at(DAY_SECS) + quiet()).unwrap();
        assert_eq!(fx.to, AuctionStatus::ClosedWaitingOnPayment);
        // Terminal for the sweep: nothing further is due.
        assert!(eng
            .stage_transition(1, at(DAY_SECS * 2), quiet())
            .unwrap()
            .is_none());
    }

    #[test]
    fn closing_without_bids_ends_not_sold() {
        let mut eng = engine_with(live_auction(1, None));
        advance(&mut eng, 1, at(DAY_SECS)).unwrap();
        let fx = advance(&mut eng, 1, at(DAY_SECS) + quiet()).unwrap();
        assert_eq!(fx.to, AuctionStatus::ClosedNotSold);
    }

    #[test]
    fn closing_with_unmet_reserve_ends_not_sold() {
        let mut eng = engine_with(live_auction(1, Some(20_000)));
        place(&mut eng, 1, 101, 15_000, BidKind::Immediate, at(60)).unwrap();
        advance(&mut eng, 1, at(DAY_SECS)).unwrap();
        let fx = advance(&mut eng, 1, at(DAY_SECS) + quiet()).unwrap();
        assert_eq!(fx.to, AuctionStatus::ClosedNotSold);
    }

    #[test]
    fn quiet_period_extension_is_full_length() {
        let mut eng = engine_with(live_auction(1, None));
        place(&mut eng, 1, 101, 15_000, BidKind::Immediate, at(60)).unwrap();
        advance(&mut eng, 1, at(DAY_SECS)).unwrap();
        let end = eng.auction(1).unwrap().closing_window_end.unwrap();

        let bid_time = end - Duration::seconds(1);
        place(&mut eng, 1, 102, 16_000, BidKind::Immediate, bid_time).unwrap();
        let new_end = eng.auction(1).unwrap().closing_window_end.unwrap();
        assert_eq!(new_end, bid_time + quiet());
        assert!(new_end > end);
    }

    #[test]
    fn late_bid_before_sweep_still_extends() {
        let mut eng = engine_with(live_auction(1, None));
        place(&mut eng, 1, 101, 15_000, BidKind::Immediate, at(60)).unwrap();
        advance(&mut eng, 1, at(DAY_SECS)).unwrap();
        let end = eng.auction(1).unwrap().closing_window_end.unwrap();

        // The window has passed but no sweep has run yet; the auction is still
        // Closing, so the bid is admitted and pushes the close back out.
        let bid_time = end + Duration::seconds(10);
        place(&mut eng, 1, 102, 16_000, BidKind::Immediate, bid_time).unwrap();
        assert!(eng
            .stage_transition(1, bid_time + Duration::seconds(1), quiet())
            .unwrap()
            .is_none());
        assert_eq!(
            eng.auction(1).unwrap().closing_window_end,
            Some(bid_time + quiet())
        );
    }

    #[test]
    fn mode_switch_keeps_received_at_and_skips_repricing() {
        let mut eng = engine_with(live_auction(1, None));
        place(&mut eng, 1, 101, 15_000, BidKind::Immediate, at(60)).unwrap();
        let fx = place(&mut eng, 1, 101, 18_000, BidKind::Delayed, at(120)).unwrap();
        assert!(!fx.auction_changed);
        let e = eng.entry(1, 101).unwrap();
        assert_eq!(e.kind, BidKind::Delayed);
        assert_eq!(e.max_bid_cents, 18_000);
        assert_eq!(e.received_at, at(60));
        // Derived fields are not recomputed on the delayed path; the stored
        // snapshot still names 101 until the next pricing run.
        let a = eng.auction(1).unwrap();
        assert_eq!(a.current_leader_user_id, Some(101));
        assert_eq!(a.bid_count, 1);

        let fx = advance(&mut eng, 1, at(DAY_SECS)).unwrap();
        assert_eq!(fx.injected_bidders, vec![101]);
        let a = eng.auction(1).unwrap();
        assert_eq!(a.current_leader_user_id, Some(101));
        assert_eq!(a.bid_count, 1);
    }

    #[test]
    fn open_and_payment_transitions() {
        let draft = Auction::new_draft(5, 905, START_PRICE, None, at(DAY_SECS), at(0));
        let mut eng = engine_with(draft);
        let fx = eng.stage_open(5, at(10)).unwrap().unwrap();
        eng.apply_transition(&fx);
        let a = eng.auction(5).unwrap();
        assert_eq!(a.status, AuctionStatus::Live);
        assert_eq!(a.start_time, Some(at(10)));
        assert!(eng.stage_open(5, at(20)).unwrap().is_none());

        place(&mut eng, 5, 101, 15_000, BidKind::Immediate, at(60)).unwrap();
        advance(&mut eng, 5, at(DAY_SECS)).unwrap();
        advance(&mut eng, 5, at(DAY_SECS) + quiet()).unwrap();
        let fx = eng.stage_payment(5, at(DAY_SECS * 2)).unwrap().unwrap();
        eng.apply_transition(&fx);
        assert_eq!(eng.auction(5).unwrap().status, AuctionStatus::ClosedPaid);
        assert!(eng.stage_payment(5, at(DAY_SECS * 2 + 10)).unwrap().is_none());
    }

    #[test]
    fn relist_waits_for_cooldown_then_copies_terms() {
        let mut eng = engine_with(live_auction(1, Some(20_000)));
        place(&mut eng, 1, 101, 15_000, BidKind::Immediate, at(60)).unwrap();
        advance(&mut eng, 1, at(DAY_SECS)).unwrap();
        advance(&mut eng, 1, at(DAY_SECS) + quiet()).unwrap();
        let closed_at = eng.auction(1).unwrap().updated_at;

        let delay = Duration::hours(24);
        assert!(eng
            .due_for_relist(closed_at + Duration::hours(1), delay, 16)
            .is_empty());
        let due_at = closed_at + delay;
        assert_eq!(eng.due_for_relist(due_at, delay, 16), vec![1]);

        let fx = eng
            .stage_relist(1, 2, due_at, delay, Duration::days(7))
            .unwrap();
        let s = &fx.successor;
        assert_eq!(s.auction_id, 2);
        assert_eq!(s.listing_id, eng.auction(1).unwrap().listing_id);
        assert_eq!(s.status, AuctionStatus::Live);
        assert_eq!(s.start_time, Some(due_at));
        // Original ran from at(0) to at(DAY_SECS); the successor gets the same
        // span.
        assert_eq!(s.close_time, due_at + Duration::seconds(DAY_SECS));
        assert_eq!(s.starting_price_cents, START_PRICE);
        assert_eq!(s.reserve_price_cents, Some(20_000));
        assert_eq!(s.relist_of_auction_id, Some(1));
        assert_eq!(s.bid_count, 0);
        assert_eq!(s.current_price_cents, START_PRICE);

        eng.apply_relist(&fx);
        assert!(eng.stage_relist(1, 3, due_at, delay, Duration::days(7)).is_none());
        assert!(eng.due_for_relist(due_at + delay, delay, 16).is_empty());
    }

    #[test]
    fn relist_uses_default_duration_when_never_live() {
        // An imported row can be ClosedNotSold without ever having gone Live.
        let mut a = Auction::new_draft(1, 901, START_PRICE, Some(20_000), at(DAY_SECS), at(0));
        a.status = AuctionStatus::ClosedNotSold;
        let mut eng = engine_with(a);
        let now = at(DAY_SECS * 3);
        let fx = eng
            .stage_relist(1, 2, now, Duration::hours(24), Duration::days(7))
            .unwrap();
        assert_eq!(fx.successor.close_time, now + Duration::days(7));
    }

    #[test]
    fn relist_requires_unmet_reserve() {
        // No reserve: never relisted, even when not sold.
        let mut eng = engine_with(live_auction(1, None));
        advance(&mut eng, 1, at(DAY_SECS)).unwrap();
        advance(&mut eng, 1, at(DAY_SECS) + quiet()).unwrap();
        assert_eq!(eng.auction(1).unwrap().status, AuctionStatus::ClosedNotSold);
        assert!(eng
            .stage_relist(1, 2, at(DAY_SECS * 30), Duration::hours(24), Duration::days(7))
            .is_none());
    }

    #[test]
    fn successor_can_relist_after_failing_again() {
        let mut eng = engine_with(live_auction(1, Some(20_000)));
        advance(&mut eng, 1, at(DAY_SECS)).unwrap();
        advance(&mut eng, 1, at(DAY_SECS) + quiet()).unwrap();
        let delay = Duration::hours(24);
        let t1 = eng.auction(1).unwrap().updated_at + delay;
        let fx = eng.stage_relist(1, 2, t1, delay, Duration::days(7)).unwrap();
        eng.apply_relist(&fx);

        // The successor runs and fails its reserve too.
        let succ_close = eng.auction(2).unwrap().close_time;
        advance(&mut eng, 2, succ_close).unwrap();
        let end = eng.auction(2).unwrap().closing_window_end.unwrap();
        advance(&mut eng, 2, end).unwrap();
        assert_eq!(eng.auction(2).unwrap().status, AuctionStatus::ClosedNotSold);
        let t2 = eng.auction(2).unwrap().updated_at + delay;
        let fx = eng.stage_relist(2, 3, t2, delay, Duration::days(7)).unwrap();
        assert_eq!(fx.successor.relist_of_auction_id, Some(2));
    }

    #[test]
    fn due_scan_orders_by_deadline_and_respects_budget() {
        let mut eng = EngineState::new();
        let mut early = live_auction(1, None);
        early.close_time = at(100);
        let mut later = live_auction(2, None);
        later.close_time = at(200);
        eng.insert_auction(later);
        eng.insert_auction(early);

        assert_eq!(eng.due_for_transition(at(50), 16), Vec::<i64>::new());
        assert_eq!(eng.due_for_transition(at(300), 16), vec![1, 2]);
        assert_eq!(eng.due_for_transition(at(300), 1), vec![1]);
    }

    #[test]
    fn derived_invariants_hold_across_a_bid_sequence() {
        let mut eng = engine_with(live_auction(1, Some(30_000)));
        let script: [(i64, i64, BidKind); 6] = [
            (101, 12_000, BidKind::Immediate),
            (102, 15_000, BidKind::Immediate),
            (103, 20_000, BidKind::Delayed),
            (101, 18_000, BidKind::Immediate),
            (104, 31_000, BidKind::Immediate),
            (102, 35_000, BidKind::Immediate),
        ];
        let mut clock = 60;
        for (bidder, max, kind) in script {
            clock += 60;
            let _ = place(&mut eng, 1, bidder, max, kind, at(clock));
            let a = eng.auction(1).unwrap();
            if let Some(leader_max) = a.current_leader_max_cents {
                assert!(a.current_price_cents <= leader_max);
            }
            assert!(a.current_price_cents >= START_PRICE);
            let immediate = eng
                .ledger_entries(1)
                .iter()
                .filter(|e| e.kind == BidKind::Immediate)
                .count() as i64;
            assert_eq!(a.bid_count, immediate);
            assert_eq!(
                a.reserve_met,
                a.current_leader_max_cents.map(|m| m >= 30_000).unwrap_or(false)
            );
        }
    }
}
