use std::str::FromStr;
use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::engine::{AuctionSnapshot, BidKind};
use crate::error::{ApiError, RejectReason};
use crate::events::{AuctionEvent, EventSnapshot};
use crate::increment::is_whole_dollar;
use crate::state::{lock_read, AppState, ProfiledMutexGuard};
use crate::store;

// Dollar-string to cents. Fractional, non-positive and out-of-range input all
// come back as InvalidAmount so the caller emits the usual rejection envelope.
pub(crate) fn parse_whole_dollar_bid(amount: &str) -> Result<i64, RejectReason> {
    let d = Decimal::from_str(amount.trim()).map_err(|_| RejectReason::InvalidAmount)?;
    if d <= Decimal::ZERO {
        return Err(RejectReason::InvalidAmount);
    }
    let scaled = d
        .checked_mul(Decimal::from(100))
        .ok_or(RejectReason::InvalidAmount)?;
    if scaled != scaled.trunc() {
        return Err(RejectReason::InvalidAmount);
    }
    let cents = scaled.to_i64().ok_or(RejectReason::InvalidAmount)?;
    if cents <= 0 || !is_whole_dollar(cents) {
        return Err(RejectReason::InvalidAmount);
    }
    Ok(cents)
}

#[derive(Debug)]
pub(crate) enum BidOutcome {
    Accepted {
        snapshot: AuctionSnapshot,
    },
    Rejected {
        reason: RejectReason,
        snapshot: Option<AuctionSnapshot>,
    },
}

async fn acquire_bid_lock(state: &AppState, auction_id: i64) -> Option<ProfiledMutexGuard> {
    let budget = Duration::from_millis(state.cfg.auction.bid_lock_timeout_ms);
    let mut attempt = 0u32;
    loop {
        match tokio::time::timeout(budget, state.auction_locks.lock(auction_id)).await {
            Ok(guard) => return Some(guard),
            Err(_timeout) => {
                attempt += 1;
                state.perf.bid_lock_retries.fetch_add(1, Ordering::Relaxed);
                if attempt >= state.cfg.auction.bid_lock_retries.max(1) {
                    return None;
                }
            }
        }
    }
}

// Record the rejection for audit; answer with the current read-model snapshot.
pub(crate) async fn reject_bid(
    state: &AppState,
    auction_id: i64,
    bidder_id: i64,
    amount_cents: Option<i64>,
    reason: RejectReason,
    request_id: Uuid,
) -> BidOutcome {
    state.perf.bids_rejected.fetch_add(1, Ordering::Relaxed);
    let pre_state = {
        let eng = lock_read(&state.engine, "bids.reject_bid.engine_read").await;
        eng.auction(auction_id).map(EventSnapshot::of)
    };
    let event = AuctionEvent::BidRejected {
        bidder_id,
        amount_cents,
        reason,
        snapshot: pre_state,
    };
    store::persist_bid_rejected(state, auction_id, &event, request_id).await;
    let snapshot = state
        .snapshot_cache
        .get(&auction_id)
        .map(|s| s.value().clone());
    BidOutcome::Rejected { reason, snapshot }
}

// Bid path: syntax checks before the lock, status and price rules under it,
// then persist, apply, announce. The per-auction lock serializes bids on one
// auction; other auctions never wait here.
pub(crate) async fn place_bid(
    state: &AppState,
    auction_id: i64,
    bidder_id: i64,
    max_bid_cents: i64,
    kind: BidKind,
    request_id: Uuid,
    now: DateTime<Utc>,
) -> Result<BidOutcome, ApiError> {
    state.perf.bids_received.fetch_add(1, Ordering::Relaxed);

    if max_bid_cents <= 0 || !is_whole_dollar(max_bid_cents) {
        let outcome = reject_bid(
            state,
            auction_id,
            bidder_id,
            Some(max_bid_cents),
            RejectReason::InvalidAmount,
            request_id,
        )
        .await;
        return Ok(outcome);
    }

    let guard = match acquire_bid_lock(state, auction_id).await {
        Some(g) => g,
        None => {
            state.perf.bid_lock_contention.fetch_add(1, Ordering::Relaxed);
            let outcome = reject_bid(
                state,
                auction_id,
                bidder_id,
                Some(max_bid_cents),
                RejectReason::LockContention,
                request_id,
            )
            .await;
            return Ok(outcome);
        }
    };
    state
        .perf
        .observe_bid_lock_wait_ms(guard.wait_ms().min(u64::MAX as u128) as u64);

    let staged = {
        let eng = lock_read(&state.engine, "bids.place_bid.engine_read").await;
        eng.stage_bid(
            auction_id,
            bidder_id,
            max_bid_cents,
            kind,
            now,
            state.cfg.auction.quiet_period(),
            state.cfg.auction.delayed_cutoff(),
        )
    };
    let fx = match staged {
        Ok(fx) => fx,
        Err(reason) => {
            drop(guard);
            let outcome = reject_bid(
                state,
                auction_id,
                bidder_id,
                Some(max_bid_cents),
                reason,
                request_id,
            )
            .await;
            return Ok(outcome);
        }
    };

    let event = AuctionEvent::BidAccepted {
        bidder_id,
        amount_cents: max_bid_cents,
        kind,
        snapshot: EventSnapshot::of(&fx.auction_after),
    };
    if let Err(e) = store::persist_bid_accepted(state, &fx, &event, request_id).await {
        state.perf.bid_db_failures.fetch_add(1, Ordering::Relaxed);
        return Err(e);
    }
    state
        .with_engine_write_profile("bids.place_bid.apply", |eng| eng.apply_bid(&fx))
        .await;
    if fx.auction_changed {
        state.update_snapshot(&fx.auction_after);
    }
    drop(guard);

    state.perf.bids_accepted.fetch_add(1, Ordering::Relaxed);
    let snapshot = AuctionSnapshot::of(&fx.auction_after);
    // A delayed entry leaves the visible state alone, so nothing is announced
    // for it until injection at close. Frames carry the public snapshot only;
    // the submitted maximum stays in the audit row.
    if fx.auction_changed {
        state.publish_update(auction_id, event.code(), snapshot.clone(), now);
    }
    Ok(BidOutcome::Accepted { snapshot })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_dollar_strings_parse_to_cents() {
        assert_eq!(parse_whole_dollar_bid("150"), Ok(15_000));
        assert_eq!(parse_whole_dollar_bid("150.00"), Ok(15_000));
        assert_eq!(parse_whole_dollar_bid(" 1 "), Ok(100));
        assert_eq!(parse_whole_dollar_bid("1000000"), Ok(100_000_000));
    }

    #[test]
    fn fractional_dollars_are_rejected() {
        assert_eq!(
            parse_whole_dollar_bid("150.50"),
            Err(RejectReason::InvalidAmount)
        );
        assert_eq!(
            parse_whole_dollar_bid("149.999"),
            Err(RejectReason::InvalidAmount)
        );
        assert_eq!(
            parse_whole_dollar_bid("0.01"),
            Err(RejectReason::InvalidAmount)
        );
    }

    #[test]
    fn junk_zero_and_negative_are_rejected() {
        assert_eq!(parse_whole_dollar_bid(""), Err(RejectReason::InvalidAmount));
        assert_eq!(
            parse_whole_dollar_bid("abc"),
            Err(RejectReason::InvalidAmount)
        );
        assert_eq!(parse_whole_dollar_bid("0"), Err(RejectReason::InvalidAmount));
        assert_eq!(
            parse_whole_dollar_bid("-25"),
            Err(RejectReason::InvalidAmount)
        );
    }

    #[test]
    fn out_of_range_amounts_are_rejected() {
        // 26 digits scale but exceed i64; 28 digits would overflow the
        // decimal multiply itself. Both must reject, never panic.
        assert_eq!(
            parse_whole_dollar_bid("99999999999999999999999999"),
            Err(RejectReason::InvalidAmount)
        );
        assert_eq!(
            parse_whole_dollar_bid("1000000000000000000000000000"),
            Err(RejectReason::InvalidAmount)
        );
        assert_eq!(
            parse_whole_dollar_bid("79228162514264337593543950335"),
            Err(RejectReason::InvalidAmount)
        );
    }
}
