use std::sync::atomic::Ordering;

use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::engine::{AuctionSnapshot, TransitionEffects};
use crate::error::ApiError;
use crate::events::{AuctionEvent, EventSnapshot};
use crate::state::{lock_read, AppState};
use crate::store;

fn not_found() -> ApiError {
    ApiError::new(StatusCode::NOT_FOUND, "auction not found")
}

struct AppliedTransition {
    auction_id: i64,
    at: DateTime<Utc>,
    snapshot: AuctionSnapshot,
    codes: Vec<&'static str>,
}

// Persist the staged transition, fold it into the engine, and refresh the
// read model. Announcing happens at the caller after the auction lock is
// released, and frames carry the public snapshot, not the audit events.
async fn persist_and_apply(
    state: &AppState,
    fx: TransitionEffects,
    request_id: Option<Uuid>,
) -> Result<AppliedTransition, ApiError> {
    let after = EventSnapshot::of(&fx.auction_after);
    let mut events = vec![AuctionEvent::StatusChanged {
        from: fx.from,
        to: fx.to,
        snapshot: after.clone(),
    }];
    if !fx.injected_bidders.is_empty() {
        events.push(AuctionEvent::DelayedBidsInjected {
            injected: fx.injected_bidders.len() as i64,
            snapshot: after,
        });
    }
    store::persist_transition(state, &fx, &events, request_id).await?;
    state
        .with_engine_write_profile("lifecycle.persist_and_apply.engine", |eng| {
            eng.apply_transition(&fx)
        })
        .await;
    state.update_snapshot(&fx.auction_after);
    state.perf.transitions_applied.fetch_add(1, Ordering::Relaxed);
    Ok(AppliedTransition {
        auction_id: fx.auction_id,
        at: fx.at,
        snapshot: AuctionSnapshot::of(&fx.auction_after),
        codes: events.iter().map(AuctionEvent::code).collect(),
    })
}

fn announce(state: &AppState, applied: AppliedTransition) {
    for code in applied.codes {
        state.publish_update(applied.auction_id, code, applied.snapshot.clone(), applied.at);
    }
}

// Draft -> Live. Opening an already-open auction is a no-op, not an error.
pub(crate) async fn open_auction(
    state: &AppState,
    auction_id: i64,
    request_id: Uuid,
    now: DateTime<Utc>,
) -> Result<bool, ApiError> {
    let guard = state.auction_locks.lock(auction_id).await;
    let staged = {
        let eng = lock_read(&state.engine, "lifecycle.open_auction.engine_read").await;
        eng.stage_open(auction_id, now)
    };
    match staged {
        Err(_) => Err(not_found()),
        Ok(None) => {
            state.perf.transitions_noop.fetch_add(1, Ordering::Relaxed);
            Ok(false)
        }
        Ok(Some(fx)) => {
            let applied = persist_and_apply(state, fx, Some(request_id)).await?;
            drop(guard);
            announce(state, applied);
            Ok(true)
        }
    }
}

// Runs whichever time-based transition is due for one auction right now.
pub(crate) async fn advance_auction(
    state: &AppState,
    auction_id: i64,
    request_id: Option<Uuid>,
    now: DateTime<Utc>,
) -> Result<bool, ApiError> {
    let guard = state.auction_locks.lock(auction_id).await;
    let staged = {
        let eng = lock_read(&state.engine, "lifecycle.advance_auction.engine_read").await;
        eng.stage_transition(auction_id, now, state.cfg.auction.quiet_period())
    };
    match staged {
        Err(_) => Err(not_found()),
        Ok(None) => {
            state.perf.transitions_noop.fetch_add(1, Ordering::Relaxed);
            Ok(false)
        }
        Ok(Some(fx)) => {
            let applied = persist_and_apply(state, fx, request_id).await?;
            drop(guard);
            announce(state, applied);
            Ok(true)
        }
    }
}

// Sweep pass: scan for due transitions and run each under a non-blocking
// per-auction lock. A bid that lands between the scan and the lock simply
// makes the staged transition re-validate to a no-op.
pub(crate) async fn advance_due_auctions(
    state: &AppState,
    now: DateTime<Utc>,
    budget: usize,
) -> usize {
    let due = {
        let eng = lock_read(&state.engine, "lifecycle.advance_due.engine_read").await;
        eng.due_for_transition(now, budget)
    };
    if due.is_empty() {
        return 0;
    }
    state.perf.observe_sweep_batch_size(due.len());

    let mut changed = 0usize;
    for auction_id in due {
        let Some(guard) = state.auction_locks.try_lock(auction_id) else {
            state.perf.sweep_lock_skips.fetch_add(1, Ordering::Relaxed);
            continue;
        };
        let staged = {
            let eng = lock_read(&state.engine, "lifecycle.advance_due.stage_read").await;
            eng.stage_transition(auction_id, now, state.cfg.auction.quiet_period())
        };
        match staged {
            Ok(Some(fx)) => match persist_and_apply(state, fx, None).await {
                Ok(applied) => {
                    drop(guard);
                    announce(state, applied);
                    changed += 1;
                }
                Err(e) => {
                    state.perf.sweep_errors.fetch_add(1, Ordering::Relaxed);
                    eprintln!(
                        "[sweep] persist_failed auction_id={} error={}",
                        auction_id, e.detail
                    );
                }
            },
            Ok(None) => {
                state.perf.transitions_noop.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {}
        }
    }
    changed
}

// ClosedWaitingOnPayment -> ClosedPaid, driven by the payment collaborator's
// confirmation callback.
pub(crate) async fn complete_payment(
    state: &AppState,
    auction_id: i64,
    request_id: Uuid,
    now: DateTime<Utc>,
) -> Result<bool, ApiError> {
    let guard = state.auction_locks.lock(auction_id).await;
    let staged = {
        let eng = lock_read(&state.engine, "lifecycle.complete_payment.engine_read").await;
        eng.stage_payment(auction_id, now)
    };
    match staged {
        Err(_) => Err(not_found()),
        Ok(None) => {
            state.perf.transitions_noop.fetch_add(1, Ordering::Relaxed);
            Ok(false)
        }
        Ok(Some(fx)) => {
            let applied = persist_and_apply(state, fx, Some(request_id)).await?;
            drop(guard);
            announce(state, applied);
            Ok(true)
        }
    }
}

async fn relist_one(
    state: &AppState,
    predecessor_id: i64,
    now: DateTime<Utc>,
) -> Result<bool, ApiError> {
    let guard = state.auction_locks.lock(predecessor_id).await;
    let successor_id = state.allocate_auction_id();
    let staged = {
        let eng = lock_read(&state.engine, "lifecycle.relist_one.engine_read").await;
        eng.stage_relist(
            predecessor_id,
            successor_id,
            now,
            state.cfg.auction.relist_delay(),
            state.cfg.auction.default_relist_duration(),
        )
    };
    let Some(fx) = staged else {
        return Ok(false);
    };
    let event = AuctionEvent::Relisted {
        predecessor_auction_id: fx.predecessor_id,
        successor_auction_id: fx.successor.auction_id,
        snapshot: EventSnapshot::of(&fx.successor),
    };
    let inserted = store::persist_relist(state, &fx, &event).await?;
    if !inserted {
        return Ok(false);
    }
    state
        .with_engine_write_profile("lifecycle.relist_one.apply", |eng| eng.apply_relist(&fx))
        .await;
    state.update_snapshot(&fx.successor);
    drop(guard);
    state.perf.relists_created.fetch_add(1, Ordering::Relaxed);
    // Announced under the predecessor id; the successor's snapshot carries its
    // own auction_id, which is how subscribers find the new listing.
    state.publish_update(
        fx.predecessor_id,
        event.code(),
        AuctionSnapshot::of(&fx.successor),
        now,
    );
    Ok(true)
}

// Relist pass: every not-sold auction past its cooldown gets exactly one
// successor. Eligibility is re-checked under the lock, and the successor
// insert is guarded by the unique index on lineage, so a racing second
// worker can only lose quietly.
pub(crate) async fn relist_due_auctions(
    state: &AppState,
    now: DateTime<Utc>,
    budget: usize,
) -> usize {
    let due = {
        let eng = lock_read(&state.engine, "lifecycle.relist_due.engine_read").await;
        eng.due_for_relist(now, state.cfg.auction.relist_delay(), budget)
    };
    let mut created = 0usize;
    for predecessor_id in due {
        match relist_one(state, predecessor_id, now).await {
            Ok(true) => created += 1,
            Ok(false) => {
                state.perf.relist_skips.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                state.perf.relist_errors.fetch_add(1, Ordering::Relaxed);
                eprintln!(
                    "[relist] create_failed predecessor_id={} error={}",
                    predecessor_id, e.detail
                );
            }
        }
    }
    created
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;

    use chrono::{DateTime, Duration, TimeZone, Utc};
    use tokio::sync::RwLock;

    use crate::engine::{Auction, AuctionStatus, EngineState};
    use crate::state::AuctionLocks;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_735_689_600 + secs, 0).unwrap()
    }

    fn not_sold_with_reserve(auction_id: i64, closed_at: DateTime<Utc>) -> Auction {
        let mut a = Auction::new_draft(auction_id, 500, 10_000, Some(20_000), at(3_600), at(0));
        a.status = AuctionStatus::ClosedNotSold;
        a.start_time = Some(at(0));
        a.updated_at = closed_at;
        a
    }

    // Mirrors relist_one's lock/stage/apply protocol without a database: the
    // winner applies and everyone staging after it re-validates to None.
    #[tokio::test]
    async fn concurrent_relist_attempts_create_one_successor() {
        let mut eng = EngineState::new();
        eng.insert_auction(not_sold_with_reserve(1, at(0)));
        let engine = Arc::new(RwLock::new(eng));
        let locks = Arc::new(AuctionLocks::new(64));
        let next_id = Arc::new(AtomicI64::new(2));
        let now = at(200_000);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let engine = engine.clone();
            let locks = locks.clone();
            let next_id = next_id.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock(1).await;
                let successor_id = next_id.fetch_add(1, Ordering::SeqCst);
                let staged = {
                    let eng = engine.read().await;
                    eng.stage_relist(
                        1,
                        successor_id,
                        now,
                        Duration::seconds(86_400),
                        Duration::seconds(604_800),
                    )
                };
                match staged {
                    Some(fx) => {
                        engine.write().await.apply_relist(&fx);
                        true
                    }
                    None => false,
                }
            }));
        }

        let mut created = 0usize;
        for h in handles {
            if h.await.unwrap() {
                created += 1;
            }
        }
        assert_eq!(created, 1);

        let eng = engine.read().await;
        assert_eq!(eng.successors.len(), 1);
        assert_eq!(eng.auctions.len(), 2);
        let successor_id = *eng.successors.get(&1).unwrap();
        let successor = eng.auction(successor_id).unwrap();
        assert_eq!(successor.relist_of_auction_id, Some(1));
        assert_eq!(successor.status, AuctionStatus::Live);
    }

    #[tokio::test]
    async fn racing_advances_apply_the_close_once() {
        let mut live = Auction::new_draft(1, 500, 10_000, None, at(3_600), at(0));
        live.status = AuctionStatus::Live;
        live.start_time = Some(at(0));
        let mut eng = EngineState::new();
        eng.insert_auction(live);
        let engine = Arc::new(RwLock::new(eng));
        let locks = Arc::new(AuctionLocks::new(64));
        let now = at(3_700);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let engine = engine.clone();
            let locks = locks.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock(1).await;
                let staged = {
                    let eng = engine.read().await;
                    eng.stage_transition(1, now, Duration::seconds(300))
                };
                match staged {
                    Ok(Some(fx)) => {
                        engine.write().await.apply_transition(&fx);
                        true
                    }
                    _ => false,
                }
            }));
        }

        let mut applied = 0usize;
        for h in handles {
            if h.await.unwrap() {
                applied += 1;
            }
        }
        assert_eq!(applied, 1);

        let eng = engine.read().await;
        let a = eng.auction(1).unwrap();
        assert_eq!(a.status, AuctionStatus::Closing);
        assert_eq!(a.closing_window_end, Some(at(4_000)));
    }
}
