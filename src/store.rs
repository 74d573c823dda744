use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::time::Instant;

use anyhow::Result;
use axum::http::StatusCode;
use sqlx::postgres::PgRow;
use sqlx::{Postgres, Row, Transaction};
use uuid::Uuid;

use crate::engine::{
    Auction, AuctionSnapshot, AuctionStatus, BidEffects, BidKind, EngineState, LedgerEntry,
    RelistEffects, TransitionEffects,
};
use crate::error::ApiError;
use crate::events::AuctionEvent;
use crate::state::{lock_read, lock_write, AppState};

const BID_PERSIST_SLOW_WARN_MS: u128 = 200;
const TRANSITION_PERSIST_SLOW_WARN_MS: u128 = 250;
const RELIST_UNIQUE_CONSTRAINT: &str = "uq_auctions_relist_of";

const INSERT_AUCTION_SQL: &str = r#"
    INSERT INTO auctions (
        auction_id, listing_id, status,
        starting_price_cents, reserve_price_cents,
        start_time, close_time, closing_window_end,
        current_price_cents, current_leader_user_id, current_leader_max_cents,
        bid_count, reserve_met, relist_of_auction_id,
        created_at, updated_at
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
"#;

fn db_err(e: sqlx::Error) -> ApiError {
    ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, format!("db error: {e}"))
}

fn is_unique_violation(e: &sqlx::Error, constraint: &str) -> bool {
    match e {
        sqlx::Error::Database(db) => db.constraint() == Some(constraint),
        _ => false,
    }
}

pub(crate) async fn load_event_type_ids(state: &AppState) -> Result<()> {
    // Keep DB event type catalog aligned with Rust handlers.
    for code in crate::events::EVENT_CODES {
        let _ =
            sqlx::query("INSERT INTO event_types (code) VALUES ($1) ON CONFLICT (code) DO NOTHING")
                .bind(code)
                .execute(&state.db)
                .await?;
    }

    let rows = sqlx::query("SELECT id, code FROM event_types ORDER BY id")
        .fetch_all(&state.db)
        .await?;
    let mut map = HashMap::new();
    for r in rows {
        let id: i16 = r.get("id");
        let code: String = r.get("code");
        map.insert(code, id);
    }
    *lock_write(&state.event_type_ids, "store.load_event_type_ids.write").await = map;
    Ok(())
}

fn auction_from_row(r: &PgRow) -> Result<Auction> {
    let auction_id: i64 = r.get("auction_id");
    let status_raw: String = r.get("status");
    let status = AuctionStatus::parse(&status_raw)
        .ok_or_else(|| anyhow::anyhow!("auction {auction_id} has unknown status {status_raw}"))?;
    Ok(Auction {
        auction_id,
        listing_id: r.get("listing_id"),
        status,
        starting_price_cents: r.get("starting_price_cents"),
        reserve_price_cents: r.get("reserve_price_cents"),
        start_time: r.get("start_time"),
        close_time: r.get("close_time"),
        closing_window_end: r.get("closing_window_end"),
        current_price_cents: r.get("current_price_cents"),
        current_leader_user_id: r.get("current_leader_user_id"),
        current_leader_max_cents: r.get("current_leader_max_cents"),
        bid_count: r.get("bid_count"),
        reserve_met: r.get("reserve_met"),
        relist_of_auction_id: r.get("relist_of_auction_id"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    })
}

fn ledger_entry_from_row(r: &PgRow) -> Result<LedgerEntry> {
    let auction_id: i64 = r.get("auction_id");
    let bidder_id: i64 = r.get("bidder_id");
    let kind_raw: String = r.get("kind");
    let kind = BidKind::parse(&kind_raw).ok_or_else(|| {
        anyhow::anyhow!("ledger entry {auction_id}/{bidder_id} has unknown kind {kind_raw}")
    })?;
    Ok(LedgerEntry {
        auction_id,
        bidder_id,
        max_bid_cents: r.get("max_bid_cents"),
        kind,
        received_at: r.get("received_at"),
    })
}

// Rebuilds the in-memory engine from the auction and ledger rows, primes the
// snapshot cache, and seeds the id allocator. Rows are authoritative: the
// derived columns were written in the same transaction as the ledger, so no
// recompute happens here.
pub(crate) async fn reload_auctions(state: &AppState) -> Result<(usize, usize)> {
    let auction_rows = sqlx::query(
        r#"
        SELECT auction_id, listing_id, status,
               starting_price_cents, reserve_price_cents,
               start_time, close_time, closing_window_end,
               current_price_cents, current_leader_user_id, current_leader_max_cents,
               bid_count, reserve_met, relist_of_auction_id,
               created_at, updated_at
        FROM auctions
        ORDER BY auction_id
        "#,
    )
    .fetch_all(&state.db)
    .await?;

    let ledger_rows = sqlx::query(
        r#"
        SELECT auction_id, bidder_id, max_bid_cents, kind, received_at
        FROM bid_ledger
        ORDER BY auction_id, bidder_id
        "#,
    )
    .fetch_all(&state.db)
    .await?;

    let mut auctions = Vec::with_capacity(auction_rows.len());
    for r in &auction_rows {
        auctions.push(auction_from_row(r)?);
    }
    let mut entries = Vec::with_capacity(ledger_rows.len());
    for r in &ledger_rows {
        entries.push(ledger_entry_from_row(r)?);
    }
    let auction_count = auctions.len();
    let entry_count = entries.len();

    {
        let mut eng = lock_write(&state.engine, "store.reload_auctions.engine_write").await;
        *eng = EngineState::new();
        for a in auctions {
            state
                .snapshot_cache
                .insert(a.auction_id, AuctionSnapshot::of(&a));
            eng.insert_auction(a);
        }
        for e in entries {
            eng.insert_ledger_entry(e);
        }
        let next = eng.max_auction_id() + 1;
        state.next_auction_id.store(next, Ordering::SeqCst);
    }
    Ok((auction_count, entry_count))
}

fn insert_auction_query(
    a: &Auction,
) -> sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments> {
    sqlx::query(INSERT_AUCTION_SQL)
        .bind(a.auction_id)
        .bind(a.listing_id)
        .bind(a.status.as_str())
        .bind(a.starting_price_cents)
        .bind(a.reserve_price_cents)
        .bind(a.start_time)
        .bind(a.close_time)
        .bind(a.closing_window_end)
        .bind(a.current_price_cents)
        .bind(a.current_leader_user_id)
        .bind(a.current_leader_max_cents)
        .bind(a.bid_count)
        .bind(a.reserve_met)
        .bind(a.relist_of_auction_id)
        .bind(a.created_at)
        .bind(a.updated_at)
}

pub(crate) async fn insert_auction(state: &AppState, a: &Auction) -> Result<(), ApiError> {
    insert_auction_query(a)
        .execute(&state.db)
        .await
        .map_err(db_err)?;
    Ok(())
}

// The immutable columns (listing, prices, lineage, created_at) stay as
// inserted; everything the engine derives is overwritten as one row image.
async fn update_auction_tx(
    tx: &mut Transaction<'_, Postgres>,
    a: &Auction,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE auctions
        SET status = $2,
            start_time = $3,
            closing_window_end = $4,
            current_price_cents = $5,
            current_leader_user_id = $6,
            current_leader_max_cents = $7,
            bid_count = $8,
            reserve_met = $9,
            updated_at = $10
        WHERE auction_id = $1
        "#,
    )
    .bind(a.auction_id)
    .bind(a.status.as_str())
    .bind(a.start_time)
    .bind(a.closing_window_end)
    .bind(a.current_price_cents)
    .bind(a.current_leader_user_id)
    .bind(a.current_leader_max_cents)
    .bind(a.bid_count)
    .bind(a.reserve_met)
    .bind(a.updated_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn event_type_id(state: &AppState, code: &str) -> Result<i16, ApiError> {
    let ids = lock_read(&state.event_type_ids, "store.event_type_id.read").await;
    ids.get(code)
        .copied()
        .ok_or_else(|| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "missing event type"))
}

async fn insert_event_tx(
    tx: &mut Transaction<'_, Postgres>,
    type_id: i16,
    auction_id: i64,
    request_id: Option<Uuid>,
    event: &AuctionEvent,
) -> Result<(), sqlx::Error> {
    let payload = serde_json::to_value(event).unwrap_or_else(|_| serde_json::json!({}));
    sqlx::query(
        r#"
        INSERT INTO auction_events
            (event_type_id, auction_id, request_id, bidder_id, amount_cents, payload)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(type_id)
    .bind(auction_id)
    .bind(request_id)
    .bind(event.bidder_id())
    .bind(event.amount_cents())
    .bind(payload)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

// Ledger upsert, auction row image, and the accepted event in one
// transaction. The conflict arm never touches received_at, which is what
// makes the first-receipt tiebreak durable across resubmissions.
pub(crate) async fn persist_bid_accepted(
    state: &AppState,
    fx: &BidEffects,
    event: &AuctionEvent,
    request_id: Uuid,
) -> Result<(), ApiError> {
    let type_id = event_type_id(state, crate::events::EVT_BID_ACCEPTED).await?;
    let db_started = Instant::now();
    let mut tx = state.db.begin().await.map_err(db_err)?;

    sqlx::query(
        r#"
        INSERT INTO bid_ledger (auction_id, bidder_id, max_bid_cents, kind, received_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (auction_id, bidder_id) DO UPDATE
        SET max_bid_cents = EXCLUDED.max_bid_cents,
            kind = EXCLUDED.kind,
            updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(fx.entry.auction_id)
    .bind(fx.entry.bidder_id)
    .bind(fx.entry.max_bid_cents)
    .bind(fx.entry.kind.as_str())
    .bind(fx.entry.received_at)
    .bind(fx.at)
    .execute(&mut *tx)
    .await
    .map_err(db_err)?;

    if fx.auction_changed {
        update_auction_tx(&mut tx, &fx.auction_after)
            .await
            .map_err(db_err)?;
    }
    insert_event_tx(&mut tx, type_id, fx.auction_id, Some(request_id), event)
        .await
        .map_err(db_err)?;
    tx.commit().await.map_err(db_err)?;

    let db_ms = db_started.elapsed().as_millis();
    if db_ms >= BID_PERSIST_SLOW_WARN_MS {
        eprintln!(
            "[bids] slow_persist auction_id={} bidder_id={} db_ms={}",
            fx.auction_id, fx.bidder_id, db_ms
        );
    }
    Ok(())
}

// Best-effort audit of a rejection. A failure here is logged and swallowed;
// the caller already has its answer.
pub(crate) async fn persist_bid_rejected(
    state: &AppState,
    auction_id: i64,
    event: &AuctionEvent,
    request_id: Uuid,
) {
    let type_id = {
        let ids = lock_read(&state.event_type_ids, "store.persist_bid_rejected.event_type_ids").await;
        ids.get(crate::events::EVT_BID_REJECTED).copied()
    };
    let Some(type_id) = type_id else {
        eprintln!("[bids] reject_event_skipped auction_id={auction_id} err=missing_event_type");
        return;
    };
    let payload = serde_json::to_value(event).unwrap_or_else(|_| serde_json::json!({}));
    let res = sqlx::query(
        r#"
        INSERT INTO auction_events
            (event_type_id, auction_id, request_id, bidder_id, amount_cents, payload)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(type_id)
    .bind(auction_id)
    .bind(request_id)
    .bind(event.bidder_id())
    .bind(event.amount_cents())
    .bind(payload)
    .execute(&state.db)
    .await;
    if let Err(e) = res {
        eprintln!(
            "[bids] reject_event_failed auction_id={} request_id={} err={}",
            auction_id, request_id, e
        );
    }
}

// Auction row image, delayed-kind flips, and the transition events in one
// transaction.
pub(crate) async fn persist_transition(
    state: &AppState,
    fx: &TransitionEffects,
    events: &[AuctionEvent],
    request_id: Option<Uuid>,
) -> Result<(), ApiError> {
    let db_started = Instant::now();
    let mut tx = state.db.begin().await.map_err(db_err)?;

    update_auction_tx(&mut tx, &fx.auction_after)
        .await
        .map_err(db_err)?;

    if !fx.injected_bidders.is_empty() {
        sqlx::query(
            "UPDATE bid_ledger SET kind = $1, updated_at = $2 WHERE auction_id = $3 AND bidder_id = ANY($4)",
        )
        .bind(BidKind::Immediate.as_str())
        .bind(fx.at)
        .bind(fx.auction_id)
        .bind(&fx.injected_bidders)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
    }

    for ev in events {
        let type_id = event_type_id(state, ev.code()).await?;
        insert_event_tx(&mut tx, type_id, fx.auction_id, request_id, ev)
            .await
            .map_err(db_err)?;
    }
    tx.commit().await.map_err(db_err)?;

    let db_ms = db_started.elapsed().as_millis();
    if db_ms >= TRANSITION_PERSIST_SLOW_WARN_MS {
        eprintln!(
            "[sweep] slow_persist auction_id={} from={} to={} db_ms={}",
            fx.auction_id,
            fx.from.as_str(),
            fx.to.as_str(),
            db_ms
        );
    }
    Ok(())
}

// Successor insert plus the relist events. The partial unique index on
// relist_of_auction_id is the cross-process guard: a duplicate insert from a
// racing worker rolls back here and reports false.
pub(crate) async fn persist_relist(
    state: &AppState,
    fx: &RelistEffects,
    event: &AuctionEvent,
) -> Result<bool, ApiError> {
    let type_id = event_type_id(state, crate::events::EVT_RELISTED).await?;
    let mut tx = state.db.begin().await.map_err(db_err)?;

    if let Err(e) = insert_auction_query(&fx.successor).execute(&mut *tx).await {
        if is_unique_violation(&e, RELIST_UNIQUE_CONSTRAINT) {
            eprintln!(
                "[relist] duplicate predecessor_id={} successor_id={} skipped",
                fx.predecessor_id, fx.successor.auction_id
            );
            return Ok(false);
        }
        return Err(db_err(e));
    }
    // The lineage event is filed under both rows, so either auction's audit
    // trail shows the handoff.
    insert_event_tx(&mut tx, type_id, fx.predecessor_id, None, event)
        .await
        .map_err(db_err)?;
    insert_event_tx(&mut tx, type_id, fx.successor.auction_id, None, event)
        .await
        .map_err(db_err)?;
    tx.commit().await.map_err(db_err)?;
    Ok(true)
}
