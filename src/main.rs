use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use http::header::{ACCEPT, CONTENT_TYPE};
use serde::Deserialize;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::RwLock;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

mod bids;
mod config;
mod engine;
mod error;
mod events;
mod increment;
mod lifecycle;
mod publish;
mod state;
mod store;
mod tasks;

use crate::bids::{parse_whole_dollar_bid, place_bid, reject_bid, BidOutcome};
use crate::config::load_config;
use crate::engine::{Auction, AuctionSnapshot, AuctionStatus, BidKind, EngineState};
use crate::error::{ApiError, RejectReason};
use crate::lifecycle::{advance_auction, complete_payment, open_auction};
use crate::publish::RealtimeHub;
use crate::state::{lock_read, AppState, AuctionLocks, PerfCounters};
use crate::store::{insert_auction, load_event_type_ids, reload_auctions};
use crate::tasks::start_background_tasks;

const AUCTION_LOCK_SHARDS: usize = 1024;
const AUCTION_LIST_DEFAULT_LIMIT: usize = 200;
const AUCTION_LIST_MAX_LIMIT: usize = 1000;

#[derive(Debug, Deserialize)]
struct BidCreate {
    bidder_id: i64,
    max_bid: String,
    mode: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AuctionCreate {
    listing_id: i64,
    starting_price: String,
    reserve_price: Option<String>,
    close_time: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct AuctionsQuery {
    status: Option<String>,
    limit: Option<usize>,
}

fn parse_whole_dollar_price(raw: &str, field: &str) -> Result<i64, ApiError> {
    parse_whole_dollar_bid(raw).map_err(|_| {
        ApiError::new(
            StatusCode::BAD_REQUEST,
            format!("{field} must be a positive whole-dollar amount"),
        )
    })
}

// ===== HTTP handlers =====

async fn health_check(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    sqlx::query("SELECT 1")
        .fetch_one(&state.db)
        .await
        .map_err(|e| ApiError::new(StatusCode::SERVICE_UNAVAILABLE, format!("db error: {e}")))?;
    Ok(Json(serde_json::json!({
        "status": "healthy",
        "database": "connected",
        "engine_ready": state.engine_ready.load(Ordering::Acquire)
    })))
}

async fn require_engine_ready(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if !state.engine_ready.load(Ordering::Acquire) {
        return Err(ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "engine warming up",
        ));
    }
    Ok(next.run(req).await)
}

async fn list_auctions(
    State(state): State<AppState>,
    Query(q): Query<AuctionsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let status_filter = match q.status.as_deref() {
        Some(raw) => Some(
            AuctionStatus::parse(raw.trim().to_ascii_uppercase().as_str())
                .ok_or_else(|| ApiError::new(StatusCode::BAD_REQUEST, "unknown status filter"))?,
        ),
        None => None,
    };
    let limit = q
        .limit
        .unwrap_or(AUCTION_LIST_DEFAULT_LIMIT)
        .max(1)
        .min(AUCTION_LIST_MAX_LIMIT);
    let mut rows: Vec<AuctionSnapshot> = state
        .snapshot_cache
        .iter()
        .map(|kv| kv.value().clone())
        .filter(|s| status_filter.map(|want| s.status == want).unwrap_or(true))
        .collect();
    rows.sort_by_key(|s| s.auction_id);
    let truncated = rows.len() > limit;
    rows.truncate(limit);
    Ok(Json(serde_json::json!({
        "count": rows.len(),
        "truncated": truncated,
        "auctions": rows,
    })))
}

async fn get_auction(
    State(state): State<AppState>,
    Path(auction_id): Path<i64>,
) -> Result<Json<AuctionSnapshot>, ApiError> {
    if let Some(snap) = state.snapshot_cache.get(&auction_id) {
        return Ok(Json(snap.value().clone()));
    }
    let eng = lock_read(&state.engine, "main.get_auction.engine_read").await;
    let a = eng
        .auction(auction_id)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "auction not found"))?;
    Ok(Json(AuctionSnapshot::of(a)))
}

async fn create_bid(
    State(state): State<AppState>,
    Path(auction_id): Path<i64>,
    Json(req): Json<BidCreate>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    if req.bidder_id <= 0 {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "bidder_id must be > 0"));
    }
    let request_id = Uuid::new_v4();
    let now = Utc::now();

    // Amount and mode syntax are checked before the per-auction lock; each
    // failure is still recorded as a rejected event.
    let outcome = match parse_whole_dollar_bid(&req.max_bid) {
        Err(reason) => {
            state.perf.bids_received.fetch_add(1, Ordering::Relaxed);
            reject_bid(&state, auction_id, req.bidder_id, None, reason, request_id).await
        }
        Ok(cents) => {
            let kind = match req.mode.as_deref() {
                None => Some(BidKind::Immediate),
                Some(raw) => BidKind::parse(raw.trim().to_ascii_uppercase().as_str()),
            };
            match kind {
                None => {
                    state.perf.bids_received.fetch_add(1, Ordering::Relaxed);
                    reject_bid(
                        &state,
                        auction_id,
                        req.bidder_id,
                        Some(cents),
                        RejectReason::UnsupportedMode,
                        request_id,
                    )
                    .await
                }
                Some(kind) => {
                    place_bid(&state, auction_id, req.bidder_id, cents, kind, request_id, now)
                        .await?
                }
            }
        }
    };

    let (code, body) = match outcome {
        BidOutcome::Accepted { snapshot } => (
            StatusCode::OK,
            serde_json::json!({
                "request_id": request_id.to_string(),
                "accepted": true,
                "auction": snapshot,
            }),
        ),
        BidOutcome::Rejected { reason, snapshot } => {
            let code = match reason {
                RejectReason::AuctionNotFound => StatusCode::NOT_FOUND,
                r if r.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::OK,
            };
            (
                code,
                serde_json::json!({
                    "request_id": request_id.to_string(),
                    "accepted": false,
                    "reason": reason.code(),
                    "detail": reason.detail(),
                    "auction": snapshot,
                }),
            )
        }
    };
    Ok((code, Json(body)))
}

// ===== Admin endpoints =====

async fn create_auction(
    State(state): State<AppState>,
    Json(req): Json<AuctionCreate>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    if req.listing_id <= 0 {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "listing_id must be > 0"));
    }
    let starting_price_cents = parse_whole_dollar_price(&req.starting_price, "starting_price")?;
    let reserve_price_cents = match req.reserve_price.as_deref() {
        Some(raw) => Some(parse_whole_dollar_price(raw, "reserve_price")?),
        None => None,
    };
    if let Some(reserve) = reserve_price_cents {
        if reserve < starting_price_cents {
            return Err(ApiError::new(
                StatusCode::BAD_REQUEST,
                "reserve_price must be at least the starting price",
            ));
        }
    }
    let now = Utc::now();
    if req.close_time <= now {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "close_time must be in the future",
        ));
    }

    let auction_id = state.allocate_auction_id();
    let auction = Auction::new_draft(
        auction_id,
        req.listing_id,
        starting_price_cents,
        reserve_price_cents,
        req.close_time,
        now,
    );
    insert_auction(&state, &auction).await?;
    state
        .with_engine_write_profile("main.create_auction.apply", |eng| {
            eng.insert_auction(auction.clone());
        })
        .await;
    state.update_snapshot(&auction);

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "auction_id": auction_id,
            "auction": auction,
        })),
    ))
}

async fn admin_open_auction(
    State(state): State<AppState>,
    Path(auction_id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let changed = open_auction(&state, auction_id, Uuid::new_v4(), Utc::now()).await?;
    Ok(Json(serde_json::json!({
        "auction_id": auction_id,
        "changed": changed,
    })))
}

// Same code path as the sweep, for operational nudging.
async fn admin_advance_auction(
    State(state): State<AppState>,
    Path(auction_id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let changed = advance_auction(&state, auction_id, Some(Uuid::new_v4()), Utc::now()).await?;
    Ok(Json(serde_json::json!({
        "auction_id": auction_id,
        "changed": changed,
    })))
}

async fn admin_confirm_payment(
    State(state): State<AppState>,
    Path(auction_id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let changed = complete_payment(&state, auction_id, Uuid::new_v4(), Utc::now()).await?;
    Ok(Json(serde_json::json!({
        "auction_id": auction_id,
        "changed": changed,
    })))
}

async fn admin_get_stats(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let (total, by_status) = {
        let eng = lock_read(&state.engine, "main.admin_get_stats.engine_read").await;
        let mut by_status: BTreeMap<&'static str, i64> = BTreeMap::new();
        for a in eng.auctions.values() {
            *by_status.entry(a.status.as_str()).or_insert(0) += 1;
        }
        (eng.auctions.len(), by_status)
    };
    Ok(Json(serde_json::json!({
        "auctions": {"total": total, "by_status": by_status},
        "realtime_subscribers": state.realtime.subscriber_count(),
        "perf": state.perf.snapshot_json(),
    })))
}

#[tokio::main(worker_threads = 16)]
async fn main() -> Result<()> {
    let cfg = Arc::new(load_config()?);

    let db = PgPoolOptions::new()
        .min_connections(cfg.database.min_pool_size)
        .max_connections(cfg.database.max_pool_size)
        .acquire_timeout(Duration::from_secs(cfg.database.acquire_timeout_seconds))
        .max_lifetime(Duration::from_secs(cfg.database.max_lifetime_seconds))
        .connect(&cfg.database.url)
        .await
        .context("failed to connect to postgres")?;

    let state = AppState {
        cfg: cfg.clone(),
        db: db.clone(),
        engine: Arc::new(RwLock::new(EngineState::new())),
        event_type_ids: Arc::new(RwLock::new(HashMap::new())),
        next_auction_id: Arc::new(AtomicI64::new(1)),
        auction_locks: Arc::new(AuctionLocks::new(AUCTION_LOCK_SHARDS)),
        snapshot_cache: Arc::new(DashMap::new()),
        realtime: Arc::new(RealtimeHub::new()),
        perf: Arc::new(PerfCounters::new()),
        engine_ready: Arc::new(AtomicBool::new(false)),
    };

    load_event_type_ids(&state).await?;

    let allowed_headers = [CONTENT_TYPE, ACCEPT];
    let allowed_methods = [Method::GET, Method::POST, Method::OPTIONS];
    let cors = if cfg.api.cors_origins.iter().any(|x| x == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(allowed_methods)
            .allow_headers(allowed_headers)
    } else {
        let origins: Vec<HeaderValue> = cfg
            .api
            .cors_origins
            .iter()
            .filter_map(|origin| HeaderValue::from_str(origin).ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(allowed_methods)
            .allow_headers(allowed_headers)
    };

    // Serve immediately; the engine load runs in background and flips
    // readiness when done.
    let s_boot = state.clone();
    tokio::spawn(async move {
        match reload_auctions(&s_boot).await {
            Ok((auctions, entries)) => {
                start_background_tasks(s_boot.clone());
                s_boot.engine_ready.store(true, Ordering::Release);
                eprintln!(
                    "[startup] engine_ready=true auctions={auctions} ledger_entries={entries}"
                );
            }
            Err(e) => {
                eprintln!("[startup] reload_failed error={e}");
            }
        }
    });

    let protected_api = Router::new()
        .route("/auctions", get(list_auctions))
        .route("/auctions/{auction_id}", get(get_auction))
        .route("/auctions/{auction_id}/bids", post(create_bid))
        .route("/admin/auctions", post(create_auction))
        .route("/admin/auctions/{auction_id}/open", post(admin_open_auction))
        .route("/admin/auctions/{auction_id}/advance", post(admin_advance_auction))
        .route("/admin/auctions/{auction_id}/paid", post(admin_confirm_payment))
        .route("/admin/stats", get(admin_get_stats))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_engine_ready,
        ));

    let app = Router::new()
        .route("/health", get(health_check))
        .merge(protected_api)
        .layer(cors)
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", cfg.api.host, cfg.api.port).parse()?;
    println!("Auction engine API listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
