use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::Utc;

use crate::engine::AuctionSnapshot;
use crate::lifecycle;
use crate::state::{try_lock_read, AppState, BATCH_BUCKET_BOUNDS, LATENCY_BUCKET_BOUNDS_MS};

const SWEEP_MAX_PER_TICK: usize = 256;
const RELIST_MAX_PER_TICK: usize = 64;
const SNAPSHOT_REFRESH_TICK_MS: u64 = 1_000;
const PERF_REPORT_SECS: u64 = 5;

fn p95_from_hist_delta(bounds: &[u64], delta: &[u64]) -> Option<u64> {
    let total: u64 = delta.iter().copied().sum();
    if total == 0 {
        return None;
    }
    let target = ((total as f64) * 0.95).ceil() as u64;
    let mut acc = 0u64;
    for (i, c) in delta.iter().enumerate() {
        acc += *c;
        if acc >= target {
            if let Some(v) = bounds.get(i) {
                return Some(*v);
            }
            return bounds.last().copied();
        }
    }
    bounds.last().copied()
}

pub(crate) fn start_background_tasks(state: AppState) {
    // 1) Status sweep: runs due Live->Closing and Closing->Closed-* moves.
    let s_sweep = state.clone();
    tokio::spawn(async move {
        let tick = Duration::from_secs(s_sweep.cfg.auction.sweep_tick_seconds.max(1));
        loop {
            tokio::time::sleep(tick).await;
            s_sweep.perf.sweep_ticks.fetch_add(1, Ordering::Relaxed);
            let now = Utc::now();
            let changed = lifecycle::advance_due_auctions(&s_sweep, now, SWEEP_MAX_PER_TICK).await;
            if changed > 0 {
                eprintln!("[sweep] transitions={changed}");
            }
        }
    });

    // 2) Relist worker for not-sold auctions past their cooldown.
    let s_relist = state.clone();
    tokio::spawn(async move {
        let tick = Duration::from_secs(s_relist.cfg.auction.relist_tick_seconds.max(1));
        loop {
            tokio::time::sleep(tick).await;
            let now = Utc::now();
            let created = lifecycle::relist_due_auctions(&s_relist, now, RELIST_MAX_PER_TICK).await;
            if created > 0 {
                eprintln!("[relist] created={created}");
            }
        }
    });

    // 3) Snapshot refresher. The bid and transition paths write the cache
    // through; this pass re-derives the live entries from the engine so the
    // read model cannot drift for long. Terminal auctions no longer change, so
    // their write-through entries are left alone. Skips the tick instead of
    // waiting when the engine is busy.
    let s_read = state.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_millis(SNAPSHOT_REFRESH_TICK_MS)).await;
            s_read
                .perf
                .snapshot_refresh_ticks
                .fetch_add(1, Ordering::Relaxed);
            if let Some(eng) =
                try_lock_read(&s_read.engine, "tasks.snapshot_refresh.engine_try_read")
            {
                for a in eng.auctions.values() {
                    if a.status.is_closed() {
                        continue;
                    }
                    s_read
                        .snapshot_cache
                        .insert(a.auction_id, AuctionSnapshot::of(a));
                }
            } else {
                s_read
                    .perf
                    .snapshot_engine_busy
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
    });

    // 4) Performance telemetry: interval p95s from histogram deltas plus the
    // running counters.
    let s_perf = state.clone();
    tokio::spawn(async move {
        let mut prev_bid_wait = vec![0u64; LATENCY_BUCKET_BOUNDS_MS.len() + 1];
        let mut prev_apply_wait = vec![0u64; LATENCY_BUCKET_BOUNDS_MS.len() + 1];
        let mut prev_batch = vec![0u64; BATCH_BUCKET_BOUNDS.len() + 1];
        loop {
            tokio::time::sleep(Duration::from_secs(PERF_REPORT_SECS)).await;

            let mut cur_bid_wait = vec![0u64; LATENCY_BUCKET_BOUNDS_MS.len() + 1];
            let mut cur_apply_wait = vec![0u64; LATENCY_BUCKET_BOUNDS_MS.len() + 1];
            let mut cur_batch = vec![0u64; BATCH_BUCKET_BOUNDS.len() + 1];
            for (i, c) in s_perf.perf.bid_lock_wait_hist.iter().enumerate() {
                cur_bid_wait[i] = c.load(Ordering::Relaxed);
            }
            for (i, c) in s_perf.perf.engine_apply_lock_wait_hist.iter().enumerate() {
                cur_apply_wait[i] = c.load(Ordering::Relaxed);
            }
            for (i, c) in s_perf.perf.sweep_batch_hist.iter().enumerate() {
                cur_batch[i] = c.load(Ordering::Relaxed);
            }

            let delta_bid_wait: Vec<u64> = cur_bid_wait
                .iter()
                .zip(prev_bid_wait.iter())
                .map(|(a, b)| a.saturating_sub(*b))
                .collect();
            let delta_apply_wait: Vec<u64> = cur_apply_wait
                .iter()
                .zip(prev_apply_wait.iter())
                .map(|(a, b)| a.saturating_sub(*b))
                .collect();
            let delta_batch: Vec<u64> = cur_batch
                .iter()
                .zip(prev_batch.iter())
                .map(|(a, b)| a.saturating_sub(*b))
                .collect();
            prev_bid_wait = cur_bid_wait;
            prev_apply_wait = cur_apply_wait;
            prev_batch = cur_batch;

            let sweep_batches: u64 = delta_batch.iter().sum();

            eprintln!(
                "[perf] bid_lock_wait_p95_ms={:?} engine_apply_p95_ms={:?} sweep_batches={} bids_received={} bids_accepted={} bids_rejected={} lock_contention={} transitions={} noops={} sweep_lock_skips={} relists={} subscribers={}",
                p95_from_hist_delta(&LATENCY_BUCKET_BOUNDS_MS, &delta_bid_wait),
                p95_from_hist_delta(&LATENCY_BUCKET_BOUNDS_MS, &delta_apply_wait),
                sweep_batches,
                s_perf.perf.bids_received.load(Ordering::Relaxed),
                s_perf.perf.bids_accepted.load(Ordering::Relaxed),
                s_perf.perf.bids_rejected.load(Ordering::Relaxed),
                s_perf.perf.bid_lock_contention.load(Ordering::Relaxed),
                s_perf.perf.transitions_applied.load(Ordering::Relaxed),
                s_perf.perf.transitions_noop.load(Ordering::Relaxed),
                s_perf.perf.sweep_lock_skips.load(Ordering::Relaxed),
                s_perf.perf.relists_created.load(Ordering::Relaxed),
                s_perf.realtime.subscriber_count()
            );
        }
    });
}
