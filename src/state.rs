use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use sqlx::{Pool, Postgres};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::config::AppConfig;
use crate::engine::{Auction, AuctionSnapshot, EngineState};
use crate::publish::RealtimeHub;

pub(crate) const LATENCY_BUCKET_BOUNDS_MS: [u64; 12] =
    [0, 1, 2, 5, 10, 20, 50, 100, 200, 500, 1000, 2000];
pub(crate) const BATCH_BUCKET_BOUNDS: [u64; 7] = [1, 2, 4, 8, 16, 32, 64];

fn hist_bucket_idx(v: u64, bounds: &[u64]) -> usize {
    for (i, b) in bounds.iter().enumerate() {
        if v <= *b {
            return i;
        }
    }
    bounds.len()
}

pub(crate) struct PerfCounters {
    pub(crate) bids_received: AtomicU64,
    pub(crate) bids_accepted: AtomicU64,
    pub(crate) bids_rejected: AtomicU64,
    pub(crate) bid_lock_retries: AtomicU64,
    pub(crate) bid_lock_contention: AtomicU64,
    pub(crate) bid_db_failures: AtomicU64,
    pub(crate) sweep_ticks: AtomicU64,
    pub(crate) transitions_applied: AtomicU64,
    pub(crate) transitions_noop: AtomicU64,
    pub(crate) sweep_lock_skips: AtomicU64,
    pub(crate) sweep_errors: AtomicU64,
    pub(crate) relists_created: AtomicU64,
    pub(crate) relist_skips: AtomicU64,
    pub(crate) relist_errors: AtomicU64,
    pub(crate) publish_sent: AtomicU64,
    pub(crate) publish_dropped: AtomicU64,
    pub(crate) snapshot_refresh_ticks: AtomicU64,
    pub(crate) snapshot_updates: AtomicU64,
    pub(crate) snapshot_engine_busy: AtomicU64,
    pub(crate) bid_lock_wait_hist: [AtomicU64; LATENCY_BUCKET_BOUNDS_MS.len() + 1],
    pub(crate) engine_apply_lock_wait_hist: [AtomicU64; LATENCY_BUCKET_BOUNDS_MS.len() + 1],
    pub(crate) sweep_batch_hist: [AtomicU64; BATCH_BUCKET_BOUNDS.len() + 1],
}

impl PerfCounters {
    pub(crate) fn new() -> Self {
        Self {
            bids_received: AtomicU64::new(0),
            bids_accepted: AtomicU64::new(0),
            bids_rejected: AtomicU64::new(0),
            bid_lock_retries: AtomicU64::new(0),
            bid_lock_contention: AtomicU64::new(0),
            bid_db_failures: AtomicU64::new(0),
            sweep_ticks: AtomicU64::new(0),
            transitions_applied: AtomicU64::new(0),
            transitions_noop: AtomicU64::new(0),
            sweep_lock_skips: AtomicU64::new(0),
            sweep_errors: AtomicU64::new(0),
            relists_created: AtomicU64::new(0),
            relist_skips: AtomicU64::new(0),
            relist_errors: AtomicU64::new(0),
            publish_sent: AtomicU64::new(0),
            publish_dropped: AtomicU64::new(0),
            snapshot_refresh_ticks: AtomicU64::new(0),
            snapshot_updates: AtomicU64::new(0),
            snapshot_engine_busy: AtomicU64::new(0),
            bid_lock_wait_hist: std::array::from_fn(|_| AtomicU64::new(0)),
            engine_apply_lock_wait_hist: std::array::from_fn(|_| AtomicU64::new(0)),
            sweep_batch_hist: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    pub(crate) fn observe_bid_lock_wait_ms(&self, ms: u64) {
        let idx = hist_bucket_idx(ms, &LATENCY_BUCKET_BOUNDS_MS);
        self.bid_lock_wait_hist[idx].fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn observe_engine_apply_lock_wait_ms(&self, ms: u64) {
        let idx = hist_bucket_idx(ms, &LATENCY_BUCKET_BOUNDS_MS);
        self.engine_apply_lock_wait_hist[idx].fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn observe_sweep_batch_size(&self, n: usize) {
        let idx = hist_bucket_idx(n as u64, &BATCH_BUCKET_BOUNDS);
        self.sweep_batch_hist[idx].fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot_json(&self) -> serde_json::Value {
        serde_json::json!({
            "bids": {
                "received": self.bids_received.load(Ordering::Relaxed),
                "accepted": self.bids_accepted.load(Ordering::Relaxed),
                "rejected": self.bids_rejected.load(Ordering::Relaxed),
                "lock_retries": self.bid_lock_retries.load(Ordering::Relaxed),
                "lock_contention": self.bid_lock_contention.load(Ordering::Relaxed),
                "db_failures": self.bid_db_failures.load(Ordering::Relaxed),
            },
            "sweep": {
                "ticks": self.sweep_ticks.load(Ordering::Relaxed),
                "transitions": self.transitions_applied.load(Ordering::Relaxed),
                "noops": self.transitions_noop.load(Ordering::Relaxed),
                "lock_skips": self.sweep_lock_skips.load(Ordering::Relaxed),
                "errors": self.sweep_errors.load(Ordering::Relaxed),
            },
            "relist": {
                "created": self.relists_created.load(Ordering::Relaxed),
                "skips": self.relist_skips.load(Ordering::Relaxed),
                "errors": self.relist_errors.load(Ordering::Relaxed),
            },
            "publish": {
                "sent": self.publish_sent.load(Ordering::Relaxed),
                "dropped": self.publish_dropped.load(Ordering::Relaxed),
            },
            "snapshot_cache": {
                "ticks": self.snapshot_refresh_ticks.load(Ordering::Relaxed),
                "updates": self.snapshot_updates.load(Ordering::Relaxed),
                "engine_busy": self.snapshot_engine_busy.load(Ordering::Relaxed),
            }
        })
    }
}

const LOCK_PROFILE_WARN_MS: u128 = 500;
const LOCK_PROFILE_COOLDOWN_MS: i64 = 1000;
static LOCK_LOG_LAST_MS: Lazy<DashMap<&'static str, i64>> = Lazy::new(DashMap::new);
static ENGINE_LOG_LAST_MS: Lazy<DashMap<String, i64>> = Lazy::new(DashMap::new);

fn now_epoch_ms_i64() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(_) => 0,
    }
}

fn should_emit_lock_log(label: &'static str) -> bool {
    let now = now_epoch_ms_i64();
    if let Some(mut last) = LOCK_LOG_LAST_MS.get_mut(label) {
        if now - *last < LOCK_PROFILE_COOLDOWN_MS {
            return false;
        }
        *last = now;
        true
    } else {
        LOCK_LOG_LAST_MS.insert(label, now);
        true
    }
}

fn should_emit_engine_log(label: &str) -> bool {
    let now = now_epoch_ms_i64();
    if let Some(mut last) = ENGINE_LOG_LAST_MS.get_mut(label) {
        if now - *last < LOCK_PROFILE_COOLDOWN_MS {
            return false;
        }
        *last = now;
        true
    } else {
        ENGINE_LOG_LAST_MS.insert(label.to_string(), now);
        true
    }
}

pub(crate) struct ProfiledReadGuard<'a, T> {
    label: &'static str,
    wait_ms: u128,
    acquired_at: Instant,
    guard: tokio::sync::RwLockReadGuard<'a, T>,
}

impl<'a, T> Deref for ProfiledReadGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<'a, T> Drop for ProfiledReadGuard<'a, T> {
    fn drop(&mut self) {
        let hold_ms = self.acquired_at.elapsed().as_millis();
        if (self.wait_ms >= LOCK_PROFILE_WARN_MS || hold_ms >= LOCK_PROFILE_WARN_MS)
            && should_emit_lock_log(self.label)
        {
            eprintln!(
                "[lock] kind=read label={} wait_ms={} hold_ms={}",
                self.label, self.wait_ms, hold_ms
            );
        }
    }
}

pub(crate) struct ProfiledWriteGuard<'a, T> {
    label: &'static str,
    wait_ms: u128,
    acquired_at: Instant,
    guard: tokio::sync::RwLockWriteGuard<'a, T>,
}

impl<'a, T> Deref for ProfiledWriteGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<'a, T> DerefMut for ProfiledWriteGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

impl<'a, T> Drop for ProfiledWriteGuard<'a, T> {
    fn drop(&mut self) {
        let hold_ms = self.acquired_at.elapsed().as_millis();
        if (self.wait_ms >= LOCK_PROFILE_WARN_MS || hold_ms >= LOCK_PROFILE_WARN_MS)
            && should_emit_lock_log(self.label)
        {
            eprintln!(
                "[lock] kind=write label={} wait_ms={} hold_ms={}",
                self.label, self.wait_ms, hold_ms
            );
        }
    }
}

pub(crate) async fn lock_read<'a, T>(
    lock: &'a RwLock<T>,
    label: &'static str,
) -> ProfiledReadGuard<'a, T> {
    let wait_started = Instant::now();
    let guard = lock.read().await;
    ProfiledReadGuard {
        label,
        wait_ms: wait_started.elapsed().as_millis(),
        acquired_at: Instant::now(),
        guard,
    }
}

pub(crate) async fn lock_write<'a, T>(
    lock: &'a RwLock<T>,
    label: &'static str,
) -> ProfiledWriteGuard<'a, T> {
    let wait_started = Instant::now();
    let guard = lock.write().await;
    ProfiledWriteGuard {
        label,
        wait_ms: wait_started.elapsed().as_millis(),
        acquired_at: Instant::now(),
        guard,
    }
}

pub(crate) fn try_lock_read<'a, T>(
    lock: &'a RwLock<T>,
    label: &'static str,
) -> Option<ProfiledReadGuard<'a, T>> {
    let guard = lock.try_read().ok()?;
    Some(ProfiledReadGuard {
        label,
        wait_ms: 0,
        acquired_at: Instant::now(),
        guard,
    })
}

pub(crate) struct ProfiledMutexGuard {
    label: &'static str,
    wait_ms: u128,
    acquired_at: Instant,
    _guard: OwnedMutexGuard<()>,
}

impl ProfiledMutexGuard {
    pub(crate) fn wait_ms(&self) -> u128 {
        self.wait_ms
    }
}

impl Drop for ProfiledMutexGuard {
    fn drop(&mut self) {
        let hold_ms = self.acquired_at.elapsed().as_millis();
        if (self.wait_ms >= LOCK_PROFILE_WARN_MS || hold_ms >= LOCK_PROFILE_WARN_MS)
            && should_emit_lock_log(self.label)
        {
            eprintln!(
                "[lock] kind=mutex label={} wait_ms={} hold_ms={}",
                self.label, self.wait_ms, hold_ms
            );
        }
    }
}

// Sharded per-auction lock table. Every mutation for one auction (bid,
// transition, relist) runs under its shard mutex, which is what serializes
// the aggregate. Shard collisions only cost extra waiting, never correctness.
pub(crate) struct AuctionLocks {
    shards: Vec<Arc<Mutex<()>>>,
}

impl AuctionLocks {
    pub(crate) fn new(shard_count: usize) -> Self {
        let n = shard_count.max(1);
        Self {
            shards: (0..n).map(|_| Arc::new(Mutex::new(()))).collect(),
        }
    }

    fn shard_index(&self, auction_id: i64) -> usize {
        (auction_id.unsigned_abs() as usize) % self.shards.len()
    }

    pub(crate) async fn lock(&self, auction_id: i64) -> ProfiledMutexGuard {
        let idx = self.shard_index(auction_id);
        let wait_started = Instant::now();
        let guard = self.shards[idx].clone().lock_owned().await;
        ProfiledMutexGuard {
            label: "state.lock_auction",
            wait_ms: wait_started.elapsed().as_millis(),
            acquired_at: Instant::now(),
            _guard: guard,
        }
    }

    // Non-blocking variant for the sweep: a contended auction is skipped and
    // picked up again on the next tick.
    pub(crate) fn try_lock(&self, auction_id: i64) -> Option<ProfiledMutexGuard> {
        let idx = self.shard_index(auction_id);
        let guard = self.shards[idx].clone().try_lock_owned().ok()?;
        Some(ProfiledMutexGuard {
            label: "state.try_lock_auction",
            wait_ms: 0,
            acquired_at: Instant::now(),
            _guard: guard,
        })
    }
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) cfg: Arc<AppConfig>,
    pub(crate) db: Pool<Postgres>,
    pub(crate) engine: Arc<RwLock<EngineState>>,
    pub(crate) event_type_ids: Arc<RwLock<HashMap<String, i16>>>,
    pub(crate) next_auction_id: Arc<AtomicI64>,
    pub(crate) auction_locks: Arc<AuctionLocks>,
    pub(crate) snapshot_cache: Arc<DashMap<i64, AuctionSnapshot>>,
    pub(crate) realtime: Arc<RealtimeHub>,
    pub(crate) perf: Arc<PerfCounters>,
    pub(crate) engine_ready: Arc<AtomicBool>,
}

impl AppState {
    pub(crate) fn allocate_auction_id(&self) -> i64 {
        self.next_auction_id.fetch_add(1, Ordering::SeqCst)
    }

    // Write-through update of the lock-free read model.
    pub(crate) fn update_snapshot(&self, a: &Auction) {
        self.snapshot_cache.insert(a.auction_id, AuctionSnapshot::of(a));
        self.perf.snapshot_updates.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn publish_update(
        &self,
        auction_id: i64,
        code: &'static str,
        snapshot: AuctionSnapshot,
        at: DateTime<Utc>,
    ) {
        if self.realtime.publish(auction_id, code, snapshot, at) {
            self.perf.publish_sent.fetch_add(1, Ordering::Relaxed);
        } else {
            self.perf.publish_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) async fn with_engine_write_profile<R>(
        &self,
        label: &str,
        f: impl FnOnce(&mut EngineState) -> R,
    ) -> R {
        let lock_wait_started = Instant::now();
        let mut eng = self.engine.write().await;
        let lock_wait_ms = lock_wait_started.elapsed().as_millis();
        self.perf
            .observe_engine_apply_lock_wait_ms(lock_wait_ms.min(u64::MAX as u128) as u64);
        let hold_started = Instant::now();
        let out = f(&mut eng);
        let hold_ms = hold_started.elapsed().as_millis();
        if (lock_wait_ms >= LOCK_PROFILE_WARN_MS || hold_ms >= LOCK_PROFILE_WARN_MS)
            && should_emit_engine_log(label)
        {
            eprintln!(
                "[engine_lock] label={} wait_ms={} hold_ms={}",
                label, lock_wait_ms, hold_ms
            );
        }
        out
    }
}
