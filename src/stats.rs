use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Default)]
pub struct Stats {
    start_ms: AtomicU64,
    last_log_ms: AtomicU64,

    refreshes_started: AtomicU64,
    refreshes_joined: AtomicU64,
    resolutions_ok: AtomicU64,
    resolutions_failed: AtomicU64,
    fallbacks_used: AtomicU64,
    results_discarded: AtomicU64,
    active_subscriptions: AtomicU64,
}

impl Stats {
    pub fn new(now_ms: u64) -> Arc<Self> {
        let s = Arc::new(Self::default());
        s.start_ms.store(now_ms, Ordering::Relaxed);
        s.last_log_ms.store(now_ms, Ordering::Relaxed);
        s
    }

    pub fn inc_refresh_started(&self) {
        self.refreshes_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_refresh_joined(&self) {
        self.refreshes_joined.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_resolution_ok(&self) {
        self.resolutions_ok.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_resolution_failed(&self) {
        self.resolutions_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_fallback(&self) {
        self.fallbacks_used.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_discarded(&self) {
        self.results_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_active_subscriptions(&self, n: u64) {
        self.active_subscriptions.store(n, Ordering::Relaxed);
    }

    pub fn should_log(&self, now_ms: u64, every_sec: u64) -> bool {
        if every_sec == 0 { return false; }
        let last = self.last_log_ms.load(Ordering::Relaxed);
        now_ms.saturating_sub(last) >= every_sec.saturating_mul(1000)
    }

    pub fn mark_logged(&self, now_ms: u64) {
        self.last_log_ms.store(now_ms, Ordering::Relaxed);
    }

    pub fn snapshot(&self, now_ms: u64) -> StatsSnapshot {
        let start = self.start_ms.load(Ordering::Relaxed);
        StatsSnapshot {
            now_ms,
            up_sec: now_ms.saturating_sub(start) / 1000,
            refreshes_started: self.refreshes_started.load(Ordering::Relaxed),
            refreshes_joined: self.refreshes_joined.load(Ordering::Relaxed),
            resolutions_ok: self.resolutions_ok.load(Ordering::Relaxed),
            resolutions_failed: self.resolutions_failed.load(Ordering::Relaxed),
            fallbacks_used: self.fallbacks_used.load(Ordering::Relaxed),
            results_discarded: self.results_discarded.load(Ordering::Relaxed),
            active_subscriptions: self.active_subscriptions.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub now_ms: u64,
    pub up_sec: u64,
    pub refreshes_started: u64,
    pub refreshes_joined: u64,
    pub resolutions_ok: u64,
    pub resolutions_failed: u64,
    pub fallbacks_used: u64,
    pub results_discarded: u64,
    pub active_subscriptions: u64,
}
