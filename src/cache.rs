//! Per-key polling cache over a [`FallbackResolver`].
//!
//! Each key owns one [`FeedState`], one refresh timer while anyone is
//! subscribed, and at most one resolution in flight. Consumers hold a
//! [`Subscription`] and only ever read snapshots.

use std::collections::hash_map::Entry as MapEntry;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::resolver::{FallbackResolver, Resolution};
use crate::source::PriceSource;
use crate::stats::Stats;
use crate::types::{AssetId, ErrorInfo, FeedState, FeedStatus};

const MIN_INTERVAL: Duration = Duration::from_millis(1);

type InFlight = Shared<BoxFuture<'static, FeedState>>;

struct Entry {
    asset_ids: Vec<AssetId>,
    resolver: FallbackResolver,
    interval: Duration,
    tx: watch::Sender<FeedState>,
    subscribers: HashSet<Uuid>,
    in_flight: Option<InFlight>,
    // restored when a result lands after everyone left
    status_before_attempt: FeedStatus,
    last_attempt: Option<Instant>,
    timer: Option<JoinHandle<()>>,
}

struct Inner {
    entries: Mutex<HashMap<String, Entry>>,
    stats: Arc<Stats>,
}

#[derive(Clone)]
pub struct PollingCache {
    inner: Arc<Inner>,
}

impl PollingCache {
    pub fn new(stats: Arc<Stats>) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                stats,
            }),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.inner.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register interest in `key`. Must be called from within a tokio runtime.
    ///
    /// The first subscription defines the key's assets, sources and interval
    /// and starts a resolution right away. Later ones share that cycle and
    /// see the current state immediately.
    pub fn subscribe(
        &self,
        key: &str,
        asset_ids: Vec<AssetId>,
        sources: Vec<Arc<dyn PriceSource>>,
        interval: Duration,
    ) -> Subscription {
        let id = Uuid::new_v4();
        let mut entries = self.entries();

        let entry = match entries.entry(key.to_string()) {
            MapEntry::Occupied(o) => o.into_mut(),
            MapEntry::Vacant(v) => {
                let resolver = FallbackResolver::new(sources);
                let interval = interval.max(MIN_INTERVAL);
                tracing::info!(
                    key,
                    assets = ?asset_ids,
                    sources = ?resolver.source_names(),
                    interval_ms = interval.as_millis() as u64,
                    "feed created"
                );
                let (tx, _) = watch::channel(FeedState::new(key));
                v.insert(Entry {
                    asset_ids,
                    resolver,
                    interval,
                    tx,
                    subscribers: HashSet::new(),
                    in_flight: None,
                    status_before_attempt: FeedStatus::Idle,
                    last_attempt: None,
                    timer: None,
                })
            }
        };

        entry.subscribers.insert(id);
        let rx = entry.tx.subscribe();

        if entry.timer.is_none() {
            let first_due = match entry.last_attempt {
                Some(at) => at + entry.interval,
                None => {
                    // dropping the handle is fine, the task keeps running
                    let _ = self.start_refresh(key, entry);
                    Instant::now() + entry.interval
                }
            };
            entry.timer = Some(self.spawn_timer(key, first_due, entry.interval));
        }

        self.publish_active(&entries);
        drop(entries);

        Subscription {
            cache: self.clone(),
            key: key.to_string(),
            id,
            rx,
            active: true,
        }
    }

    /// Idempotent. Stops the key's timer when the last subscriber leaves; a
    /// resolution already in flight is left to finish.
    pub fn unsubscribe(&self, key: &str, id: Uuid) {
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(key) else { return };
        if !entry.subscribers.remove(&id) {
            return;
        }
        if entry.subscribers.is_empty() {
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
            tracing::info!(key, "last subscriber left; refresh stopped");
        }
        self.publish_active(&entries);
    }

    /// Resolve `key` now, or join the resolution already running.
    /// `None` if the key was never subscribed. A key nobody is subscribed
    /// to is not fetched; its current state is returned as-is.
    pub async fn refresh(&self, key: &str) -> Option<FeedState> {
        let fut = {
            let mut entries = self.entries();
            let entry = entries.get_mut(key)?;
            if entry.subscribers.is_empty() {
                tracing::debug!(key, "refresh skipped; no subscribers");
                let current = entry.tx.borrow().clone();
                return Some(current);
            }
            self.start_refresh(key, entry)
        };
        Some(fut.await)
    }

    pub fn snapshot(&self, key: &str) -> Option<FeedState> {
        self.entries().get(key).map(|e| e.tx.borrow().clone())
    }

    fn publish_active(&self, entries: &HashMap<String, Entry>) {
        let n: usize = entries.values().map(|e| e.subscribers.len()).sum();
        self.inner.stats.set_active_subscriptions(n as u64);
    }

    fn start_refresh(&self, key: &str, entry: &mut Entry) -> InFlight {
        if let Some(running) = &entry.in_flight {
            self.inner.stats.inc_refresh_joined();
            tracing::debug!(key, "joining in-flight refresh");
            return running.clone();
        }

        self.inner.stats.inc_refresh_started();
        entry.status_before_attempt = entry.tx.borrow().status;
        entry.last_attempt = Some(Instant::now());
        entry.tx.send_modify(|s| {
            s.status = FeedStatus::Loading;
            s.last_attempt_at = Utc::now();
        });

        let resolver = entry.resolver.clone();
        let assets = entry.asset_ids.clone();
        let cache = self.clone();
        let task_key = key.to_string();
        // Runs detached so that unsubscribing never cancels the upstream call.
        let task = tokio::spawn(async move {
            let outcome = match AssertUnwindSafe(resolver.resolve(&assets)).catch_unwind().await {
                Ok(res) => res.map_err(|e| ErrorInfo::from(&e)),
                Err(_) => {
                    tracing::error!(key = %task_key, "price source panicked during refresh");
                    Err(ErrorInfo {
                        message: "price resolution panicked".to_string(),
                        attempts: vec![],
                    })
                }
            };
            cache.complete(&task_key, outcome)
        });

        let key = key.to_string();
        let fut: InFlight = async move {
            match task.await {
                Ok(state) => state,
                // only reachable when the runtime is shutting down
                Err(e) => {
                    tracing::error!(key = %key, error = %e, "refresh task cancelled");
                    FeedState::new(&key)
                }
            }
        }
        .boxed()
        .shared();

        entry.in_flight = Some(fut.clone());
        fut
    }

    fn complete(&self, key: &str, outcome: Result<Resolution, ErrorInfo>) -> FeedState {
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(key) else {
            return FeedState::new(key);
        };
        entry.in_flight = None;

        if entry.subscribers.is_empty() {
            self.inner.stats.inc_discarded();
            let prior = entry.status_before_attempt;
            entry.tx.send_modify(|s| s.status = prior);
            tracing::debug!(key, "no subscribers left; resolution discarded");
            let current = entry.tx.borrow().clone();
            return current;
        }

        match outcome {
            Ok(res) => {
                self.inner.stats.inc_resolution_ok();
                if !res.failed_attempts.is_empty() {
                    self.inner.stats.inc_fallback();
                    tracing::info!(
                        key,
                        source = %res.source_name,
                        skipped = res.failed_attempts.len(),
                        "served by fallback source"
                    );
                }
                let now = Utc::now();
                entry.tx.send_modify(|s| {
                    s.status = FeedStatus::Ready;
                    s.value = Some(res.quotes);
                    s.source = Some(res.source_name);
                    s.last_error = None;
                    s.last_success_at = Some(now);
                });
            }
            Err(info) => {
                self.inner.stats.inc_resolution_failed();
                tracing::warn!(
                    key,
                    error = %info.message,
                    attempts = ?info.attempts,
                    "feed refresh failed; keeping last value"
                );
                entry.tx.send_modify(|s| {
                    s.status = FeedStatus::Error;
                    s.last_error = Some(info);
                });
            }
        }

        let current = entry.tx.borrow().clone();
        current
    }

    async fn scheduled_refresh(&self, key: &str) -> bool {
        let fut = {
            let mut entries = self.entries();
            match entries.get_mut(key) {
                Some(entry) if !entry.subscribers.is_empty() => self.start_refresh(key, entry),
                _ => return false,
            }
        };
        fut.await;
        true
    }

    fn spawn_timer(&self, key: &str, first_due: Instant, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let key = key.to_string();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(first_due, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let cache = PollingCache { inner };
                if !cache.scheduled_refresh(&key).await {
                    break;
                }
            }
            tracing::debug!(key = %key, "refresh timer stopped");
        })
    }
}

/// A consumer's handle on one key. Dropping it unsubscribes.
pub struct Subscription {
    cache: PollingCache,
    key: String,
    id: Uuid,
    rx: watch::Receiver<FeedState>,
    active: bool,
}

impl Subscription {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn snapshot(&self) -> FeedState {
        self.rx.borrow().clone()
    }

    /// Wait for the next state write. `None` once the cache is gone.
    pub async fn changed(&mut self) -> Option<FeedState> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    pub async fn refresh(&self) -> Option<FeedState> {
        self.cache.refresh(&self.key).await
    }

    pub fn unsubscribe(&mut self) {
        if std::mem::take(&mut self.active) {
            self.cache.unsubscribe(&self.key, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
