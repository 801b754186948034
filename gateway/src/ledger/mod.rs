//! Call ledger: in-memory TTL store of progress and results keyed by call id.
//!
//! Workers report incremental progress and a terminal result for an opaque call
//! id; callers poll for them later. Every call id ages out after its ttl (set
//! explicitly or defaulted) and its expiry callback, if any, fires exactly once.
//!
//! `get_progress` (peek) and `consume_progress` (dequeue) read the same queue.
//! Mixing them on one call id has no defined combined meaning; pick one per id.

mod sweeper;

use std::{
    collections::{HashMap, VecDeque},
    panic::AssertUnwindSafe,
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::{
    sync::{oneshot, Mutex},
    time::Instant,
};
use tracing::{debug, error, info};

pub use sweeper::LedgerSweeper;

/// Why an expiry callback fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryReason {
    /// No activity within the call's ttl
    Ttl,
    /// The worker owning the call went away
    OwnerGone,
}

pub type ExpiryCallback = Box<dyn FnOnce(ExpiryReason) + Send + 'static>;

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEntry {
    pub value: Value,
    pub timestamp: DateTime<Utc>,
    recorded_at: Instant,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResultRecord {
    pub value: Value,
    pub timestamp: DateTime<Utc>,
    recorded_at: Instant,
}

/// Maps a call id to the worker that owns it.
pub trait OwnerResolver: Send + Sync {
    fn owner_of(&self, call_id: &str) -> Option<String>;
}

/// Call ids shaped `<workerId><delimiter><rest>` belong to `workerId`.
#[derive(Debug, Clone)]
pub struct DelimitedOwnerResolver {
    delimiter: String,
}

impl DelimitedOwnerResolver {
    pub fn new(delimiter: impl Into<String>) -> Self {
        Self {
            delimiter: delimiter.into(),
        }
    }
}

impl Default for DelimitedOwnerResolver {
    fn default() -> Self {
        Self::new(":")
    }
}

impl OwnerResolver for DelimitedOwnerResolver {
    fn owner_of(&self, call_id: &str) -> Option<String> {
        if self.delimiter.is_empty() {
            return None;
        }
        call_id
            .split_once(self.delimiter.as_str())
            .map(|(owner, _)| owner)
            .filter(|owner| !owner.is_empty())
            .map(ToString::to_string)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LedgerSettings {
    /// Ttl applied to call ids that never had one set explicitly
    pub default_ttl: Duration,
    /// How often the sweeper scans for expired call ids
    pub sweep_interval: Duration,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(5 * 60),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

struct CallState {
    progress: VecDeque<ProgressEntry>,
    result: Option<ResultRecord>,
    ttl: Option<Duration>,
    on_expiry: Option<ExpiryCallback>,
    /// Last registration, write, or dequeue. Ages calls with no queued activity,
    /// including subscriptions registered before any data existed.
    last_touch: Instant,
}

impl CallState {
    fn new(now: Instant) -> Self {
        Self {
            progress: VecDeque::new(),
            result: None,
            ttl: None,
            on_expiry: None,
            last_touch: now,
        }
    }

    fn has_data(&self) -> bool {
        !self.progress.is_empty() || self.result.is_some()
    }

    /// Most recent real activity: newest progress entry or the result.
    fn last_activity(&self) -> Option<Instant> {
        let progress = self.progress.iter().map(|p| p.recorded_at).max();
        let result = self.result.as_ref().map(|r| r.recorded_at);
        progress.max(result)
    }

    fn is_expired(&self, now: Instant, default_ttl: Duration) -> bool {
        let ttl = self.ttl.unwrap_or(default_ttl);
        let idle_since = self.last_activity().unwrap_or(self.last_touch);
        now.saturating_duration_since(idle_since) > ttl
    }
}

/// Progress/result/expiry state for every in-flight call id.
pub struct CallLedger {
    settings: LedgerSettings,
    resolver: Arc<dyn OwnerResolver>,
    calls: Mutex<HashMap<String, CallState>>,
}

impl CallLedger {
    pub fn new(settings: LedgerSettings, resolver: Arc<dyn OwnerResolver>) -> Arc<Self> {
        Arc::new(Self {
            settings,
            resolver,
            calls: Mutex::new(HashMap::new()),
        })
    }

    pub fn settings(&self) -> LedgerSettings {
        self.settings
    }

    /// Set the ttl for `call_id` without touching its data.
    pub async fn set_expiry(&self, call_id: &str, ttl: Duration) {
        let now = Instant::now();
        let mut calls = self.calls.lock().await;
        calls
            .entry(call_id.to_string())
            .or_insert_with(|| CallState::new(now))
            .ttl = Some(ttl);
        debug!(call_id, ttl_ms = ttl.as_millis() as u64, "call ttl set");
    }

    /// Register the one-shot callback fired when `call_id` expires.
    ///
    /// Replaces any earlier callback. A call id without data gets a registration
    /// stamp so the subscription still ages out.
    pub async fn on_expiry(&self, call_id: &str, callback: ExpiryCallback) {
        let now = Instant::now();
        let mut calls = self.calls.lock().await;
        let state = calls
            .entry(call_id.to_string())
            .or_insert_with(|| CallState::new(now));
        state.ttl.get_or_insert(self.settings.default_ttl);
        if !state.has_data() {
            state.last_touch = now;
        }
        state.on_expiry = Some(callback);
    }

    /// Channel flavour of [`CallLedger::on_expiry`].
    pub async fn expiry_signal(&self, call_id: &str) -> oneshot::Receiver<ExpiryReason> {
        let (tx, rx) = oneshot::channel();
        self.on_expiry(
            call_id,
            Box::new(move |reason| {
                let _ = tx.send(reason);
            }),
        )
        .await;
        rx
    }

    pub async fn store_progress(&self, call_id: &str, value: Value) {
        let now = Instant::now();
        let mut calls = self.calls.lock().await;
        let state = calls
            .entry(call_id.to_string())
            .or_insert_with(|| CallState::new(now));
        state.ttl.get_or_insert(self.settings.default_ttl);
        state.progress.push_back(ProgressEntry {
            value,
            timestamp: Utc::now(),
            recorded_at: now,
        });
        state.last_touch = now;
    }

    /// Oldest queued progress entry, left in place.
    pub async fn get_progress(&self, call_id: &str) -> Option<ProgressEntry> {
        let calls = self.calls.lock().await;
        calls.get(call_id)?.progress.front().cloned()
    }

    /// Dequeue the oldest progress entry.
    ///
    /// Once the queue drains only the registration/ttl/result state remains; the
    /// sweep erases it when it goes idle.
    pub async fn consume_progress(&self, call_id: &str) -> Option<ProgressEntry> {
        let now = Instant::now();
        let mut calls = self.calls.lock().await;
        let state = calls.get_mut(call_id)?;
        let entry = state.progress.pop_front()?;
        state.last_touch = now;
        Some(entry)
    }

    /// Set the terminal result; a later write overwrites it.
    pub async fn store_result(&self, call_id: &str, value: Value) {
        let now = Instant::now();
        let mut calls = self.calls.lock().await;
        let state = calls
            .entry(call_id.to_string())
            .or_insert_with(|| CallState::new(now));
        state.ttl.get_or_insert(self.settings.default_ttl);
        state.result = Some(ResultRecord {
            value,
            timestamp: Utc::now(),
            recorded_at: now,
        });
        state.last_touch = now;
    }

    pub async fn get_result(&self, call_id: &str) -> Option<ResultRecord> {
        let calls = self.calls.lock().await;
        calls.get(call_id)?.result.clone()
    }

    /// Erase everything about `call_id`. The callback is dropped unfired.
    pub async fn cleanup(&self, call_id: &str) {
        let removed = self.calls.lock().await.remove(call_id);
        if removed.is_some() {
            debug!(call_id, "call state erased");
        }
    }

    /// Expire every call id owned by `owner_id`, firing their callbacks.
    ///
    /// Returns the number of call ids erased.
    pub async fn cleanup_for_owner(&self, owner_id: &str) -> usize {
        let expired: Vec<(String, CallState)> = {
            let mut calls = self.calls.lock().await;
            let owned: Vec<String> = calls
                .keys()
                .filter(|id| self.resolver.owner_of(id).as_deref() == Some(owner_id))
                .cloned()
                .collect();
            owned
                .into_iter()
                .filter_map(|id| calls.remove(&id).map(|state| (id, state)))
                .collect()
        };

        let count = expired.len();
        for (call_id, state) in expired {
            fire_callback(&call_id, state, ExpiryReason::OwnerGone);
        }
        if count > 0 {
            info!(owner_id, count, "released calls owned by departed worker");
        }
        count
    }

    /// Expire every call id idle for longer than its ttl.
    ///
    /// Returns the number of call ids erased.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let default_ttl = self.settings.default_ttl;
        let expired: Vec<(String, CallState)> = {
            let mut calls = self.calls.lock().await;
            let stale: Vec<String> = calls
                .iter()
                .filter(|(_, state)| state.is_expired(now, default_ttl))
                .map(|(id, _)| id.clone())
                .collect();
            stale
                .into_iter()
                .filter_map(|id| calls.remove(&id).map(|state| (id, state)))
                .collect()
        };

        let count = expired.len();
        for (call_id, state) in expired {
            fire_callback(&call_id, state, ExpiryReason::Ttl);
        }
        if count > 0 {
            debug!(count, "ledger sweep expired calls");
        }
        count
    }

    /// Number of call ids currently tracked.
    pub async fn len(&self) -> usize {
        self.calls.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Run the expiry callback of an erased call; a panic is logged and swallowed.
fn fire_callback(call_id: &str, state: CallState, reason: ExpiryReason) {
    let Some(callback) = state.on_expiry else {
        return;
    };
    if std::panic::catch_unwind(AssertUnwindSafe(move || callback(reason))).is_err() {
        error!(call_id, ?reason, "expiry callback panicked");
    }
}
