use std::{
    collections::HashMap,
    sync::RwLock,
    time::{Duration, Instant},
};

/// Health verdict for one chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChainStatus {
    /// Most recent poll succeeded and is fresh.
    Healthy,
    /// At least one prior success exists but it is older than the
    /// staleness threshold.
    Degraded,
    /// Most recent poll failed.
    Failed,
    /// No poll attempt has completed yet.
    Unknown,
}

impl ChainStatus {
    /// Lowercase label for reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Failed => "failed",
            Self::Unknown => "unknown",
        }
    }
}

/// Read-only view of one chain's health.
#[derive(Clone, Debug)]
pub struct ChainHealthSnapshot {
    /// Chain name.
    pub chain: String,
    /// Chain id learned from the RPC endpoint, if any.
    pub chain_id: Option<u64>,
    /// Aggregate verdict.
    pub status: ChainStatus,
    /// Unix timestamp of the last successful poll.
    pub last_success_ts: Option<u64>,
    /// Category of the last poll error.
    pub last_error: Option<String>,
    /// Consecutive failed polls.
    pub consecutive_failures: u32,
    /// Backoff currently applied before the next poll.
    pub current_backoff: Duration,
}

#[derive(Debug)]
struct ChainEntry {
    chain_id: Option<u64>,
    last_success_ts: Option<u64>,
    last_attempt_ts: Option<u64>,
    last_error: Option<String>,
    consecutive_failures: u32,
    current_backoff: Duration,
    poll_interval: Duration,
    registered_at: Instant,
    first_tick_done: bool,
}

impl ChainEntry {
    fn new(poll_interval: Duration) -> Self {
        Self {
            chain_id: None,
            last_success_ts: None,
            last_attempt_ts: None,
            last_error: None,
            consecutive_failures: 0,
            current_backoff: poll_interval,
            poll_interval,
            registered_at: Instant::now(),
            first_tick_done: false,
        }
    }

    fn status(&self, now: u64, stale_threshold: Duration) -> ChainStatus {
        if self.last_attempt_ts.is_none() {
            return ChainStatus::Unknown;
        }
        if self.consecutive_failures > 0 {
            return ChainStatus::Failed;
        }
        match self.last_success_ts {
            Some(ts) if now.saturating_sub(ts) > stale_threshold.as_secs() => {
                ChainStatus::Degraded
            }
            Some(_) => ChainStatus::Healthy,
            None => ChainStatus::Unknown,
        }
    }
}

/// Per-chain freshness and failure state, mutated by the poll loops and
/// read by the health endpoints.
#[derive(Debug)]
pub struct ChainHealth {
    stale_threshold: Duration,
    chains: RwLock<HashMap<String, ChainEntry>>,
}

impl ChainHealth {
    /// New empty state with the given staleness threshold.
    pub fn new(stale_threshold: Duration) -> Self {
        Self {
            stale_threshold,
            chains: RwLock::new(HashMap::new()),
        }
    }

    /// Register a chain when its poll loop starts.
    pub fn register_chain(&self, chain: &str, poll_interval: Duration) {
        self.write()
            .insert(chain.to_string(), ChainEntry::new(poll_interval));
    }

    /// Drop a chain's state when it is removed from the configuration.
    pub fn remove_chain(&self, chain: &str) {
        self.write().remove(chain);
    }

    /// Update the poll interval after a replace-in-place reload.
    pub fn update_interval(&self, chain: &str, poll_interval: Duration) {
        if let Some(entry) = self.write().get_mut(chain) {
            entry.poll_interval = poll_interval;
        }
    }

    /// Record the chain id resolved for `chain`, returning the previous
    /// value when it differs.
    pub fn record_chain_id(&self, chain: &str, chain_id: u64) -> Option<u64> {
        let mut chains = self.write();
        let entry = chains.get_mut(chain)?;
        let previous = entry.chain_id;
        entry.chain_id = Some(chain_id);
        match previous {
            Some(old) if old != chain_id => Some(old),
            _ => None,
        }
    }

    /// The chain id currently known for `chain`.
    pub fn chain_id(&self, chain: &str) -> Option<u64> {
        self.read().get(chain).and_then(|entry| entry.chain_id)
    }

    /// Record a successful poll at `now` (epoch seconds).
    pub fn record_success(&self, chain: &str, now: u64, backoff: Duration) {
        if let Some(entry) = self.write().get_mut(chain) {
            // A wall-clock jump backwards is treated as no update.
            if entry.last_success_ts.map_or(true, |ts| now >= ts) {
                entry.last_success_ts = Some(now);
            }
            if entry.last_attempt_ts.map_or(true, |ts| now >= ts) {
                entry.last_attempt_ts = Some(now);
            }
            entry.last_error = None;
            entry.consecutive_failures = 0;
            entry.current_backoff = backoff;
            entry.first_tick_done = true;
        }
    }

    /// Record a failed poll at `now` (epoch seconds).
    pub fn record_failure(
        &self,
        chain: &str,
        now: u64,
        error_category: &str,
        consecutive_failures: u32,
        backoff: Duration,
    ) {
        if let Some(entry) = self.write().get_mut(chain) {
            if entry.last_attempt_ts.map_or(true, |ts| now >= ts) {
                entry.last_attempt_ts = Some(now);
            }
            entry.last_error = Some(error_category.to_string());
            entry.consecutive_failures = consecutive_failures;
            entry.current_backoff = backoff;
            entry.first_tick_done = true;
        }
    }

    /// Whether every registered chain has completed its first poll tick.
    pub fn all_first_ticks_done(&self) -> bool {
        self.read().values().all(|entry| entry.first_tick_done)
    }

    /// Liveness: at least one poll loop has started, vacuously true with
    /// an empty configuration. Never depends on RPC reachability.
    pub fn live(&self) -> bool {
        true
    }

    /// Readiness at `now` (epoch seconds).
    ///
    /// Ready iff at least one chain has a fresh success and no chain
    /// that ever succeeded has gone stale. Chains that never succeeded
    /// only gate readiness until their first tick has had a chance to
    /// run.
    pub fn ready(&self, now: u64) -> bool {
        let chains = self.read();

        if chains.is_empty() {
            return true;
        }

        let mut any_fresh = false;

        for entry in chains.values() {
            match entry.last_success_ts {
                Some(ts) if now.saturating_sub(ts) <= self.stale_threshold.as_secs() => {
                    any_fresh = true;
                }
                Some(_) => return false,
                None => {
                    let first_tick_pending = !entry.first_tick_done
                        && entry.registered_at.elapsed() < entry.poll_interval;
                    if first_tick_pending {
                        return false;
                    }
                }
            }
        }

        any_fresh
    }

    /// Per-chain snapshots at `now` (epoch seconds), sorted by name.
    pub fn snapshot(&self, now: u64) -> Vec<ChainHealthSnapshot> {
        let chains = self.read();

        let mut out: Vec<_> = chains
            .iter()
            .map(|(name, entry)| ChainHealthSnapshot {
                chain: name.clone(),
                chain_id: entry.chain_id,
                status: entry.status(now, self.stale_threshold),
                last_success_ts: entry.last_success_ts,
                last_error: entry.last_error.clone(),
                consecutive_failures: entry.consecutive_failures,
                current_backoff: entry.current_backoff,
            })
            .collect();

        out.sort_by(|a, b| a.chain.cmp(&b.chain));
        out
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, ChainEntry>> {
        self.chains.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, ChainEntry>> {
        self.chains.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
