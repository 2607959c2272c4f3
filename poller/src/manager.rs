use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use url::Url;

use client::{ConnectionPool, EthRpc};
use collector::TokenClassCache;
use config::ChainSpec;
use metrics::{ChainHealth, ChainScope, LabelCache, MetricsBundle};

use crate::{poll_loop, reload, ReloadSummary};

/// Grace granted to a removed chain's in-flight poll before its series
/// are pruned regardless.
const REMOVE_GRACE: Duration = Duration::from_secs(5);

/// Constructs the RPC client a poll loop uses for one tick.
pub type RpcFactory = Arc<dyn Fn(&ChainSpec, ChainScope) -> Arc<dyn EthRpc> + Send + Sync>;

/// Shared services handed to every poll loop.
pub struct PollerContext {
    /// Metric registry.
    pub bundle: Arc<MetricsBundle>,
    /// Per-chain freshness state.
    pub health: Arc<ChainHealth>,
    /// Process-lifetime contract classification cache.
    pub classes: Arc<TokenClassCache>,
    /// RPC client factory.
    pub rpc_factory: RpcFactory,
    /// Transport pool behind the factory, when there is one to
    /// invalidate on chain removal.
    pub pool: Option<Arc<ConnectionPool>>,
    /// Fallback for chains without a poll interval.
    pub default_poll_interval: Duration,
    /// Ceiling for the failure backoff.
    pub max_failure_backoff: Duration,
}

struct ChainRuntime {
    spec_tx: watch::Sender<Arc<ChainSpec>>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    scope: ChainScope,
    rpc_url: Url,
}

/// Owner of the active poll loops, keyed by chain name.
///
/// The map lock is held only across set mutations, never across RPC
/// calls; poll loops mutate nothing but their own state.
pub struct PollerManager {
    ctx: Arc<PollerContext>,
    chains: Mutex<HashMap<String, ChainRuntime>>,
}

impl PollerManager {
    /// A manager with no chains running yet.
    pub fn new(ctx: Arc<PollerContext>) -> Self {
        Self {
            ctx,
            chains: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn one poll loop per spec.
    pub async fn start(&self, specs: Vec<ChainSpec>) {
        let mut chains = self.chains.lock().await;

        for spec in specs {
            self.spawn_locked(&mut chains, spec);
        }

        self.update_counters(&chains);
    }

    /// Signal every loop to stop and wait up to `grace` for them to
    /// drain; afterwards the loops are abandoned and state is cleared
    /// regardless.
    pub async fn stop_all(&self, grace: Duration) {
        let mut chains = self.chains.lock().await;

        for runtime in chains.values() {
            runtime.cancel.cancel();
        }

        let deadline = Instant::now() + grace;

        for (name, runtime) in chains.drain() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(remaining, runtime.handle).await.is_err() {
                tracing::warn!(chain = %name, "poll loop did not stop in time, abandoning");
            }
            runtime.scope.prune_all();
            self.ctx.health.remove_chain(&name);
        }

        self.update_counters(&chains);
    }

    /// Apply a new spec set: remove, replace in place, and add chains as
    /// the diff against the running set dictates.
    pub async fn apply_reload(&self, new_specs: Vec<ChainSpec>) -> ReloadSummary {
        let mut chains = self.chains.lock().await;

        let current: Vec<ChainSpec> = chains
            .values()
            .map(|runtime| ChainSpec::clone(&runtime.spec_tx.borrow()))
            .collect();

        let plan = reload::diff(&current, &new_specs);
        let summary = ReloadSummary {
            added: plan.add.len(),
            removed: plan.remove.len(),
            replaced: plan.replace.len(),
            total: new_specs.len(),
        };

        for name in &plan.remove {
            self.remove_locked(&mut chains, name).await;
        }

        for spec in plan.replace {
            let Some(runtime) = chains.get(&spec.name) else {
                continue;
            };
            let interval = spec.poll_interval.unwrap_or(self.ctx.default_poll_interval);
            self.ctx.health.update_interval(&spec.name, interval);
            // The loop reads the channel at the top of its next tick;
            // the label cache is retained so continuous series are not
            // broken.
            let _ = runtime.spec_tx.send(Arc::new(spec));
        }

        for spec in plan.add {
            self.spawn_locked(&mut chains, spec);
        }

        self.update_counters(&chains);

        if summary.added + summary.removed + summary.replaced > 0 {
            tracing::info!(
                added = summary.added,
                removed = summary.removed,
                replaced = summary.replaced,
                total = summary.total,
                "configuration reloaded",
            );
        }

        summary
    }

    /// Names of the chains currently running.
    pub async fn chain_names(&self) -> Vec<String> {
        let chains = self.chains.lock().await;
        let mut names: Vec<_> = chains.keys().cloned().collect();
        names.sort();
        names
    }

    /// The spec set currently driving the loops.
    pub async fn current_specs(&self) -> Vec<ChainSpec> {
        let chains = self.chains.lock().await;
        chains
            .values()
            .map(|runtime| ChainSpec::clone(&runtime.spec_tx.borrow()))
            .collect()
    }

    /// Block until every chain has completed its first poll attempt, or
    /// `timeout` elapses.
    pub async fn await_first_ticks(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;

        while Instant::now() < deadline {
            if self.ctx.health.all_first_ticks_done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        tracing::warn!(
            timeout_s = timeout.as_secs_f64(),
            "warm poll timed out, continuing startup",
        );
    }

    fn spawn_locked(&self, chains: &mut HashMap<String, ChainRuntime>, spec: ChainSpec) {
        let name = spec.name.clone();
        let rpc_url = spec.rpc_url.clone();
        let interval = spec.poll_interval.unwrap_or(self.ctx.default_poll_interval);

        self.ctx.health.register_chain(&name, interval);

        let scope = ChainScope::new(
            self.ctx.bundle.clone(),
            Arc::new(StdMutex::new(LabelCache::new())),
            name.clone(),
        );

        let (spec_tx, spec_rx) = watch::channel(Arc::new(spec));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(poll_loop::run(
            self.ctx.clone(),
            spec_rx,
            cancel.clone(),
            scope.clone(),
        ));

        chains.insert(
            name,
            ChainRuntime {
                spec_tx,
                cancel,
                handle,
                scope,
                rpc_url,
            },
        );
    }

    async fn remove_locked(&self, chains: &mut HashMap<String, ChainRuntime>, name: &str) {
        let Some(runtime) = chains.remove(name) else {
            return;
        };

        runtime.cancel.cancel();
        if tokio::time::timeout(REMOVE_GRACE, runtime.handle)
            .await
            .is_err()
        {
            tracing::warn!(chain = %name, "poll loop did not stop in time, abandoning");
        }

        // The loop prunes on exit as well; doing it here keeps removal
        // correct even for an abandoned loop.
        runtime.scope.prune_all();
        self.ctx.health.remove_chain(name);

        if let Some(pool) = &self.ctx.pool {
            pool.invalidate(&runtime.rpc_url);
        }

        tracing::info!(chain = %name, "chain removed");
    }

    fn update_counters(&self, chains: &HashMap<String, ChainRuntime>) {
        let count = chains.len() as i64;
        self.ctx.bundle.exporter.configured_blockchains.set(count);
        self.ctx.bundle.exporter.poller_tasks.set(count);
    }
}
