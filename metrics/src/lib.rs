#![deny(unused_crate_dependencies)]
#![warn(missing_docs)]
#![warn(unused_extern_crates)]
#![warn(unused_imports)]

//! Prometheus metric registry for the exporter.
//!
//! All families are registered against a single [`prometheus::Registry`]
//! so `/metrics` serialises one coherent payload. Every chain-labelled
//! write goes through a [`ChainScope`], which records the touched
//! (family, labelset) pair in that chain's [`LabelCache`]; pruning
//! removes exactly the cached set, making series removal O(live set).

mod error;
mod health;
mod label_cache;

pub use error::{Error, Result};
pub use health::{ChainHealth, ChainHealthSnapshot, ChainStatus};
pub use label_cache::LabelCache;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use prometheus::{
    Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

/// `blockchain_exporter_up` family name.
pub const EXPORTER_UP: &str = "blockchain_exporter_up";
/// `blockchain_exporter_configured_blockchains` family name.
pub const EXPORTER_CONFIGURED_BLOCKCHAINS: &str = "blockchain_exporter_configured_blockchains";
/// `blockchain_exporter_poller_tasks` family name.
pub const EXPORTER_POLLER_TASKS: &str = "blockchain_exporter_poller_tasks";

/// `chain_latest_block` family name.
pub const CHAIN_LATEST_BLOCK: &str = "chain_latest_block";
/// `chain_finalized_block` family name.
pub const CHAIN_FINALIZED_BLOCK: &str = "chain_finalized_block";
/// `chain_finalized_stale` family name.
pub const CHAIN_FINALIZED_STALE: &str = "chain_finalized_stale";
/// `blockchain_poll_success` family name.
pub const POLL_SUCCESS: &str = "blockchain_poll_success";
/// `blockchain_poll_timestamp_seconds` family name.
pub const POLL_TIMESTAMP_SECONDS: &str = "blockchain_poll_timestamp_seconds";
/// `blockchain_poll_consecutive_failures` family name.
pub const POLL_CONSECUTIVE_FAILURES: &str = "blockchain_poll_consecutive_failures";
/// `blockchain_poll_backoff_seconds` family name.
pub const POLL_BACKOFF_SECONDS: &str = "blockchain_poll_backoff_seconds";
/// `blockchain_poll_duration_seconds` family name.
pub const POLL_DURATION_SECONDS: &str = "blockchain_poll_duration_seconds";
/// `rpc_call_duration_seconds` family name.
pub const RPC_CALL_DURATION_SECONDS: &str = "rpc_call_duration_seconds";
/// `rpc_call_errors_total` family name.
pub const RPC_CALL_ERRORS_TOTAL: &str = "rpc_call_errors_total";
/// `log_chunks_total` family name.
pub const LOG_CHUNKS_TOTAL: &str = "log_chunks_total";
/// `log_chunk_span_blocks` family name.
pub const LOG_CHUNK_SPAN_BLOCKS: &str = "log_chunk_span_blocks";

/// `account_balance_wei` family name.
pub const ACCOUNT_BALANCE_WEI: &str = "account_balance_wei";

/// `contract_eth_balance_wei` family name.
pub const CONTRACT_ETH_BALANCE_WEI: &str = "contract_eth_balance_wei";
/// `contract_token_supply_raw` family name.
pub const CONTRACT_TOKEN_SUPPLY_RAW: &str = "contract_token_supply_raw";
/// `contract_token_supply_normalized` family name.
pub const CONTRACT_TOKEN_SUPPLY_NORMALIZED: &str = "contract_token_supply_normalized";
/// `contract_nft_total_supply` family name.
pub const CONTRACT_NFT_TOTAL_SUPPLY: &str = "contract_nft_total_supply";
/// `contract_transfer_count_window` family name.
pub const CONTRACT_TRANSFER_COUNT_WINDOW: &str = "contract_transfer_count_window";
/// `account_token_balance_raw` family name.
pub const ACCOUNT_TOKEN_BALANCE_RAW: &str = "account_token_balance_raw";
/// `account_token_balance` family name.
pub const ACCOUNT_TOKEN_BALANCE: &str = "account_token_balance";
/// `account_nft_balance` family name.
pub const ACCOUNT_NFT_BALANCE: &str = "account_nft_balance";
/// `account_nft_owned` family name.
pub const ACCOUNT_NFT_OWNED: &str = "account_nft_owned";

/// Process-level metrics.
#[derive(Clone)]
pub struct ExporterMetrics {
    /// 1 while the exporter is running, 0 once shutdown begins.
    pub up: IntGauge,
    /// Number of chains in the active configuration.
    pub configured_blockchains: IntGauge,
    /// Number of live poll loops.
    pub poller_tasks: IntGauge,
}

/// Per-chain operational metrics.
#[derive(Clone)]
pub struct ChainMetrics {
    /// Latest block height.
    pub latest_block: GaugeVec,
    /// Finalized block height, 0 when unavailable.
    pub finalized_block: GaugeVec,
    /// 1 when the finalized height could not be fetched this tick.
    pub finalized_stale: GaugeVec,
    /// 1 when the most recent poll succeeded, 0 otherwise.
    pub poll_success: GaugeVec,
    /// Unix timestamp of the most recent successful poll.
    pub poll_timestamp: GaugeVec,
    /// Number of consecutive failed polls.
    pub consecutive_failures: GaugeVec,
    /// Backoff applied before the next poll.
    pub backoff_seconds: GaugeVec,
    /// Wall-clock duration of poll cycles.
    pub poll_duration: HistogramVec,
    /// Duration of RPC calls by operation.
    pub rpc_call_duration: HistogramVec,
    /// RPC errors by operation and category.
    pub rpc_call_errors: IntCounterVec,
    /// Log sub-queries issued by the chunker.
    pub log_chunks: IntCounterVec,
    /// Block span of individual log sub-queries.
    pub log_chunk_span: HistogramVec,
}

/// Per-account metrics.
#[derive(Clone)]
pub struct AccountMetrics {
    /// Native balance in wei.
    pub balance_wei: GaugeVec,
}

/// Per-contract metrics.
#[derive(Clone)]
pub struct ContractMetrics {
    /// Native balance held by the contract, in wei.
    pub eth_balance_wei: GaugeVec,
    /// ERC-20 total supply in raw units.
    pub token_supply_raw: GaugeVec,
    /// ERC-20 total supply divided by `10^decimals`.
    pub token_supply_normalized: GaugeVec,
    /// ERC-721 total supply where the contract exposes one.
    pub nft_total_supply: GaugeVec,
    /// Transfer events observed within the lookback window.
    pub transfer_count_window: GaugeVec,
    /// ERC-20 balance of a configured account, raw units.
    pub token_balance_raw: GaugeVec,
    /// ERC-20 balance of a configured account, normalized.
    pub token_balance: GaugeVec,
    /// ERC-721 balance of a configured account.
    pub nft_balance: GaugeVec,
    /// 1 when the configured account owns the token id.
    pub nft_owned: GaugeVec,
}

enum FamilyHandle {
    Gauge(GaugeVec),
    Counter(IntCounterVec),
    Histogram(HistogramVec),
}

impl FamilyHandle {
    fn remove(&self, labels: &[&str]) {
        // Removing a series that a concurrent write re-created is fine;
        // the next sweep picks it up again.
        let _ = match self {
            Self::Gauge(family) => family.remove_label_values(labels),
            Self::Counter(family) => family.remove_label_values(labels),
            Self::Histogram(family) => family.remove_label_values(labels),
        };
    }
}

/// Typed bundles of every exporter metric family over one registry.
pub struct MetricsBundle {
    registry: Registry,
    /// Process-level families.
    pub exporter: ExporterMetrics,
    /// Chain-level families.
    pub chain: ChainMetrics,
    /// Account-level families.
    pub account: AccountMetrics,
    /// Contract-level families.
    pub contract: ContractMetrics,
    families: HashMap<&'static str, FamilyHandle>,
}

impl MetricsBundle {
    /// Build and register every family against a fresh registry.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let mut families = HashMap::new();

        let exporter = ExporterMetrics {
            up: register_int_gauge(&registry, EXPORTER_UP, "Whether the exporter process is up.")?,
            configured_blockchains: register_int_gauge(
                &registry,
                EXPORTER_CONFIGURED_BLOCKCHAINS,
                "Number of blockchains currently configured.",
            )?,
            poller_tasks: register_int_gauge(
                &registry,
                EXPORTER_POLLER_TASKS,
                "Number of active poll loops.",
            )?,
        };

        let chain_labels = &["chain", "chain_id"];

        let account = AccountMetrics {
            balance_wei: register_gauge(
                &registry,
                &mut families,
                ACCOUNT_BALANCE_WEI,
                "Native balance in wei for configured accounts.",
                &["chain", "chain_id", "name", "address"],
            )?,
        };

        let token_account_labels = &[
            "chain",
            "chain_id",
            "token_name",
            "token_address",
            "account_name",
            "account_address",
        ];

        let contract = ContractMetrics {
            eth_balance_wei: register_gauge(
                &registry,
                &mut families,
                CONTRACT_ETH_BALANCE_WEI,
                "Native balance in wei held by configured contracts.",
                &["chain", "chain_id", "name", "address"],
            )?,
            token_supply_raw: register_gauge(
                &registry,
                &mut families,
                CONTRACT_TOKEN_SUPPLY_RAW,
                "ERC-20 total supply in raw token units.",
                &["chain", "chain_id", "name", "address"],
            )?,
            token_supply_normalized: register_gauge(
                &registry,
                &mut families,
                CONTRACT_TOKEN_SUPPLY_NORMALIZED,
                "ERC-20 total supply normalized by token decimals.",
                &["chain", "chain_id", "name", "address"],
            )?,
            nft_total_supply: register_gauge(
                &registry,
                &mut families,
                CONTRACT_NFT_TOTAL_SUPPLY,
                "ERC-721 total supply where the contract exposes one.",
                &["chain", "chain_id", "name", "address"],
            )?,
            transfer_count_window: register_gauge(
                &registry,
                &mut families,
                CONTRACT_TRANSFER_COUNT_WINDOW,
                "Transfer events observed within the lookback window.",
                &["chain", "chain_id", "name", "address", "window_blocks"],
            )?,
            token_balance_raw: register_gauge(
                &registry,
                &mut families,
                ACCOUNT_TOKEN_BALANCE_RAW,
                "ERC-20 balance of configured accounts in raw token units.",
                token_account_labels,
            )?,
            token_balance: register_gauge(
                &registry,
                &mut families,
                ACCOUNT_TOKEN_BALANCE,
                "ERC-20 balance of configured accounts normalized by token decimals.",
                token_account_labels,
            )?,
            nft_balance: register_gauge(
                &registry,
                &mut families,
                ACCOUNT_NFT_BALANCE,
                "ERC-721 balance of configured accounts.",
                token_account_labels,
            )?,
            nft_owned: register_gauge(
                &registry,
                &mut families,
                ACCOUNT_NFT_OWNED,
                "Whether the configured account owns the token id.",
                &[
                    "chain",
                    "chain_id",
                    "token_name",
                    "token_address",
                    "account_name",
                    "account_address",
                    "token_id",
                ],
            )?,
        };

        let chain = ChainMetrics {
            latest_block: register_gauge(
                &registry,
                &mut families,
                CHAIN_LATEST_BLOCK,
                "Latest block number reported by the RPC endpoint.",
                chain_labels,
            )?,
            finalized_block: register_gauge(
                &registry,
                &mut families,
                CHAIN_FINALIZED_BLOCK,
                "Finalized block number reported by the RPC endpoint, 0 when unavailable.",
                chain_labels,
            )?,
            finalized_stale: register_gauge(
                &registry,
                &mut families,
                CHAIN_FINALIZED_STALE,
                "Whether the finalized block number could not be fetched this poll.",
                chain_labels,
            )?,
            poll_success: register_gauge(
                &registry,
                &mut families,
                POLL_SUCCESS,
                "Whether the most recent polling cycle succeeded.",
                chain_labels,
            )?,
            poll_timestamp: register_gauge(
                &registry,
                &mut families,
                POLL_TIMESTAMP_SECONDS,
                "Unix timestamp of the most recent successful polling cycle.",
                chain_labels,
            )?,
            consecutive_failures: register_gauge(
                &registry,
                &mut families,
                POLL_CONSECUTIVE_FAILURES,
                "Number of consecutive polling failures.",
                chain_labels,
            )?,
            backoff_seconds: register_gauge(
                &registry,
                &mut families,
                POLL_BACKOFF_SECONDS,
                "Backoff applied before the next poll.",
                chain_labels,
            )?,
            poll_duration: register_histogram(
                &registry,
                &mut families,
                POLL_DURATION_SECONDS,
                "Duration of polling cycles in seconds.",
                chain_labels,
                vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0],
            )?,
            rpc_call_duration: register_histogram(
                &registry,
                &mut families,
                RPC_CALL_DURATION_SECONDS,
                "Duration of RPC calls in seconds.",
                &["chain", "operation"],
                vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0],
            )?,
            rpc_call_errors: register_counter(
                &registry,
                &mut families,
                RPC_CALL_ERRORS_TOTAL,
                "RPC errors by category.",
                &["chain", "operation", "category"],
            )?,
            log_chunks: register_counter(
                &registry,
                &mut families,
                LOG_CHUNKS_TOTAL,
                "Log sub-queries issued while chunking large ranges.",
                &["chain", "contract"],
            )?,
            log_chunk_span: register_histogram(
                &registry,
                &mut families,
                LOG_CHUNK_SPAN_BLOCKS,
                "Block span of individual log sub-queries.",
                &["chain", "contract"],
                vec![1.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2000.0],
            )?,
        };

        Ok(Self {
            registry,
            exporter,
            chain,
            account,
            contract,
            families,
        })
    }

    /// The underlying registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Serialise every family into the Prometheus text exposition format.
    pub fn encode_text(&self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }

    /// Remove one series of `family` by labelset.
    pub fn remove_series(&self, family: &str, labels: &[String]) {
        if let Some(handle) = self.families.get(family) {
            let refs: Vec<&str> = labels.iter().map(String::as_str).collect();
            handle.remove(&refs);
        }
    }

    fn set_family_gauge(&self, family: &'static str, labels: &[&str], value: f64) {
        if let Some(FamilyHandle::Gauge(gauge)) = self.families.get(family) {
            gauge.with_label_values(labels).set(value);
        } else {
            debug_assert!(false, "{family} is not a registered gauge family");
        }
    }

    fn observe_family_histogram(&self, family: &'static str, labels: &[&str], value: f64) {
        if let Some(FamilyHandle::Histogram(histogram)) = self.families.get(family) {
            histogram.with_label_values(labels).observe(value);
        } else {
            debug_assert!(false, "{family} is not a registered histogram family");
        }
    }

    fn inc_family_counter(&self, family: &'static str, labels: &[&str]) {
        if let Some(FamilyHandle::Counter(counter)) = self.families.get(family) {
            counter.with_label_values(labels).inc();
        } else {
            debug_assert!(false, "{family} is not a registered counter family");
        }
    }
}

fn register_int_gauge(registry: &Registry, name: &'static str, help: &str) -> Result<IntGauge> {
    let gauge = IntGauge::new(name, help)?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

fn register_gauge(
    registry: &Registry,
    families: &mut HashMap<&'static str, FamilyHandle>,
    name: &'static str,
    help: &str,
    labels: &[&str],
) -> Result<GaugeVec> {
    let family = GaugeVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(family.clone()))?;
    families.insert(name, FamilyHandle::Gauge(family.clone()));
    Ok(family)
}

fn register_counter(
    registry: &Registry,
    families: &mut HashMap<&'static str, FamilyHandle>,
    name: &'static str,
    help: &str,
    labels: &[&str],
) -> Result<IntCounterVec> {
    let family = IntCounterVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(family.clone()))?;
    families.insert(name, FamilyHandle::Counter(family.clone()));
    Ok(family)
}

fn register_histogram(
    registry: &Registry,
    families: &mut HashMap<&'static str, FamilyHandle>,
    name: &'static str,
    help: &str,
    labels: &[&str],
    buckets: Vec<f64>,
) -> Result<HistogramVec> {
    let family = HistogramVec::new(HistogramOpts::new(name, help).buckets(buckets), labels)?;
    registry.register(Box::new(family.clone()))?;
    families.insert(name, FamilyHandle::Histogram(family.clone()));
    Ok(family)
}

/// Write-side view of the registry for a single chain.
///
/// Every write records the touched series in the chain's label cache, so
/// pruning the chain removes exactly what it published.
#[derive(Clone)]
pub struct ChainScope {
    bundle: Arc<MetricsBundle>,
    cache: Arc<Mutex<LabelCache>>,
    chain: String,
}

impl ChainScope {
    /// A scope writing `chain`'s series through `bundle` into `cache`.
    pub fn new(bundle: Arc<MetricsBundle>, cache: Arc<Mutex<LabelCache>>, chain: String) -> Self {
        Self {
            bundle,
            cache,
            chain,
        }
    }

    /// The chain name this scope writes for.
    pub fn chain(&self) -> &str {
        &self.chain
    }

    /// The registry bundle behind this scope.
    pub fn bundle(&self) -> &Arc<MetricsBundle> {
        &self.bundle
    }

    /// Open a new label-cache generation for the next collect cycle.
    pub fn begin_tick(&self) {
        self.lock_cache().begin_generation();
    }

    /// Set a gauge series and remember it in the label cache.
    pub fn set_gauge(&self, family: &'static str, labels: &[&str], value: f64) {
        self.bundle.set_family_gauge(family, labels, value);
        self.lock_cache().record(family, labels);
    }

    /// Observe into a histogram series and remember it in the label cache.
    pub fn observe_histogram(&self, family: &'static str, labels: &[&str], value: f64) {
        self.bundle.observe_family_histogram(family, labels, value);
        self.lock_cache().record(family, labels);
    }

    /// Increment a counter series and remember it in the label cache.
    pub fn inc_counter(&self, family: &'static str, labels: &[&str]) {
        self.bundle.inc_family_counter(family, labels);
        self.lock_cache().record(family, labels);
    }

    /// Record the duration of one RPC operation.
    pub fn observe_rpc_duration(&self, operation: &str, duration: Duration) {
        self.observe_histogram(
            RPC_CALL_DURATION_SECONDS,
            &[&self.chain, operation],
            duration.as_secs_f64(),
        );
    }

    /// Count one categorised RPC error.
    pub fn inc_rpc_error(&self, operation: &str, category: &str) {
        self.inc_counter(RPC_CALL_ERRORS_TOTAL, &[&self.chain, operation, category]);
    }

    /// Remove every series this chain has published.
    pub fn prune_all(&self) {
        let drained = self.lock_cache().drain();
        for (family, labels) in drained {
            self.bundle.remove_series(&family, &labels);
        }
    }

    /// Remove series that were published before the current generation
    /// but not touched within it.
    pub fn sweep_stale(&self) {
        let stale = self.lock_cache().sweep_stale();
        for (family, labels) in stale {
            self.bundle.remove_series(&family, &labels);
        }
    }

    /// Number of live series in the cache.
    pub fn cached_series(&self) -> usize {
        self.lock_cache().len()
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, LabelCache> {
        // A poisoned cache mutex means a panic mid-write; carrying on
        // with the inner state is strictly better than tearing down the
        // whole poll loop.
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
