#![deny(unused_crate_dependencies)]
#![warn(missing_docs)]
#![warn(unused_extern_crates)]
#![warn(unused_imports)]

//! Lifecycle of the per-chain poll loops.
//!
//! The [`PollerManager`] owns one cooperative loop per configured chain,
//! each with its own cancellation token, spec channel, and label cache.
//! Reloads are computed as remove / add / replace-in-place sets and
//! applied without disturbing unaffected chains.

mod manager;
mod poll_loop;
mod reload;

pub use manager::{PollerContext, PollerManager, RpcFactory};
pub use reload::{diff, ReloadError, ReloadPlan, ReloadSummary, Reloader};

use std::{sync::Arc, time::Duration};

use client::{ConnectionPool, EthRpc, RpcClient};
use config::ChainSpec;
use metrics::ChainScope;

#[cfg(test)]
use ethers as _;
#[cfg(test)]
use pretty_assertions as _;

/// The production RPC factory: one pooled HTTP transport per endpoint,
/// wrapped in a retrying [`RpcClient`] per chain.
pub fn http_rpc_factory(pool: Arc<ConnectionPool>, request_timeout: Duration) -> RpcFactory {
    Arc::new(move |spec: &ChainSpec, scope: ChainScope| {
        Arc::new(RpcClient::new(
            pool.provider(&spec.rpc_url),
            scope,
            request_timeout,
        )) as Arc<dyn EthRpc>
    })
}
