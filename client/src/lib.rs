#![deny(unused_crate_dependencies)]
#![warn(missing_docs)]
#![warn(unused_extern_crates)]
#![warn(unused_imports)]

//! Typed, retrying JSON-RPC client for EVM endpoints.
//!
//! [`RpcClient`] wraps an [`ethers`] HTTP provider with the narrow
//! capability set the collector needs, categorises every failure at the
//! boundary, retries transient errors with exponential backoff, and
//! records per-call latency and error metrics.

mod error;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
mod pool;

pub use error::{Error, ErrorCategory, Result};
pub use pool::ConnectionPool;

use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use ethers::{
    providers::{Http, Middleware, Provider, ProviderError},
    types::{
        transaction::eip2718::TypedTransaction, Address, BlockNumber, Bytes, Filter, Log,
        TransactionRequest, H256, U256,
    },
};
use tokio::time::Instant;

use metrics::ChainScope;

/// Retry budget per RPC call.
pub const RPC_MAX_ATTEMPTS: u32 = 3;
/// Backoff before the first retry.
pub const RPC_INITIAL_BACKOFF: Duration = Duration::from_millis(500);
/// Ceiling for the per-call retry backoff.
pub const RPC_MAX_BACKOFF: Duration = Duration::from_secs(5);

/// The capability set the collector consumes.
///
/// Any implementation providing these operations with the stated error
/// categorisation is a valid collaborator, including in-memory fakes.
#[async_trait]
pub trait EthRpc: Send + Sync {
    /// `eth_chainId`.
    async fn chain_id(&self) -> Result<u64>;

    /// Height of the given block tag (`latest`, `finalized`, ...).
    async fn block_number(&self, block: BlockNumber) -> Result<u64>;

    /// Native balance of `address`.
    async fn balance(&self, address: Address, block: Option<BlockNumber>) -> Result<U256>;

    /// Deployed bytecode at `address`.
    async fn code(&self, address: Address, block: Option<BlockNumber>) -> Result<Bytes>;

    /// `eth_call` with raw calldata.
    async fn call(&self, to: Address, data: Bytes, block: Option<BlockNumber>) -> Result<Bytes>;

    /// `eth_getLogs` filtered on one address and topic0 over a block
    /// range.
    async fn logs(&self, from: u64, to: u64, address: Address, topic0: H256) -> Result<Vec<Log>>;
}

/// Retrying RPC client bound to one chain.
pub struct RpcClient {
    provider: Arc<Provider<Http>>,
    scope: ChainScope,
    request_timeout: Duration,
}

impl RpcClient {
    /// A client speaking to `provider`, recording metrics through
    /// `scope`.
    pub fn new(provider: Arc<Provider<Http>>, scope: ChainScope, request_timeout: Duration) -> Self {
        Self {
            provider,
            scope,
            request_timeout,
        }
    }

    async fn with_retries<T, F, Fut>(&self, operation: &'static str, request: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = std::result::Result<T, ProviderError>>,
    {
        let started = Instant::now();
        let mut delay = RPC_INITIAL_BACKOFF;
        let mut attempt = 0;

        loop {
            attempt += 1;

            match request().await {
                Ok(value) => {
                    self.scope.observe_rpc_duration(operation, started.elapsed());
                    return Ok(value);
                }
                Err(provider_error) => {
                    let error = Error::from_provider(provider_error, self.request_timeout);
                    self.scope
                        .inc_rpc_error(operation, error.category().as_str());

                    if attempt >= RPC_MAX_ATTEMPTS || !error.is_transient() {
                        tracing::warn!(
                            chain = %self.scope.chain(),
                            operation,
                            attempt,
                            error = %error,
                            "rpc operation failed",
                        );
                        return Err(error);
                    }

                    tracing::debug!(
                        chain = %self.scope.chain(),
                        operation,
                        attempt,
                        error = %error,
                        "retrying rpc operation",
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(RPC_MAX_BACKOFF);
                }
            }
        }
    }
}

#[async_trait]
impl EthRpc for RpcClient {
    async fn chain_id(&self) -> Result<u64> {
        let id = self
            .with_retries("chain_id", || self.provider.get_chainid())
            .await?;
        Ok(id.as_u64())
    }

    async fn block_number(&self, block: BlockNumber) -> Result<u64> {
        if block == BlockNumber::Latest {
            let number = self
                .with_retries("block_number", || self.provider.get_block_number())
                .await?;
            return Ok(number.as_u64());
        }

        let fetched = self
            .with_retries("block_number", || self.provider.get_block(block))
            .await?;

        fetched
            .and_then(|b| b.number)
            .map(|number| number.as_u64())
            .ok_or_else(|| Error::Value(format!("endpoint returned no {block:?} block")))
    }

    async fn balance(&self, address: Address, block: Option<BlockNumber>) -> Result<U256> {
        self.with_retries("balance", || {
            self.provider.get_balance(address, block.map(Into::into))
        })
        .await
    }

    async fn code(&self, address: Address, block: Option<BlockNumber>) -> Result<Bytes> {
        self.with_retries("code", || {
            self.provider.get_code(address, block.map(Into::into))
        })
        .await
    }

    async fn call(&self, to: Address, data: Bytes, block: Option<BlockNumber>) -> Result<Bytes> {
        let tx: TypedTransaction = TransactionRequest::new().to(to).data(data).into();

        self.with_retries("call", || self.provider.call(&tx, block.map(Into::into)))
            .await
    }

    async fn logs(&self, from: u64, to: u64, address: Address, topic0: H256) -> Result<Vec<Log>> {
        let filter = Filter::new()
            .from_block(from)
            .to_block(to)
            .address(address)
            .topic0(topic0);

        self.with_retries("logs", || self.provider.get_logs(&filter))
            .await
    }
}
