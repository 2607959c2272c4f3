#![deny(unused_crate_dependencies)]
#![warn(missing_docs)]
#![warn(unused_extern_crates)]
#![warn(unused_imports)]

//! Per-chain metric collection.
//!
//! One [`collect_chain`] invocation is one poll tick: resolve the chain
//! id, record block heights, read account balances, classify and read
//! contracts, and count Transfer logs over the lookback window. The
//! steps run strictly in order because later steps depend on earlier
//! values, but an error in anything past the chain id marks the tick
//! failed without aborting the remaining steps.

mod chunker;
pub mod tokens;

pub use chunker::{fetch_logs, LOG_MAX_CHUNK_SIZE, LOG_SPLIT_MIN_BLOCK_SPAN};
pub use tokens::{TokenClassCache, TokenKind};

use client::{Error, ErrorCategory, EthRpc};
use config::{ChainSpec, ContractAccountSpec, ContractSpec};
use ethers::types::{BlockNumber, H256, U256};
use metrics::{
    ChainHealth, ChainScope, ACCOUNT_BALANCE_WEI, ACCOUNT_NFT_BALANCE, ACCOUNT_NFT_OWNED,
    ACCOUNT_TOKEN_BALANCE, ACCOUNT_TOKEN_BALANCE_RAW, CHAIN_FINALIZED_BLOCK,
    CHAIN_FINALIZED_STALE, CHAIN_LATEST_BLOCK, CONTRACT_ETH_BALANCE_WEI, CONTRACT_NFT_TOTAL_SUPPLY,
    CONTRACT_TOKEN_SUPPLY_NORMALIZED, CONTRACT_TOKEN_SUPPLY_RAW, CONTRACT_TRANSFER_COUNT_WINDOW,
};

use crate::tokens::{
    calldata, decode_address, decode_uint, format_address, u256_scaled_f64, u256_to_f64,
    SEL_BALANCE_OF, SEL_OWNER_OF, SEL_TOTAL_SUPPLY,
};

/// `keccak256("Transfer(address,address,uint256)")`, topic0 of both
/// ERC-20 and ERC-721 transfer events.
pub const TRANSFER_EVENT_TOPIC: H256 = H256([
    0xdd, 0xf2, 0x52, 0xad, 0x1b, 0xe2, 0xc8, 0x9b, 0x69, 0xc2, 0xb0, 0x68, 0xfc, 0x37, 0x8d,
    0xaa, 0x95, 0x2b, 0xa7, 0xf1, 0x63, 0xc4, 0xa1, 0x16, 0x28, 0xf5, 0x5a, 0x4d, 0xf5, 0x23,
    0xb3, 0xef,
]);

/// Verdict of one poll tick.
#[derive(Clone, Copy, Debug)]
pub struct CollectOutcome {
    /// Whether every step succeeded.
    pub success: bool,
    /// The chain id used for this tick's labels, if it could be
    /// resolved.
    pub chain_id: Option<u64>,
    /// Category of the last error observed during the tick.
    pub last_error: Option<ErrorCategory>,
}

struct TickState<'a> {
    spec: &'a ChainSpec,
    rpc: &'a dyn EthRpc,
    scope: &'a ChainScope,
    classes: &'a TokenClassCache,
    chain_id_label: String,
    failed: bool,
    last_error: Option<ErrorCategory>,
}

impl TickState<'_> {
    fn note_failure(&mut self, error: &Error) {
        self.failed = true;
        self.last_error = Some(error.category());
    }

    fn chain(&self) -> &str {
        &self.spec.name
    }
}

/// Run one collection tick for `spec`.
pub async fn collect_chain(
    spec: &ChainSpec,
    rpc: &dyn EthRpc,
    scope: &ChainScope,
    health: &ChainHealth,
    classes: &TokenClassCache,
) -> CollectOutcome {
    // Step 1: the chain id anchors every label this tick writes; failing
    // to resolve it is fatal for the whole tick.
    let chain_id = match rpc.chain_id().await {
        Ok(id) => id,
        Err(error) => {
            tracing::warn!(chain = %spec.name, %error, "failed to resolve chain id");
            return CollectOutcome {
                success: false,
                chain_id: health.chain_id(&spec.name),
                last_error: Some(error.category()),
            };
        }
    };

    if let Some(previous) = health.record_chain_id(&spec.name, chain_id) {
        tracing::info!(
            chain = %spec.name,
            previous,
            current = chain_id,
            "chain id changed, pruning stale series",
        );
        scope.prune_all();
    }

    scope.begin_tick();

    let mut tick = TickState {
        spec,
        rpc,
        scope,
        classes,
        chain_id_label: chain_id.to_string(),
        failed: false,
        last_error: None,
    };

    // Step 2: block heights.
    let latest = record_block_heights(&mut tick).await;

    // Step 3: native balances of configured accounts.
    record_account_balances(&mut tick).await;

    // Step 4: contracts.
    for contract in &spec.contracts {
        record_contract(&mut tick, contract, latest).await;
    }

    // Step 5 belongs to the poll loop: it records the tick verdict and,
    // on success, sweeps the series this tick stopped publishing.
    CollectOutcome {
        success: !tick.failed,
        chain_id: Some(chain_id),
        last_error: tick.last_error,
    }
}

async fn record_block_heights(tick: &mut TickState<'_>) -> Option<u64> {
    let chain = tick.spec.name.clone();
    let chain_id = tick.chain_id_label.clone();
    let labels = [chain.as_str(), chain_id.as_str()];

    let latest = match tick.rpc.block_number(BlockNumber::Latest).await {
        Ok(number) => {
            tick.scope
                .set_gauge(CHAIN_LATEST_BLOCK, &labels, number as f64);
            Some(number)
        }
        Err(error) => {
            tracing::warn!(chain = %tick.chain(), %error, "failed to fetch latest block");
            tick.note_failure(&error);
            None
        }
    };

    match tick.rpc.block_number(BlockNumber::Finalized).await {
        Ok(number) => {
            tick.scope
                .set_gauge(CHAIN_FINALIZED_BLOCK, &labels, number as f64);
            tick.scope.set_gauge(CHAIN_FINALIZED_STALE, &labels, 0.0);
        }
        Err(error) => {
            // Plenty of endpoints have no finalized tag; report the gap
            // instead of failing the tick.
            tracing::debug!(chain = %tick.chain(), %error, "no finalized block available");
            tick.scope.set_gauge(CHAIN_FINALIZED_BLOCK, &labels, 0.0);
            tick.scope.set_gauge(CHAIN_FINALIZED_STALE, &labels, 1.0);
        }
    }

    latest
}

async fn record_account_balances(tick: &mut TickState<'_>) {
    let spec = tick.spec;
    let chain_id = tick.chain_id_label.clone();

    for account in &spec.accounts {
        match tick.rpc.balance(account.address, Some(BlockNumber::Latest)).await {
            Ok(balance) => {
                let address = format_address(account.address);
                tick.scope.set_gauge(
                    ACCOUNT_BALANCE_WEI,
                    &[
                        spec.name.as_str(),
                        chain_id.as_str(),
                        account.name.as_str(),
                        address.as_str(),
                    ],
                    u256_to_f64(balance),
                );
            }
            Err(error) => {
                tracing::warn!(
                    chain = %spec.name,
                    account = %account.name,
                    %error,
                    "failed to fetch account balance",
                );
                tick.note_failure(&error);
            }
        }
    }
}

async fn record_contract(tick: &mut TickState<'_>, contract: &ContractSpec, latest: Option<u64>) {
    let address = format_address(contract.address);
    let chain = tick.spec.name.clone();
    let chain_id = tick.chain_id_label.clone();
    let labels = [
        chain.as_str(),
        chain_id.as_str(),
        contract.name.as_str(),
        address.as_str(),
    ];

    let kind = match tick
        .classes
        .classify(&tick.spec.name, contract.address, tick.rpc)
        .await
    {
        Ok(kind) => Some(kind),
        Err(error) => {
            tracing::warn!(
                chain = %tick.chain(),
                contract = %contract.name,
                %error,
                "failed to classify contract",
            );
            tick.note_failure(&error);
            None
        }
    };

    match tick
        .rpc
        .balance(contract.address, Some(BlockNumber::Latest))
        .await
    {
        Ok(balance) => {
            tick.scope
                .set_gauge(CONTRACT_ETH_BALANCE_WEI, &labels, u256_to_f64(balance));
        }
        Err(error) => {
            tracing::warn!(
                chain = %tick.chain(),
                contract = %contract.name,
                %error,
                "failed to fetch contract balance",
            );
            tick.note_failure(&error);
        }
    }

    match kind {
        Some(TokenKind::Erc20 { decimals }) => {
            let decimals = contract.decimals.unwrap_or(decimals);
            record_erc20_supply(tick, contract, &labels, decimals).await;

            for account in &contract.accounts {
                record_erc20_balance(tick, contract, account, decimals).await;
            }
        }
        Some(TokenKind::Erc721) => {
            record_erc721_supply(tick, contract, &labels).await;

            for account in &contract.accounts {
                record_erc721_account(tick, contract, account).await;
            }
        }
        Some(other) => {
            if !contract.accounts.is_empty()
                && tick
                    .classes
                    .first_report(&tick.spec.name, contract.address, "classification")
            {
                tracing::warn!(
                    chain = %tick.chain(),
                    contract = %contract.name,
                    kind = ?other,
                    "contract is not a recognised token, skipping token metrics",
                );
            }
        }
        None => {}
    }

    let lookback = tick.spec.lookback_for(contract);
    if lookback > 0 {
        if let Some(latest) = latest {
            record_transfer_window(tick, contract, &address, latest, lookback).await;
        }
    }
}

async fn record_erc20_supply(
    tick: &mut TickState<'_>,
    contract: &ContractSpec,
    labels: &[&str; 4],
    decimals: u8,
) {
    match tick
        .rpc
        .call(contract.address, calldata(SEL_TOTAL_SUPPLY, &[]), None)
        .await
    {
        Ok(data) => match decode_uint(&data) {
            Some(supply) => {
                tick.scope
                    .set_gauge(CONTRACT_TOKEN_SUPPLY_RAW, labels, u256_to_f64(supply));
                tick.scope.set_gauge(
                    CONTRACT_TOKEN_SUPPLY_NORMALIZED,
                    labels,
                    u256_scaled_f64(supply, decimals),
                );
            }
            None => {
                if tick
                    .classes
                    .first_report(&tick.spec.name, contract.address, "totalSupply")
                {
                    tracing::warn!(
                        chain = %tick.chain(),
                        contract = %contract.name,
                        "totalSupply returned undecodable data",
                    );
                }
            }
        },
        Err(error) if error.is_transient() => tick.note_failure(&error),
        Err(error) => {
            if tick
                .classes
                .first_report(&tick.spec.name, contract.address, "totalSupply")
            {
                tracing::warn!(
                    chain = %tick.chain(),
                    contract = %contract.name,
                    %error,
                    "totalSupply reverted",
                );
            }
        }
    }
}

async fn record_erc721_supply(
    tick: &mut TickState<'_>,
    contract: &ContractSpec,
    labels: &[&str; 4],
) {
    match tick
        .rpc
        .call(contract.address, calldata(SEL_TOTAL_SUPPLY, &[]), None)
        .await
    {
        Ok(data) => {
            if let Some(supply) = decode_uint(&data) {
                tick.scope
                    .set_gauge(CONTRACT_NFT_TOTAL_SUPPLY, labels, u256_to_f64(supply));
            }
        }
        Err(error) if error.is_transient() => tick.note_failure(&error),
        // `totalSupply` is an optional ERC-721 extension; omit the
        // series when absent.
        Err(_) => {}
    }
}

fn token_account_labels<'a>(
    tick: &'a TickState<'_>,
    contract: &'a ContractSpec,
    contract_address: &'a str,
    account: &'a ContractAccountSpec,
    account_address: &'a str,
) -> [&'a str; 6] {
    [
        tick.spec.name.as_str(),
        tick.chain_id_label.as_str(),
        contract.name.as_str(),
        contract_address,
        account.name.as_str(),
        account_address,
    ]
}

async fn record_erc20_balance(
    tick: &mut TickState<'_>,
    contract: &ContractSpec,
    account: &ContractAccountSpec,
    decimals: u8,
) {
    let data = calldata(SEL_BALANCE_OF, &[ethers::abi::Token::Address(account.address)]);
    let contract_address = format_address(contract.address);
    let account_address = format_address(account.address);

    match tick.rpc.call(contract.address, data, None).await {
        Ok(response) => {
            let Some(raw) = decode_uint(&response) else {
                if tick
                    .classes
                    .first_report(&tick.spec.name, contract.address, "balanceOf")
                {
                    tracing::warn!(
                        chain = %tick.chain(),
                        contract = %contract.name,
                        account = %account.name,
                        "balanceOf returned undecodable data",
                    );
                }
                return;
            };

            let labels = token_account_labels(
                tick,
                contract,
                &contract_address,
                account,
                &account_address,
            );
            tick.scope
                .set_gauge(ACCOUNT_TOKEN_BALANCE_RAW, &labels, u256_to_f64(raw));
            tick.scope.set_gauge(
                ACCOUNT_TOKEN_BALANCE,
                &labels,
                u256_scaled_f64(raw, decimals),
            );
        }
        Err(error) if error.is_transient() => tick.note_failure(&error),
        Err(error) => {
            if tick
                .classes
                .first_report(&tick.spec.name, contract.address, "balanceOf")
            {
                tracing::warn!(
                    chain = %tick.chain(),
                    contract = %contract.name,
                    account = %account.name,
                    %error,
                    "balanceOf reverted, publishing zero",
                );
            }

            let labels = token_account_labels(
                tick,
                contract,
                &contract_address,
                account,
                &account_address,
            );
            tick.scope.set_gauge(ACCOUNT_TOKEN_BALANCE_RAW, &labels, 0.0);
            tick.scope.set_gauge(ACCOUNT_TOKEN_BALANCE, &labels, 0.0);
        }
    }
}

async fn record_erc721_account(
    tick: &mut TickState<'_>,
    contract: &ContractSpec,
    account: &ContractAccountSpec,
) {
    let contract_address = format_address(contract.address);
    let account_address = format_address(account.address);

    let data = calldata(SEL_BALANCE_OF, &[ethers::abi::Token::Address(account.address)]);
    match tick.rpc.call(contract.address, data, None).await {
        Ok(response) => {
            if let Some(count) = decode_uint(&response) {
                let labels = token_account_labels(
                    tick,
                    contract,
                    &contract_address,
                    account,
                    &account_address,
                );
                tick.scope
                    .set_gauge(ACCOUNT_NFT_BALANCE, &labels, u256_to_f64(count));
            }
        }
        Err(error) if error.is_transient() => tick.note_failure(&error),
        Err(error) => {
            if tick
                .classes
                .first_report(&tick.spec.name, contract.address, "balanceOf")
            {
                tracing::warn!(
                    chain = %tick.chain(),
                    contract = %contract.name,
                    account = %account.name,
                    %error,
                    "balanceOf reverted on ERC-721",
                );
            }
        }
    }

    let Some(token_ids) = &account.token_ids else {
        return;
    };

    for token_id in token_ids {
        record_erc721_ownership(
            tick,
            contract,
            account,
            &contract_address,
            &account_address,
            *token_id,
        )
        .await;
    }
}

async fn record_erc721_ownership(
    tick: &mut TickState<'_>,
    contract: &ContractSpec,
    account: &ContractAccountSpec,
    contract_address: &str,
    account_address: &str,
    token_id: U256,
) {
    let token_id_label = token_id.to_string();
    let chain = tick.spec.name.clone();
    let chain_id = tick.chain_id_label.clone();
    let labels = [
        chain.as_str(),
        chain_id.as_str(),
        contract.name.as_str(),
        contract_address,
        account.name.as_str(),
        account_address,
        token_id_label.as_str(),
    ];

    let data = calldata(SEL_OWNER_OF, &[ethers::abi::Token::Uint(token_id)]);
    match tick.rpc.call(contract.address, data, None).await {
        Ok(response) => {
            let owned = decode_address(&response) == Some(account.address);
            tick.scope
                .set_gauge(ACCOUNT_NFT_OWNED, &labels, if owned { 1.0 } else { 0.0 });
        }
        Err(error) if error.is_transient() => tick.note_failure(&error),
        // `ownerOf` reverts for a token id that does not exist; nobody
        // owns it.
        Err(_) => {
            tick.scope.set_gauge(ACCOUNT_NFT_OWNED, &labels, 0.0);
        }
    }
}

async fn record_transfer_window(
    tick: &mut TickState<'_>,
    contract: &ContractSpec,
    contract_address: &str,
    latest: u64,
    lookback: u64,
) {
    let from = latest.saturating_sub(lookback);

    match chunker::fetch_logs(
        tick.rpc,
        tick.scope,
        contract.address,
        TRANSFER_EVENT_TOPIC,
        from,
        latest,
    )
    .await
    {
        Ok(logs) => {
            let window = lookback.to_string();
            tick.scope.set_gauge(
                CONTRACT_TRANSFER_COUNT_WINDOW,
                &[
                    tick.spec.name.as_str(),
                    tick.chain_id_label.as_str(),
                    contract.name.as_str(),
                    contract_address,
                    window.as_str(),
                ],
                logs.len() as f64,
            );
        }
        Err(error) => {
            tracing::warn!(
                chain = %tick.chain(),
                contract = %contract.name,
                %error,
                "failed to count transfer logs",
            );
            tick.note_failure(&error);
        }
    }
}

#[cfg(test)]
mod tests;
