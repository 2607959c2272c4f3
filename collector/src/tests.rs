use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use client::mock::MockRpc;
use config::{AccountSpec, ChainSpec, ContractAccountSpec, ContractSpec};
use ethers::types::{Address, Bytes, H160, U256};
use metrics::{ChainHealth, ChainScope, LabelCache, MetricsBundle};
use pretty_assertions::assert_eq;

use crate::tokens::{encode_uint, SEL_BALANCE_OF, SEL_DECIMALS, SEL_TOTAL_SUPPLY};
use crate::{collect_chain, TokenClassCache};

fn addr(byte: u8) -> Address {
    H160::repeat_byte(byte)
}

fn chain_spec() -> ChainSpec {
    ChainSpec {
        name: "c1".to_string(),
        rpc_url: "https://rpc.example.com".parse().unwrap(),
        poll_interval: Some(Duration::from_secs(1)),
        transfer_lookback_blocks: 0,
        accounts: Vec::new(),
        contracts: Vec::new(),
        enabled: true,
    }
}

fn account(name: &str, address: Address) -> AccountSpec {
    AccountSpec {
        name: name.to_string(),
        address,
        enabled: true,
    }
}

fn contract(name: &str, address: Address) -> ContractSpec {
    ContractSpec {
        name: name.to_string(),
        address,
        decimals: None,
        transfer_lookback_blocks: None,
        accounts: Vec::new(),
        enabled: true,
    }
}

struct Harness {
    bundle: Arc<MetricsBundle>,
    scope: ChainScope,
    health: ChainHealth,
    classes: TokenClassCache,
}

impl Harness {
    fn new(chain: &str) -> Self {
        let bundle = Arc::new(MetricsBundle::new().unwrap());
        let scope = ChainScope::new(
            bundle.clone(),
            Arc::new(Mutex::new(LabelCache::new())),
            chain.to_string(),
        );
        let health = ChainHealth::new(Duration::from_secs(300));
        health.register_chain(chain, Duration::from_secs(1));

        Self {
            bundle,
            scope,
            health,
            classes: TokenClassCache::new(),
        }
    }

    fn text(&self) -> String {
        String::from_utf8(self.bundle.encode_text().unwrap()).unwrap()
    }
}

#[tokio::test]
async fn publishes_account_balance() {
    let rpc = MockRpc::new(1);
    rpc.set_latest_block(100);
    rpc.set_finalized_block(Some(90));
    rpc.set_balance(addr(0xaa), U256::from(7));

    let mut spec = chain_spec();
    spec.accounts.push(account("A", addr(0xaa)));

    let harness = Harness::new("c1");
    let outcome = collect_chain(&spec, &rpc, &harness.scope, &harness.health, &harness.classes).await;

    assert!(outcome.success);
    assert_eq!(outcome.chain_id, Some(1));

    let value = harness
        .bundle
        .account
        .balance_wei
        .get_metric_with_label_values(&[
            "c1",
            "1",
            "A",
            "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
        ])
        .unwrap()
        .get();
    assert_eq!(value, 7.0);

    let latest = harness
        .bundle
        .chain
        .latest_block
        .get_metric_with_label_values(&["c1", "1"])
        .unwrap()
        .get();
    assert_eq!(latest, 100.0);
}

#[tokio::test]
async fn missing_finalized_tag_is_non_fatal() {
    let rpc = MockRpc::new(1);
    rpc.set_latest_block(100);
    rpc.set_finalized_block(None);

    let spec = chain_spec();
    let harness = Harness::new("c1");
    let outcome = collect_chain(&spec, &rpc, &harness.scope, &harness.health, &harness.classes).await;

    assert!(outcome.success);

    let stale = harness
        .bundle
        .chain
        .finalized_stale
        .get_metric_with_label_values(&["c1", "1"])
        .unwrap()
        .get();
    assert_eq!(stale, 1.0);

    let finalized = harness
        .bundle
        .chain
        .finalized_block
        .get_metric_with_label_values(&["c1", "1"])
        .unwrap()
        .get();
    assert_eq!(finalized, 0.0);
}

#[tokio::test]
async fn chain_id_failure_is_fatal_for_the_tick() {
    let rpc = MockRpc::new(1);
    rpc.fail_next("chain_id", client::Error::Connection("refused".to_string()));

    let spec = chain_spec();
    let harness = Harness::new("c1");
    let outcome = collect_chain(&spec, &rpc, &harness.scope, &harness.health, &harness.classes).await;

    assert!(!outcome.success);
    assert_eq!(outcome.chain_id, None);
    assert_eq!(outcome.last_error, Some(client::ErrorCategory::Connection));
    // The tick aborted before any RPC beyond the chain id.
    assert_eq!(rpc.invocation_count("block_number"), 0);
}

#[tokio::test]
async fn account_error_marks_tick_failed_but_later_steps_run() {
    let rpc = MockRpc::new(1);
    rpc.set_latest_block(100);
    rpc.set_finalized_block(Some(90));
    rpc.fail_next("balance", client::Error::Timeout(Duration::from_secs(10)));
    rpc.set_balance(addr(0xbb), U256::from(9));

    let mut spec = chain_spec();
    spec.accounts.push(account("broken", addr(0xaa)));
    spec.accounts.push(account("ok", addr(0xbb)));

    let harness = Harness::new("c1");
    let outcome = collect_chain(&spec, &rpc, &harness.scope, &harness.health, &harness.classes).await;

    assert!(!outcome.success);
    assert_eq!(outcome.last_error, Some(client::ErrorCategory::Timeout));

    // The second account was still collected.
    let value = harness
        .bundle
        .account
        .balance_wei
        .get_metric_with_label_values(&[
            "c1",
            "1",
            "ok",
            "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb",
        ])
        .unwrap()
        .get();
    assert_eq!(value, 9.0);
}

#[tokio::test]
async fn erc20_contract_publishes_supply_and_balances() {
    let token = addr(0x20);
    let holder = addr(0xcc);

    let rpc = MockRpc::new(1);
    rpc.set_latest_block(100);
    rpc.set_finalized_block(Some(90));
    rpc.set_code(token, Bytes::from(vec![0x60, 0x80]));
    rpc.set_call(token, SEL_DECIMALS, Ok(encode_uint(U256::from(6))));
    rpc.set_call(
        token,
        SEL_TOTAL_SUPPLY,
        Ok(encode_uint(U256::from(1_500_000u64))),
    );
    rpc.set_call(token, SEL_BALANCE_OF, Ok(encode_uint(U256::from(3_000_000u64))));
    rpc.set_balance(token, U256::from(42));

    let mut spec = chain_spec();
    let mut erc20 = contract("usdc", token);
    erc20.accounts.push(ContractAccountSpec {
        name: "vault".to_string(),
        address: holder,
        token_ids: None,
        enabled: true,
    });
    spec.contracts.push(erc20);

    let harness = Harness::new("c1");
    let outcome = collect_chain(&spec, &rpc, &harness.scope, &harness.health, &harness.classes).await;

    assert!(outcome.success);

    let token_label = "0x2020202020202020202020202020202020202020";
    let contract_labels = ["c1", "1", "usdc", token_label];

    let raw = harness
        .bundle
        .contract
        .token_supply_raw
        .get_metric_with_label_values(&contract_labels)
        .unwrap()
        .get();
    assert_eq!(raw, 1_500_000.0);

    let normalized = harness
        .bundle
        .contract
        .token_supply_normalized
        .get_metric_with_label_values(&contract_labels)
        .unwrap()
        .get();
    assert_eq!(normalized, 1.5);

    let eth = harness
        .bundle
        .contract
        .eth_balance_wei
        .get_metric_with_label_values(&contract_labels)
        .unwrap()
        .get();
    assert_eq!(eth, 42.0);

    let holder_label = "0xcccccccccccccccccccccccccccccccccccccccc";
    let balance = harness
        .bundle
        .contract
        .token_balance
        .get_metric_with_label_values(&["c1", "1", "usdc", token_label, "vault", holder_label])
        .unwrap()
        .get();
    assert_eq!(balance, 3.0);
}

#[tokio::test]
async fn zero_lookback_issues_no_log_queries() {
    let token = addr(0x20);

    let rpc = MockRpc::new(1);
    rpc.set_latest_block(100);
    rpc.set_finalized_block(Some(90));
    rpc.set_code(token, Bytes::from(vec![0x60]));
    rpc.set_call(token, SEL_DECIMALS, Ok(encode_uint(U256::from(18))));
    rpc.set_call(token, SEL_TOTAL_SUPPLY, Ok(encode_uint(U256::one())));

    let mut spec = chain_spec();
    spec.contracts.push(contract("t", token));

    let harness = Harness::new("c1");
    let outcome = collect_chain(&spec, &rpc, &harness.scope, &harness.health, &harness.classes).await;

    assert!(outcome.success);
    assert_eq!(rpc.invocation_count("logs"), 0);
}

#[tokio::test]
async fn transfer_window_counts_logs() {
    let token = addr(0x20);

    let rpc = MockRpc::new(1);
    rpc.set_latest_block(1_000);
    rpc.set_finalized_block(Some(990));
    rpc.set_code(token, Bytes::from(vec![0x60]));
    rpc.set_call(token, SEL_DECIMALS, Ok(encode_uint(U256::from(18))));
    rpc.set_call(token, SEL_TOTAL_SUPPLY, Ok(encode_uint(U256::one())));
    rpc.set_logs(|from, to, _| {
        assert_eq!((from, to), (900, 1_000));
        Ok(vec![Default::default(), Default::default(), Default::default()])
    });

    let mut spec = chain_spec();
    spec.transfer_lookback_blocks = 100;
    spec.contracts.push(contract("t", token));

    let harness = Harness::new("c1");
    let outcome = collect_chain(&spec, &rpc, &harness.scope, &harness.health, &harness.classes).await;

    assert!(outcome.success);

    let count = harness
        .bundle
        .contract
        .transfer_count_window
        .get_metric_with_label_values(&[
            "c1",
            "1",
            "t",
            "0x2020202020202020202020202020202020202020",
            "100",
        ])
        .unwrap()
        .get();
    assert_eq!(count, 3.0);
}

#[tokio::test]
async fn chain_id_change_replaces_every_series() {
    let rpc = MockRpc::new(1);
    rpc.set_latest_block(100);
    rpc.set_finalized_block(Some(90));
    rpc.set_balance(addr(0xaa), U256::from(7));

    let mut spec = chain_spec();
    spec.accounts.push(account("A", addr(0xaa)));

    let harness = Harness::new("c1");
    collect_chain(&spec, &rpc, &harness.scope, &harness.health, &harness.classes).await;
    assert!(harness.text().contains(r#"chain_id="1""#));

    rpc.set_chain_id(137);
    let outcome = collect_chain(&spec, &rpc, &harness.scope, &harness.health, &harness.classes).await;
    assert!(outcome.success);

    let payload = harness.text();
    assert!(payload.contains(r#"chain_id="137""#));
    assert!(!payload.contains(r#"chain_id="1""#), "old chain id must be pruned: {payload}");
}

#[tokio::test]
async fn removed_account_is_swept_on_next_success() {
    let rpc = MockRpc::new(1);
    rpc.set_latest_block(100);
    rpc.set_finalized_block(Some(90));
    rpc.set_balance(addr(0xaa), U256::from(1));
    rpc.set_balance(addr(0xbb), U256::from(2));

    let mut spec = chain_spec();
    spec.accounts.push(account("keep", addr(0xaa)));
    spec.accounts.push(account("drop", addr(0xbb)));

    let harness = Harness::new("c1");
    let outcome =
        collect_chain(&spec, &rpc, &harness.scope, &harness.health, &harness.classes).await;
    assert!(outcome.success);
    harness.scope.sweep_stale();
    assert!(harness.text().contains(r#"name="drop""#));

    spec.accounts.pop();
    let outcome =
        collect_chain(&spec, &rpc, &harness.scope, &harness.health, &harness.classes).await;
    assert!(outcome.success);
    harness.scope.sweep_stale();

    let payload = harness.text();
    assert!(payload.contains(r#"name="keep""#));
    assert!(!payload.contains(r#"name="drop""#));
}
