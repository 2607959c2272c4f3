//! Scriptable in-memory [`EthRpc`] implementation for tests.

use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
};

use async_trait::async_trait;
use ethers::types::{Address, BlockNumber, Bytes, Log, H256, U256};

use crate::{Error, EthRpc, Result};

type CallKey = (Address, [u8; 4]);
type LogsHandler = Box<dyn Fn(u64, u64, Address) -> Result<Vec<Log>> + Send + Sync>;

#[derive(Default)]
struct State {
    chain_id: u64,
    latest_block: u64,
    finalized_block: Option<u64>,
    balances: HashMap<Address, U256>,
    codes: HashMap<Address, Bytes>,
    calls: HashMap<CallKey, Result<Bytes>>,
    scripted_failures: HashMap<&'static str, VecDeque<Error>>,
    invocations: Vec<String>,
}

/// An [`EthRpc`] whose responses are configured up front.
///
/// Unconfigured balances and codes default to zero and empty bytes;
/// unconfigured calls revert, which models probing a selector the
/// contract does not implement. Failures can be scripted per operation
/// and are consumed in order.
pub struct MockRpc {
    state: Mutex<State>,
    logs: Mutex<Option<LogsHandler>>,
}

impl MockRpc {
    /// A mock reporting `chain_id`.
    pub fn new(chain_id: u64) -> Self {
        Self {
            state: Mutex::new(State {
                chain_id,
                ..State::default()
            }),
            logs: Mutex::new(None),
        }
    }

    /// Change the reported chain id.
    pub fn set_chain_id(&self, chain_id: u64) {
        self.lock().chain_id = chain_id;
    }

    /// Set the latest block height.
    pub fn set_latest_block(&self, number: u64) {
        self.lock().latest_block = number;
    }

    /// Set or clear the finalized block height.
    pub fn set_finalized_block(&self, number: Option<u64>) {
        self.lock().finalized_block = number;
    }

    /// Set the native balance of `address`.
    pub fn set_balance(&self, address: Address, balance: U256) {
        self.lock().balances.insert(address, balance);
    }

    /// Set the bytecode of `address`.
    pub fn set_code(&self, address: Address, code: Bytes) {
        self.lock().codes.insert(address, code);
    }

    /// Script the response of `eth_call` for one (address, selector).
    pub fn set_call(&self, address: Address, selector: [u8; 4], response: Result<Bytes>) {
        self.lock().calls.insert((address, selector), response);
    }

    /// Script the log responses; the handler receives (from, to, address).
    pub fn set_logs(&self, handler: impl Fn(u64, u64, Address) -> Result<Vec<Log>> + Send + Sync + 'static) {
        *self.logs.lock().unwrap() = Some(Box::new(handler));
    }

    /// Queue a failure returned by the next invocation of `operation`.
    pub fn fail_next(&self, operation: &'static str, error: Error) {
        self.lock()
            .scripted_failures
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    /// Every operation invoked so far, in order.
    pub fn invocations(&self) -> Vec<String> {
        self.lock().invocations.clone()
    }

    /// How many times `operation` was invoked.
    pub fn invocation_count(&self, operation: &str) -> usize {
        self.lock()
            .invocations
            .iter()
            .filter(|entry| entry.starts_with(operation))
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn record_and_check(&self, operation: &'static str, detail: String) -> Result<()> {
        let mut state = self.lock();
        state.invocations.push(detail);
        if let Some(queue) = state.scripted_failures.get_mut(operation) {
            if let Some(error) = queue.pop_front() {
                return Err(error);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EthRpc for MockRpc {
    async fn chain_id(&self) -> Result<u64> {
        self.record_and_check("chain_id", "chain_id".to_string())?;
        Ok(self.lock().chain_id)
    }

    async fn block_number(&self, block: BlockNumber) -> Result<u64> {
        self.record_and_check("block_number", format!("block_number({block:?})"))?;

        let state = self.lock();
        match block {
            BlockNumber::Latest => Ok(state.latest_block),
            BlockNumber::Finalized => state
                .finalized_block
                .ok_or_else(|| Error::Value("endpoint has no finalized tag".to_string())),
            other => Err(Error::Value(format!("unsupported block tag {other:?}"))),
        }
    }

    async fn balance(&self, address: Address, _block: Option<BlockNumber>) -> Result<U256> {
        self.record_and_check("balance", format!("balance({address:#x})"))?;
        Ok(self
            .lock()
            .balances
            .get(&address)
            .copied()
            .unwrap_or_default())
    }

    async fn code(&self, address: Address, _block: Option<BlockNumber>) -> Result<Bytes> {
        self.record_and_check("code", format!("code({address:#x})"))?;
        Ok(self.lock().codes.get(&address).cloned().unwrap_or_default())
    }

    async fn call(&self, to: Address, data: Bytes, _block: Option<BlockNumber>) -> Result<Bytes> {
        let selector: [u8; 4] = data
            .get(..4)
            .and_then(|bytes| bytes.try_into().ok())
            .unwrap_or_default();

        self.record_and_check("call", format!("call({to:#x}, 0x{})", hex(&selector)))?;

        self.lock()
            .calls
            .get(&(to, selector))
            .cloned()
            .unwrap_or_else(|| {
                Err(Error::Rpc {
                    code: 3,
                    message: "execution reverted".to_string(),
                })
            })
    }

    async fn logs(&self, from: u64, to: u64, address: Address, _topic0: H256) -> Result<Vec<Log>> {
        self.record_and_check("logs", format!("logs({from},{to})"))?;

        let handler = self.logs.lock().unwrap();
        match handler.as_ref() {
            Some(handler) => handler(from, to, address),
            None => Ok(Vec::new()),
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
