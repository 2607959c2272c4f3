//! Token contract classification and ABI helpers.

use std::{
    collections::{HashMap, HashSet},
    sync::Mutex,
};

use client::{EthRpc, Result};
use ethers::{
    abi::{self, ParamType, Token},
    types::{Address, Bytes, U256},
};

/// `decimals()`.
pub const SEL_DECIMALS: [u8; 4] = [0x31, 0x3c, 0xe5, 0x67];
/// `totalSupply()`.
pub const SEL_TOTAL_SUPPLY: [u8; 4] = [0x18, 0x16, 0x0d, 0xdd];
/// `balanceOf(address)`.
pub const SEL_BALANCE_OF: [u8; 4] = [0x70, 0xa0, 0x82, 0x31];
/// `ownerOf(uint256)`.
pub const SEL_OWNER_OF: [u8; 4] = [0x63, 0x52, 0x21, 0x1e];
/// `supportsInterface(bytes4)`.
pub const SEL_SUPPORTS_INTERFACE: [u8; 4] = [0x01, 0xff, 0xc9, 0xa7];
/// ERC-165 interface id of ERC-721.
pub const ERC721_INTERFACE_ID: [u8; 4] = [0x80, 0xac, 0x58, 0xcd];

/// Decimals assumed when an ERC-20 reverts on `decimals()`.
pub const DEFAULT_ERC20_DECIMALS: u8 = 18;

/// What a configured contract turned out to be.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenKind {
    /// Fungible token with the given decimals.
    Erc20 {
        /// Value of `decimals()`, or the 18 fallback.
        decimals: u8,
    },
    /// Non-fungible token.
    Erc721,
    /// The address carries no bytecode.
    NotAContract,
    /// Bytecode exists but none of the standard probes matched.
    Unknown,
}

/// Process-lifetime cache of contract classifications, plus the
/// once-per-(chain, contract, selector) suppression set for permanent
/// value errors.
#[derive(Debug, Default)]
pub struct TokenClassCache {
    kinds: Mutex<HashMap<(String, Address), TokenKind>>,
    logged: Mutex<HashSet<(String, Address, &'static str)>>,
}

impl TokenClassCache {
    /// An empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify `address` on `chain`, probing the standard selectors on
    /// first sight and serving from memory afterwards.
    ///
    /// Transient transport errors propagate without caching, so a flaky
    /// endpoint cannot pin a wrong classification.
    pub async fn classify(
        &self,
        chain: &str,
        address: Address,
        rpc: &dyn EthRpc,
    ) -> Result<TokenKind> {
        if let Some(kind) = self.cached(chain, address) {
            return Ok(kind);
        }

        let code = rpc.code(address, None).await?;

        let kind = if code.0.is_empty() {
            TokenKind::NotAContract
        } else {
            self.probe_kind(address, rpc).await?
        };

        tracing::debug!(chain, address = %format_address(address), ?kind, "classified contract");

        self.kinds
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert((chain.to_string(), address), kind);

        Ok(kind)
    }

    async fn probe_kind(&self, address: Address, rpc: &dyn EthRpc) -> Result<TokenKind> {
        if let Some(data) = probe(rpc, address, calldata(SEL_DECIMALS, &[])).await? {
            if let Some(decimals) = decode_uint(&data).filter(|d| *d <= U256::from(u8::MAX)) {
                return Ok(TokenKind::Erc20 {
                    decimals: decimals.as_u32() as u8,
                });
            }
        }

        let erc721_probe = calldata(
            SEL_SUPPORTS_INTERFACE,
            &[Token::FixedBytes(ERC721_INTERFACE_ID.to_vec())],
        );
        if let Some(data) = probe(rpc, address, erc721_probe).await? {
            if decode_bool(&data) == Some(true) {
                return Ok(TokenKind::Erc721);
            }
        }

        if let Some(data) = probe(rpc, address, calldata(SEL_TOTAL_SUPPLY, &[])).await? {
            if decode_uint(&data).is_some() {
                return Ok(TokenKind::Erc20 {
                    decimals: DEFAULT_ERC20_DECIMALS,
                });
            }
        }

        Ok(TokenKind::Unknown)
    }

    fn cached(&self, chain: &str, address: Address) -> Option<TokenKind> {
        self.kinds
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&(chain.to_string(), address))
            .copied()
    }

    /// Whether a permanent error on (chain, contract, selector) has
    /// already been reported. The first caller gets `true` and should
    /// log; later callers stay silent.
    pub fn first_report(&self, chain: &str, address: Address, selector: &'static str) -> bool {
        self.logged
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert((chain.to_string(), address, selector))
    }
}

/// Run a selector probe: permanent errors mean "not supported", while
/// transient errors propagate.
async fn probe(rpc: &dyn EthRpc, address: Address, data: Bytes) -> Result<Option<Bytes>> {
    match rpc.call(address, data, None).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(error) if error.is_transient() => Err(error),
        Err(_) => Ok(None),
    }
}

/// Build calldata from a four-byte selector and ABI-encoded arguments.
pub fn calldata(selector: [u8; 4], args: &[Token]) -> Bytes {
    let mut data = selector.to_vec();
    data.extend(abi::encode(args));
    data.into()
}

/// Decode a single `uint256` return value.
pub fn decode_uint(data: &Bytes) -> Option<U256> {
    match abi::decode(&[ParamType::Uint(256)], data).ok()?.pop()? {
        Token::Uint(value) => Some(value),
        _ => None,
    }
}

/// Decode a single `bool` return value.
pub fn decode_bool(data: &Bytes) -> Option<bool> {
    match abi::decode(&[ParamType::Bool], data).ok()?.pop()? {
        Token::Bool(value) => Some(value),
        _ => None,
    }
}

/// Decode a single `address` return value.
pub fn decode_address(data: &Bytes) -> Option<Address> {
    match abi::decode(&[ParamType::Address], data).ok()?.pop()? {
        Token::Address(value) => Some(value),
        _ => None,
    }
}

/// Encode a `uint256` as a 32-byte ABI word.
pub fn encode_uint(value: U256) -> Bytes {
    abi::encode(&[Token::Uint(value)]).into()
}

/// Full lowercase `0x…` rendering of an address for metric labels.
pub fn format_address(address: Address) -> String {
    format!("{address:#x}")
}

/// Lossy conversion of a 256-bit value for gauge display.
pub fn u256_to_f64(value: U256) -> f64 {
    u256_scaled_f64(value, 0)
}

/// Convert a scaled 256-bit integer into the corresponding float value.
pub fn u256_scaled_f64(value: U256, decimals: u8) -> f64 {
    let limbs = value.0;
    let raw = (limbs[0] as f64)
        + (limbs[1] as f64) * 2f64.powi(64)
        + (limbs[2] as f64) * 2f64.powi(128)
        + (limbs[3] as f64) * 2f64.powi(192);

    raw / 10f64.powi(decimals as i32)
}
