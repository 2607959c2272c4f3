#![deny(unused_crate_dependencies)]
#![warn(missing_docs)]
#![warn(unused_extern_crates)]
#![warn(unused_imports)]

//! Chain configuration model and loaders.
//!
//! The blockchains file is a TOML document with a top-level `blockchains`
//! array. `${VAR}` placeholders in the raw file are expanded from the
//! process environment before parsing; a placeholder with no matching
//! variable is a fatal error. Process-wide tuning knobs live in
//! [`Settings`] and are read from environment variables.

mod error;
mod settings;

pub use error::{Error, Result};
pub use settings::Settings;

use std::{collections::HashSet, env, fs, path::Path, time::Duration};

use ethers::types::{Address, U256};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use url::Url;

/// One account whose native balance is exported.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AccountSpec {
    /// Human-readable account name used as a metric label.
    pub name: String,
    /// 20-byte account address.
    pub address: Address,
    /// Disabled entries are dropped at load time.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// An account checked against a specific token contract.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ContractAccountSpec {
    /// Human-readable account name used as a metric label.
    pub name: String,
    /// 20-byte account address.
    pub address: Address,
    /// Token ids to run `ownerOf` checks against (ERC-721 contracts only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_ids: Option<Vec<U256>>,
    /// Disabled entries are dropped at load time.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// One token contract watched on a chain.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ContractSpec {
    /// Human-readable contract name used as a metric label.
    pub name: String,
    /// 20-byte contract address.
    pub address: Address,
    /// Overrides the on-chain `decimals()` value when normalising supply
    /// and balances.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decimals: Option<u8>,
    /// Overrides the chain-level transfer lookback for this contract.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_lookback_blocks: Option<u64>,
    /// Disabled entries are dropped at load time.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Accounts whose token balance is checked against this contract.
    #[serde(default)]
    pub accounts: Vec<ContractAccountSpec>,
}

/// Immutable description of one chain to poll.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ChainSpec {
    /// Unique, case-sensitive chain name.
    pub name: String,
    /// JSON-RPC endpoint. Changing the URL is treated as removing the
    /// chain and adding a new one.
    pub rpc_url: Url,
    /// Per-chain poll interval; falls back to
    /// [`Settings::default_poll_interval`] when absent.
    #[serde(
        default,
        with = "duration_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub poll_interval: Option<Duration>,
    /// Trailing block window over which Transfer logs are counted.
    /// Zero disables transfer counting.
    #[serde(default)]
    pub transfer_lookback_blocks: u64,
    /// Disabled entries are dropped at load time.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Accounts whose native balance is exported.
    #[serde(default)]
    pub accounts: Vec<AccountSpec>,
    /// Token contracts watched on this chain.
    #[serde(default)]
    pub contracts: Vec<ContractSpec>,
}

impl ChainSpec {
    /// The transfer lookback that applies to `contract`, honoring the
    /// per-contract override.
    pub fn lookback_for(&self, contract: &ContractSpec) -> u64 {
        contract
            .transfer_lookback_blocks
            .unwrap_or(self.transfer_lookback_blocks)
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    blockchains: Vec<ChainSpec>,
}

fn default_enabled() -> bool {
    true
}

/// Load, interpolate, parse, and validate the blockchains file.
///
/// Disabled chains, contracts, and accounts are filtered out. The
/// returned chains preserve the file order.
pub fn load_chains(path: &Path) -> Result<Vec<ChainSpec>> {
    let raw = fs::read_to_string(path).map_err(|source| Error::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let expanded = expand_env_vars(&raw)?;

    let file: ConfigFile = toml::from_str(&expanded)?;

    validate_chains(file.blockchains)
}

/// Expand `${VAR}` placeholders from the process environment.
///
/// Literal `$` signs that do not open a `${...}` placeholder are kept
/// as-is.
fn expand_env_vars(raw: &str) -> Result<String> {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);

        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            // An unterminated placeholder is left for the TOML parser to
            // reject in context.
            out.push_str(&rest[start..]);
            return Ok(out);
        };

        let var = &after[..end];
        match env::var(var) {
            Ok(value) => out.push_str(&value),
            Err(_) => return Err(Error::UnresolvedVar(var.to_string())),
        }

        rest = &after[end + 1..];
    }

    out.push_str(rest);
    Ok(out)
}

fn validate_chains(chains: Vec<ChainSpec>) -> Result<Vec<ChainSpec>> {
    let mut seen_names: HashSet<String> = HashSet::new();
    let mut out = Vec::with_capacity(chains.len());

    for (index, mut chain) in chains.into_iter().enumerate() {
        let location = format!("blockchains[{}]", index + 1);

        if !chain.enabled {
            continue;
        }

        if chain.name.trim().is_empty() {
            return Err(Error::validation(
                format!("{location}.name"),
                "must be a non-empty string",
            ));
        }

        // Names are case-sensitive labels but a duplicate differing only
        // in case is almost certainly a mistake.
        if !seen_names.insert(chain.name.to_lowercase()) {
            return Err(Error::validation(
                format!("{location}.name"),
                format!("duplicate blockchain name '{}'", chain.name),
            ));
        }

        if let Some(interval) = chain.poll_interval {
            if interval.is_zero() {
                return Err(Error::validation(
                    format!("{location}.poll_interval"),
                    "must be a positive duration",
                ));
            }
        }

        chain.accounts = validate_accounts(chain.accounts, &location)?;
        chain.contracts = validate_contracts(chain.contracts, &location)?;

        out.push(chain);
    }

    Ok(out)
}

fn validate_accounts(accounts: Vec<AccountSpec>, location: &str) -> Result<Vec<AccountSpec>> {
    let mut seen: HashSet<Address> = HashSet::new();
    let mut out = Vec::with_capacity(accounts.len());

    for (index, account) in accounts.into_iter().enumerate() {
        let location = format!("{location}.accounts[{}]", index + 1);

        if !account.enabled {
            continue;
        }

        if account.name.trim().is_empty() {
            return Err(Error::validation(
                format!("{location}.name"),
                "must be a non-empty string",
            ));
        }

        if !seen.insert(account.address) {
            return Err(Error::validation(
                format!("{location}.address"),
                format!("duplicate account address {:#x}", account.address),
            ));
        }

        out.push(account);
    }

    Ok(out)
}

fn validate_contracts(contracts: Vec<ContractSpec>, location: &str) -> Result<Vec<ContractSpec>> {
    let mut seen: HashSet<Address> = HashSet::new();
    let mut out = Vec::with_capacity(contracts.len());

    for (index, mut contract) in contracts.into_iter().enumerate() {
        let location = format!("{location}.contracts[{}]", index + 1);

        if !contract.enabled {
            continue;
        }

        if contract.name.trim().is_empty() {
            return Err(Error::validation(
                format!("{location}.name"),
                "must be a non-empty string",
            ));
        }

        if !seen.insert(contract.address) {
            return Err(Error::validation(
                format!("{location}.address"),
                format!("duplicate contract address {:#x}", contract.address),
            ));
        }

        let mut seen_accounts: HashSet<Address> = HashSet::new();
        let mut accounts = Vec::with_capacity(contract.accounts.len());

        for (account_index, account) in contract.accounts.into_iter().enumerate() {
            let location = format!("{location}.accounts[{}]", account_index + 1);

            if !account.enabled {
                continue;
            }

            if account.name.trim().is_empty() {
                return Err(Error::validation(
                    format!("{location}.name"),
                    "must be a non-empty string",
                ));
            }

            if !seen_accounts.insert(account.address) {
                return Err(Error::validation(
                    format!("{location}.address"),
                    format!("duplicate contract account address {:#x}", account.address),
                ));
            }

            accounts.push(account);
        }

        contract.accounts = accounts;
        out.push(contract);
    }

    Ok(out)
}

/// Parse a duration string of the form `N`, `Ns`, `Nm`, or `Nh`.
///
/// The unit is case-insensitive and defaults to seconds.
pub fn parse_duration(value: &str) -> Option<Duration> {
    let trimmed = value.trim();

    let (digits, unit) = match trimmed.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => (&trimmed[..trimmed.len() - 1], c),
        Some(_) => (trimmed, 's'),
        None => return None,
    };

    let amount: u64 = digits.trim().parse().ok()?;

    let multiplier = match unit.to_ascii_lowercase() {
        's' => 1,
        'm' => 60,
        'h' => 3600,
        _ => return None,
    };

    Some(Duration::from_secs(amount.checked_mul(multiplier)?))
}

mod duration_string {
    use super::*;

    pub(super) fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_str(&format!("{}s", duration.as_secs())),
            None => serializer.serialize_none(),
        }
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Option<Duration>, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;

        raw.map(|value| {
            parse_duration(&value).ok_or_else(|| {
                serde::de::Error::custom(format!(
                    "invalid duration '{value}', expected a number with an optional s/m/h unit"
                ))
            })
        })
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn write_config(contents: &str) -> tempfile_path::TempConfig {
        tempfile_path::TempConfig::new(contents)
    }

    // A tiny self-cleaning temp file helper so tests do not depend on an
    // external tempfile crate.
    mod tempfile_path {
        use std::{
            path::PathBuf,
            sync::atomic::{AtomicU64, Ordering},
        };

        static COUNTER: AtomicU64 = AtomicU64::new(0);

        pub struct TempConfig {
            pub path: PathBuf,
        }

        impl TempConfig {
            pub fn new(contents: &str) -> Self {
                let path = std::env::temp_dir().join(format!(
                    "blockchain-exporter-config-test-{}-{}.toml",
                    std::process::id(),
                    COUNTER.fetch_add(1, Ordering::Relaxed),
                ));
                std::fs::write(&path, contents).unwrap();
                Self { path }
            }
        }

        impl Drop for TempConfig {
            fn drop(&mut self) {
                let _ = std::fs::remove_file(&self.path);
            }
        }
    }

    const SAMPLE: &str = r#"
[[blockchains]]
name = "mainnet"
rpc_url = "https://eth.example.com"
poll_interval = "30s"
transfer_lookback_blocks = 100

[[blockchains.accounts]]
name = "treasury"
address = "0x00000000000000000000000000000000000000aa"

[[blockchains.contracts]]
name = "usdc"
address = "0x00000000000000000000000000000000000000bb"
transfer_lookback_blocks = 50

[[blockchains.contracts.accounts]]
name = "vault"
address = "0x00000000000000000000000000000000000000cc"

[[blockchains]]
name = "polygon"
rpc_url = "https://polygon.example.com"
"#;

    #[test]
    fn parses_sample_config() {
        let file = write_config(SAMPLE);
        let chains = load_chains(&file.path).unwrap();

        assert_eq!(chains.len(), 2);
        assert_eq!(chains[0].name, "mainnet");
        assert_eq!(chains[0].poll_interval, Some(Duration::from_secs(30)));
        assert_eq!(chains[0].transfer_lookback_blocks, 100);
        assert_eq!(chains[0].accounts.len(), 1);
        assert_eq!(chains[0].contracts[0].accounts[0].name, "vault");
        assert_eq!(chains[1].name, "polygon");
        assert_eq!(chains[1].poll_interval, None);
        assert_eq!(chains[1].transfer_lookback_blocks, 0);
    }

    #[test]
    fn contract_lookback_override_wins() {
        let file = write_config(SAMPLE);
        let chains = load_chains(&file.path).unwrap();

        let chain = &chains[0];
        assert_eq!(chain.lookback_for(&chain.contracts[0]), 50);
    }

    #[test]
    fn expands_environment_placeholders() {
        std::env::set_var("CONFIG_TEST_RPC_HOST", "rpc.example.com");

        let file = write_config(
            r#"
[[blockchains]]
name = "c1"
rpc_url = "https://${CONFIG_TEST_RPC_HOST}/v1"
"#,
        );

        let chains = load_chains(&file.path).unwrap();
        assert_eq!(chains[0].rpc_url.as_str(), "https://rpc.example.com/v1");
    }

    #[test]
    fn unresolved_placeholder_is_fatal() {
        let file = write_config(
            r#"
[[blockchains]]
name = "c1"
rpc_url = "https://${CONFIG_TEST_MISSING_VAR}/v1"
"#,
        );

        let err = load_chains(&file.path).unwrap_err();
        assert!(matches!(err, Error::UnresolvedVar(var) if var == "CONFIG_TEST_MISSING_VAR"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let file = write_config(
            r#"
[[blockchains]]
name = "c1"
rpc_url = "https://eth.example.com"
pol_interval = "5m"
"#,
        );

        let err = load_chains(&file.path).unwrap_err().to_string();
        assert!(err.contains("pol_interval"), "error should name the field: {err}");
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let file = write_config(
            r#"
[[blockchains]]
name = "c1"
rpc_url = "https://a.example.com"

[[blockchains]]
name = "C1"
rpc_url = "https://b.example.com"
"#,
        );

        assert!(matches!(
            load_chains(&file.path).unwrap_err(),
            Error::Validation { .. }
        ));
    }

    #[test]
    fn disabled_entries_are_filtered() {
        let file = write_config(
            r#"
[[blockchains]]
name = "c1"
rpc_url = "https://a.example.com"

[[blockchains.accounts]]
name = "off"
address = "0x00000000000000000000000000000000000000aa"
enabled = false

[[blockchains]]
name = "c2"
rpc_url = "https://b.example.com"
enabled = false
"#,
        );

        let chains = load_chains(&file.path).unwrap();
        assert_eq!(chains.len(), 1);
        assert!(chains[0].accounts.is_empty());
    }

    #[test]
    fn duration_grammar() {
        assert_eq!(parse_duration("30"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("2H"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_duration(" 10 s "), Some(Duration::from_secs(10)));
        assert_eq!(parse_duration("5d"), None);
        assert_eq!(parse_duration("m"), None);
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("-5s"), None);
    }

    #[test]
    fn round_trip_preserves_identity_and_order() {
        let file = write_config(SAMPLE);
        let chains = load_chains(&file.path).unwrap();

        let serialized = toml::to_string(&ConfigFileOwned {
            blockchains: chains.clone(),
        })
        .unwrap();

        let reparsed = write_config(&serialized);
        let reloaded = load_chains(&reparsed.path).unwrap();

        let identity =
            |chains: &[ChainSpec]| -> Vec<(String, String)> {
                chains
                    .iter()
                    .map(|c| (c.name.clone(), c.rpc_url.to_string()))
                    .collect()
            };

        assert_eq!(identity(&chains), identity(&reloaded));
    }

    #[derive(Serialize)]
    struct ConfigFileOwned {
        blockchains: Vec<ChainSpec>,
    }
}
