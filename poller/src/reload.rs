use std::{collections::HashMap, path::PathBuf, sync::Arc};

use serde::Serialize;

use config::ChainSpec;

use crate::PollerManager;

/// Disjoint change sets produced by diffing two spec sets.
///
/// A changed `rpc_url` is identity-bearing and lands the chain in both
/// `remove` and `add`; other field changes become `replace`.
#[derive(Debug, Default)]
pub struct ReloadPlan {
    /// Chains to spawn.
    pub add: Vec<ChainSpec>,
    /// Chain names to cancel and prune.
    pub remove: Vec<String>,
    /// Chains whose spec is swapped between ticks.
    pub replace: Vec<ChainSpec>,
}

impl ReloadPlan {
    /// Whether the plan changes nothing.
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty() && self.replace.is_empty()
    }
}

/// Diff the running spec set against a new one.
pub fn diff(current: &[ChainSpec], new: &[ChainSpec]) -> ReloadPlan {
    let current_by_name: HashMap<&str, &ChainSpec> = current
        .iter()
        .map(|spec| (spec.name.as_str(), spec))
        .collect();
    let new_by_name: HashMap<&str, &ChainSpec> =
        new.iter().map(|spec| (spec.name.as_str(), spec)).collect();

    let mut plan = ReloadPlan::default();

    for spec in current {
        match new_by_name.get(spec.name.as_str()) {
            None => plan.remove.push(spec.name.clone()),
            Some(candidate) if candidate.rpc_url != spec.rpc_url => {
                plan.remove.push(spec.name.clone());
            }
            Some(_) => {}
        }
    }

    for spec in new {
        match current_by_name.get(spec.name.as_str()) {
            None => plan.add.push(spec.clone()),
            Some(old) if old.rpc_url != spec.rpc_url => plan.add.push(spec.clone()),
            Some(old) if **old != *spec => plan.replace.push(spec.clone()),
            Some(_) => {}
        }
    }

    plan
}

/// Counts reported after a reload was applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ReloadSummary {
    /// Chains spawned.
    pub added: usize,
    /// Chains cancelled and pruned.
    pub removed: usize,
    /// Chains whose spec was swapped in place.
    pub replaced: usize,
    /// Chains in the new configuration.
    pub total: usize,
}

/// Why a reload request was not applied.
#[derive(Debug, thiserror::Error)]
pub enum ReloadError {
    /// Another reload is executing; reloads are serialised.
    #[error("a reload is already in flight")]
    InFlight,

    /// The new configuration was rejected; the running system is
    /// untouched.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Serialised reload entry point shared by `SIGHUP` and the HTTP
/// trigger.
pub struct Reloader {
    manager: Arc<PollerManager>,
    config_path: PathBuf,
    guard: tokio::sync::Mutex<()>,
}

impl Reloader {
    /// A reloader reading new configurations from `config_path`.
    pub fn new(manager: Arc<PollerManager>, config_path: PathBuf) -> Self {
        Self {
            manager,
            config_path,
            guard: tokio::sync::Mutex::new(()),
        }
    }

    /// Reload the configuration file and apply the diff.
    ///
    /// Atomic from the caller's view: an invalid file is rejected before
    /// any running chain is touched.
    pub async fn try_reload(&self) -> Result<ReloadSummary, ReloadError> {
        let Ok(_guard) = self.guard.try_lock() else {
            return Err(ReloadError::InFlight);
        };

        let specs = config::load_chains(&self.config_path)
            .map_err(|error| ReloadError::Invalid(error.to_string()))?;

        Ok(self.manager.apply_reload(specs).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn spec(name: &str, url: &str) -> ChainSpec {
        ChainSpec {
            name: name.to_string(),
            rpc_url: url.parse().unwrap(),
            poll_interval: None,
            transfer_lookback_blocks: 0,
            accounts: Vec::new(),
            contracts: Vec::new(),
            enabled: true,
        }
    }

    #[test]
    fn identical_sets_are_a_no_op() {
        let chains = vec![spec("a", "https://a.example.com"), spec("b", "https://b.example.com")];
        let plan = diff(&chains, &chains);
        assert!(plan.is_empty());
    }

    #[test]
    fn added_and_removed_chains_are_detected() {
        let current = vec![spec("a", "https://a.example.com"), spec("b", "https://b.example.com")];
        let new = vec![spec("b", "https://b.example.com"), spec("c", "https://c.example.com")];

        let plan = diff(&current, &new);

        assert_eq!(plan.remove, vec!["a".to_string()]);
        assert_eq!(plan.add.len(), 1);
        assert_eq!(plan.add[0].name, "c");
        assert!(plan.replace.is_empty());
    }

    #[test]
    fn rpc_url_change_is_remove_then_add() {
        let current = vec![spec("a", "https://old.example.com")];
        let new = vec![spec("a", "https://new.example.com")];

        let plan = diff(&current, &new);

        assert_eq!(plan.remove, vec!["a".to_string()]);
        assert_eq!(plan.add.len(), 1);
        assert_eq!(plan.add[0].rpc_url.as_str(), "https://new.example.com/");
        assert!(plan.replace.is_empty());
    }

    #[test]
    fn non_identity_change_is_replace_in_place() {
        let current = vec![spec("a", "https://a.example.com")];
        let mut changed = spec("a", "https://a.example.com");
        changed.poll_interval = Some(Duration::from_secs(60));

        let plan = diff(&current, &[changed]);

        assert!(plan.remove.is_empty());
        assert!(plan.add.is_empty());
        assert_eq!(plan.replace.len(), 1);
        assert_eq!(plan.replace[0].poll_interval, Some(Duration::from_secs(60)));
    }

    #[test]
    fn applying_a_plan_twice_is_empty_the_second_time() {
        let current = vec![spec("a", "https://a.example.com")];
        let new = vec![
            spec("a", "https://a.example.com"),
            spec("b", "https://b.example.com"),
        ];

        let first = diff(&current, &new);
        assert!(!first.is_empty());

        let second = diff(&new, &new);
        assert!(second.is_empty());
    }
}
