use std::collections::HashMap;

/// The set of (metric family, labelset) tuples a chain has published.
///
/// Entries carry the generation in which they were last written, so the
/// series a collect cycle stopped touching can be swept once that cycle
/// succeeds, while failed cycles leave everything in place.
#[derive(Debug, Default)]
pub struct LabelCache {
    generation: u64,
    entries: HashMap<(String, Vec<String>), u64>,
}

impl LabelCache {
    /// An empty cache at generation zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new generation; subsequent [`record`](Self::record) calls
    /// belong to it.
    pub fn begin_generation(&mut self) {
        self.generation += 1;
    }

    /// Remember that `labels` of `family` were written this generation.
    pub fn record(&mut self, family: &str, labels: &[&str]) {
        let key = (
            family.to_string(),
            labels.iter().map(|l| l.to_string()).collect(),
        );
        self.entries.insert(key, self.generation);
    }

    /// Remove and return every entry not touched in the current
    /// generation.
    pub fn sweep_stale(&mut self) -> Vec<(String, Vec<String>)> {
        let generation = self.generation;
        let stale: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, touched)| **touched < generation)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &stale {
            self.entries.remove(key);
        }

        stale
    }

    /// Remove and return every entry.
    pub fn drain(&mut self) -> Vec<(String, Vec<String>)> {
        self.entries.drain().map(|(key, _)| key).collect()
    }

    /// Whether `labels` of `family` are currently cached.
    pub fn contains(&self, family: &str, labels: &[&str]) -> bool {
        let key = (
            family.to_string(),
            labels.iter().map(|l| l.to_string()).collect::<Vec<_>>(),
        );
        self.entries.contains_key(&key)
    }

    /// Number of cached series.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no series.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_removes_only_untouched_entries() {
        let mut cache = LabelCache::new();

        cache.begin_generation();
        cache.record("f", &["a"]);
        cache.record("f", &["b"]);

        cache.begin_generation();
        cache.record("f", &["a"]);

        let stale = cache.sweep_stale();
        assert_eq!(stale, vec![("f".to_string(), vec!["b".to_string()])]);
        assert!(cache.contains("f", &["a"]));
        assert!(!cache.contains("f", &["b"]));
    }

    #[test]
    fn drain_empties_the_cache() {
        let mut cache = LabelCache::new();
        cache.record("f", &["a"]);
        cache.record("g", &["a", "b"]);

        let drained = cache.drain();
        assert_eq!(drained.len(), 2);
        assert!(cache.is_empty());
    }
}
