use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use ethers::providers::{Http, Provider};
use url::Url;

use crate::{Error, Result};

/// Caches one HTTP transport per RPC endpoint.
///
/// All transports share a single [`reqwest::Client`], so keep-alive
/// connections are reused across polls instead of opening a fresh socket
/// every cycle.
pub struct ConnectionPool {
    http: reqwest::Client,
    providers: Mutex<HashMap<Url, Arc<Provider<Http>>>>,
}

impl ConnectionPool {
    /// A pool whose requests are bounded by `request_timeout`.
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|error| Error::Connection(format!("failed to build http client: {error}")))?;

        Ok(Self {
            http,
            providers: Mutex::new(HashMap::new()),
        })
    }

    /// Get or create the transport for `url`. Idempotent.
    pub fn provider(&self, url: &Url) -> Arc<Provider<Http>> {
        let mut providers = self.lock();

        providers
            .entry(url.clone())
            .or_insert_with(|| {
                tracing::debug!(%url, "creating rpc transport");
                let transport = Http::new_with_client(url.clone(), self.http.clone());
                Arc::new(Provider::new(transport))
            })
            .clone()
    }

    /// Drop the pooled transport for `url`, forcing the next
    /// [`provider`](Self::provider) call to dial fresh.
    pub fn invalidate(&self, url: &Url) {
        self.lock().remove(url);
    }

    /// Number of pooled transports.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the pool is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Url, Arc<Provider<Http>>>> {
        self.providers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_or_create_is_idempotent() {
        let pool = ConnectionPool::new(Duration::from_secs(10)).unwrap();
        let url: Url = "https://rpc.example.com".parse().unwrap();

        let first = pool.provider(&url);
        let second = pool.provider(&url);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn invalidate_forces_a_fresh_transport() {
        let pool = ConnectionPool::new(Duration::from_secs(10)).unwrap();
        let url: Url = "https://rpc.example.com".parse().unwrap();

        let first = pool.provider(&url);
        pool.invalidate(&url);
        let second = pool.provider(&url);

        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn distinct_urls_get_distinct_transports() {
        let pool = ConnectionPool::new(Duration::from_secs(10)).unwrap();
        let a = pool.provider(&"https://a.example.com".parse().unwrap());
        let b = pool.provider(&"https://b.example.com".parse().unwrap());

        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(pool.len(), 2);
    }
}
