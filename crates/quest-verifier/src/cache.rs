// Copyright 2026 Boundless Foundation, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock,
    },
};

use alloy::primitives::Address;
use thiserror::Error;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{ConfigErr, ConfigLock},
    errors::CodedError,
    impl_coded_debug,
    task::{RetryRes, RetryTask, SupervisorErr},
};

/// Identity of one verdict
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Config generation the verdict was computed under
    pub generation: u64,
    pub contract_id: String,
    /// Campaign id, `custom` for explicit ranges or `all`
    pub scope: String,
    pub address: Address,
    /// Explicit range bounds, unix seconds
    pub bounds: Option<(u64, u64)>,
}

#[derive(Debug, Clone, Copy)]
struct CachedVerdict {
    eligible: bool,
    inserted: Instant,
}

/// In-memory verdict memo with a fixed TTL from insertion
#[derive(Clone, Debug)]
pub struct VerdictCache {
    entries: Arc<RwLock<HashMap<CacheKey, CachedVerdict>>>,
    ttl_ms: Arc<AtomicU64>,
}

impl VerdictCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl_ms: Arc::new(AtomicU64::new(ttl.as_millis() as u64)),
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms.load(Ordering::Relaxed))
    }

    pub fn set_ttl(&self, ttl: Duration) {
        self.ttl_ms.store(ttl.as_millis() as u64, Ordering::Relaxed);
    }

    /// Expired entries read as absent whether or not the sweeper has run
    pub fn get(&self, key: &CacheKey) -> Option<bool> {
        let ttl = self.ttl();
        let entries = self.entries.read().ok()?;
        entries.get(key).filter(|entry| entry.inserted.elapsed() < ttl).map(|entry| entry.eligible)
    }

    pub fn set(&self, key: CacheKey, eligible: bool) {
        match self.entries.write() {
            Ok(mut entries) => {
                entries.insert(key, CachedVerdict { eligible, inserted: Instant::now() });
            }
            Err(err) => tracing::error!("Failed to lock verdict cache for insert: {err}"),
        }
    }

    /// Removes every entry, returning how many there were
    pub fn clear(&self) -> usize {
        match self.entries.write() {
            Ok(mut entries) => {
                let count = entries.len();
                entries.clear();
                count
            }
            Err(err) => {
                tracing::error!("Failed to lock verdict cache for clear: {err}");
                0
            }
        }
    }

    pub fn evict_expired(&self) -> usize {
        let ttl = self.ttl();
        match self.entries.write() {
            Ok(mut entries) => {
                let before = entries.len();
                entries.retain(|_, entry| entry.inserted.elapsed() < ttl);
                before - entries.len()
            }
            Err(err) => {
                tracing::error!("Failed to lock verdict cache for eviction: {err}");
                0
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Error)]
pub enum SweeperErr {
    #[error("{code} Config error {0}", code = self.code())]
    ConfigReadErr(#[from] ConfigErr),
}

impl_coded_debug!(SweeperErr);

impl CodedError for SweeperErr {
    fn code(&self) -> &str {
        match self {
            SweeperErr::ConfigReadErr(_) => "[QV-CACHE-001]",
        }
    }
}

/// Periodically evicts expired verdicts
#[derive(Clone)]
pub struct CacheSweeper {
    cache: VerdictCache,
    config: ConfigLock,
}

impl CacheSweeper {
    pub fn new(cache: VerdictCache, config: ConfigLock) -> Self {
        Self { cache, config }
    }

    async fn run_sweep_loop(&self, cancel_token: CancellationToken) -> Result<(), SweeperErr> {
        loop {
            // Re-read each round so reloads can change the interval
            let interval =
                Duration::from_secs(self.config.snapshot()?.engine().cache_sweep_interval_secs);

            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let evicted = self.cache.evict_expired();
                    if evicted > 0 {
                        let remaining = self.cache.len();
                        tracing::debug!("Evicted {evicted} expired verdicts, {remaining} remain");
                    }
                }
                _ = cancel_token.cancelled() => {
                    tracing::info!("Cache sweeper shutting down");
                    return Ok(());
                }
            }
        }
    }
}

impl RetryTask for CacheSweeper {
    type Error = SweeperErr;

    fn spawn(&self, cancel_token: CancellationToken) -> RetryRes<Self::Error> {
        let this = self.clone();
        Box::pin(async move {
            this.run_sweep_loop(cancel_token).await.map_err(SupervisorErr::Recover)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::Config, task::Supervisor};
    use alloy::primitives::address;

    fn key(contract_id: &str) -> CacheKey {
        CacheKey {
            generation: 0,
            contract_id: contract_id.to_string(),
            scope: "all".to_string(),
            address: address!("000000000000000000000000000000000000abcd"),
            bounds: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_from_insertion() {
        let cache = VerdictCache::new(Duration::from_secs(10));
        cache.set(key("pass"), true);
        assert_eq!(cache.get(&key("pass")), Some(true));

        tokio::time::advance(Duration::from_secs(6)).await;
        // Reads do not extend the lifetime
        assert_eq!(cache.get(&key("pass")), Some(true));
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(cache.get(&key("pass")), None);
        // Still stored until swept
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.evict_expired(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn keys_are_isolated() {
        let cache = VerdictCache::new(Duration::from_secs(10));
        cache.set(key("pass"), true);
        cache.set(key("badge"), false);

        assert_eq!(cache.get(&key("pass")), Some(true));
        assert_eq!(cache.get(&key("badge")), Some(false));
        assert_eq!(cache.get(&CacheKey { generation: 1, ..key("pass") }), None);
        assert_eq!(cache.get(&CacheKey { bounds: Some((1, 2)), ..key("pass") }), None);

        assert_eq!(cache.clear(), 2);
        assert_eq!(cache.get(&key("pass")), None);
        assert_eq!(cache.get(&key("badge")), None);
    }

    #[test]
    fn zero_ttl_never_hits() {
        let cache = VerdictCache::new(Duration::ZERO);
        cache.set(key("pass"), true);
        assert_eq!(cache.get(&key("pass")), None);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_evicts_in_background() {
        let mut config = Config::default();
        config.engine.cache_sweep_interval_secs = 5;
        let cache = VerdictCache::new(Duration::from_secs(1));
        let cancel_token = CancellationToken::new();
        let sweeper = Arc::new(CacheSweeper::new(cache.clone(), ConfigLock::new(config)));
        let handle = tokio::spawn(Supervisor::new(sweeper, cancel_token.clone()).spawn());

        cache.set(key("pass"), true);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(cache.is_empty());

        cancel_token.cancel();
        handle.await.unwrap().unwrap();
    }
}
