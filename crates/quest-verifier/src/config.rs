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
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};

use crate::{errors::CodedError, impl_coded_debug};
use alloy::primitives::{keccak256, Address, B256};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use notify::{EventKind, Watcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{timeout, Duration},
};
use url::Url;

#[derive(Error)]
pub enum ConfigErr {
    #[error("{code} Failed to lock internal config structure", code = self.code())]
    LockFailed,

    #[error("{code} Invalid configuration: {0}", code = self.code())]
    InvalidConfig(String),

    #[error("{code} Contract not found: {0}", code = self.code())]
    ContractNotFound(String),

    #[error("{code} Config has no backing file to reload from", code = self.code())]
    NoSource,
}

impl_coded_debug!(ConfigErr);

impl CodedError for ConfigErr {
    fn code(&self) -> &str {
        match self {
            ConfigErr::LockFailed => "[QV-CON-3012]",
            ConfigErr::InvalidConfig(_) => "[QV-CON-3013]",
            ConfigErr::ContractNotFound(_) => "[QV-CON-3014]",
            ConfigErr::NoSource => "[QV-CON-3015]",
        }
    }
}

pub mod defaults {
    pub const fn verification_timeout_ms() -> u64 {
        8_000
    }

    pub const fn cache_ttl_secs() -> u64 {
        300
    }

    pub const fn cache_sweep_interval_secs() -> u64 {
        60
    }

    pub const fn binary_search_max_iterations() -> u32 {
        32
    }

    pub const fn default_block_time_ms() -> u64 {
        12_000
    }

    pub const fn trust_nonce_delta() -> bool {
        true
    }

    pub const fn attempts() -> u32 {
        3
    }

    pub const fn call_timeout_ms() -> u64 {
        2_500
    }

    pub const fn base_delay_ms() -> u64 {
        250
    }

    pub const fn recent_blocks() -> u64 {
        10_000
    }

    pub const fn batch_size() -> u64 {
        2_000
    }

    pub const fn large_range_threshold() -> u64 {
        100_000
    }

    pub const fn sample_points() -> u64 {
        20
    }

    pub const fn mid_sample_points() -> u64 {
        10
    }

    pub const fn sample_radius() -> u64 {
        250
    }

    pub const fn final_sweep_radius() -> u64 {
        2_000
    }

    pub const fn max_query_range() -> u64 {
        10_000
    }

    pub const fn deployment_block() -> u64 {
        1
    }

    pub fn privileged_getter() -> String {
        "minter()".into()
    }

    pub fn transfer_event() -> String {
        "Transfer(address,address,uint256)".into()
    }
}

/// How wall-clock timestamps are mapped to block numbers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockEstimation {
    /// Head block minus elapsed time divided by the average block interval
    #[default]
    Arithmetic,
    /// Bounded binary search over block timestamps
    BinarySearch,
}

/// Per ledger call timeout and retry behavior
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per query, including the first one
    #[serde(default = "defaults::attempts")]
    pub attempts: u32,
    /// Timeout for a single attempt
    #[serde(default = "defaults::call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// Linear backoff unit, attempt `n` waits `n * base_delay_ms` before retrying
    #[serde(default = "defaults::base_delay_ms")]
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: defaults::attempts(),
            call_timeout_ms: defaults::call_timeout_ms(),
            base_delay_ms: defaults::base_delay_ms(),
        }
    }
}

/// Activity scanner tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Blocks at the end of the window that are always scanned first
    #[serde(default = "defaults::recent_blocks")]
    pub recent_blocks: u64,
    /// Block span of each sequential batch for small windows
    #[serde(default = "defaults::batch_size")]
    pub batch_size: u64,
    /// Windows wider than this switch to strategic sampling
    #[serde(default = "defaults::large_range_threshold")]
    pub large_range_threshold: u64,
    /// Evenly spaced samples across the whole window
    #[serde(default = "defaults::sample_points")]
    pub sample_points: u64,
    /// Extra samples inside the middle half of the window
    #[serde(default = "defaults::mid_sample_points")]
    pub mid_sample_points: u64,
    /// Blocks scanned on each side of a sample
    #[serde(default = "defaults::sample_radius")]
    pub sample_radius: u64,
    /// Blocks scanned on each side of the midpoint after sampling
    #[serde(default = "defaults::final_sweep_radius")]
    pub final_sweep_radius: u64,
    /// Provider cap on the block span of a single log query
    #[serde(default = "defaults::max_query_range")]
    pub max_query_range: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            recent_blocks: defaults::recent_blocks(),
            batch_size: defaults::batch_size(),
            large_range_threshold: defaults::large_range_threshold(),
            sample_points: defaults::sample_points(),
            mid_sample_points: defaults::mid_sample_points(),
            sample_radius: defaults::sample_radius(),
            final_sweep_radius: defaults::final_sweep_radius(),
            max_query_range: defaults::max_query_range(),
        }
    }
}

/// Verification engine settings, hot reloadable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Overall deadline for a single uncached verification
    #[serde(default = "defaults::verification_timeout_ms")]
    pub verification_timeout_ms: u64,
    /// Lifetime of a cached verdict from insertion
    #[serde(default = "defaults::cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// Interval of the background sweep evicting expired verdicts
    #[serde(default = "defaults::cache_sweep_interval_secs")]
    pub cache_sweep_interval_secs: u64,
    #[serde(default)]
    pub block_estimation: BlockEstimation,
    #[serde(default = "defaults::binary_search_max_iterations")]
    pub binary_search_max_iterations: u32,
    /// Average block interval used when neither the contract nor the chain provides one
    #[serde(default = "defaults::default_block_time_ms")]
    pub default_block_time_ms: u64,
    /// Treat a transaction count change inside the window as an interaction on its own
    #[serde(default = "defaults::trust_nonce_delta")]
    pub trust_nonce_delta: bool,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub scan: ScanConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            verification_timeout_ms: defaults::verification_timeout_ms(),
            cache_ttl_secs: defaults::cache_ttl_secs(),
            cache_sweep_interval_secs: defaults::cache_sweep_interval_secs(),
            block_estimation: BlockEstimation::default(),
            binary_search_max_iterations: defaults::binary_search_max_iterations(),
            default_block_time_ms: defaults::default_block_time_ms(),
            trust_nonce_delta: defaults::trust_nonce_delta(),
            retry: RetryConfig::default(),
            scan: ScanConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn verification_timeout(&self) -> Duration {
        Duration::from_millis(self.verification_timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    fn validate(&self) -> Result<(), ConfigErr> {
        let checks = [
            ("engine.verification_timeout_ms", self.verification_timeout_ms),
            ("engine.cache_sweep_interval_secs", self.cache_sweep_interval_secs),
            ("engine.default_block_time_ms", self.default_block_time_ms),
            ("engine.retry.attempts", self.retry.attempts as u64),
            ("engine.retry.call_timeout_ms", self.retry.call_timeout_ms),
            ("engine.scan.batch_size", self.scan.batch_size),
            ("engine.scan.max_query_range", self.scan.max_query_range),
            ("engine.binary_search_max_iterations", self.binary_search_max_iterations as u64),
        ];
        for (name, value) in checks {
            if value == 0 {
                return Err(ConfigErr::InvalidConfig(format!("{name} must be greater than zero")));
            }
        }
        Ok(())
    }
}

/// A date-bounded campaign run against one contract
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Campaign {
    /// Filled from the table key on load
    #[serde(default, skip_serializing)]
    pub id: String,
    pub name: String,
    pub start: DateTime<Utc>,
    /// Inclusive
    pub end: DateTime<Utc>,
    #[serde(default)]
    pub description: String,
}

impl Campaign {
    pub fn start_timestamp(&self) -> u64 {
        self.start.timestamp().max(0) as u64
    }

    pub fn end_timestamp(&self) -> u64 {
        self.end.timestamp().max(0) as u64
    }
}

/// Everything the engine knows about a tracked contract
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractProfile {
    /// Filled from the table key on load
    #[serde(default, skip_serializing)]
    pub id: String,
    pub name: String,
    pub address: Address,
    pub chain_id: u64,
    pub rpc_url: Url,
    #[serde(default)]
    pub fallback_rpc_urls: Vec<Url>,
    /// Overrides the chain block-time hint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_time_ms: Option<u64>,
    /// Lower bound of the window when no campaign or range is given
    #[serde(default = "defaults::deployment_block")]
    pub deployment_block: u64,
    /// View function returning the privileged account; empty disables the check
    #[serde(default = "defaults::privileged_getter")]
    pub privileged_getter: String,
    #[serde(default = "defaults::transfer_event")]
    pub transfer_event: String,
    #[serde(default)]
    pub campaigns: BTreeMap<String, Campaign>,
}

impl ContractProfile {
    /// Primary URL followed by the distinct fallbacks
    pub fn rpc_urls(&self) -> Vec<Url> {
        let mut urls = vec![self.rpc_url.clone()];
        for url in &self.fallback_rpc_urls {
            if !urls.contains(url) {
                urls.push(url.clone());
            }
        }
        urls
    }

    /// Topic0 of the transfer-like event
    pub fn transfer_topic(&self) -> B256 {
        keccak256(self.transfer_event.as_bytes())
    }

    pub fn privileged_getter(&self) -> Option<&str> {
        let getter = self.privileged_getter.trim();
        (!getter.is_empty()).then_some(getter)
    }

    fn validate(&self) -> Result<(), ConfigErr> {
        if self.chain_id == 0 {
            return Err(ConfigErr::InvalidConfig(format!("contract {}: chain_id is zero", self.id)));
        }
        if self.block_time_ms == Some(0) {
            return Err(ConfigErr::InvalidConfig(format!(
                "contract {}: block_time_ms is zero",
                self.id
            )));
        }
        if !is_signature(&self.transfer_event) {
            return Err(ConfigErr::InvalidConfig(format!(
                "contract {}: malformed transfer_event {:?}",
                self.id, self.transfer_event
            )));
        }
        if let Some(getter) = self.privileged_getter() {
            if !is_signature(getter) {
                return Err(ConfigErr::InvalidConfig(format!(
                    "contract {}: malformed privileged_getter {getter:?}",
                    self.id
                )));
            }
        }
        for campaign in self.campaigns.values() {
            if campaign.start > campaign.end {
                return Err(ConfigErr::InvalidConfig(format!(
                    "campaign {}/{}: start is after end",
                    self.id, campaign.id
                )));
            }
        }
        Ok(())
    }
}

fn is_signature(sig: &str) -> bool {
    match sig.find('(') {
        Some(open) => open > 0 && sig.ends_with(')') && !sig.contains(' '),
        None => false,
    }
}

/// Top level config file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub contracts: BTreeMap<String, ContractProfile>,
}

impl Config {
    /// Load and validate a TOML config file
    pub async fn load(path: &Path) -> Result<Self> {
        let data = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config: Self = toml::from_str(&data).context("Failed to parse toml file")?;
        config.assign_ids();
        config.validate()?;
        Ok(config)
    }

    /// Serialize to a TOML file
    pub async fn write(&self, path: &Path) -> Result<()> {
        let data = toml::to_string(self).context("Failed to serialize config")?;
        tokio::fs::write(path, data).await.context("Failed to write config file")?;
        Ok(())
    }

    /// Copies the table keys into the `id` fields of contracts and campaigns
    pub fn assign_ids(&mut self) {
        for (contract_id, contract) in self.contracts.iter_mut() {
            contract.id = contract_id.clone();
            for (campaign_id, campaign) in contract.campaigns.iter_mut() {
                campaign.id = campaign_id.clone();
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigErr> {
        self.engine.validate()?;
        for contract in self.contracts.values() {
            contract.validate()?;
        }
        Ok(())
    }
}

/// Immutable view of one config generation
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub config: Arc<Config>,
    /// Bumped on every replacement
    pub generation: u64,
}

impl ConfigSnapshot {
    pub fn engine(&self) -> &EngineConfig {
        &self.config.engine
    }

    pub fn contract(&self, contract_id: &str) -> Result<&ContractProfile, ConfigErr> {
        self.config
            .contracts
            .get(contract_id)
            .ok_or_else(|| ConfigErr::ContractNotFound(contract_id.to_string()))
    }

    pub fn campaign(
        &self,
        contract_id: &str,
        campaign_id: &str,
    ) -> Result<Option<&Campaign>, ConfigErr> {
        Ok(self.contract(contract_id)?.campaigns.get(campaign_id))
    }

    pub fn contract_ids(&self) -> Vec<&str> {
        self.config.contracts.keys().map(String::as_str).collect()
    }
}

#[derive(Debug)]
struct Loaded {
    config: Arc<Config>,
    generation: u64,
}

/// Shared handle to the active config
#[derive(Clone, Debug)]
pub struct ConfigLock {
    loaded: Arc<RwLock<Loaded>>,
    source: Option<Arc<PathBuf>>,
    notifier: Arc<watch::Sender<u64>>,
}

impl Default for ConfigLock {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl ConfigLock {
    /// In-memory config with no file behind it
    pub fn new(config: Config) -> Self {
        let (notifier, _) = watch::channel(0);
        Self {
            loaded: Arc::new(RwLock::new(Loaded { config: Arc::new(config), generation: 0 })),
            source: None,
            notifier: Arc::new(notifier),
        }
    }

    fn with_source(config: Config, path: &Path) -> Self {
        Self { source: Some(Arc::new(path.to_path_buf())), ..Self::new(config) }
    }

    pub fn snapshot(&self) -> Result<ConfigSnapshot, ConfigErr> {
        let loaded = self.loaded.read().map_err(|_| ConfigErr::LockFailed)?;
        Ok(ConfigSnapshot { config: loaded.config.clone(), generation: loaded.generation })
    }

    /// Atomically swaps in a new config and notifies subscribers
    pub fn replace(&self, config: Config) -> Result<u64, ConfigErr> {
        let generation = {
            let mut loaded = self.loaded.write().map_err(|_| ConfigErr::LockFailed)?;
            loaded.config = Arc::new(config);
            loaded.generation += 1;
            loaded.generation
        };
        self.notifier.send_replace(generation);
        Ok(generation)
    }

    /// Receives the new generation after each replacement
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.notifier.subscribe()
    }

    /// Re-reads the backing file; the active config is kept if the file is invalid
    pub async fn reload(&self) -> Result<u64> {
        let path = self.source.as_ref().ok_or(ConfigErr::NoSource)?;
        let config = Config::load(path).await.context("Failed to reload config")?;
        log_config_summary(&config);
        Ok(self.replace(config)?)
    }
}

/// Max number of pending filesystem events from the config file
const FILE_MONITOR_EVENT_BUFFER: usize = 32;

/// Monitor service for watching config files for changes
pub struct ConfigWatcher {
    /// Current config data
    pub config: ConfigLock,
    /// monitor task handle
    _monitor: JoinHandle<Result<()>>,
}

impl ConfigWatcher {
    /// Initialize a new config watcher and handle
    pub async fn new(config_path: &Path) -> Result<Self> {
        let initial_config = Config::load(config_path).await?;
        log_config_summary(&initial_config);
        let config = ConfigLock::with_source(initial_config, config_path);
        let config_copy = config.clone();
        let config_path_copy = config_path.to_path_buf();

        let startup_notification = Arc::new(tokio::sync::Notify::new());
        let startup_notification_copy = startup_notification.clone();

        let monitor = tokio::spawn(async move {
            let (tx, mut rx) = tokio::sync::mpsc::channel(FILE_MONITOR_EVENT_BUFFER);

            let mut watcher = notify::recommended_watcher(move |res| match res {
                Ok(event) => {
                    if let Err(err) = tx.try_send(event) {
                        tracing::debug!("Failed to send filesystem event to channel: {err:?}");
                    }
                }
                Err(err) => tracing::error!("Failed to watch config file: {err:?}"),
            })
            .context("Failed to construct watcher")?;

            watcher
                .watch(&config_path_copy, notify::RecursiveMode::NonRecursive)
                .context("Failed to start watcher")?;
            startup_notification_copy.notify_one();

            while let Some(event) = rx.recv().await {
                match event.kind {
                    EventKind::Modify(_) => {
                        tracing::debug!("Reloading modified config file");
                        match config_copy.reload().await {
                            Ok(generation) => {
                                tracing::info!("Config reloaded, generation {generation}")
                            }
                            Err(err) => tracing::error!("Failed to load modified config: {err:?}"),
                        }
                    }
                    _ => {
                        tracing::debug!("unsupported config file event: {event:?}");
                    }
                }
            }

            watcher.unwatch(&config_path_copy).context("Failed to stop watching config")?;

            Ok(())
        });

        // Wait for successful start up, if failed return the Result
        if let Err(err) = timeout(Duration::from_secs(1), startup_notification.notified()).await {
            tracing::error!("Failed to get notification from config monitor startup in: {err}");
            let task_res = monitor.await.context("Config watcher startup failed")?;
            match task_res {
                Ok(_) => unreachable!("Startup failed to notify in timeout but exited cleanly"),
                Err(err) => return Err(err),
            }
        }
        tracing::debug!("Successful startup");

        Ok(Self { config, _monitor: monitor })
    }
}

fn log_config_summary(config: &Config) {
    let campaigns: usize = config.contracts.values().map(|c| c.campaigns.len()).sum();
    tracing::info!(
        "Loaded config: {} contracts, {} campaigns, block estimation {:?}",
        config.contracts.len(),
        campaigns,
        config.engine.block_estimation
    );
    for contract in config.contracts.values() {
        if contract.fallback_rpc_urls.is_empty() {
            tracing::debug!("contract {} has no fallback RPC urls", contract.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;
    use std::{
        fs::File,
        io::{Seek, Write},
    };
    use tempfile::NamedTempFile;
    use tracing_test::traced_test;

    const CONFIG_TEMPL: &str = r#"
[engine]
verification_timeout_ms = 5000
cache_ttl_secs = 120

[engine.retry]
attempts = 2
call_timeout_ms = 1000

[contracts.galaxy-pass]
name = "Galaxy Pass"
address = "0x5FbDB2315678afecb367f032d93F642f64180aa3"
chain_id = 8453
rpc_url = "https://base.example.org"
fallback_rpc_urls = ["https://base-backup.example.org"]

[contracts.galaxy-pass.campaigns.summer]
name = "Summer Quest"
start = "2024-06-01T00:00:00Z"
end = "2024-06-30T23:59:59Z"
description = "Mint during June""#;

    const CONFIG_TEMPL_2: &str = r#"
[engine]
verification_timeout_ms = 3000
block_estimation = "binary_search"
trust_nonce_delta = false

[engine.scan]
recent_blocks = 500
sample_radius = 50

[contracts.galaxy-pass]
name = "Galaxy Pass"
address = "0x5FbDB2315678afecb367f032d93F642f64180aa3"
chain_id = 8453
rpc_url = "https://base.example.org"
privileged_getter = ""

[contracts.badge]
name = "Badge"
address = "0xe7f1725E7734CE288F8367e1Bb143E90bb3F0512"
chain_id = 1
rpc_url = "https://eth.example.org"
block_time_ms = 12000
deployment_block = 17000000
transfer_event = "TransferSingle(address,address,address,uint256,uint256)""#;

    const BAD_CONFIG: &str = r#"
[engine]
error = ?"#;

    const BACKWARDS_CAMPAIGN: &str = r#"
[contracts.galaxy-pass]
name = "Galaxy Pass"
address = "0x5FbDB2315678afecb367f032d93F642f64180aa3"
chain_id = 8453
rpc_url = "https://base.example.org"

[contracts.galaxy-pass.campaigns.broken]
name = "Broken"
start = "2024-07-01T00:00:00Z"
end = "2024-06-01T00:00:00Z""#;

    fn write_config(data: &str, file: &mut File) {
        file.seek(std::io::SeekFrom::Start(0)).unwrap();
        file.write_all(data.as_bytes()).unwrap();
        file.set_len(data.len() as u64).unwrap();
    }

    #[tokio::test]
    async fn config_parser() {
        let mut config_temp = NamedTempFile::new().unwrap();
        write_config(CONFIG_TEMPL, config_temp.as_file_mut());
        let config = Config::load(config_temp.path()).await.unwrap();

        assert_eq!(config.engine.verification_timeout_ms, 5000);
        assert_eq!(config.engine.cache_ttl_secs, 120);
        assert_eq!(config.engine.cache_sweep_interval_secs, 60);
        assert_eq!(config.engine.block_estimation, BlockEstimation::Arithmetic);
        assert!(config.engine.trust_nonce_delta);
        assert_eq!(config.engine.retry.attempts, 2);
        assert_eq!(config.engine.retry.call_timeout_ms, 1000);
        assert_eq!(config.engine.retry.base_delay_ms, 250);
        assert_eq!(config.engine.scan, ScanConfig::default());

        let contract = &config.contracts["galaxy-pass"];
        assert_eq!(contract.id, "galaxy-pass");
        assert_eq!(contract.address, address!("5FbDB2315678afecb367f032d93F642f64180aa3"));
        assert_eq!(contract.chain_id, 8453);
        assert_eq!(contract.rpc_urls().len(), 2);
        assert_eq!(contract.deployment_block, 1);
        assert_eq!(contract.privileged_getter(), Some("minter()"));
        assert_eq!(contract.transfer_event, "Transfer(address,address,uint256)");

        let campaign = &contract.campaigns["summer"];
        assert_eq!(campaign.id, "summer");
        assert_eq!(campaign.start_timestamp(), 1_717_200_000);
        assert_eq!(campaign.end_timestamp(), 1_719_791_999);
        assert_eq!(campaign.description, "Mint during June");
    }

    #[tokio::test]
    #[should_panic(expected = "TOML parse error")]
    async fn bad_config() {
        let mut config_temp = NamedTempFile::new().unwrap();
        write_config(BAD_CONFIG, config_temp.as_file_mut());
        Config::load(config_temp.path()).await.unwrap();
    }

    #[tokio::test]
    async fn rejects_backwards_campaign() {
        let mut config_temp = NamedTempFile::new().unwrap();
        write_config(BACKWARDS_CAMPAIGN, config_temp.as_file_mut());
        let err = Config::load(config_temp.path()).await.unwrap_err();
        assert!(err.to_string().contains("start is after end"), "{err:?}");
    }

    #[test]
    fn rejects_zero_engine_values() {
        let mut config = Config::default();
        config.engine.retry.attempts = 0;
        assert!(matches!(config.validate(), Err(ConfigErr::InvalidConfig(_))));
    }

    #[test]
    fn signature_shape() {
        assert!(is_signature("minter()"));
        assert!(is_signature("Transfer(address,address,uint256)"));
        assert!(!is_signature("minter"));
        assert!(!is_signature("(address)"));
        assert!(!is_signature("owner ()"));
    }

    #[test]
    fn snapshot_lookups() {
        let mut config: Config = toml::from_str(CONFIG_TEMPL).unwrap();
        config.assign_ids();
        let lock = ConfigLock::new(config);
        let snapshot = lock.snapshot().unwrap();

        assert_eq!(snapshot.contract_ids(), vec!["galaxy-pass"]);
        assert!(snapshot.campaign("galaxy-pass", "summer").unwrap().is_some());
        assert!(snapshot.campaign("galaxy-pass", "winter").unwrap().is_none());
        assert!(matches!(
            snapshot.contract("missing"),
            Err(ConfigErr::ContractNotFound(id)) if id == "missing"
        ));
    }

    #[tokio::test]
    async fn replace_bumps_generation_and_notifies() {
        let lock = ConfigLock::default();
        let mut rx = lock.subscribe();
        assert_eq!(lock.snapshot().unwrap().generation, 0);

        let generation = lock.replace(Config::default()).unwrap();
        assert_eq!(generation, 1);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 1);
        assert_eq!(lock.snapshot().unwrap().generation, 1);
    }

    #[tokio::test]
    async fn reload_without_source_fails() {
        let lock = ConfigLock::default();
        let err = lock.reload().await.unwrap_err();
        assert!(err.to_string().contains("no backing file"), "{err:?}");
    }

    #[tokio::test]
    async fn round_trips_through_file() {
        let mut config: Config = toml::from_str(CONFIG_TEMPL_2).unwrap();
        config.assign_ids();
        let config_temp = NamedTempFile::new().unwrap();
        config.write(config_temp.path()).await.unwrap();
        let loaded = Config::load(config_temp.path()).await.unwrap();
        assert_eq!(loaded, config);
    }

    #[tokio::test]
    #[traced_test]
    async fn config_watcher() {
        let mut config_temp = NamedTempFile::new().unwrap();
        write_config(CONFIG_TEMPL, config_temp.as_file_mut());
        let config_mgnr = ConfigWatcher::new(config_temp.path()).await.unwrap();

        {
            let snapshot = config_mgnr.config.snapshot().unwrap();
            assert_eq!(snapshot.generation, 0);
            assert_eq!(snapshot.engine().verification_timeout_ms, 5000);
            assert_eq!(snapshot.contract_ids(), vec!["galaxy-pass"]);
        }

        write_config(CONFIG_TEMPL_2, config_temp.as_file_mut());
        tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;

        {
            let snapshot = config_mgnr.config.snapshot().unwrap();
            assert!(snapshot.generation >= 1);
            let engine = snapshot.engine();
            assert_eq!(engine.verification_timeout_ms, 3000);
            assert_eq!(engine.block_estimation, BlockEstimation::BinarySearch);
            assert!(!engine.trust_nonce_delta);
            assert_eq!(engine.scan.recent_blocks, 500);
            assert_eq!(engine.scan.sample_radius, 50);
            assert_eq!(engine.scan.batch_size, 2_000);
            assert_eq!(snapshot.contract_ids(), vec!["badge", "galaxy-pass"]);

            let pass = snapshot.contract("galaxy-pass").unwrap();
            assert!(pass.campaigns.is_empty());
            assert_eq!(pass.privileged_getter(), None);

            let badge = snapshot.contract("badge").unwrap();
            assert_eq!(badge.deployment_block, 17_000_000);
            assert_eq!(badge.block_time_ms, Some(12_000));
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn watcher_keeps_config_on_bad_reload() {
        let mut config_temp = NamedTempFile::new().unwrap();
        write_config(CONFIG_TEMPL, config_temp.as_file_mut());
        let config_mgnr = ConfigWatcher::new(config_temp.path()).await.unwrap();

        write_config(BAD_CONFIG, config_temp.as_file_mut());
        tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;

        let snapshot = config_mgnr.config.snapshot().unwrap();
        assert_eq!(snapshot.generation, 0);
        assert_eq!(snapshot.engine().verification_timeout_ms, 5000);
    }

    #[tokio::test]
    #[traced_test]
    #[should_panic(expected = "Failed to parse toml file")]
    async fn watcher_fail_startup() {
        let mut config_temp = NamedTempFile::new().unwrap();
        write_config(BAD_CONFIG, config_temp.as_file_mut());
        ConfigWatcher::new(config_temp.path()).await.unwrap();
    }
}
