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

//! Deterministic in-memory ledger for engine and API tests.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU32, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use alloy::{
    primitives::{Address, Bytes, B256},
    rpc::types::Log,
    sol_types::SolEvent,
    transports::TransportError,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::{
    cache::VerdictCache,
    config::{Campaign, Config, ConfigLock, ContractProfile, EngineConfig, RetryConfig},
    ledger::{
        BlockRange, Direction, LedgerClient, LedgerError, LedgerFactory, Transfer, TransferFilter,
    },
    pool::LedgerPool,
    verifier::Verifier,
};

pub const GENESIS_TIMESTAMP: u64 = 1_700_000_000;
pub const BLOCK_TIME_SECS: u64 = 12;

/// Mock chain where block `n` has timestamp `GENESIS_TIMESTAMP + n * BLOCK_TIME_SECS`
pub struct MockLedger {
    head: u64,
    event: B256,
    transfers: Vec<(u64, Address, Address)>,
    outgoing: HashMap<Address, Vec<u64>>,
    privileged: Option<(String, Address)>,
    missing_blocks: HashSet<u64>,
    max_log_range: Option<u64>,
    unresponsive: bool,
    delay: Option<Duration>,
    failures_remaining: AtomicU32,
    queries: AtomicUsize,
    log_queries: AtomicUsize,
    queried_ranges: Mutex<Vec<BlockRange>>,
}

impl MockLedger {
    pub fn new(head: u64) -> Self {
        Self {
            head,
            event: Transfer::SIGNATURE_HASH,
            transfers: vec![],
            outgoing: HashMap::new(),
            privileged: None,
            missing_blocks: HashSet::new(),
            max_log_range: None,
            unresponsive: false,
            delay: None,
            failures_remaining: AtomicU32::new(0),
            queries: AtomicUsize::new(0),
            log_queries: AtomicUsize::new(0),
            queried_ranges: Mutex::new(vec![]),
        }
    }

    pub fn timestamp_of(block: u64) -> u64 {
        GENESIS_TIMESTAMP + block * BLOCK_TIME_SECS
    }

    /// Adds a transfer event log at `block`
    pub fn with_transfer(mut self, block: u64, from: Address, to: Address) -> Self {
        self.transfers.push((block, from, to));
        self
    }

    /// Adds a transaction sent by `account` at `block`, bumping its nonce
    pub fn with_outgoing_tx(mut self, account: Address, block: u64) -> Self {
        self.outgoing.entry(account).or_default().push(block);
        self
    }

    /// `getter` returns `account`, e.g. `minter()`
    pub fn with_privileged(mut self, getter: &str, account: Address) -> Self {
        self.privileged = Some((getter.to_string(), account));
        self
    }

    pub fn with_missing_block(mut self, block: u64) -> Self {
        self.missing_blocks.insert(block);
        self
    }

    /// Log queries spanning more blocks than this fail, like a capped provider
    pub fn with_max_log_range(mut self, blocks: u64) -> Self {
        self.max_log_range = Some(blocks);
        self
    }

    /// Every call hangs forever
    pub fn unresponsive(mut self) -> Self {
        self.unresponsive = true;
        self
    }

    /// Every call takes at least `delay`
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// The next `count` calls fail
    pub fn failing_calls(self, count: u32) -> Self {
        self.failures_remaining.store(count, Ordering::SeqCst);
        self
    }

    /// Total calls of any kind
    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn log_queries(&self) -> usize {
        self.log_queries.load(Ordering::SeqCst)
    }

    pub fn queried_ranges(&self) -> Vec<BlockRange> {
        self.queried_ranges.lock().map(|ranges| ranges.clone()).unwrap_or_default()
    }

    async fn enter(&self) -> Result<(), LedgerError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if self.unresponsive {
            std::future::pending::<()>().await;
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let injected = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(TransportError::local_usage_str("injected failure").into());
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerClient for MockLedger {
    async fn head_block_number(&self) -> Result<u64, LedgerError> {
        self.enter().await?;
        Ok(self.head)
    }

    async fn block_timestamp(&self, number: u64) -> Result<Option<u64>, LedgerError> {
        self.enter().await?;
        if number > self.head || self.missing_blocks.contains(&number) {
            return Ok(None);
        }
        Ok(Some(Self::timestamp_of(number)))
    }

    async fn transaction_count(&self, account: Address, block: u64) -> Result<u64, LedgerError> {
        self.enter().await?;
        let sent = self.outgoing.get(&account).map(|blocks| {
            blocks.iter().filter(|&&sent_at| sent_at <= block).count() as u64
        });
        Ok(sent.unwrap_or(0))
    }

    async fn transfer_logs(&self, filter: &TransferFilter) -> Result<Vec<Log>, LedgerError> {
        self.enter().await?;
        self.log_queries.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut ranges) = self.queried_ranges.lock() {
            ranges.push(filter.range);
        }
        if let Some(max) = self.max_log_range {
            if filter.range.len() > max {
                return Err(TransportError::local_usage_str("block range too large").into());
            }
        }
        if filter.event != self.event {
            return Ok(vec![]);
        }

        let logs = self
            .transfers
            .iter()
            .filter(|(block, from, to)| {
                let party = match filter.direction {
                    Direction::Sent => from,
                    Direction::Received => to,
                };
                filter.range.contains(*block) && *party == filter.account
            })
            .map(|(block, _, _)| Log {
                block_number: Some(*block),
                block_timestamp: Some(Self::timestamp_of(*block)),
                ..Default::default()
            })
            .collect();
        Ok(logs)
    }

    async fn call_view(&self, _contract: Address, signature: &str) -> Result<Bytes, LedgerError> {
        self.enter().await?;
        match &self.privileged {
            Some((getter, account)) if getter == signature => {
                Ok(Bytes::copy_from_slice(account.into_word().as_slice()))
            }
            _ => Err(TransportError::local_usage_str("execution reverted").into()),
        }
    }
}

/// Hands out preconfigured [MockLedger]s by contract id
#[derive(Default)]
pub struct MockLedgerFactory {
    ledgers: HashMap<String, Arc<MockLedger>>,
    connects: AtomicUsize,
}

impl MockLedgerFactory {
    pub fn with_ledger(mut self, contract_id: &str, ledger: MockLedger) -> Self {
        self.ledgers.insert(contract_id.to_string(), Arc::new(ledger));
        self
    }

    pub fn ledger(&self, contract_id: &str) -> Arc<MockLedger> {
        self.ledgers[contract_id].clone()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl LedgerFactory for MockLedgerFactory {
    fn connect(&self, profile: &ContractProfile) -> Result<Arc<dyn LedgerClient>> {
        let ledger = self
            .ledgers
            .get(&profile.id)
            .cloned()
            .ok_or_else(|| anyhow!("no mock ledger for contract {}", profile.id))?;
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(ledger)
    }
}

/// Profile whose block time matches [MockLedger]
pub fn contract_profile(id: &str, address: Address) -> ContractProfile {
    ContractProfile {
        id: id.to_string(),
        name: format!("{id} contract"),
        address,
        chain_id: 31337,
        rpc_url: "http://localhost:8545".parse().expect("static url"),
        fallback_rpc_urls: vec![],
        block_time_ms: Some(BLOCK_TIME_SECS * 1000),
        deployment_block: 1,
        privileged_getter: crate::config::defaults::privileged_getter(),
        transfer_event: crate::config::defaults::transfer_event(),
        campaigns: Default::default(),
    }
}

pub fn campaign(id: &str, start: u64, end: u64) -> Campaign {
    Campaign {
        id: id.to_string(),
        name: format!("{id} campaign"),
        start: chrono::DateTime::from_timestamp(start as i64, 0).expect("valid timestamp"),
        end: chrono::DateTime::from_timestamp(end as i64, 0).expect("valid timestamp"),
        description: String::new(),
    }
}

/// Engine settings with short timeouts so failure paths finish quickly
pub fn fast_engine() -> EngineConfig {
    EngineConfig {
        verification_timeout_ms: 2_000,
        retry: RetryConfig { attempts: 2, call_timeout_ms: 200, base_delay_ms: 10 },
        ..Default::default()
    }
}

/// Config with the given profiles and [fast_engine] settings
pub fn config_with(profiles: impl IntoIterator<Item = ContractProfile>) -> Config {
    let mut config = Config { engine: fast_engine(), ..Default::default() };
    for profile in profiles {
        config.contracts.insert(profile.id.clone(), profile);
    }
    config.assign_ids();
    config
}

/// Verifier over in-memory config and mock ledgers
pub fn mock_verifier(config: Config, factory: Arc<MockLedgerFactory>) -> Verifier {
    let cache = VerdictCache::new(config.engine.cache_ttl());
    Verifier::new(ConfigLock::new(config), Arc::new(LedgerPool::new(factory)), cache)
}
