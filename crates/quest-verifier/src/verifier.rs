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

//! Verification entry points.
//!
//! A request resolves its contract and window from the current config snapshot, then tries,
//! in order: the verdict cache, the contract's privileged account, the nonce based direct
//! check and finally the activity scanner. Everything after the cache lookup races the
//! verification deadline. Ledger trouble of any kind ends in a negative verdict.

use std::{str::FromStr, sync::Arc};

use alloy::primitives::Address;
use serde::Serialize;
use thiserror::Error;
use tokio::{sync::watch, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    blocks::{estimator, window_blocks},
    cache::{CacheKey, VerdictCache},
    config::{ConfigErr, ConfigLock, ConfigSnapshot, ContractProfile},
    direct::DirectChecker,
    errors::CodedError,
    impl_coded_debug,
    ledger::BlockRange,
    pool::LedgerPool,
    retry::GuardedLedger,
    scanner::ActivityScanner,
    task::{RetryRes, RetryTask, SupervisorErr},
};

#[derive(Error)]
pub enum VerifyError {
    #[error("{code} Invalid input: {0}", code = self.code())]
    InvalidInput(String),

    #[error("{code} Contract not found: {0}", code = self.code())]
    ContractNotFound(String),

    #[error("{code} Campaign {campaign} not found for contract {contract}", code = self.code())]
    CampaignNotFound { contract: String, campaign: String },
}

impl_coded_debug!(VerifyError);

impl CodedError for VerifyError {
    fn code(&self) -> &str {
        match self {
            VerifyError::InvalidInput(_) => "[QV-VER-001]",
            VerifyError::ContractNotFound(_) => "[QV-VER-002]",
            VerifyError::CampaignNotFound { .. } => "[QV-VER-003]",
        }
    }
}

/// A validated verification request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationRequest {
    pub address: Address,
    pub contract_id: String,
    /// Takes precedence over `range`
    pub campaign_id: Option<String>,
    /// Inclusive unix second bounds
    pub range: Option<(u64, u64)>,
}

impl VerificationRequest {
    pub fn new(address: &str, contract_id: &str) -> Result<Self, VerifyError> {
        let address = address.trim();
        let contract_id = contract_id.trim();
        if address.is_empty() {
            return Err(VerifyError::InvalidInput("address is required".into()));
        }
        if contract_id.is_empty() {
            return Err(VerifyError::InvalidInput("contract is required".into()));
        }
        let address = Address::from_str(address).map_err(|err| {
            VerifyError::InvalidInput(format!("malformed address {address:?}: {err}"))
        })?;
        Ok(Self { address, contract_id: contract_id.to_string(), campaign_id: None, range: None })
    }

    /// Blank campaign ids are ignored
    pub fn with_campaign(mut self, campaign_id: Option<&str>) -> Self {
        self.campaign_id =
            campaign_id.map(str::trim).filter(|id| !id.is_empty()).map(ToString::to_string);
        self
    }

    pub fn with_range(mut self, start: u64, end: u64) -> Result<Self, VerifyError> {
        if start > end {
            return Err(VerifyError::InvalidInput(format!("start {start} is after end {end}")));
        }
        self.range = Some((start, end));
        Ok(self)
    }
}

/// The time span a request covers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Window {
    /// From the contract's deployment block to the head
    All,
    Campaign { id: String, start: u64, end: u64 },
    Range { start: u64, end: u64 },
}

impl Window {
    fn scope(&self) -> &str {
        match self {
            Window::All => "all",
            Window::Campaign { id, .. } => id,
            Window::Range { .. } => "custom",
        }
    }

    fn bounds(&self) -> Option<(u64, u64)> {
        match self {
            Window::All => None,
            Window::Campaign { start, end, .. } | Window::Range { start, end } => {
                Some((*start, *end))
            }
        }
    }
}

/// Where a verdict came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictSource {
    Cache,
    Privileged,
    Direct,
    Scan,
    /// Every planned query succeeded and found nothing
    NotFound,
    /// The window starts after the current head block
    NotStarted,
    /// The verification deadline expired first
    Deadline,
    /// The ledger could not be reached or some ranges could not be queried
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub eligible: bool,
    pub source: VerdictSource,
}

impl Verdict {
    fn eligible(source: VerdictSource) -> Self {
        Self { eligible: true, source }
    }

    fn ineligible(source: VerdictSource) -> Self {
        Self { eligible: false, source }
    }

    /// Degraded negatives are not cached so a slow node cannot pin them for a whole TTL
    fn cacheable(&self) -> bool {
        matches!(
            self.source,
            VerdictSource::Privileged
                | VerdictSource::Direct
                | VerdictSource::Scan
                | VerdictSource::NotFound
        )
    }
}

pub struct Verifier {
    config: ConfigLock,
    pool: Arc<LedgerPool>,
    cache: VerdictCache,
}

impl Verifier {
    pub fn new(config: ConfigLock, pool: Arc<LedgerPool>, cache: VerdictCache) -> Self {
        Self { config, pool, cache }
    }

    pub fn config(&self) -> &ConfigLock {
        &self.config
    }

    pub fn cache(&self) -> &VerdictCache {
        &self.cache
    }

    pub fn pool(&self) -> &Arc<LedgerPool> {
        &self.pool
    }

    /// Has `address` interacted with the contract, within the campaign if one is given
    pub async fn verify(
        &self,
        address: &str,
        contract_id: &str,
        campaign_id: Option<&str>,
    ) -> Result<bool, VerifyError> {
        let request = VerificationRequest::new(address, contract_id)?.with_campaign(campaign_id);
        Ok(self.verify_request(&request).await?.eligible)
    }

    /// Has `address` interacted with the contract between two unix timestamps, inclusive
    pub async fn verify_in_range(
        &self,
        address: &str,
        contract_id: &str,
        start: u64,
        end: u64,
    ) -> Result<bool, VerifyError> {
        let request = VerificationRequest::new(address, contract_id)?.with_range(start, end)?;
        Ok(self.verify_request(&request).await?.eligible)
    }

    pub async fn verify_request(
        &self,
        request: &VerificationRequest,
    ) -> Result<Verdict, VerifyError> {
        let started = Instant::now();
        let snapshot = match self.config.snapshot() {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::error!("Failed to read config: {err}");
                return Ok(Verdict::ineligible(VerdictSource::Unavailable));
            }
        };
        let (profile, window) = resolve(&snapshot, request)?;

        let key = CacheKey {
            generation: snapshot.generation,
            contract_id: profile.id.clone(),
            scope: window.scope().to_string(),
            address: request.address,
            bounds: window.bounds(),
        };
        if let Some(eligible) = self.cache.get(&key) {
            tracing::debug!(
                "Cached verdict for {} on {}/{}: {eligible}",
                request.address,
                key.contract_id,
                key.scope
            );
            return Ok(Verdict { eligible, source: VerdictSource::Cache });
        }

        let deadline = started + snapshot.engine().verification_timeout();
        let verdict = match tokio::time::timeout_at(
            deadline,
            self.search(&snapshot, profile, &window, request.address, deadline),
        )
        .await
        {
            Ok(verdict) => verdict,
            Err(_) => {
                tracing::warn!(
                    "Verification of {} on {} hit the {}ms deadline",
                    request.address,
                    profile.id,
                    snapshot.engine().verification_timeout_ms
                );
                Verdict::ineligible(VerdictSource::Deadline)
            }
        };

        if verdict.cacheable() {
            self.cache.set(key, verdict.eligible);
        }
        tracing::info!(
            "Verified {} on {}/{}: {} ({:?}) in {}ms",
            request.address,
            profile.id,
            window.scope(),
            verdict.eligible,
            verdict.source,
            started.elapsed().as_millis()
        );
        Ok(verdict)
    }

    async fn search(
        &self,
        snapshot: &ConfigSnapshot,
        profile: &ContractProfile,
        window: &Window,
        address: Address,
        deadline: Instant,
    ) -> Verdict {
        let engine = snapshot.engine();
        let client = match self.pool.get(profile, snapshot.generation) {
            Ok(client) => client,
            Err(err) => {
                tracing::warn!("No ledger client for {}: {err:?}", profile.id);
                return Verdict::ineligible(VerdictSource::Unavailable);
            }
        };
        let ledger = GuardedLedger::new(client, profile, engine.retry.clone());

        if let Some(getter) = profile.privileged_getter() {
            if ledger.privileged_account(getter).await == Some(address) {
                return Verdict::eligible(VerdictSource::Privileged);
            }
        }

        let head = match ledger.head().await {
            Ok(head) => head,
            Err(err) => {
                tracing::warn!("Failed to read head block for {}: {err}", profile.id);
                return Verdict::ineligible(VerdictSource::Unavailable);
            }
        };

        let blocks = match window.bounds() {
            None => Some(BlockRange::new(profile.deployment_block, head.number)),
            Some((start, end)) => {
                let estimator = estimator(profile, engine);
                match window_blocks(estimator.as_ref(), &ledger, head, start, end).await {
                    Ok(blocks) => blocks,
                    Err(err) => {
                        tracing::warn!("Failed to map window to blocks for {}: {err}", profile.id);
                        return Verdict::ineligible(VerdictSource::Unavailable);
                    }
                }
            }
        };
        let Some(blocks) = blocks else {
            return Verdict::ineligible(VerdictSource::NotStarted);
        };
        // Nothing can happen before the contract exists
        if blocks.to < profile.deployment_block {
            return Verdict::ineligible(VerdictSource::NotFound);
        }
        let blocks = BlockRange::new(blocks.from.max(profile.deployment_block), blocks.to);
        tracing::debug!("Checking {address} on {} over blocks {blocks}", profile.id);

        let direct =
            DirectChecker::new(&ledger, engine.scan.max_query_range, engine.trust_nonce_delta);
        if direct.has_direct_interaction(address, blocks).await {
            return Verdict::eligible(VerdictSource::Direct);
        }

        let report = ActivityScanner::new(&ledger, &engine.scan, deadline)
            .has_activity(address, blocks)
            .await;
        if report.found {
            Verdict::eligible(VerdictSource::Scan)
        } else if report.deadline_hit {
            Verdict::ineligible(VerdictSource::Deadline)
        } else if report.conclusive() {
            Verdict::ineligible(VerdictSource::NotFound)
        } else {
            Verdict::ineligible(VerdictSource::Unavailable)
        }
    }

    /// Re-reads the config file and drops everything built from the old one
    pub async fn reload(&self) -> anyhow::Result<u64> {
        let generation = self.config.reload().await?;
        self.invalidate();
        if let Ok(snapshot) = self.config.snapshot() {
            self.cache.set_ttl(snapshot.engine().cache_ttl());
        }
        Ok(generation)
    }

    pub fn clear_cache(&self) -> usize {
        let cleared = self.cache.clear();
        tracing::info!("Cleared {cleared} cached verdicts");
        cleared
    }

    /// Drops pooled ledger clients and cached verdicts
    pub fn invalidate(&self) {
        self.pool.clear();
        self.cache.clear();
    }
}

fn resolve<'a>(
    snapshot: &'a ConfigSnapshot,
    request: &VerificationRequest,
) -> Result<(&'a ContractProfile, Window), VerifyError> {
    let profile = snapshot.contract(&request.contract_id).map_err(|err| match err {
        ConfigErr::ContractNotFound(id) => VerifyError::ContractNotFound(id),
        other => VerifyError::ContractNotFound(format!("{}: {other}", request.contract_id)),
    })?;

    let window = match (&request.campaign_id, request.range) {
        (Some(campaign_id), _) => {
            let campaign = profile.campaigns.get(campaign_id).ok_or_else(|| {
                VerifyError::CampaignNotFound {
                    contract: profile.id.clone(),
                    campaign: campaign_id.clone(),
                }
            })?;
            Window::Campaign {
                id: campaign.id.clone(),
                start: campaign.start_timestamp(),
                end: campaign.end_timestamp(),
            }
        }
        (None, Some((start, end))) => Window::Range { start, end },
        (None, None) => Window::All,
    };
    Ok((profile, window))
}

/// Drops pooled clients and cached verdicts whenever the config generation changes
#[derive(Clone)]
pub struct ReloadListener {
    verifier: Arc<Verifier>,
    /// Subscribed on construction so replacements made before the first spawn are seen
    updates: watch::Receiver<u64>,
}

impl ReloadListener {
    pub fn new(verifier: Arc<Verifier>) -> Self {
        let updates = verifier.config.subscribe();
        Self { verifier, updates }
    }

    async fn listen(&self, cancel_token: CancellationToken) -> Result<(), ConfigErr> {
        let mut updates = self.updates.clone();
        loop {
            tokio::select! {
                changed = updates.changed() => {
                    if changed.is_err() {
                        tracing::warn!("Config notifier closed, reload listener exiting");
                        return Ok(());
                    }
                    let generation = *updates.borrow_and_update();
                    let ttl = self.verifier.config.snapshot()?.engine().cache_ttl();
                    self.verifier.invalidate();
                    self.verifier.cache.set_ttl(ttl);
                    tracing::info!(
                        "Config generation {generation} active, ledger clients and verdicts dropped"
                    );
                }
                _ = cancel_token.cancelled() => {
                    tracing::info!("Reload listener shutting down");
                    return Ok(());
                }
            }
        }
    }
}

impl RetryTask for ReloadListener {
    type Error = ConfigErr;

    fn spawn(&self, cancel_token: CancellationToken) -> RetryRes<Self::Error> {
        let this = self.clone();
        Box::pin(async move { this.listen(cancel_token).await.map_err(SupervisorErr::Recover) })
    }
}
