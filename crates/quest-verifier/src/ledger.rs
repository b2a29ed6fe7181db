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

//! Read-only ledger access used by the verification engine.

use std::{num::NonZeroUsize, sync::Arc};

use alloy::{
    network::Ethereum,
    primitives::{keccak256, Address, Bytes, B256},
    providers::{DynProvider, Provider, ProviderBuilder},
    rpc::{
        client::RpcClient,
        types::{BlockId, BlockNumberOrTag, Filter, Log, TransactionInput, TransactionRequest},
    },
    sol,
    transports::{http::Http, layers::FallbackLayer, TransportError},
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use thiserror::Error;
use tower::ServiceBuilder;

use crate::{
    config::ContractProfile,
    errors::CodedError,
    impl_coded_debug,
    rpcmetrics::{RpcMetricsLayer, RpcMetricsStats, RpcMetricsSummary},
};

sol! {
    /// Default transfer-like event tracked for interactions
    event Transfer(address indexed from, address indexed to, uint256 value);
}

#[derive(Error)]
pub enum LedgerError {
    #[error("{code} RPC request failed: {0}", code = self.code())]
    Rpc(#[from] TransportError),

    #[error("{code} Block {0} not found", code = self.code())]
    MissingBlock(u64),

    #[error("{code} {0} unavailable after retries", code = self.code())]
    Unavailable(String),
}

impl_coded_debug!(LedgerError);

impl CodedError for LedgerError {
    fn code(&self) -> &str {
        match self {
            LedgerError::Rpc(_) => "[QV-LED-501]",
            LedgerError::MissingBlock(_) => "[QV-LED-502]",
            LedgerError::Unavailable(_) => "[QV-LED-503]",
        }
    }
}

/// Inclusive block interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRange {
    pub from: u64,
    pub to: u64,
}

impl BlockRange {
    /// Builds a range from two bounds in either order
    pub fn new(a: u64, b: u64) -> Self {
        Self { from: a.min(b), to: a.max(b) }
    }

    pub fn len(&self) -> u64 {
        self.to - self.from + 1
    }

    pub fn contains(&self, block: u64) -> bool {
        self.from <= block && block <= self.to
    }

    pub fn midpoint(&self) -> u64 {
        self.from + (self.to - self.from) / 2
    }

    /// The last `blocks` blocks of the range
    pub fn tail(&self, blocks: u64) -> Self {
        let blocks = blocks.max(1).min(self.len());
        Self { from: self.to + 1 - blocks, to: self.to }
    }

    /// Everything strictly before `block`, if anything
    pub fn before(&self, block: u64) -> Option<Self> {
        (block > self.from).then(|| Self { from: self.from, to: self.to.min(block - 1) })
    }

    /// `center +- radius`, clipped to this range
    pub fn around(&self, center: u64, radius: u64) -> Self {
        let center = center.clamp(self.from, self.to);
        Self {
            from: center.saturating_sub(radius).max(self.from),
            to: center.saturating_add(radius).min(self.to),
        }
    }

    /// Splits into consecutive pieces of at most `size` blocks, latest piece first
    pub fn chunks_rev(&self, size: u64) -> Vec<Self> {
        let size = size.max(1);
        let mut chunks = Vec::with_capacity((self.len() / size + 1) as usize);
        let mut to = self.to;
        loop {
            let from = to.saturating_sub(size - 1).max(self.from);
            chunks.push(Self { from, to });
            if from == self.from {
                break;
            }
            to = from - 1;
        }
        chunks
    }

    /// Most recent third first, then the middle third, then the earliest third
    pub fn thirds_recent_first(&self) -> Vec<Self> {
        let len = self.len();
        if len < 3 {
            return vec![*self];
        }
        let third = len / 3;
        let early = Self { from: self.from, to: self.from + third - 1 };
        let middle = Self { from: early.to + 1, to: early.to + third };
        let late = Self { from: middle.to + 1, to: self.to };
        vec![late, middle, early]
    }
}

impl std::fmt::Display for BlockRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.from, self.to)
    }
}

/// Which side of the transfer event the account appears on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Sent,
    Received,
}

/// Transfer-event log query for one account over one block range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferFilter {
    pub contract: Address,
    pub event: B256,
    pub account: Address,
    pub direction: Direction,
    pub range: BlockRange,
}

impl TransferFilter {
    pub fn to_filter(&self) -> Filter {
        let filter = Filter::new()
            .address(self.contract)
            .event_signature(self.event)
            .from_block(self.range.from)
            .to_block(self.range.to);
        match self.direction {
            Direction::Sent => filter.topic1(self.account.into_word()),
            Direction::Received => filter.topic2(self.account.into_word()),
        }
    }
}

/// Read-only view of one chain, bound to the endpoints of a contract profile
#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn head_block_number(&self) -> Result<u64, LedgerError>;

    /// `None` when the node does not know the block
    async fn block_timestamp(&self, number: u64) -> Result<Option<u64>, LedgerError>;

    /// Account nonce after `block` has been applied
    async fn transaction_count(&self, account: Address, block: u64) -> Result<u64, LedgerError>;

    async fn transfer_logs(&self, filter: &TransferFilter) -> Result<Vec<Log>, LedgerError>;

    /// `eth_call` of a zero-argument view function given by its signature, e.g. `minter()`
    async fn call_view(&self, contract: Address, signature: &str) -> Result<Bytes, LedgerError>;

    /// Transport counters, for clients that keep them
    fn rpc_metrics(&self) -> Option<RpcMetricsSummary> {
        None
    }
}

/// Builds ledger clients for contract profiles
pub trait LedgerFactory: Send + Sync {
    fn connect(&self, profile: &ContractProfile) -> Result<Arc<dyn LedgerClient>>;
}

/// Four byte selector for a function signature
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// JSON-RPC backed client
pub struct RpcLedgerClient {
    provider: DynProvider<Ethereum>,
    metrics: Arc<RpcMetricsStats>,
}

impl RpcLedgerClient {
    pub fn connect(profile: &ContractProfile) -> Result<Self> {
        let urls = profile.rpc_urls();
        let metrics_layer = RpcMetricsLayer::new(&profile.id);
        let metrics = metrics_layer.stats();

        // Build RPC client with fallback support if multiple URLs are provided
        let client = if urls.len() > 1 {
            let transports: Vec<Http<reqwest::Client>> =
                urls.iter().map(|url| Http::new(url.clone())).collect();

            let active_count =
                NonZeroUsize::new(transports.len()).unwrap_or(NonZeroUsize::MIN);
            let fallback_layer =
                FallbackLayer::default().with_active_transport_count(active_count);

            tracing::info!(
                "Configuring contract {} with fallback RPC support: {} URLs",
                profile.id,
                urls.len()
            );

            let transport = ServiceBuilder::new()
                .layer(metrics_layer)
                .layer(fallback_layer)
                .service(transports);

            RpcClient::builder().transport(transport, false)
        } else {
            let single_url = urls.first().context("contract has no RPC url")?;
            tracing::info!("Configuring contract {} with single RPC URL", profile.id);
            RpcClient::builder().layer(metrics_layer).http(single_url.clone())
        };

        let provider =
            ProviderBuilder::new().disable_recommended_fillers().connect_client(client).erased();

        Ok(Self { provider, metrics })
    }
}

#[async_trait]
impl LedgerClient for RpcLedgerClient {
    async fn head_block_number(&self) -> Result<u64, LedgerError> {
        Ok(self.provider.get_block_number().await?)
    }

    async fn block_timestamp(&self, number: u64) -> Result<Option<u64>, LedgerError> {
        let block = self.provider.get_block_by_number(BlockNumberOrTag::Number(number)).await?;
        Ok(block.map(|block| block.header.timestamp))
    }

    async fn transaction_count(&self, account: Address, block: u64) -> Result<u64, LedgerError> {
        Ok(self.provider.get_transaction_count(account).block_id(BlockId::number(block)).await?)
    }

    async fn transfer_logs(&self, filter: &TransferFilter) -> Result<Vec<Log>, LedgerError> {
        Ok(self.provider.get_logs(&filter.to_filter()).await?)
    }

    async fn call_view(&self, contract: Address, signature: &str) -> Result<Bytes, LedgerError> {
        let tx = TransactionRequest::default()
            .to(contract)
            .input(TransactionInput::new(Bytes::copy_from_slice(&selector(signature))));
        Ok(self.provider.call(tx).await?)
    }

    fn rpc_metrics(&self) -> Option<RpcMetricsSummary> {
        Some(self.metrics.summary())
    }
}

/// Connects [RpcLedgerClient]s
#[derive(Debug, Clone, Copy, Default)]
pub struct RpcLedgerFactory;

impl LedgerFactory for RpcLedgerFactory {
    fn connect(&self, profile: &ContractProfile) -> Result<Arc<dyn LedgerClient>> {
        let client = RpcLedgerClient::connect(profile)
            .with_context(|| format!("Failed to connect ledger for contract {}", profile.id))?;
        Ok(Arc::new(client))
    }
}
