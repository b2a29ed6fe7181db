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

//! Per-call timeout and bounded retry around every ledger query.

use std::{future::Future, sync::Arc};

use alloy::{
    primitives::{Address, B256},
    rpc::types::Log,
};
use tokio::time::Duration;

use crate::{
    config::{ContractProfile, RetryConfig},
    ledger::{BlockRange, Direction, LedgerClient, LedgerError, TransferFilter},
};

/// Head block number and its timestamp, read together at the start of a verification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Head {
    pub number: u64,
    pub timestamp: u64,
}

/// Result of a retried log query
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    Logs(Vec<Log>),
    /// Every attempt failed or timed out. This is "no evidence", not "no interaction".
    Exhausted,
}

impl QueryOutcome {
    pub fn found(&self) -> bool {
        matches!(self, QueryOutcome::Logs(logs) if !logs.is_empty())
    }
}

/// Combined sent and received lookup over one block range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeCheck {
    Found,
    Empty,
    /// At least one side could not be queried and neither side found anything
    Unavailable,
}

/// A contract's ledger client with the engine's retry policy applied
#[derive(Clone)]
pub struct GuardedLedger {
    ledger: Arc<dyn LedgerClient>,
    contract: Address,
    event: B256,
    retry: RetryConfig,
}

impl GuardedLedger {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        profile: &ContractProfile,
        retry: RetryConfig,
    ) -> Self {
        Self { ledger, contract: profile.address, event: profile.transfer_topic(), retry }
    }

    /// Runs `op` until it succeeds, racing each attempt against the call timeout and waiting
    /// `base_delay * attempt` between attempts.
    async fn with_retry<T, F, Fut>(&self, what: &str, op: F) -> Result<T, LedgerError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, LedgerError>>,
    {
        let attempts = self.retry.attempts.max(1);
        let call_timeout = Duration::from_millis(self.retry.call_timeout_ms);

        for attempt in 1..=attempts {
            let err = match tokio::time::timeout(call_timeout, op()).await {
                Ok(Ok(value)) => {
                    if attempt > 1 {
                        tracing::debug!("{what} succeeded after {} retries", attempt - 1);
                    }
                    return Ok(value);
                }
                Ok(Err(err)) => err.to_string(),
                Err(_) => format!("timed out after {}ms", self.retry.call_timeout_ms),
            };

            if attempt < attempts {
                let delay = Duration::from_millis(self.retry.base_delay_ms * attempt as u64);
                tracing::warn!(
                    "{what} failed (attempt {attempt}/{attempts}): {err}. Retrying in {}ms",
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            } else {
                tracing::warn!("{what} failed (attempt {attempt}/{attempts}): {err}");
            }
        }

        Err(LedgerError::Unavailable(what.to_string()))
    }

    pub async fn head(&self) -> Result<Head, LedgerError> {
        let number = self.with_retry("head block", || self.ledger.head_block_number()).await?;
        let timestamp =
            self.block_timestamp(number).await?.ok_or(LedgerError::MissingBlock(number))?;
        Ok(Head { number, timestamp })
    }

    pub async fn block_timestamp(&self, number: u64) -> Result<Option<u64>, LedgerError> {
        self.with_retry(&format!("block {number}"), || self.ledger.block_timestamp(number)).await
    }

    pub async fn transaction_count(
        &self,
        account: Address,
        block: u64,
    ) -> Result<u64, LedgerError> {
        self.with_retry(&format!("transaction count at block {block}"), || {
            self.ledger.transaction_count(account, block)
        })
        .await
    }

    /// Transfer logs for `account` on one side of the event. Exhausted retries are reported
    /// as [QueryOutcome::Exhausted] rather than an error.
    pub async fn query_with_retry(
        &self,
        account: Address,
        direction: Direction,
        range: BlockRange,
    ) -> QueryOutcome {
        let filter = TransferFilter {
            contract: self.contract,
            event: self.event,
            account,
            direction,
            range,
        };
        let what = format!("{direction:?} logs {range}");
        match self.with_retry(&what, || self.ledger.transfer_logs(&filter)).await {
            Ok(logs) => QueryOutcome::Logs(logs),
            Err(err) => {
                tracing::warn!("Giving up on {range} for {account}: {err}");
                QueryOutcome::Exhausted
            }
        }
    }

    /// Queries the sent and received sides of `range` concurrently
    pub async fn check_range(&self, account: Address, range: BlockRange) -> RangeCheck {
        let (sent, received) = tokio::join!(
            self.query_with_retry(account, Direction::Sent, range),
            self.query_with_retry(account, Direction::Received, range)
        );
        if sent.found() || received.found() {
            RangeCheck::Found
        } else if sent == QueryOutcome::Exhausted || received == QueryOutcome::Exhausted {
            RangeCheck::Unavailable
        } else {
            RangeCheck::Empty
        }
    }

    /// Address returned by the contract's privileged getter, if the call succeeds
    pub async fn privileged_account(&self, getter: &str) -> Option<Address> {
        let contract = self.contract;
        let what = format!("privileged getter {getter}");
        match self.with_retry(&what, || self.ledger.call_view(contract, getter)).await {
            Ok(output) if output.len() >= 32 => {
                Some(Address::from_word(B256::from_slice(&output[..32])))
            }
            Ok(output) => {
                tracing::debug!("{getter} returned {} bytes, expected an address", output.len());
                None
            }
            Err(err) => {
                tracing::debug!("Skipping privileged check: {err}");
                None
            }
        }
    }
}
