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

//! Mapping wall-clock timestamps to approximate block numbers.

use alloy_chains::Chain;
use async_trait::async_trait;
use tokio::time::Duration;

use crate::{
    config::{BlockEstimation, ContractProfile, EngineConfig},
    ledger::{BlockRange, LedgerError},
    retry::{GuardedLedger, Head},
};

/// Converts a unix timestamp into a block number at or below `head`
#[async_trait]
pub trait BlockEstimator: Send + Sync {
    async fn block_for_timestamp(
        &self,
        ledger: &GuardedLedger,
        head: Head,
        timestamp: u64,
    ) -> Result<u64, LedgerError>;
}

/// Head block minus the elapsed time in average block intervals. Costs no ledger queries.
#[derive(Debug, Clone, Copy)]
pub struct Arithmetic {
    pub block_time: Duration,
}

#[async_trait]
impl BlockEstimator for Arithmetic {
    async fn block_for_timestamp(
        &self,
        _ledger: &GuardedLedger,
        head: Head,
        timestamp: u64,
    ) -> Result<u64, LedgerError> {
        if timestamp >= head.timestamp {
            return Ok(head.number);
        }
        let elapsed_ms = (head.timestamp - timestamp).saturating_mul(1000);
        let blocks = elapsed_ms / (self.block_time.as_millis() as u64).max(1);
        Ok(head.number.saturating_sub(blocks).max(1))
    }
}

/// Blocks checked on each side of an unreadable search pivot
const MAX_NEIGHBOR_STEPS: u64 = 8;

/// Bounded binary search over block timestamps in `[1, head]`.
///
/// Returns the closest block seen when the iterations run out before an exact match. A pivot
/// the node cannot return is replaced by the nearest readable block inside the search bounds;
/// if none is found nearby the mapping fails rather than guessing a side.
#[derive(Debug, Clone, Copy)]
pub struct BinarySearch {
    pub max_iterations: u32,
}

#[async_trait]
impl BlockEstimator for BinarySearch {
    async fn block_for_timestamp(
        &self,
        ledger: &GuardedLedger,
        head: Head,
        timestamp: u64,
    ) -> Result<u64, LedgerError> {
        if timestamp >= head.timestamp {
            return Ok(head.number);
        }

        let mut lo = 1u64;
        let mut hi = head.number;
        // (block, |block timestamp - target|)
        let mut closest = (head.number, head.timestamp - timestamp);

        for _ in 0..self.max_iterations {
            if lo > hi {
                break;
            }
            let mid = lo + (hi - lo) / 2;
            let Some((pivot, block_ts)) = readable_near(ledger, mid, lo, hi).await? else {
                tracing::warn!("No readable block near {mid} in [{lo}, {hi}]");
                return Err(LedgerError::MissingBlock(mid));
            };

            let delta = block_ts.abs_diff(timestamp);
            if delta < closest.1 || (delta == closest.1 && pivot < closest.0) {
                closest = (pivot, delta);
            }
            if block_ts == timestamp {
                return Ok(pivot);
            }
            if block_ts < timestamp {
                lo = pivot + 1;
            } else {
                hi = pivot.saturating_sub(1);
            }
        }

        Ok(closest.0)
    }
}

/// `mid` or the nearest block to it within `[lo, hi]` that the node returns, with its
/// timestamp. Looks at most [MAX_NEIGHBOR_STEPS] blocks away on either side.
async fn readable_near(
    ledger: &GuardedLedger,
    mid: u64,
    lo: u64,
    hi: u64,
) -> Result<Option<(u64, u64)>, LedgerError> {
    if let Some(ts) = ledger.block_timestamp(mid).await? {
        return Ok(Some((mid, ts)));
    }
    for step in 1..=MAX_NEIGHBOR_STEPS {
        let above = mid.checked_add(step).filter(|block| *block <= hi);
        let below = mid.checked_sub(step).filter(|block| *block >= lo);
        if above.is_none() && below.is_none() {
            break;
        }
        for block in [above, below].into_iter().flatten() {
            if let Some(ts) = ledger.block_timestamp(block).await? {
                tracing::debug!("Block {mid} did not resolve, searching from {block}");
                return Ok(Some((block, ts)));
            }
        }
    }
    Ok(None)
}

/// Average block interval for a contract: its own override, then the chain's known hint, then
/// the engine default.
pub fn block_time(profile: &ContractProfile, engine: &EngineConfig) -> Duration {
    if let Some(ms) = profile.block_time_ms {
        return Duration::from_millis(ms);
    }
    Chain::from_id(profile.chain_id)
        .average_blocktime_hint()
        .filter(|hint| !hint.is_zero())
        .unwrap_or_else(|| Duration::from_millis(engine.default_block_time_ms))
}

pub fn estimator(profile: &ContractProfile, engine: &EngineConfig) -> Box<dyn BlockEstimator> {
    match engine.block_estimation {
        BlockEstimation::Arithmetic => {
            Box::new(Arithmetic { block_time: block_time(profile, engine) })
        }
        BlockEstimation::BinarySearch => {
            Box::new(BinarySearch { max_iterations: engine.binary_search_max_iterations })
        }
    }
}

/// Block range covering `[start, end]` in time, or `None` when the window starts after the
/// head block.
pub async fn window_blocks(
    estimator: &dyn BlockEstimator,
    ledger: &GuardedLedger,
    head: Head,
    start: u64,
    end: u64,
) -> Result<Option<BlockRange>, LedgerError> {
    if start > head.timestamp {
        return Ok(None);
    }
    let from = estimator.block_for_timestamp(ledger, head, start).await?;
    let to = estimator.block_for_timestamp(ledger, head, end).await?;
    Ok(Some(BlockRange::new(from, to)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::RetryConfig,
        test_utils::{contract_profile, MockLedger, BLOCK_TIME_SECS},
    };
    use alloy::primitives::Address;
    use proptest::prelude::*;
    use std::sync::Arc;

    const HEAD: u64 = 1_000_000;

    fn ledger(mock: MockLedger) -> GuardedLedger {
        let retry = RetryConfig { attempts: 1, call_timeout_ms: 1_000, base_delay_ms: 1 };
        GuardedLedger::new(Arc::new(mock), &contract_profile("pass", Address::ZERO), retry)
    }

    fn head() -> Head {
        Head { number: HEAD, timestamp: MockLedger::timestamp_of(HEAD) }
    }

    fn arithmetic() -> Arithmetic {
        Arithmetic { block_time: Duration::from_secs(BLOCK_TIME_SECS) }
    }

    #[tokio::test]
    async fn arithmetic_estimate() {
        let ledger = ledger(MockLedger::new(HEAD));
        let est = arithmetic();

        let ts = MockLedger::timestamp_of(1_000);
        assert_eq!(est.block_for_timestamp(&ledger, head(), ts).await.unwrap(), 1_000);
        // Rounds towards the head inside a block interval
        assert_eq!(est.block_for_timestamp(&ledger, head(), ts - 5).await.unwrap(), 1_000);
        assert_eq!(est.block_for_timestamp(&ledger, head(), ts + 5).await.unwrap(), 1_001);
        // Future timestamps clamp to the head, ancient ones to block 1
        assert_eq!(est.block_for_timestamp(&ledger, head(), u64::MAX).await.unwrap(), HEAD);
        assert_eq!(est.block_for_timestamp(&ledger, head(), 0).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn binary_search_finds_exact_block() {
        let mock = MockLedger::new(HEAD);
        let ledger = ledger(mock);
        let est = BinarySearch { max_iterations: 32 };

        let ts = MockLedger::timestamp_of(123_456);
        assert_eq!(est.block_for_timestamp(&ledger, head(), ts).await.unwrap(), 123_456);
        assert_eq!(est.block_for_timestamp(&ledger, head(), ts + 1).await.unwrap(), 123_456);
        assert_eq!(est.block_for_timestamp(&ledger, head(), ts + 11).await.unwrap(), 123_457);
        assert_eq!(est.block_for_timestamp(&ledger, head(), 0).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn binary_search_returns_closest_when_out_of_iterations() {
        let est = BinarySearch { max_iterations: 3 };
        let ledger = ledger(MockLedger::new(HEAD));
        let block = est
            .block_for_timestamp(&ledger, head(), MockLedger::timestamp_of(10))
            .await
            .unwrap();
        // Three halvings from the head only get down to an eighth of the chain
        assert_eq!(block, 125_000);
    }

    fn small_head() -> Head {
        Head { number: 1_000, timestamp: MockLedger::timestamp_of(1_000) }
    }

    #[tokio::test]
    async fn binary_search_skips_missing_blocks() {
        let est = BinarySearch { max_iterations: 32 };
        for target in [100, 499, 501, 700, 999] {
            let mock = MockLedger::new(1_000).with_missing_block(500);
            let block = est
                .block_for_timestamp(&ledger(mock), small_head(), MockLedger::timestamp_of(target))
                .await
                .unwrap();
            assert_eq!(block, target);
        }
    }

    #[tokio::test]
    async fn binary_search_fails_on_unreadable_stretch() {
        let mock = (490..=510).fold(MockLedger::new(1_000), |mock, n| mock.with_missing_block(n));
        let est = BinarySearch { max_iterations: 32 };
        let err = est
            .block_for_timestamp(&ledger(mock), small_head(), MockLedger::timestamp_of(700))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::MissingBlock(500)));
    }

    #[tokio::test]
    async fn binary_search_window_spans_missing_pivot() {
        let mock = MockLedger::new(1_000).with_missing_block(500);
        let est = BinarySearch { max_iterations: 32 };
        let (start, end) = (MockLedger::timestamp_of(690), MockLedger::timestamp_of(710));
        let range = window_blocks(&est, &ledger(mock), small_head(), start, end).await.unwrap();
        assert_eq!(range, Some(BlockRange::new(690, 710)));
    }

    #[tokio::test]
    async fn future_window_has_no_blocks() {
        let ledger = ledger(MockLedger::new(HEAD));
        let start = head().timestamp + 1;
        let range =
            window_blocks(&arithmetic(), &ledger, head(), start, start + 100).await.unwrap();
        assert_eq!(range, None);

        let start = MockLedger::timestamp_of(10);
        let range =
            window_blocks(&arithmetic(), &ledger, head(), start, u64::MAX).await.unwrap();
        assert_eq!(range, Some(BlockRange::new(10, HEAD)));
    }

    #[test]
    fn block_time_resolution() {
        let engine = EngineConfig { default_block_time_ms: 7_000, ..Default::default() };
        let mut profile = contract_profile("pass", Address::ZERO);
        assert_eq!(block_time(&profile, &engine), Duration::from_secs(BLOCK_TIME_SECS));

        profile.block_time_ms = None;
        profile.chain_id = 1;
        assert_eq!(block_time(&profile, &engine), Duration::from_secs(12));

        profile.chain_id = 0xdead_beef_cafe;
        assert_eq!(block_time(&profile, &engine), Duration::from_millis(7_000));
    }

    proptest! {
        #[test]
        fn estimators_are_monotonic(
            a in 0u64..(HEAD * BLOCK_TIME_SECS),
            b in 0u64..(HEAD * BLOCK_TIME_SECS),
        ) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            let (early, late) = (a.min(b), a.max(b));
            let (early, late) = (GENESIS + early, GENESIS + late);

            rt.block_on(async {
                let ledger = ledger(MockLedger::new(HEAD));
                let search = BinarySearch { max_iterations: 32 };
                for est in [&arithmetic() as &dyn BlockEstimator, &search] {
                    let first = est.block_for_timestamp(&ledger, head(), early).await.unwrap();
                    let second = est.block_for_timestamp(&ledger, head(), late).await.unwrap();
                    assert!(first <= second, "{early} -> {first}, {late} -> {second}");
                }

                // The precise variant lands within one block interval of the target
                let block = search.block_for_timestamp(&ledger, head(), late).await.unwrap();
                assert!(MockLedger::timestamp_of(block).abs_diff(late) <= BLOCK_TIME_SECS);
            });
        }
    }

    const GENESIS: u64 = crate::test_utils::GENESIS_TIMESTAMP;
}
