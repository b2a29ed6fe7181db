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

use alloy::primitives::Address;

use crate::{
    ledger::BlockRange,
    retry::{GuardedLedger, RangeCheck},
};

/// Cheap first pass: did the account's nonce move inside the window, and can the movement be
/// pinned to a transfer log?
pub struct DirectChecker<'a> {
    ledger: &'a GuardedLedger,
    /// Provider cap on a single log query
    max_query_range: u64,
    /// Accept a nonce change without a confirming log
    trust_nonce_delta: bool,
}

impl<'a> DirectChecker<'a> {
    pub fn new(ledger: &'a GuardedLedger, max_query_range: u64, trust_nonce_delta: bool) -> Self {
        Self { ledger, max_query_range, trust_nonce_delta }
    }

    /// Never fails; ledger errors count as "nothing found".
    pub async fn has_direct_interaction(&self, account: Address, window: BlockRange) -> bool {
        // Nonce before the first block of the window vs after the last one
        let counts = match window.from.checked_sub(1) {
            Some(before) => tokio::try_join!(
                self.ledger.transaction_count(account, before),
                self.ledger.transaction_count(account, window.to)
            ),
            None => self.ledger.transaction_count(account, window.to).await.map(|after| (0, after)),
        };
        let (before, after) = match counts {
            Ok(counts) => counts,
            Err(err) => {
                tracing::debug!("Direct check for {account} skipped: {err}");
                return false;
            }
        };
        if before == after {
            return false;
        }
        tracing::debug!("Nonce of {account} moved {before} -> {after} within {window}");

        for third in window.thirds_recent_first() {
            let span = third.tail(self.max_query_range);
            if self.ledger.check_range(account, span).await == RangeCheck::Found {
                tracing::debug!("Direct interaction of {account} located in {span}");
                return true;
            }
        }

        if self.trust_nonce_delta {
            tracing::debug!("No transfer log for {account} in {window}, accepting nonce change");
        }
        self.trust_nonce_delta
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::RetryConfig,
        test_utils::{contract_profile, MockLedger},
    };
    use alloy::primitives::address;
    use std::sync::Arc;

    const USER: Address = address!("000000000000000000000000000000000000abcd");
    const CONTRACT: Address = address!("5FbDB2315678afecb367f032d93F642f64180aa3");

    fn guarded(mock: MockLedger) -> (GuardedLedger, Arc<MockLedger>) {
        let mock = Arc::new(mock);
        let retry = RetryConfig { attempts: 2, call_timeout_ms: 100, base_delay_ms: 5 };
        (GuardedLedger::new(mock.clone(), &contract_profile("pass", CONTRACT), retry), mock)
    }

    #[tokio::test]
    async fn unchanged_nonce_is_no_interaction() {
        let (ledger, mock) = guarded(MockLedger::new(10_000).with_outgoing_tx(USER, 50));
        let checker = DirectChecker::new(&ledger, 10_000, true);
        assert!(!checker.has_direct_interaction(USER, BlockRange::new(100, 9_000)).await);
        assert_eq!(mock.log_queries(), 0);
    }

    #[tokio::test]
    async fn locates_transfer_most_recent_third_first() {
        let (ledger, mock) = guarded(
            MockLedger::new(10_000)
                .with_outgoing_tx(USER, 8_500)
                .with_transfer(8_500, USER, CONTRACT),
        );
        let checker = DirectChecker::new(&ledger, 10_000, false);
        assert!(checker.has_direct_interaction(USER, BlockRange::new(1, 9_000)).await);
        // One range check, both directions
        assert_eq!(mock.log_queries(), 2);
        assert_eq!(mock.queried_ranges()[0], BlockRange::new(6_001, 9_000));
    }

    #[tokio::test]
    async fn falls_back_to_older_thirds() {
        let (ledger, mock) = guarded(
            MockLedger::new(10_000).with_outgoing_tx(USER, 100).with_transfer(100, CONTRACT, USER),
        );
        let checker = DirectChecker::new(&ledger, 10_000, false);
        assert!(checker.has_direct_interaction(USER, BlockRange::new(1, 9_000)).await);
        assert_eq!(mock.log_queries(), 6);
    }

    #[tokio::test]
    async fn nonce_change_policy() {
        let mock = MockLedger::new(10_000).with_outgoing_tx(USER, 500);
        let (ledger, _) = guarded(mock);
        let window = BlockRange::new(400, 600);
        let trusting = DirectChecker::new(&ledger, 10_000, true);
        let strict = DirectChecker::new(&ledger, 10_000, false);
        assert!(trusting.has_direct_interaction(USER, window).await);
        assert!(!strict.has_direct_interaction(USER, window).await);
    }

    #[tokio::test]
    async fn nonce_at_window_start_counts() {
        // A transaction in the first block of the window changes the count
        let (ledger, _) = guarded(MockLedger::new(10_000).with_outgoing_tx(USER, 400));
        let checker = DirectChecker::new(&ledger, 10_000, true);
        assert!(checker.has_direct_interaction(USER, BlockRange::new(400, 600)).await);
        assert!(!checker.has_direct_interaction(USER, BlockRange::new(401, 600)).await);
    }

    #[tokio::test]
    async fn queries_respect_provider_cap() {
        let (ledger, mock) = guarded(
            MockLedger::new(100_000)
                .with_max_log_range(1_000)
                .with_outgoing_tx(USER, 89_500)
                .with_transfer(89_500, USER, CONTRACT),
        );
        let checker = DirectChecker::new(&ledger, 1_000, false);
        assert!(checker.has_direct_interaction(USER, BlockRange::new(1, 90_000)).await);
        assert!(mock.queried_ranges().iter().all(|range| range.len() <= 1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn ledger_failure_is_no_interaction() {
        let (ledger, _) =
            guarded(MockLedger::new(10_000).with_outgoing_tx(USER, 500).unresponsive());
        let checker = DirectChecker::new(&ledger, 10_000, true);
        assert!(!checker.has_direct_interaction(USER, BlockRange::new(400, 600)).await);
    }
}
