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

//! Heuristic transfer-log search over a block window.
//!
//! The most recent blocks are always scanned first. Windows above the large range threshold
//! are then sampled at evenly spaced points (denser in the middle half) followed by one wider
//! sweep around the midpoint; smaller windows are scanned completely in batches. Sampling can
//! miss sparse activity between samples, so a negative result on a large window is best effort.

use alloy::primitives::Address;
use tokio::time::Instant;

use crate::{
    config::ScanConfig,
    ledger::BlockRange,
    retry::{GuardedLedger, RangeCheck},
};

/// What a scan observed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub found: bool,
    /// Sub-ranges checked, including unavailable ones
    pub checks: usize,
    /// Sub-ranges whose queries ran out of retries
    pub unavailable: Vec<BlockRange>,
    /// Stopped early because the verification deadline passed
    pub deadline_hit: bool,
}

impl ScanReport {
    /// Negative without gaps: every planned sub-range was queried successfully
    pub fn conclusive(&self) -> bool {
        self.found || (self.unavailable.is_empty() && !self.deadline_hit)
    }
}

pub struct ActivityScanner<'a> {
    ledger: &'a GuardedLedger,
    config: &'a ScanConfig,
    deadline: Instant,
}

impl<'a> ActivityScanner<'a> {
    pub fn new(ledger: &'a GuardedLedger, config: &'a ScanConfig, deadline: Instant) -> Self {
        Self { ledger, config, deadline }
    }

    pub async fn has_activity(&self, account: Address, window: BlockRange) -> ScanReport {
        let mut report = ScanReport::default();
        let recent = window.tail(self.config.recent_blocks);

        if self.scan_ranges(account, self.split(recent), &mut report).await {
            tracing::debug!("Recent activity of {account} found in {recent}");
            return report;
        }

        let Some(rest) = window.before(recent.from) else {
            return report;
        };

        let plan = if window.to - window.from > self.config.large_range_threshold {
            tracing::debug!("Sampling {window} for {account}");
            let mut plan: Vec<BlockRange> =
                sample_points(window, self.config.sample_points, self.config.mid_sample_points)
                    .into_iter()
                    .rev()
                    .map(|point| window.around(point, self.config.sample_radius))
                    // Already covered by the recent scan
                    .filter(|range| !(recent.contains(range.from) && recent.contains(range.to)))
                    .flat_map(|range| self.split(range))
                    .collect();
            let sweep = window.around(window.midpoint(), self.config.final_sweep_radius);
            plan.extend(self.split(sweep));
            plan
        } else {
            rest.chunks_rev(self.config.batch_size.min(self.config.max_query_range))
        };

        if self.scan_ranges(account, plan, &mut report).await {
            tracing::debug!("Activity of {account} found after {} range checks", report.checks);
        } else if !report.unavailable.is_empty() {
            tracing::warn!(
                "Scan of {window} for {account} skipped {} unavailable ranges",
                report.unavailable.len()
            );
        }
        report
    }

    /// Checks `ranges` in order until a hit or the deadline. Returns true on a hit.
    async fn scan_ranges(
        &self,
        account: Address,
        ranges: Vec<BlockRange>,
        report: &mut ScanReport,
    ) -> bool {
        for range in ranges {
            if Instant::now() >= self.deadline {
                tracing::debug!("Deadline reached after {} range checks", report.checks);
                report.deadline_hit = true;
                return false;
            }
            report.checks += 1;
            match self.ledger.check_range(account, range).await {
                RangeCheck::Found => {
                    report.found = true;
                    return true;
                }
                RangeCheck::Empty => {}
                RangeCheck::Unavailable => report.unavailable.push(range),
            }
        }
        false
    }

    /// Splits a range into provider-sized queries, latest first
    fn split(&self, range: BlockRange) -> Vec<BlockRange> {
        range.chunks_rev(self.config.max_query_range)
    }
}

/// Sample blocks for a large window: `points` evenly spaced over the whole window plus
/// `mid_points` evenly spaced over its middle half. Sorted, without duplicates.
pub fn sample_points(window: BlockRange, points: u64, mid_points: u64) -> Vec<u64> {
    let span = window.to - window.from;
    let middle = BlockRange::new(window.from + span / 4, window.from + span / 4 * 3);

    let mut samples = spread(window, points);
    samples.extend(spread(middle, mid_points));
    samples.sort_unstable();
    samples.dedup();
    samples
}

fn spread(range: BlockRange, count: u64) -> Vec<u64> {
    let span = range.to - range.from;
    match count {
        0 => vec![],
        1 => vec![range.midpoint()],
        _ => (0..count)
            .map(|i| range.from + ((span as u128 * i as u128) / (count as u128 - 1)) as u64)
            .collect(),
    }
}
