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
    sync::{Arc, RwLock},
};

use anyhow::{anyhow, Result};

use crate::{
    config::ContractProfile,
    ledger::{LedgerClient, LedgerFactory},
    rpcmetrics::RpcMetricsSummary,
};

struct PooledLedger {
    /// Config generation the client was built from
    generation: u64,
    client: Arc<dyn LedgerClient>,
}

/// Lazily connected ledger clients, one per contract id
pub struct LedgerPool {
    factory: Arc<dyn LedgerFactory>,
    handles: RwLock<HashMap<String, PooledLedger>>,
}

impl LedgerPool {
    pub fn new(factory: Arc<dyn LedgerFactory>) -> Self {
        Self { factory, handles: RwLock::new(HashMap::new()) }
    }

    /// Returns the client for `profile`, connecting it if missing or built from an older
    /// config generation.
    pub fn get(&self, profile: &ContractProfile, generation: u64) -> Result<Arc<dyn LedgerClient>> {
        {
            let handles = self.handles.read().map_err(|_| anyhow!("ledger pool lock poisoned"))?;
            if let Some(pooled) = handles.get(&profile.id) {
                if pooled.generation >= generation {
                    return Ok(pooled.client.clone());
                }
            }
        }

        let mut handles = self.handles.write().map_err(|_| anyhow!("ledger pool lock poisoned"))?;
        // Another request may have connected while we waited for the write lock
        if let Some(pooled) = handles.get(&profile.id) {
            if pooled.generation >= generation {
                return Ok(pooled.client.clone());
            }
        }

        tracing::debug!("Connecting ledger client for contract {} (gen {generation})", profile.id);
        let client = self.factory.connect(profile)?;
        handles.insert(profile.id.clone(), PooledLedger { generation, client: client.clone() });
        Ok(client)
    }

    /// Drops every client; in-flight requests keep the handles they already hold
    pub fn clear(&self) {
        match self.handles.write() {
            Ok(mut handles) => {
                for (contract_id, pooled) in handles.iter() {
                    if let Some(summary) = pooled.client.rpc_metrics() {
                        tracing::info!(
                            "Releasing ledger client for {contract_id}: {} requests ({} failed)",
                            summary.total_requests,
                            summary.failed_requests
                        );
                        tracing::debug!(
                            "Ledger client for {contract_id} sent {} bytes, received {} bytes",
                            summary.total_req_bytes,
                            summary.total_resp_bytes
                        );
                    }
                }
                handles.clear();
            }
            Err(err) => tracing::error!("Failed to lock ledger pool for clearing: {err:?}"),
        }
    }

    pub fn len(&self) -> usize {
        self.handles.read().map(|handles| handles.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Transport counters of every connected client that keeps them
    pub fn rpc_metrics(&self) -> Vec<(String, RpcMetricsSummary)> {
        let Ok(handles) = self.handles.read() else {
            return vec![];
        };
        let mut metrics: Vec<_> = handles
            .iter()
            .filter_map(|(id, pooled)| pooled.client.rpc_metrics().map(|m| (id.clone(), m)))
            .collect();
        metrics.sort_by(|a, b| a.0.cmp(&b.0));
        metrics
    }
}
