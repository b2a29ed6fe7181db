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

use alloy::rpc::json_rpc::{RequestPacket, ResponsePacket};
use alloy::transports::{TransportError, TransportFut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};

// ── Stats ───────────────────────────────────────────────────────

/// Request counters for one contract's ledger transport
#[derive(Default, Debug)]
pub struct RpcMetricsStats {
    pub total_requests: AtomicU64,
    pub failed_requests: AtomicU64,
    pub total_req_bytes: AtomicU64,
    pub total_resp_bytes: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct RpcMetricsSummary {
    pub total_requests: u64,
    pub failed_requests: u64,
    pub total_req_bytes: u64,
    pub total_resp_bytes: u64,
}

impl RpcMetricsStats {
    pub fn summary(&self) -> RpcMetricsSummary {
        RpcMetricsSummary {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            total_req_bytes: self.total_req_bytes.load(Ordering::Relaxed),
            total_resp_bytes: self.total_resp_bytes.load(Ordering::Relaxed),
        }
    }
}

// ── Layer ───────────────────────────────────────────────────────

#[derive(Clone)]
pub struct RpcMetricsLayer {
    label: Arc<str>,
    stats: Arc<RpcMetricsStats>,
}

impl RpcMetricsLayer {
    pub fn new(label: &str) -> Self {
        Self { label: label.into(), stats: Arc::new(RpcMetricsStats::default()) }
    }

    pub fn stats(&self) -> Arc<RpcMetricsStats> {
        self.stats.clone()
    }
}

impl<S> Layer<S> for RpcMetricsLayer {
    type Service = RpcMetrics<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RpcMetrics { inner, label: self.label.clone(), stats: self.stats.clone() }
    }
}

// ── Service ─────────────────────────────────────────────────────

#[derive(Clone)]
pub struct RpcMetrics<S> {
    inner: S,
    label: Arc<str>,
    stats: Arc<RpcMetricsStats>,
}

impl<S> Service<RequestPacket> for RpcMetrics<S>
where
    S: Service<RequestPacket, Response = ResponsePacket, Error = TransportError>
        + Send
        + Clone
        + 'static,
    S::Future: Send,
{
    type Response = ResponsePacket;
    type Error = TransportError;
    type Future = TransportFut<'static>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: RequestPacket) -> Self::Future {
        let (methods, req_bytes) = match &req {
            RequestPacket::Single(r) => {
                let serialized = serde_json::to_string(r).unwrap_or_default();
                (vec![r.method().to_string()], serialized.len() as u64)
            }
            RequestPacket::Batch(batch) => {
                let serialized = serde_json::to_string(batch).unwrap_or_default();
                let methods: Vec<String> = batch.iter().map(|r| r.method().to_string()).collect();
                (methods, serialized.len() as u64)
            }
        };

        let stats = self.stats.clone();
        let label = self.label.clone();
        stats.total_requests.fetch_add(methods.len() as u64, Ordering::Relaxed);
        stats.total_req_bytes.fetch_add(req_bytes, Ordering::Relaxed);

        let start = std::time::Instant::now();
        let fut = self.inner.call(req);

        Box::pin(async move {
            let resp = match fut.await {
                Ok(resp) => resp,
                Err(err) => {
                    stats.failed_requests.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(
                        target: "quest_verifier::rpc",
                        label = %label,
                        method = %methods.join(","),
                        "RPC request failed: {err}"
                    );
                    return Err(err);
                }
            };

            let resp_bytes = match &resp {
                ResponsePacket::Single(r) => serde_json::to_string(r).unwrap_or_default().len(),
                ResponsePacket::Batch(batch) => {
                    serde_json::to_string(batch).unwrap_or_default().len()
                }
            } as u64;
            stats.total_resp_bytes.fetch_add(resp_bytes, Ordering::Relaxed);

            tracing::trace!(
                target: "quest_verifier::rpc",
                label = %label,
                method = %methods.join(","),
                req_bytes,
                resp_bytes,
                duration_ms = start.elapsed().as_millis() as u64,
                "RPC request"
            );

            Ok(resp)
        })
    }
}
