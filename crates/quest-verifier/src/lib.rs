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

//! Decides whether a wallet has interacted with a configured contract, optionally within a
//! campaign window or explicit date range, while bounding the time spent on the ledger.

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub mod api;
pub mod blocks;
pub mod cache;
pub mod config;
pub mod direct;
pub mod errors;
pub mod ledger;
pub mod pool;
pub mod retry;
pub mod rpcmetrics;
pub mod scanner;
pub mod task;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod verifier;

use crate::{
    api::AppState,
    cache::{CacheSweeper, VerdictCache},
    config::{ConfigLock, ConfigWatcher},
    ledger::{LedgerFactory, RpcLedgerFactory},
    pool::LedgerPool,
    task::Supervisor,
    verifier::{ReloadListener, Verifier},
};

/// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// Contract and engine config file, reloaded when modified
    #[clap(short, long, env, default_value = "quest-verifier.toml")]
    pub config_file: PathBuf,

    /// Bind address for REST api
    #[clap(long, env, default_value = "0.0.0.0:8080")]
    pub bind_addr: String,

    /// Token expected in the X-Admin-Token header of admin routes
    ///
    /// Admin routes are open when unset.
    #[clap(long, env)]
    pub admin_token: Option<String>,

    /// Whether to log in JSON format.
    #[clap(long, env, default_value_t = false)]
    pub log_json: bool,
}

/// Builds a verifier over `config`, with the cache TTL taken from the current snapshot
pub fn build_verifier(
    config: ConfigLock,
    factory: Arc<dyn LedgerFactory>,
) -> Result<Arc<Verifier>> {
    let ttl = config.snapshot().context("Failed to read config")?.engine().cache_ttl();
    let pool = Arc::new(LedgerPool::new(factory));
    Ok(Arc::new(Verifier::new(config, pool, VerdictCache::new(ttl))))
}

/// Runs the verifier until SIGINT or SIGTERM
pub async fn run(args: &Args) -> Result<()> {
    let watcher = ConfigWatcher::new(&args.config_file)
        .await
        .with_context(|| format!("Failed to load config {}", args.config_file.display()))?;
    let verifier = build_verifier(watcher.config.clone(), Arc::new(RpcLedgerFactory))?;
    let cancel_token = CancellationToken::new();

    let mut supervisors = JoinSet::new();
    let sweeper = Arc::new(CacheSweeper::new(verifier.cache().clone(), verifier.config().clone()));
    supervisors.spawn(Supervisor::new(sweeper, cancel_token.clone()).spawn());
    let listener = Arc::new(ReloadListener::new(verifier.clone()));
    supervisors.spawn(Supervisor::new(listener, cancel_token.clone()).spawn());

    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let state = AppState::new(verifier.clone(), args.admin_token.clone());
    let res = api::run(state, &args.bind_addr, cancel_token.clone()).await;

    cancel_token.cancel();
    while let Some(task) = supervisors.join_next().await {
        match task {
            Ok(Err(err)) => tracing::error!("Background task failed: {err:?}"),
            Err(err) => tracing::error!("Background task panicked: {err:?}"),
            Ok(Ok(())) => {}
        }
    }
    // Logs final rpc metrics per contract
    verifier.pool().clear();

    res
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!("Failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
