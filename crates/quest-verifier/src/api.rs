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

//! HTTP boundary. Verification routes only ever answer `{"result":0}` or `{"result":1}`.

use std::{any::Any, collections::BTreeMap, sync::Arc};

use anyhow::{Context, Error as AnyhowErr, Result};
use axum::{
    extract::{
        rejection::{PathRejection, QueryRejection},
        Path, Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};

use crate::{
    rpcmetrics::RpcMetricsSummary,
    verifier::{VerificationRequest, Verifier, VerifyError},
};

pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

/// Shared handler state
pub struct AppState {
    pub verifier: Arc<Verifier>,
    /// Required in the `X-Admin-Token` header of admin routes when set
    pub admin_token: Option<String>,
}

impl AppState {
    pub fn new(verifier: Arc<Verifier>, admin_token: Option<String>) -> Arc<Self> {
        let admin_token = admin_token.filter(|token| !token.is_empty());
        Arc::new(Self { verifier, admin_token })
    }
}

fn verdict_response(code: StatusCode, eligible: bool) -> Response {
    (code, Json(json!({ "result": u8::from(eligible) }))).into_response()
}

impl IntoResponse for VerifyError {
    fn into_response(self) -> Response {
        let code = match self {
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::ContractNotFound(_) | Self::CampaignNotFound { .. } => StatusCode::NOT_FOUND,
        };
        tracing::warn!("verification rejected, code {code}: {self}");
        verdict_response(code, false)
    }
}

#[derive(Error, Debug)]
pub enum AdminError {
    #[error("missing or invalid admin token")]
    Unauthorized,
    #[error("internal error: {0:#}")]
    InternalErr(AnyhowErr),
}

impl From<AnyhowErr> for AdminError {
    fn from(err: AnyhowErr) -> Self {
        Self::InternalErr(err)
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let code = match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::InternalErr(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        tracing::error!("admin api error, code {code}: {self}");
        (code, Json(json!({ "status": "error", "message": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct VerifyParams {
    contract: Option<String>,
    campaign: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RangeParams {
    contract: Option<String>,
    campaign: Option<String>,
    start_date: Option<String>,
    end_date: Option<String>,
}

/// Malformed paths and query strings answer like any other invalid input
fn rejected(err: impl std::fmt::Display) -> VerifyError {
    VerifyError::InvalidInput(err.to_string())
}

async fn verify(
    State(state): State<Arc<AppState>>,
    path: Result<Path<String>, PathRejection>,
    query: Result<Query<VerifyParams>, QueryRejection>,
) -> Result<Response, VerifyError> {
    let Path(address) = path.map_err(rejected)?;
    let Query(params) = query.map_err(rejected)?;
    let request = VerificationRequest::new(&address, params.contract.as_deref().unwrap_or(""))?
        .with_campaign(params.campaign.as_deref());
    let verdict = state.verifier.verify_request(&request).await?;
    Ok(verdict_response(StatusCode::OK, verdict.eligible))
}

async fn verify_in_range(
    State(state): State<Arc<AppState>>,
    path: Result<Path<String>, PathRejection>,
    query: Result<Query<RangeParams>, QueryRejection>,
) -> Result<Response, VerifyError> {
    let Path(address) = path.map_err(rejected)?;
    let Query(params) = query.map_err(rejected)?;
    let request = VerificationRequest::new(&address, params.contract.as_deref().unwrap_or(""))?
        .with_campaign(params.campaign.as_deref());

    // A campaign supplies its own dates, explicit ones are ignored
    let request = match request.campaign_id {
        Some(_) => request,
        None => {
            let (Some(start), Some(end)) = (params.start_date, params.end_date) else {
                return Err(VerifyError::InvalidInput(
                    "campaign or startDate and endDate are required".into(),
                ));
            };
            request.with_range(parse_date(&start, false)?, parse_date(&end, true)?)?
        }
    };

    let verdict = state.verifier.verify_request(&request).await?;
    Ok(verdict_response(StatusCode::OK, verdict.eligible))
}

/// Accepts RFC 3339, unix seconds, or `YYYY-MM-DD` which covers the whole UTC day
pub fn parse_date(value: &str, end_of_day: bool) -> Result<u64, VerifyError> {
    let value = value.trim();
    let invalid = || VerifyError::InvalidInput(format!("malformed date {value:?}"));

    if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
        return value.parse().map_err(|_| invalid());
    }
    let timestamp = if let Ok(datetime) = DateTime::parse_from_rfc3339(value) {
        datetime.timestamp()
    } else {
        let date = NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|_| invalid())?;
        let time =
            if end_of_day { date.and_hms_opt(23, 59, 59) } else { date.and_hms_opt(0, 0, 0) };
        time.ok_or_else(invalid)?.and_utc().timestamp()
    };
    u64::try_from(timestamp).map_err(|_| invalid())
}

#[derive(Debug, Serialize)]
struct CampaignSummary {
    id: String,
    name: String,
    start: String,
    end: String,
    description: String,
}

#[derive(Debug, Serialize)]
struct ContractSummary {
    id: String,
    name: String,
    chain_id: u64,
    address: String,
    campaigns: Vec<CampaignSummary>,
}

async fn list_contracts(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, AdminError> {
    let snapshot = state.verifier.config().snapshot().context("Failed to read config")?;
    let contracts: Vec<ContractSummary> = snapshot
        .config
        .contracts
        .values()
        .map(|contract| ContractSummary {
            id: contract.id.clone(),
            name: contract.name.clone(),
            chain_id: contract.chain_id,
            address: contract.address.to_string(),
            campaigns: contract
                .campaigns
                .values()
                .map(|campaign| CampaignSummary {
                    id: campaign.id.clone(),
                    name: campaign.name.clone(),
                    start: campaign.start.to_rfc3339(),
                    end: campaign.end.to_rfc3339(),
                    description: campaign.description.clone(),
                })
                .collect(),
        })
        .collect();
    Ok(Json(json!(contracts)))
}

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let verifier = &state.verifier;
    let generation = verifier.config().snapshot().map(|snapshot| snapshot.generation).ok();
    let rpc: BTreeMap<String, RpcMetricsSummary> =
        verifier.pool().rpc_metrics().into_iter().collect();
    Json(json!({
        "status": "ok",
        "config_generation": generation,
        "cached_verdicts": verifier.cache().len(),
        "rpc": rpc,
    }))
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), AdminError> {
    let Some(expected) = &state.admin_token else {
        return Ok(());
    };
    match headers.get(ADMIN_TOKEN_HEADER).and_then(|value| value.to_str().ok()) {
        Some(token) if token == expected => Ok(()),
        _ => Err(AdminError::Unauthorized),
    }
}

async fn reload(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AdminError> {
    authorize(&state, &headers)?;
    let generation = state.verifier.reload().await?;
    tracing::info!("Config reloaded by admin request, generation {generation}");
    Ok(Json(json!({ "status": "success", "generation": generation })))
}

async fn clear_cache(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AdminError> {
    authorize(&state, &headers)?;
    let cleared = state.verifier.clear_cache();
    Ok(Json(json!({ "status": "success", "cleared": cleared })))
}

fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(msg) = err.downcast_ref::<String>() {
        msg.clone()
    } else if let Some(msg) = err.downcast_ref::<&str>() {
        msg.to_string()
    } else {
        "unknown panic".to_string()
    };
    tracing::error!("Request handler panicked: {detail}");
    verdict_response(StatusCode::OK, false)
}

/// Create the application router
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/verify/{address}", get(verify))
        .route("/verify-in-range/{address}", get(verify_in_range))
        .route("/contracts", get(list_contracts))
        .route("/health", get(health))
        .route("/admin/reload", post(reload))
        .route("/admin/cache/clear", post(clear_cache))
        .with_state(state)
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http())
}

/// Serve the API until `cancel_token` fires
pub async fn run(
    state: Arc<AppState>,
    bind_addr: &str,
    cancel_token: CancellationToken,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .context("Failed to bind a TCP listener")?;

    tracing::info!("REST API listening on: {bind_addr}");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(cancel_token.cancelled_owned())
        .await
        .context("REST API service failed")?;

    Ok(())
}
