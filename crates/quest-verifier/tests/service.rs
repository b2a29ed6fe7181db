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

use std::{future::IntoFuture, net::SocketAddr, sync::Arc};

use alloy::primitives::{address, Address};
use quest_verifier::{
    api::{self, AppState},
    build_verifier,
    config::{Config, ConfigWatcher},
    test_utils::{campaign, config_with, contract_profile, MockLedger, MockLedgerFactory},
};
use serde_json::{json, Value};
use tempfile::NamedTempFile;

const PASS: Address = address!("5FbDB2315678afecb367f032d93F642f64180aa3");
const BADGE: Address = address!("e7f1725E7734CE288F8367e1Bb143E90bb3F0512");
const USER: Address = address!("000000000000000000000000000000000000abcd");

fn pass_config() -> Config {
    let mut profile = contract_profile("pass", PASS);
    profile.campaigns.insert(
        "launch".into(),
        campaign("launch", MockLedger::timestamp_of(900), MockLedger::timestamp_of(1_100)),
    );
    config_with([profile])
}

fn factory() -> Arc<MockLedgerFactory> {
    Arc::new(
        MockLedgerFactory::default()
            .with_ledger("pass", MockLedger::new(2_000).with_transfer(1_000, USER, PASS))
            .with_ledger("badge", MockLedger::new(2_000).with_transfer(1_800, USER, BADGE)),
    )
}

async fn serve(state: Arc<AppState>) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(axum::serve(listener, api::app(state)).into_future());
    addr
}

async fn get(url: String) -> (u16, Value) {
    let response = reqwest::get(url).await.unwrap();
    let status = response.status().as_u16();
    let body = response.text().await.unwrap();
    (status, serde_json::from_str(&body).unwrap())
}

#[tokio::test]
async fn verification_over_http() {
    let config_file = NamedTempFile::new().unwrap();
    pass_config().write(config_file.path()).await.unwrap();
    let watcher = ConfigWatcher::new(config_file.path()).await.unwrap();
    let verifier = build_verifier(watcher.config.clone(), factory()).unwrap();
    let addr = serve(AppState::new(verifier, None)).await;

    let (status, body) = get(format!("http://{addr}/verify/{USER}?contract=pass")).await;
    assert_eq!((status, body), (200, json!({ "result": 1 })));

    let (status, body) =
        get(format!("http://{addr}/verify/{USER}?contract=pass&campaign=launch")).await;
    assert_eq!((status, body), (200, json!({ "result": 1 })));

    let (status, body) = get(format!(
        "http://{addr}/verify-in-range/{USER}?contract=pass&startDate={}&endDate={}",
        MockLedger::timestamp_of(1_500),
        MockLedger::timestamp_of(1_600)
    ))
    .await;
    assert_eq!((status, body), (200, json!({ "result": 0 })));

    let (status, body) = get(format!("http://{addr}/verify/0xnothex?contract=pass")).await;
    assert_eq!((status, body), (400, json!({ "result": 0 })));

    let (status, body) = get(format!("http://{addr}/health")).await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["cached_verdicts"], 3);
}

#[tokio::test]
async fn admin_reload_switches_config() {
    let config_file = NamedTempFile::new().unwrap();
    pass_config().write(config_file.path()).await.unwrap();
    let watcher = ConfigWatcher::new(config_file.path()).await.unwrap();
    let verifier = build_verifier(watcher.config.clone(), factory()).unwrap();
    let addr = serve(AppState::new(verifier.clone(), Some("letmein".into()))).await;

    let (status, body) = get(format!("http://{addr}/verify/{USER}?contract=badge")).await;
    assert_eq!((status, body), (404, json!({ "result": 0 })));
    assert!(verifier.verify(&USER.to_string(), "pass", None).await.unwrap());
    assert_eq!(verifier.cache().len(), 1);

    let mut config = pass_config();
    config.contracts.insert("badge".into(), contract_profile("badge", BADGE));
    config.engine.cache_ttl_secs = 60;
    config.write(config_file.path()).await.unwrap();

    let client = reqwest::Client::new();
    let denied = client.post(format!("http://{addr}/admin/reload")).send().await.unwrap();
    assert_eq!(denied.status().as_u16(), 401);

    let reloaded = client
        .post(format!("http://{addr}/admin/reload"))
        .header("X-Admin-Token", "letmein")
        .send()
        .await
        .unwrap();
    assert_eq!(reloaded.status().as_u16(), 200);
    let body: Value = serde_json::from_str(&reloaded.text().await.unwrap()).unwrap();
    assert_eq!(body["status"], "success");
    assert!(body["generation"].as_u64().unwrap() >= 1);

    // New requests see the new contract and an empty cache
    assert!(verifier.cache().is_empty());
    assert_eq!(verifier.cache().ttl(), std::time::Duration::from_secs(60));
    let (status, body) = get(format!("http://{addr}/verify/{USER}?contract=badge")).await;
    assert_eq!((status, body), (200, json!({ "result": 1 })));

    let (status, body) = get(format!("http://{addr}/contracts")).await;
    assert_eq!(status, 200);
    let ids: Vec<&str> =
        body.as_array().unwrap().iter().map(|c| c["id"].as_str().unwrap()).collect();
    assert_eq!(ids, vec!["badge", "pass"]);
}
