// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use serde_json::{json, Value};

use common::spawn_gateway;

mod common;

#[tokio::test]
async fn health_reports_ok() {
    let gw = spawn_gateway().await;
    let client = reqwest::Client::new();

    let body: Value = client
        .get(format!("{}/health", gw.http_url))
        .send()
        .await
        .expect("request")
        .json()
        .await
        .expect("json");
    assert_eq!(body["status"], "ok");
    assert!(body["timestamp"].is_u64());
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));

    gw.handle.abort();
}

#[tokio::test]
async fn login_verify_refresh_round_trip() {
    let gw = spawn_gateway().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/auth/login", gw.http_url))
        .json(&json!({"username": "demo", "password": "demo"}))
        .send()
        .await
        .expect("login");
    assert!(response.status().is_success());
    let body: Value = response.json().await.expect("json");
    let token = body["token"].as_str().expect("token").to_string();

    let response = client
        .get(format!("{}/auth/verify", gw.http_url))
        .bearer_auth(&token)
        .send()
        .await
        .expect("verify");
    assert!(response.status().is_success());
    let body: Value = response.json().await.expect("json");
    assert_eq!(body["valid"], true);
    assert_eq!(body["username"], "demo");

    let response = client
        .post(format!("{}/auth/refresh", gw.http_url))
        .json(&json!({"token": token}))
        .send()
        .await
        .expect("refresh");
    assert!(response.status().is_success());
    let body: Value = response.json().await.expect("json");
    let refreshed = body["token"].as_str().expect("token");

    let response = client
        .get(format!("{}/auth/verify", gw.http_url))
        .bearer_auth(refreshed)
        .send()
        .await
        .expect("verify refreshed");
    assert!(response.status().is_success());

    gw.handle.abort();
}

#[tokio::test]
async fn bad_credentials_and_missing_bearer_are_unauthorized() {
    let gw = spawn_gateway().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/auth/login", gw.http_url))
        .json(&json!({"username": "demo", "password": "nope"}))
        .send()
        .await
        .expect("login");
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);

    let response = client
        .get(format!("{}/auth/verify", gw.http_url))
        .send()
        .await
        .expect("verify");
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);

    let response = client
        .post(format!("{}/auth/refresh", gw.http_url))
        .json(&json!({"token": "not-a-jwt"}))
        .send()
        .await
        .expect("refresh");
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);

    gw.handle.abort();
}
