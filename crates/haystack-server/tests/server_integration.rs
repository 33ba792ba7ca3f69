//! Integration tests for the haystack HTTP server
//!
//! These tests verify the black-box behavior of the server:
//! - Records committed over HTTP are readable and watchable
//! - watchSub opens a watch, watchPoll reports only changes
//! - Errors carry a kind and the mapped status code

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use haystack_server::{ServerCore, build_router};
use reqwest::StatusCode;
use serde_json::{Value, json};

/// Start a server on an ephemeral port, seeded with two records
async fn setup_test_server() -> (Arc<ServerCore>, SocketAddr) {
    let core = Arc::new(ServerCore::new());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let router = build_router(core.clone());
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    let (status, _) = post(
        addr,
        "/commit",
        json!({"records": [
            {"id": "r:ahu1", "dis": "AHU-1", "equip": "m:"},
            {"id": "r:ahu1.dat", "dis": "AHU-1 DAT", "point": "m:", "writable": "m:", "his": "m:"},
        ]}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    (core, addr)
}

async fn post(addr: SocketAddr, path: &str, body: Value) -> (StatusCode, Value) {
    let resp = reqwest::Client::new()
        .post(format!("http://{addr}{path}"))
        .json(&body)
        .timeout(Duration::from_secs(2))
        .send()
        .await
        .expect("request failed");
    let status = resp.status();
    (status, resp.json().await.expect("Invalid JSON"))
}

async fn get(addr: SocketAddr, path: &str) -> (StatusCode, Value) {
    let resp = reqwest::get(format!("http://{addr}{path}"))
        .await
        .expect("request failed");
    let status = resp.status();
    (status, resp.json().await.expect("Invalid JSON"))
}

// ============ Tests ============

#[tokio::test]
async fn test_about() {
    let (_core, addr) = setup_test_server().await;
    let (status, about) = get(addr, "/about").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(about["haystackVersion"], "3.0");
    assert_eq!(about["tz"], "UTC");
    assert!(about["serverTime"].as_str().unwrap().starts_with("t:"));
}

#[tokio::test]
async fn test_read_checked_and_unchecked() {
    let (_core, addr) = setup_test_server().await;

    let (status, grid) = post(addr, "/read", json!({"ids": ["@ahu1", "ghost"]})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(grid["meta"]["ver"], "3.0");
    assert_eq!(grid["rows"][0]["dis"], "AHU-1");
    assert_eq!(grid["rows"][1], json!({}));

    let (status, err) = post(addr, "/read", json!({"ids": ["ghost"], "checked": true})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(err["kind"], "unknownRecord");
}

#[tokio::test]
async fn test_watch_sub_poll_unsub() {
    let (_core, addr) = setup_test_server().await;

    let (status, grid) = post(
        addr,
        "/watchSub",
        json!({"watchDis": "dashboard", "lease": "n:5min", "ids": ["ahu1", "ahu1.dat"]}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let watch_id = grid["meta"]["watchId"].as_str().unwrap().to_string();
    assert_eq!(grid["meta"]["lease"], "n:5min");
    assert_eq!(grid["rows"].as_array().unwrap().len(), 2);

    let (_, changes) = post(addr, "/watchPoll", json!({"watchId": watch_id})).await;
    assert_eq!(changes["rows"], json!([]));

    let (status, _) = post(
        addr,
        "/pointWrite",
        json!({"id": "ahu1.dat", "level": 8, "who": "operator", "val": "n:72degF"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, changes) = post(addr, "/watchPoll", json!({"watchId": watch_id})).await;
    let rows = changes["rows"].as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["writeVal"], "n:72degF");

    let (_, watches) = get(addr, "/watches").await;
    assert_eq!(watches["watches"][0]["id"], watch_id.as_str());

    let (status, _) = post(
        addr,
        "/watchUnsub",
        json!({"watchId": watch_id, "close": true}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, err) = post(addr, "/watchPoll", json!({"watchId": watch_id})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(err["kind"], "unknownWatch");
}

#[tokio::test]
async fn test_bad_lease_is_rejected() {
    let (core, addr) = setup_test_server().await;
    let (status, err) = post(
        addr,
        "/watchSub",
        json!({"watchDis": "bad", "lease": "n:5kg", "ids": ["ahu1"]}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["kind"], "invalidOperation");
    assert!(core.watches().is_empty());
}

#[tokio::test]
async fn test_history_round_trip() {
    let (_core, addr) = setup_test_server().await;
    let (status, _) = post(
        addr,
        "/hisWrite",
        json!({"id": "ahu1.dat", "items": [
            {"ts": "2024-03-01T02:00:00Z", "val": "n:71degF"},
            {"ts": "2024-03-01T01:00:00Z", "val": "n:70degF"},
        ]}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, grid) = post(
        addr,
        "/hisRead",
        json!({"id": "ahu1.dat", "start": "2024-03-01T00:00:00Z", "end": "2024-03-02T00:00:00Z"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(grid["meta"]["id"], "r:ahu1.dat");
    assert_eq!(grid["rows"][0]["val"], "n:70degF");
    assert_eq!(grid["rows"][1]["val"], "n:71degF");
}

#[tokio::test]
async fn test_point_write_validation_and_not_implemented() {
    let (_core, addr) = setup_test_server().await;

    let (status, err) = post(addr, "/pointWrite", json!({"id": "ahu1.dat", "level": 18, "val": 1})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["kind"], "invalidArgument");

    let (status, array) = post(addr, "/pointWriteArray", json!({"id": "ahu1.dat"})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(array["rows"].as_array().unwrap().len(), 17);

    let (status, err) = post(
        addr,
        "/invokeAction",
        json!({"id": "ahu1", "action": "reset"}),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
    assert_eq!(err["kind"], "notImplemented");
}

#[tokio::test]
async fn test_watch_stream_refresh_then_changes() {
    let (_core, addr) = setup_test_server().await;
    let (_, grid) = post(
        addr,
        "/watchSub",
        json!({"watchDis": "stream", "ids": ["ahu1.dat"]}),
    )
    .await;
    let watch_id = grid["meta"]["watchId"].as_str().unwrap().to_string();

    let mut resp = reqwest::get(format!("http://{addr}/watchStream?watchId={watch_id}"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let first = tokio::time::timeout(Duration::from_secs(2), resp.chunk())
        .await
        .expect("Timeout waiting for refresh")
        .unwrap()
        .unwrap();
    assert!(String::from_utf8_lossy(&first).contains("event: refresh"));

    post(addr, "/watchUnsub", json!({"watchId": watch_id, "close": true})).await;

    let mut rest = String::new();
    while let Ok(Ok(Some(chunk))) = tokio::time::timeout(Duration::from_secs(2), resp.chunk()).await {
        rest.push_str(&String::from_utf8_lossy(&chunk));
    }
    assert!(rest.contains("event: error"));
}

#[tokio::test]
async fn test_commit_batch_is_all_or_nothing() {
    let (_core, addr) = setup_test_server().await;
    let (status, err) = post(
        addr,
        "/commit",
        json!({"records": [{"id": "r:vav1", "dis": "VAV-1"}, {"dis": "no id"}]}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["kind"], "invalidArgument");

    let (_, grid) = post(addr, "/read", json!({"ids": ["vav1"]})).await;
    assert_eq!(grid["rows"][0], json!({}));
}
