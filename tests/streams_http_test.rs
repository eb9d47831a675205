//! Streaming server: JSON slices, error codes, and SSE catch-up-then-live.

use futures::StreamExt;
use hivemind::adapters::http::{StreamServer, StreamServerConfig};
use hivemind::adapters::sqlite::initialize_database;
use hivemind::domain::models::event::NewEvent;
use hivemind::services::EventService;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

async fn started_server() -> (Arc<StreamServer>, EventService, String, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("stream.db");
    let pool = initialize_database(db.to_str().unwrap()).await.unwrap();
    let events = EventService::new(pool);

    let server = Arc::new(StreamServer::new(events.clone(), StreamServerConfig::default()));
    let url = server.start().await.unwrap();
    (server, events, url, dir)
}

async fn seed(events: &EventService, project: &str, count: usize) {
    for n in 0..count {
        events
            .append(NewEvent::new("seeded", project, json!({ "n": n })))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn json_slice_pagination() {
    let (server, events, url, _dir) = started_server().await;
    seed(&events, "/p", 5).await;

    let body: Vec<Value> = reqwest::get(format!("{url}/streams/%2Fp?offset=0&limit=3"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body.len(), 3);
    assert_eq!(body[0]["offset"], json!(1));
    assert_eq!(body[2]["offset"], json!(3));

    // `data` is the stringified event.
    let event: Value = serde_json::from_str(body[0]["data"].as_str().unwrap()).unwrap();
    assert_eq!(event["event_type"], json!("seeded"));
    assert_eq!(event["project_key"], json!("/p"));

    let rest: Vec<Value> = reqwest::get(format!("{url}/streams/%2Fp?offset=3"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(rest.len(), 2);
    assert_eq!(rest[0]["offset"], json!(4));

    server.stop().await;
}

#[tokio::test]
async fn error_codes_for_bad_offset_and_unknown_project() {
    let (server, events, url, _dir) = started_server().await;
    seed(&events, "/p", 1).await;

    let bad = reqwest::get(format!("{url}/streams/%2Fp?offset=-1")).await.unwrap();
    assert_eq!(bad.status(), 400);
    let body: Value = bad.json().await.unwrap();
    assert_eq!(body["error"]["kind"], json!("invalid"));

    let unknown = reqwest::get(format!("{url}/streams/ghost")).await.unwrap();
    assert_eq!(unknown.status(), 404);

    let missing_path = reqwest::get(format!("{url}/nope")).await.unwrap();
    assert_eq!(missing_path.status(), 404);

    let wrong_method = reqwest::Client::new()
        .post(format!("{url}/streams/%2Fp"))
        .send()
        .await
        .unwrap();
    assert_eq!(wrong_method.status(), 404);

    server.stop().await;
}

/// Read SSE `data:` frames until `count` frames or the timeout.
async fn read_frames(response: reqwest::Response, count: usize, timeout: Duration) -> Vec<Value> {
    let mut stream = response.bytes_stream();
    let mut buffer = String::new();
    let mut frames = Vec::new();

    let deadline = tokio::time::Instant::now() + timeout;
    while frames.len() < count {
        let chunk = tokio::time::timeout_at(deadline, stream.next()).await;
        let Ok(Some(Ok(bytes))) = chunk else { break };
        buffer.push_str(&String::from_utf8_lossy(&bytes));

        while let Some(pos) = buffer.find("\n\n") {
            let frame: String = buffer[..pos].to_string();
            buffer = buffer[pos + 2..].to_string();
            for line in frame.lines() {
                if let Some(data) = line.strip_prefix("data: ") {
                    if let Ok(value) = serde_json::from_str::<Value>(data) {
                        frames.push(value);
                    }
                }
            }
        }
    }
    frames
}

#[tokio::test]
async fn sse_replays_history_then_streams_live_appends() {
    let (server, events, url, _dir) = started_server().await;
    seed(&events, "/p", 3).await;

    let response = reqwest::get(format!("{url}/streams/%2Fp?live=true&offset=0"))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let content_type = response.headers()["content-type"].to_str().unwrap().to_string();
    assert!(content_type.starts_with("text/event-stream"));

    // Appending while the subscriber is connected delivers a fourth frame.
    let appender = {
        let events = events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            events
                .append(NewEvent::new("live_event", "/p", json!({ "n": 3 })))
                .await
                .unwrap();
        })
    };

    let frames = read_frames(response, 4, Duration::from_secs(5)).await;
    appender.await.unwrap();

    assert_eq!(frames.len(), 4);
    let sequences: Vec<i64> = frames.iter().map(|f| f["sequence"].as_i64().unwrap()).collect();
    assert_eq!(sequences, vec![1, 2, 3, 4]);
    assert_eq!(frames[3]["event_type"], json!("live_event"));

    // Stopping the server with a live subscriber does not hang.
    tokio::time::timeout(Duration::from_secs(5), server.stop())
        .await
        .expect("server stop timed out");
}

#[tokio::test]
async fn sse_resumes_from_offset() {
    let (server, events, url, _dir) = started_server().await;
    seed(&events, "/p", 3).await;

    let response = reqwest::get(format!("{url}/streams/%2Fp?live=true&offset=2"))
        .await
        .unwrap();
    let frames = read_frames(response, 1, Duration::from_secs(5)).await;
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["sequence"], json!(3));

    server.stop().await;
}

#[tokio::test]
async fn sse_filters_by_project() {
    let (server, events, url, _dir) = started_server().await;
    seed(&events, "/p", 1).await;
    seed(&events, "/other", 1).await;

    let response = reqwest::get(format!("{url}/streams/%2Fp?live=true&offset=0"))
        .await
        .unwrap();

    let appender = {
        let events = events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            events.append(NewEvent::new("noise", "/other", json!({}))).await.unwrap();
            events.append(NewEvent::new("signal", "/p", json!({}))).await.unwrap();
        })
    };

    let frames = read_frames(response, 2, Duration::from_secs(5)).await;
    appender.await.unwrap();

    assert_eq!(frames.len(), 2);
    assert!(frames.iter().all(|f| f["project_key"] == json!("/p")));
    assert_eq!(frames[1]["event_type"], json!("signal"));

    server.stop().await;
}
