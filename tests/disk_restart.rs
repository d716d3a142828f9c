//! The disk backend keeps undelivered entries across detach/re-attach
//! and drains them before anything stored afterwards.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use serde_json::Value;

use loki_shipper::{Event, HandlerConfig, HandlerRegistry, Level};

type Captured = Arc<Mutex<Vec<Value>>>;

async fn start_mock_loki() -> (String, Captured) {
    let captured: Captured = Arc::new(Mutex::new(Vec::new()));
    let state = Arc::clone(&captured);

    let app = Router::new().route(
        "/loki/api/v1/push",
        post(move |body: Bytes| {
            let state = Arc::clone(&state);
            async move {
                let value: Value =
                    serde_json::from_slice(&body).expect("push body must be JSON");
                state.lock().unwrap().push(value);
                StatusCode::NO_CONTENT
            }
        }),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind mock Loki");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("mock Loki failed");
    });

    (format!("http://{addr}"), captured)
}

async fn closed_port_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}

fn disk_config(loki_url: &str, data_dir: &std::path::Path) -> HandlerConfig {
    let mut config = HandlerConfig::new(loki_url);
    config.data_dir = Some(data_dir.to_string_lossy().into_owned());
    config.batch_interval_ms = 60_000;
    config
}

fn collect_messages(requests: &[Value]) -> Vec<String> {
    let mut messages = Vec::new();
    for request in requests {
        for stream in request["streams"].as_array().unwrap() {
            for value in stream["values"].as_array().unwrap() {
                messages.push(value[1].as_str().unwrap().to_owned());
            }
        }
    }
    messages
}

#[tokio::test]
async fn undelivered_entries_survive_a_restart() {
    let tmp = tempfile::TempDir::new().unwrap();
    let data_dir = tmp.path().join("buffer");
    let registry = HandlerRegistry::new();

    // First life: the endpoint is down, nothing can be delivered.
    registry
        .attach("h", disk_config(&closed_port_url().await, &data_dir))
        .await
        .unwrap();
    for i in 1..=3 {
        registry
            .store(
                "h",
                Event::new(Level::Info, format!("old {i}")).with_time_us(i),
            )
            .await
            .unwrap();
    }
    let handler = registry.handler("h").await.unwrap();
    assert_eq!(handler.buffered().await.unwrap(), 3);
    registry.detach("h").await.unwrap();
    drop(handler);

    // Second life: same directory, endpoint reachable.
    let (url, captured) = start_mock_loki().await;
    registry
        .attach("h", disk_config(&url, &data_dir))
        .await
        .unwrap();
    let handler = registry.handler("h").await.unwrap();
    assert_eq!(
        handler.buffered().await.unwrap(),
        3,
        "persisted entries are visible after re-attach"
    );

    registry.flush("h").await.unwrap();
    assert_eq!(handler.buffered().await.unwrap(), 0);
    let messages = collect_messages(&captured.lock().unwrap());
    assert_eq!(messages, vec!["old 1", "old 2", "old 3"]);

    registry.detach("h").await.unwrap();
}

#[tokio::test]
async fn pre_restart_entries_drain_before_post_restart_ones() {
    let tmp = tempfile::TempDir::new().unwrap();
    let data_dir = tmp.path().join("buffer");
    let registry = HandlerRegistry::new();

    registry
        .attach("h", disk_config(&closed_port_url().await, &data_dir))
        .await
        .unwrap();
    for i in 1..=3 {
        registry
            .store(
                "h",
                Event::new(Level::Info, format!("old {i}")).with_time_us(i + 10),
            )
            .await
            .unwrap();
    }
    registry.detach("h").await.unwrap();

    // Re-attach with a small batch size and a live endpoint, then add two
    // more entries with *earlier* timestamps. Batches are taken in key
    // order, so the first push must still hold the pre-restart entries.
    let (url, captured) = start_mock_loki().await;
    let mut config = disk_config(&url, &data_dir);
    config.batch_size = 3;
    config.batch_interval_ms = 200;
    registry.attach("h", config).await.unwrap();
    for i in 1..=2 {
        registry
            .store(
                "h",
                Event::new(Level::Info, format!("new {i}")).with_time_us(i),
            )
            .await
            .unwrap();
    }

    let handler = registry.handler("h").await.unwrap();
    let mut drained = false;
    for _ in 0..100 {
        if handler.buffered().await.unwrap() == 0 {
            drained = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(drained, "timer never drained the buffer");

    let requests = captured.lock().unwrap().clone();
    let first_batch = collect_messages(&requests[..1]);
    assert_eq!(first_batch, vec!["old 1", "old 2", "old 3"]);

    let mut rest = collect_messages(&requests[1..]);
    rest.sort();
    assert_eq!(rest, vec!["new 1", "new 2"]);

    registry.detach("h").await.unwrap();
}
