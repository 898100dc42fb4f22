use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use launch_fetch::FetchError;
use launch_store::{LaunchStore, MemoryLaunchStore, PersistenceError};
use launch_sync::{IngestConfig, IngestPipeline};
use serde_json::json;

async fn stub_upstream() -> SocketAddr {
    let router = Router::new()
        .route(
            "/repeated",
            get(|| async {
                Json(json!([
                    {"id": "a", "x": 1},
                    {"id": "b", "x": 2},
                    {"id": "a", "x": 3}
                ]))
            }),
        )
        .route("/no-id", get(|| async { Json(json!([{"x": 1}])) }))
        .route(
            "/broken",
            get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "upstream down") }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind stub upstream");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("stub upstream");
    });
    addr
}

fn pipeline(addr: SocketAddr, path: &str) -> IngestPipeline {
    IngestPipeline::new(IngestConfig {
        source_url: format!("http://{addr}{path}"),
        http_timeout_secs: 5,
        ..Default::default()
    })
    .expect("pipeline")
}

#[tokio::test]
async fn repeated_ids_converge_to_last_occurrence() {
    let addr = stub_upstream().await;
    let store = Arc::new(MemoryLaunchStore::new());

    let summary = pipeline(addr, "/repeated")
        .run_once(|| {
            let store = store.clone();
            async move { Ok(store) }
        })
        .await
        .expect("run");

    assert_eq!(summary.fetched, 3);
    assert_eq!(summary.superseded, 1);
    assert_eq!(summary.upserted, 2);
    assert_eq!(summary.stored_total, 2);

    let table = store.snapshot().await;
    assert_eq!(table.len(), 2);
    assert_eq!(table["a"].payload, json!({"id": "a", "x": 3}));
    assert_eq!(table["b"].payload, json!({"id": "b", "x": 2}));
}

#[tokio::test]
async fn rerunning_the_same_dataset_is_idempotent() {
    let addr = stub_upstream().await;
    let store = Arc::new(MemoryLaunchStore::new());
    let pipeline = pipeline(addr, "/repeated");

    pipeline
        .run_once(|| {
            let store = store.clone();
            async move { Ok(store) }
        })
        .await
        .expect("first run");
    let first = store.get("a").await.expect("get").expect("row");

    let summary = pipeline
        .run_once(|| {
            let store = store.clone();
            async move { Ok(store) }
        })
        .await
        .expect("second run");
    let second = store.get("a").await.expect("get").expect("row");

    assert_eq!(summary.stored_total, 2);
    assert_eq!(second.payload, first.payload);
    assert!(second.ingested_at >= first.ingested_at);
}

#[tokio::test]
async fn records_without_id_succeed_with_no_rows() {
    let addr = stub_upstream().await;
    let store = Arc::new(MemoryLaunchStore::new());

    let summary = pipeline(addr, "/no-id")
        .run_once(|| {
            let store = store.clone();
            async move { Ok(store) }
        })
        .await
        .expect("run");

    assert_eq!(summary.fetched, 1);
    assert_eq!(summary.skipped_without_id, 1);
    assert_eq!(summary.upserted, 0);
    assert_eq!(store.count().await.expect("count"), 0);
}

#[tokio::test]
async fn upstream_error_never_opens_the_store() {
    let addr = stub_upstream().await;
    let opened = AtomicBool::new(false);
    let store = Arc::new(MemoryLaunchStore::new());

    let err = pipeline(addr, "/broken")
        .run_once(|| {
            opened.store(true, Ordering::SeqCst);
            let store = store.clone();
            async move { Ok(store) }
        })
        .await
        .expect_err("500 must fail the run");

    assert!(matches!(
        err.downcast_ref::<FetchError>(),
        Some(FetchError::HttpStatus { status: 500, .. })
    ));
    assert!(!opened.load(Ordering::SeqCst));
    assert_eq!(store.write_attempts(), 0);
}

#[tokio::test]
async fn persistence_failure_commits_nothing() {
    let addr = stub_upstream().await;
    let store = Arc::new(MemoryLaunchStore::new().with_batch_size(1).failing_on("b"));

    let err = pipeline(addr, "/repeated")
        .run_once(|| {
            let store = store.clone();
            async move { Ok(store) }
        })
        .await
        .expect_err("injected failure must fail the run");

    assert!(matches!(
        err.downcast_ref::<PersistenceError>(),
        Some(PersistenceError::Rejected(_))
    ));
    assert_eq!(store.write_attempts(), 1);
    assert!(store.snapshot().await.is_empty());
}
