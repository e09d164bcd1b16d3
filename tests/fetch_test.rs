// Fallback fetcher against a real HTTP upstream.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;

use blob_relay_engine::config::FetchConfig;
use blob_relay_engine::engine::stats::StatsCollector;
use blob_relay_engine::error::BlobError;
use blob_relay_engine::fetch::FallbackFetcher;
use blob_relay_engine::source::HttpTransport;

const BODY: &[u8] = b"lesson-video-bytes";

async fn start_upstream(flaky_failures: usize) -> SocketAddr {
    let calls = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route(
            "/broken",
            get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
        )
        .route("/ok", get(|| async { BODY.to_vec() }))
        .route(
            "/flaky",
            get(move || {
                let calls = Arc::clone(&calls);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < flaky_failures {
                        (StatusCode::SERVICE_UNAVAILABLE, Vec::new()).into_response()
                    } else {
                        (StatusCode::OK, BODY.to_vec()).into_response()
                    }
                }
            }),
        );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    addr
}

fn fetcher() -> FallbackFetcher {
    let config = FetchConfig {
        timeout_ms: 2_000,
        max_retries: 1,
        backoff_base_ms: 10,
    };
    FallbackFetcher::new(
        Arc::new(HttpTransport::new()),
        config,
        Arc::new(StatsCollector::new()),
    )
}

#[tokio::test]
async fn test_falls_through_to_second_url() {
    let addr = start_upstream(0).await;
    let urls = vec![
        format!("http://{}/broken", addr),
        format!("http://{}/ok", addr),
    ];
    let fetcher = fetcher();

    let outcome = fetcher.fetch_with_fallback(&urls, None, None).await.unwrap();
    assert_eq!(&outcome.data[..], BODY);
    assert_eq!(outcome.url_index, 1);
    assert_eq!(outcome.success_url, urls[1]);
    assert_eq!(outcome.retry_count, 0);

    let broken = fetcher.url_health(&urls[0]).unwrap();
    assert_eq!(broken.failure_count, 2);
    assert!(!broken.is_healthy());
    assert!(broken.last_error.is_some());
    assert!(fetcher.url_health(&urls[1]).unwrap().is_healthy());

    // The healthy URL now sorts first.
    assert_eq!(fetcher.healthy_first(&urls), vec![urls[1].clone(), urls[0].clone()]);
}

#[tokio::test]
async fn test_retry_count_reports_failed_attempts_on_winner() {
    let addr = start_upstream(1).await;
    let urls = vec![format!("http://{}/flaky", addr)];

    let outcome = fetcher()
        .fetch_with_fallback(&urls, None, Some(2))
        .await
        .unwrap();
    assert_eq!(outcome.url_index, 0);
    assert_eq!(outcome.retry_count, 1);
}

#[tokio::test]
async fn test_all_urls_exhausted() {
    let addr = start_upstream(0).await;
    let urls = vec![
        format!("http://{}/broken", addr),
        format!("http://{}/missing", addr),
    ];
    let fetcher = fetcher();

    let err = fetcher
        .fetch_with_fallback(&urls, Some(Duration::from_secs(1)), Some(0))
        .await
        .unwrap_err();
    match err {
        BlobError::Exhausted(msg) => {
            assert!(msg.starts_with("All fallback URLs exhausted"));
            assert!(msg.contains("404"));
        }
        other => panic!("unexpected error: {other:?}"),
    }

    fetcher.clear_url_health();
    assert!(fetcher.url_health(&urls[0]).is_none());
}
