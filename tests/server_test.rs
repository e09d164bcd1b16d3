// Integration test for the custodian endpoint.

use std::sync::Arc;

use bytes::Bytes;
use sha2::{Digest, Sha256};

use blob_relay_engine::api::BlobEngine;
use blob_relay_engine::config::EngineConfig;
use blob_relay_engine::engine::bootstrap::BootstrapState;
use blob_relay_engine::server::BlobServer;

const CONTENT_SIZE: usize = 256 * 1024;

/// Generate deterministic test content.
fn generate_content() -> Vec<u8> {
    (0..CONTENT_SIZE).map(|i| (i % 256) as u8).collect()
}

async fn serving_engine() -> (BlobServer, String) {
    let engine = Arc::new(BlobEngine::new(EngineConfig::default()).unwrap());
    assert_eq!(engine.start().await, BootstrapState::Ready);

    let content = generate_content();
    let hash = hex::encode(Sha256::digest(&content));
    engine
        .blob_cache()
        .put(&hash, Bytes::from(content))
        .unwrap();

    let server = BlobServer::start(engine).await.unwrap();
    (server, hash)
}

#[tokio::test]
async fn test_store_endpoint_range_semantics() {
    let (server, hash) = serving_engine().await;
    let url = server.url_for_blob(&hash);
    let client = reqwest::Client::new();
    let expected = generate_content();

    let resp = client
        .get(&url)
        .header("Range", "bytes=0-1023")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 206);
    assert_eq!(
        resp.headers()["content-range"],
        format!("bytes 0-1023/{}", CONTENT_SIZE).as_str()
    );
    let body = resp.bytes().await.unwrap();
    assert_eq!(&body[..], &expected[0..1024]);

    // Suffix range.
    let resp = client
        .get(&url)
        .header("Range", "bytes=-100")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 206);
    let body = resp.bytes().await.unwrap();
    assert_eq!(&body[..], &expected[CONTENT_SIZE - 100..]);

    // No range: the whole blob.
    let resp = client.get(&url).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.bytes().await.unwrap().len(), CONTENT_SIZE);

    // Past the end.
    let resp = client
        .get(&url)
        .header("Range", format!("bytes={}-", CONTENT_SIZE))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 416);

    let head_resp = client.head(&url).send().await.unwrap();
    assert_eq!(head_resp.status(), 200);
    assert!(head_resp.headers().contains_key("accept-ranges"));
    assert_eq!(
        head_resp.headers()["content-length"],
        CONTENT_SIZE.to_string().as_str()
    );

    let stats = server.engine().stats();
    assert!(stats.total_served >= (1024 + 100 + CONTENT_SIZE) as u64);

    let resp_404 = client
        .get(server.url_for_blob(&"0".repeat(64)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp_404.status(), 404);

    server.shutdown();
}

async fn health(server: &BlobServer) -> serde_json::Value {
    let raw = reqwest::get(format!("{}/health", server.base_url()))
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();
    serde_json::from_slice(&raw).unwrap()
}

#[tokio::test]
async fn test_health_endpoint_reports_accepting() {
    let (server, _) = serving_engine().await;
    let body = health(&server).await;
    assert_eq!(body["accepting_blobs"], true);

    server.engine().shutdown().await;
    let body = health(&server).await;
    assert_eq!(body["accepting_blobs"], false);

    server.shutdown();
}
