// Custodian endpoint: serves verified blobs from the local caches so that other
// engines can use this one as a replica.

use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::Bytes;
use tokio::net::TcpListener;
use tracing::debug;

use crate::api::BlobEngine;
use crate::custodian::HealthResponse;

pub struct BlobServer {
    port: u16,
    engine: Arc<BlobEngine>,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl BlobServer {
    /// Serve `engine` on an ephemeral loopback port.
    pub async fn start(engine: Arc<BlobEngine>) -> Result<Self> {
        Self::bind(engine, "127.0.0.1:0").await
    }

    pub async fn bind(engine: Arc<BlobEngine>, addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let port = listener.local_addr()?.port();

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        let app = Router::new()
            .route("/store/{hash}", get(store_handler).head(head_handler))
            .route("/health", get(health_handler))
            .with_state(engine.clone());

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        Ok(Self {
            port,
            engine,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Base URL to advertise in a `CustodianCapability`.
    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub fn url_for_blob(&self, hash: &str) -> String {
        format!("{}/store/{}", self.base_url(), hash)
    }

    pub fn engine(&self) -> &Arc<BlobEngine> {
        &self.engine
    }

    pub fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum ParsedRange {
    StartEnd {
        start: u64,
        end_inclusive: Option<u64>,
    },
    Suffix {
        len: u64,
    },
}

/// Parse a Range header value.
/// Supports:
/// - bytes=start-end
/// - bytes=start-
/// - bytes=-suffix_len
fn parse_range_header(value: &str) -> Option<ParsedRange> {
    let value = value.trim();
    let rest = value.strip_prefix("bytes=")?;
    let mut parts = rest.splitn(2, '-');
    let start_str = parts.next()?.trim();
    let end_str = parts.next()?.trim();

    if start_str.is_empty() {
        let len: u64 = end_str.parse().ok()?;
        if len == 0 {
            return None;
        }
        Some(ParsedRange::Suffix { len })
    } else {
        let start: u64 = start_str.parse().ok()?;
        let end_inclusive = if end_str.is_empty() {
            None
        } else {
            Some(end_str.parse::<u64>().ok()?)
        };
        Some(ParsedRange::StartEnd {
            start,
            end_inclusive,
        })
    }
}

/// Resolve a Range header against `total`. `Ok(None)` means the whole body;
/// `Err(())` means the range cannot be satisfied.
fn resolve_range(headers: &HeaderMap, total: u64) -> std::result::Result<Option<(u64, u64)>, ()> {
    let Some(range) = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_range_header)
    else {
        return Ok(None);
    };

    // Returned end is exclusive.
    match range {
        ParsedRange::StartEnd {
            start,
            end_inclusive,
        } => {
            let end = end_inclusive.map_or(total, |e| e.saturating_add(1).min(total));
            if start >= total || end <= start {
                return Err(());
            }
            Ok(Some((start, end)))
        }
        ParsedRange::Suffix { len } => {
            if total == 0 {
                return Err(());
            }
            Ok(Some((total.saturating_sub(len), total)))
        }
    }
}

fn not_satisfiable(total: u64) -> Response {
    (
        StatusCode::RANGE_NOT_SATISFIABLE,
        [(header::CONTENT_RANGE, format!("bytes */{}", total))],
        "range not satisfiable",
    )
        .into_response()
}

fn base_headers(len: u64) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers
}

fn content_range(start: u64, end: u64, total: u64) -> HeaderValue {
    HeaderValue::from_str(&format!("bytes {}-{}/{}", start, end - 1, total))
        .unwrap_or_else(|_| HeaderValue::from_static("bytes */0"))
}

/// GET /store/{hash}: serve a cached blob with Range support.
async fn store_handler(
    State(engine): State<Arc<BlobEngine>>,
    Path(hash): Path<String>,
    headers: HeaderMap,
) -> Response {
    let Some(data) = engine.cached_bytes(&hash).await else {
        return (StatusCode::NOT_FOUND, "blob not found").into_response();
    };
    let total = data.len() as u64;

    let (body, status, range) = match resolve_range(&headers, total) {
        Err(()) => return not_satisfiable(total),
        Ok(None) => (data, StatusCode::OK, None),
        Ok(Some((start, end))) => (
            data.slice(start as usize..end as usize),
            StatusCode::PARTIAL_CONTENT,
            Some((start, end)),
        ),
    };

    debug!(
        "store request hash={} range={:?} bytes={}",
        hash,
        range,
        body.len()
    );

    let mut resp_headers = base_headers(body.len() as u64);
    if let Some((start, end)) = range {
        resp_headers.insert(header::CONTENT_RANGE, content_range(start, end, total));
    }
    engine.record_served(body.len() as u64);
    (status, resp_headers, body).into_response()
}

/// HEAD /store/{hash}: headers only.
async fn head_handler(
    State(engine): State<Arc<BlobEngine>>,
    Path(hash): Path<String>,
    headers: HeaderMap,
) -> Response {
    let Some(data) = engine.cached_bytes(&hash).await else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let total = data.len() as u64;

    match resolve_range(&headers, total) {
        Err(()) => not_satisfiable(total),
        Ok(None) => (StatusCode::OK, base_headers(total), Bytes::new()).into_response(),
        Ok(Some((start, end))) => {
            let mut resp_headers = base_headers(end - start);
            resp_headers.insert(header::CONTENT_RANGE, content_range(start, end, total));
            (StatusCode::PARTIAL_CONTENT, resp_headers, Bytes::new()).into_response()
        }
    }
}

/// GET /health: liveness plus whether this node takes new blobs.
async fn health_handler(State(engine): State<Arc<BlobEngine>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        accepting_blobs: engine.accepting_blobs(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_range_header_full() {
        let result = parse_range_header("bytes=0-1023");
        assert!(matches!(
            result,
            Some(ParsedRange::StartEnd {
                start: 0,
                end_inclusive: Some(1023)
            })
        ));
    }

    #[test]
    fn test_parse_range_header_open_ended() {
        let result = parse_range_header("bytes=500-");
        assert!(matches!(
            result,
            Some(ParsedRange::StartEnd {
                start: 500,
                end_inclusive: None
            })
        ));
    }

    #[test]
    fn test_parse_range_header_suffix() {
        let result = parse_range_header("bytes=-1024");
        assert!(matches!(result, Some(ParsedRange::Suffix { len: 1024 })));
    }

    #[test]
    fn test_parse_range_header_invalid() {
        assert_eq!(parse_range_header("invalid"), None);
        assert_eq!(parse_range_header("bytes=abc-def"), None);
    }

    #[test]
    fn test_resolve_range_bounds() {
        let mut headers = HeaderMap::new();
        assert_eq!(resolve_range(&headers, 100), Ok(None));

        headers.insert(header::RANGE, HeaderValue::from_static("bytes=10-19"));
        assert_eq!(resolve_range(&headers, 100), Ok(Some((10, 20))));

        headers.insert(header::RANGE, HeaderValue::from_static("bytes=90-500"));
        assert_eq!(resolve_range(&headers, 100), Ok(Some((90, 100))));

        headers.insert(header::RANGE, HeaderValue::from_static("bytes=-30"));
        assert_eq!(resolve_range(&headers, 100), Ok(Some((70, 100))));

        headers.insert(header::RANGE, HeaderValue::from_static("bytes=100-"));
        assert_eq!(resolve_range(&headers, 100), Err(()));
    }
}
