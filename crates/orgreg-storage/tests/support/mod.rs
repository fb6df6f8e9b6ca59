#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;

/// Local HTTP server serving one dataset body, optionally honouring `Range`.
pub struct DatasetServer {
    pub url: String,
    pub base: String,
    hits: Arc<AtomicUsize>,
}

impl DatasetServer {
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

struct Served {
    body: Vec<u8>,
    ranges: bool,
    hits: Arc<AtomicUsize>,
}

pub async fn spawn(body: Vec<u8>, ranges: bool) -> DatasetServer {
    let hits = Arc::new(AtomicUsize::new(0));
    let state = Arc::new(Served {
        body,
        ranges,
        hits: hits.clone(),
    });
    let app = Router::new()
        .route("/dataset.zip", get(serve))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    DatasetServer {
        url: format!("http://{addr}/dataset.zip"),
        base: format!("http://{addr}"),
        hits,
    }
}

async fn serve(State(state): State<Arc<Served>>, headers: HeaderMap) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    let total = state.body.len() as u64;
    let requested = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| parse_range(v, total));

    match requested {
        Some((start, end)) if state.ranges => (
            StatusCode::PARTIAL_CONTENT,
            [
                (header::CONTENT_RANGE, format!("bytes {start}-{end}/{total}")),
                (header::ACCEPT_RANGES, "bytes".to_string()),
            ],
            state.body[start as usize..=end as usize].to_vec(),
        )
            .into_response(),
        _ => (StatusCode::OK, state.body.clone()).into_response(),
    }
}

fn parse_range(value: &str, total: u64) -> Option<(u64, u64)> {
    let (start, end) = value.strip_prefix("bytes=")?.split_once('-')?;
    let start: u64 = start.trim().parse().ok()?;
    let end: u64 = end.trim().parse().ok()?;
    if start > end || start >= total {
        return None;
    }
    Some((start, end.min(total - 1)))
}
