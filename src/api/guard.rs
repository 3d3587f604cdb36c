//! Checks every request passes before routing.
use std::sync::Mutex;

use axum::{
    extract::{Request, State},
    http::{Method, StatusCode, Uri},
    middleware::Next,
    response::Response,
};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::error::envelope;

/// Token bucket refilled at `qps` up to `burst` tokens.
#[derive(Debug)]
pub struct TokenBucket {
    qps: f64,
    burst: f64,
    state: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            qps: qps.max(0.0),
            burst,
            state: Mutex::new(Bucket {
                tokens: burst,
                last: Instant::now(),
            }),
        }
    }

    /// Take a token if one is left.
    pub fn try_acquire(&self) -> bool {
        let mut bucket = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let refill = now.duration_since(bucket.last).as_secs_f64() * self.qps;
        bucket.tokens = (bucket.tokens + refill).min(self.burst);
        bucket.last = now;

        if bucket.tokens < 1.0 {
            return false;
        }
        bucket.tokens -= 1.0;
        true
    }
}

pub(crate) async fn rate_limit(
    State(bucket): State<std::sync::Arc<TokenBucket>>,
    request: Request,
    next: Next,
) -> Response {
    if !bucket.try_acquire() {
        warn!("rate limited {} {}", request.method(), request.uri().path());
        return envelope(
            StatusCode::TOO_MANY_REQUESTS,
            "TooManyRequests",
            "request rate exceeded, retry later".into(),
        );
    }
    next.run(request).await
}

/// Only GET, POST and DELETE on canonical paths get through. A single
/// trailing slash is tolerated and stripped.
pub(crate) async fn canonical_request(mut request: Request, next: Next) -> Response {
    let method = request.method();
    if method != Method::GET && method != Method::POST && method != Method::DELETE {
        return not_found(format!("method {method} is not supported"));
    }

    let path = request.uri().path();
    let cleaned = clean_path(path);
    if path != cleaned && path != format!("{cleaned}/") {
        return not_found(format!("path {path} is not canonical"));
    }

    if path != cleaned {
        let rewritten = match request.uri().query() {
            Some(query) => format!("{cleaned}?{query}"),
            None => cleaned,
        };
        match rewritten.parse::<Uri>() {
            Ok(uri) => {
                debug!("rewrote {} to {uri}", request.uri());
                *request.uri_mut() = uri;
            }
            Err(e) => return not_found(format!("invalid path: {e}")),
        }
    }
    next.run(request).await
}

fn not_found(reason: String) -> Response {
    envelope(StatusCode::NOT_FOUND, "NotFound", reason)
}

/// Lexically shortest form of `path`: repeated slashes collapsed, `.` and
/// `..` segments resolved, no trailing slash.
pub(crate) fn clean_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            _ => segments.push(segment),
        }
    }
    format!("/{}", segments.join("/"))
}
