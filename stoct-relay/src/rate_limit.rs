//! Token bucket rate limiter per user.

use crate::error::RelayError;
use axum::body::Body;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Idle buckets are pruned once the table grows past this.
const MAX_TRACKED_CLIENTS: usize = 10_000;

#[derive(Clone)]
pub struct RateLimiter {
    buckets: Arc<Mutex<HashMap<String, TokenBucket>>>,
    max_tokens: u32,
    refill_rate: f64, // tokens per second
}

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// `requests_per_minute == 0` disables limiting.
    pub fn new(requests_per_minute: u32) -> Self {
        Self {
            buckets: Arc::new(Mutex::new(HashMap::new())),
            max_tokens: requests_per_minute,
            refill_rate: requests_per_minute as f64 / 60.0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.max_tokens > 0
    }

    /// Take one token for `key`. Returns false when the bucket is empty.
    pub fn check(&self, key: &str) -> bool {
        if !self.is_enabled() {
            return true;
        }
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();

        if buckets.len() >= MAX_TRACKED_CLIENTS && !buckets.contains_key(key) {
            self.prune(&mut buckets, now);
        }

        let bucket = buckets.entry(key.to_string()).or_insert(TokenBucket {
            tokens: self.max_tokens as f64,
            last_refill: now,
        });

        // Refill tokens
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_rate).min(self.max_tokens as f64);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    // A bucket that would be full again carries no information.
    fn prune(&self, buckets: &mut HashMap<String, TokenBucket>, now: Instant) {
        let max = self.max_tokens as f64;
        buckets.retain(|_, b| {
            b.tokens + now.duration_since(b.last_refill).as_secs_f64() * self.refill_rate < max
        });
    }
}

#[derive(Deserialize)]
struct UserParam {
    user: Option<String>,
}

/// Rejects with 429 once a client's bucket is empty.
///
/// Clients are keyed by the `user` query parameter, falling back to the peer
/// address for requests that carry none.
pub async fn rate_limit_middleware(
    State(limiter): State<RateLimiter>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, RelayError> {
    if limiter.is_enabled() {
        let key = client_key(&request);
        if !limiter.check(&key) {
            tracing::warn!(client = %key, "Rate limit exceeded");
            return Err(RelayError::RateLimited);
        }
    }
    Ok(next.run(request).await)
}

fn client_key(request: &Request<Body>) -> String {
    let user = Query::<UserParam>::try_from_uri(request.uri())
        .ok()
        .and_then(|Query(p)| p.user)
        .filter(|u| !u.is_empty());
    if let Some(user) = user {
        return format!("user:{}", user);
    }
    match request.extensions().get::<ConnectInfo<SocketAddr>>() {
        Some(ConnectInfo(addr)) => format!("addr:{}", addr.ip()),
        None => "anonymous".to_string(),
    }
}
