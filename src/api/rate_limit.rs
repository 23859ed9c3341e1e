//! Rate limiting middleware for the API
//!
//! Sliding-window limiter: each client IP may make a configured number of
//! requests per window (one minute by default); the request over budget is
//! answered 429 with a `Retry-After` hint for when the oldest hit leaves
//! the window. Supports exempt paths and IPs.

use axum::{
    Json,
    extract::{ConnectInfo, Request},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::{
    collections::{HashMap, VecDeque},
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::Mutex;

use crate::config::RateLimitConfig;
use crate::error::OperationOutcome;

/// Rate limiter with per-IP hit tracking
pub struct RateLimiter {
    /// Per-IP timestamps of requests inside the current window
    windows: Mutex<HashMap<IpAddr, VecDeque<Instant>>>,
    /// Configuration
    config: RateLimitConfig,
}

impl RateLimiter {
    /// Create a new rate limiter from configuration
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Check if a path is exempt from rate limiting
    fn is_path_exempt(&self, path: &str) -> bool {
        self.config.exempt_paths.iter().any(|exempt| {
            // Support both exact matches and prefix matches
            path == exempt || path.starts_with(exempt)
        })
    }

    /// Check if an IP address is exempt from rate limiting
    fn is_ip_exempt(&self, addr: &SocketAddr) -> bool {
        self.config.exempt_ips.contains(&addr.ip())
    }

    /// Check if request should be rate limited.
    ///
    /// Returns the Retry-After hint in seconds when the client is over
    /// budget, `None` when the request may proceed.
    pub async fn check(&self, path: &str, addr: SocketAddr) -> Option<u64> {
        if self.is_path_exempt(path) {
            return None;
        }
        if self.is_ip_exempt(&addr) {
            return None;
        }

        let window = Duration::from_secs(self.config.window_secs);
        let mut windows = self.windows.lock().await;
        let hits = windows.entry(addr.ip()).or_default();
        slide(hits, Instant::now(), window, self.config.max_requests)
    }
}

/// Advance one client's window to `now` and admit or reject the request.
///
/// Expired hits are dropped from the front; a request within budget is
/// recorded and admitted, one over budget is rejected with the seconds
/// until the oldest remaining hit expires.
fn slide(
    hits: &mut VecDeque<Instant>,
    now: Instant,
    window: Duration,
    max_requests: u32,
) -> Option<u64> {
    while let Some(oldest) = hits.front() {
        if now.duration_since(*oldest) >= window {
            hits.pop_front();
        } else {
            break;
        }
    }

    if (hits.len() as u32) < max_requests {
        hits.push_back(now);
        return None;
    }

    let oldest = hits.front()?;
    let elapsed = now.duration_since(*oldest);
    Some((window - elapsed).as_secs().max(1))
}

/// Rate limiting middleware function
pub async fn rate_limit_middleware(
    axum::extract::State(limiter): axum::extract::State<Arc<RateLimiter>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
    next: axum::middleware::Next,
) -> Response {
    match limiter.check(req.uri().path(), addr).await {
        None => next.run(req).await,
        Some(retry_after) => {
            let outcome = OperationOutcome::error(
                "throttled",
                format!("too many requests; retry in {retry_after} seconds"),
            );
            (
                StatusCode::TOO_MANY_REQUESTS,
                [("retry-after", retry_after.to_string())],
                Json(outcome),
            )
                .into_response()
        }
    }
}
