//! Per-IP request throttle guarding the websocket upgrade and the
//! credential-gateway paths against reconnect/brute-force storms.
//!
//! A `DashMap`-backed fixed-window counter per `(ip, scope)`,
//! periodically swept so idle buckets don't accumulate forever. This is
//! an ambient abuse-resistance
//! concern, not a named spec feature; it never changes the documented
//! status code for a correctly authenticated request, only adds `429`
//! for clients that exceed the window.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Json, Response};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::state::AppState;

const CLEANUP_EVERY_REQUESTS: u64 = 512;

#[derive(Clone)]
pub struct RequestThrottle {
    limits: ThrottleLimits,
    buckets: Arc<DashMap<ThrottleKey, WindowState>>,
    requests_seen: Arc<AtomicU64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ThrottleScope {
    Websocket,
    ApiKeys,
}

impl ThrottleScope {
    fn from_path(path: &str) -> Option<Self> {
        if path == "/websocket" {
            return Some(Self::Websocket);
        }
        if path.starts_with("/api-keys") {
            return Some(Self::ApiKeys);
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ThrottleKey {
    ip: IpAddr,
    scope: ThrottleScope,
}

#[derive(Debug, Clone, Copy)]
struct WindowState {
    started_at: Instant,
    count: usize,
}

#[derive(Debug, Clone, Copy)]
struct RateLimit {
    max_requests: usize,
    window: Duration,
}

#[derive(Debug, Clone, Copy)]
struct ThrottleLimits {
    websocket: RateLimit,
    api_keys: RateLimit,
}

impl Default for ThrottleLimits {
    fn default() -> Self {
        Self {
            // Limit reconnect storms for websocket upgrades.
            websocket: RateLimit {
                max_requests: 30,
                window: Duration::from_secs(60),
            },
            // Credential management is low-volume by nature.
            api_keys: RateLimit {
                max_requests: 60,
                window: Duration::from_secs(60),
            },
        }
    }
}

enum ThrottleDecision {
    Allowed,
    Denied { retry_after: Duration },
}

impl RequestThrottle {
    pub fn new() -> Self {
        Self::with_limits(ThrottleLimits::default())
    }

    fn with_limits(limits: ThrottleLimits) -> Self {
        Self {
            limits,
            buckets: Arc::new(DashMap::new()),
            requests_seen: Arc::new(AtomicU64::new(0)),
        }
    }

    fn limit_for(&self, scope: ThrottleScope) -> RateLimit {
        match scope {
            ThrottleScope::Websocket => self.limits.websocket,
            ThrottleScope::ApiKeys => self.limits.api_keys,
        }
    }

    fn check(&self, ip: IpAddr, scope: ThrottleScope) -> ThrottleDecision {
        self.check_at(ip, scope, Instant::now())
    }

    fn check_at(&self, ip: IpAddr, scope: ThrottleScope, now: Instant) -> ThrottleDecision {
        let limit = self.limit_for(scope);
        let key = ThrottleKey { ip, scope };

        let decision = match self.buckets.entry(key) {
            Entry::Occupied(mut occupied) => {
                let state = occupied.get_mut();
                let elapsed = now.duration_since(state.started_at);
                if elapsed >= limit.window {
                    state.started_at = now;
                    state.count = 1;
                    ThrottleDecision::Allowed
                } else if state.count < limit.max_requests {
                    state.count += 1;
                    ThrottleDecision::Allowed
                } else {
                    ThrottleDecision::Denied {
                        retry_after: limit.window.saturating_sub(elapsed),
                    }
                }
            },
            Entry::Vacant(vacant) => {
                vacant.insert(WindowState {
                    started_at: now,
                    count: 1,
                });
                ThrottleDecision::Allowed
            },
        };

        self.cleanup_if_needed(now);
        decision
    }

    fn cleanup_if_needed(&self, now: Instant) {
        let seen = self.requests_seen.fetch_add(1, Ordering::Relaxed) + 1;
        if !seen.is_multiple_of(CLEANUP_EVERY_REQUESTS) {
            return;
        }
        let stale_after = self.max_window().saturating_mul(3);
        self.buckets
            .retain(|_, state| now.duration_since(state.started_at) <= stale_after);
    }

    fn max_window(&self) -> Duration {
        [self.limits.websocket.window, self.limits.api_keys.window]
            .into_iter()
            .max()
            .unwrap_or(Duration::from_secs(60))
    }
}

impl Default for RequestThrottle {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn throttle_gate(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    let path = request.uri().path().to_owned();
    let Some(scope) = ThrottleScope::from_path(&path) else {
        return next.run(request).await;
    };

    match state.throttle.check(addr.ip(), scope) {
        ThrottleDecision::Allowed => next.run(request).await,
        ThrottleDecision::Denied { retry_after } => rate_limited_response(retry_after),
    }
}

fn rate_limited_response(retry_after: Duration) -> Response {
    let retry_after_secs = retry_after.as_secs().max(1);
    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        Json(serde_json::json!({
            "error": "too many requests",
            "retryAfterSeconds": retry_after_secs,
        })),
    )
        .into_response();

    if let Ok(value) = retry_after_secs.to_string().parse() {
        response.headers_mut().insert(axum::http::header::RETRY_AFTER, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_websocket_and_api_keys_paths() {
        assert_eq!(ThrottleScope::from_path("/websocket"), Some(ThrottleScope::Websocket));
        assert_eq!(ThrottleScope::from_path("/api-keys"), Some(ThrottleScope::ApiKeys));
        assert_eq!(ThrottleScope::from_path("/api-keys/proj-x"), Some(ThrottleScope::ApiKeys));
        assert_eq!(ThrottleScope::from_path("/health"), None);
    }

    #[test]
    fn websocket_window_limits_reconnect_storms() {
        let throttle = RequestThrottle::with_limits(ThrottleLimits {
            websocket: RateLimit {
                max_requests: 2,
                window: Duration::from_secs(10),
            },
            api_keys: RateLimit {
                max_requests: 100,
                window: Duration::from_secs(10),
            },
        });

        let ip = IpAddr::V4(std::net::Ipv4Addr::LOCALHOST);
        let now = Instant::now();

        assert!(matches!(throttle.check_at(ip, ThrottleScope::Websocket, now), ThrottleDecision::Allowed));
        assert!(matches!(throttle.check_at(ip, ThrottleScope::Websocket, now), ThrottleDecision::Allowed));
        assert!(matches!(
            throttle.check_at(ip, ThrottleScope::Websocket, now),
            ThrottleDecision::Denied { .. }
        ));
        assert!(matches!(
            throttle.check_at(ip, ThrottleScope::Websocket, now + Duration::from_secs(11)),
            ThrottleDecision::Allowed
        ));
    }
}
