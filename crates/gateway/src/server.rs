//! Router assembly and the middleware stack (spec.md §4.1, SPEC_FULL.md
//! §4.1). `apply_middleware_stack` wraps a plain `axum::Router` with a
//! fixed layer order applied uniformly to every HTTP surface served, and
//! `build_gateway_app` assembles the top-level router from it.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderName, HeaderValue, Method, StatusCode, header};
use axum::routing::get;
use axum::{Router, middleware};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::sensitive_headers::SetSensitiveRequestHeadersLayer;
use tower_http::trace::TraceLayer;

use roombus_config::Config;
use roombus_credentials::ApiKeyStore;
use roombus_credentials::routes::{CredentialState, credential_routes};
use roombus_room::{LogBucketStore, UsageCounterStore};

use crate::router::{health_handler, status_handler, usage_handler};
use crate::state::{AppState, RoomRegistry};
use crate::throttle::{RequestThrottle, throttle_gate};
use crate::ws::websocket_upgrade_handler;

/// Request bodies larger than this are rejected before reaching a handler
/// (the only body-bearing routes are `/api-keys` management calls).
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Inputs needed to assemble the gateway app, beyond `Config` itself,
/// kept separate so callers (tests, `roombus-cli`) can swap in their own
/// pool-backed stores without threading a dozen constructor arguments.
pub struct ServerConfig {
    pub config: Arc<Config>,
    pub api_keys: Arc<ApiKeyStore>,
    pub log_store: Arc<dyn LogBucketStore>,
    pub usage_store: Arc<dyn UsageCounterStore>,
}

/// Build the full gateway `axum::Router`, state and all. The caller is
/// responsible for serving it with `into_make_service_with_connect_info`
/// (the throttle and websocket handlers both extract `ConnectInfo`).
pub fn build_gateway_app(server_config: ServerConfig) -> Router {
    let ServerConfig {
        config,
        api_keys,
        log_store,
        usage_store,
    } = server_config;

    let rooms = Arc::new(RoomRegistry::new(
        log_store.clone(),
        usage_store.clone(),
        config.idle_timeout,
        config.request_timeout,
    ));

    let state = AppState {
        config: config.clone(),
        rooms,
        api_keys: api_keys.clone(),
        log_store,
        usage_store,
        throttle: Arc::new(RequestThrottle::new()),
    };

    let credential_state = CredentialState {
        store: api_keys,
        service_key: config.service_key.as_deref().map(Into::into),
    };

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/websocket", get(websocket_upgrade_handler))
        .route("/status", get(status_handler))
        .route("/usage", get(usage_handler))
        .nest("/api-keys", credential_routes(credential_state))
        .route_layer(middleware::from_fn_with_state(state.clone(), throttle_gate))
        .with_state(state);

    apply_middleware_stack(app)
}

/// Wrap `app` with the process-wide middleware stack, outermost to
/// innermost: panic catch, sensitive-header redaction, request id
/// generation, tracing, CORS preflight short-circuit, CORS, request id
/// propagation, security response headers, body-size limit, response
/// compression.
fn apply_middleware_stack(app: Router) -> Router {
    let request_id_header = HeaderName::from_static("x-request-id");

    app.layer(CompressionLayer::new())
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(middleware::from_fn(security_headers))
        .layer(PropagateRequestIdLayer::new(request_id_header.clone()))
        .layer(build_cors_layer())
        .layer(middleware::from_fn(cors_preflight))
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::new(request_id_header, MakeRequestUuid))
        .layer(SetSensitiveRequestHeadersLayer::new([header::AUTHORIZATION]))
        .layer(CatchPanicLayer::new())
}

const CORS_ALLOW_METHODS: &str = "GET, POST, PUT, DELETE, OPTIONS, HEAD";
const CORS_ALLOW_HEADERS: &str = "Content-Type, Authorization, X-Requested-With, Accept, Origin, \
Upgrade, Connection, Sec-WebSocket-Protocol, Sec-WebSocket-Version, Sec-WebSocket-Key, \
Sec-WebSocket-Extensions";
const CORS_MAX_AGE: &str = "86400";

/// The allow-list from spec.md §4.1: any origin, the listed methods and
/// headers, an 86400s preflight cache.
fn build_cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
            Method::HEAD,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static("x-requested-with"),
            header::ACCEPT,
            header::ORIGIN,
            header::UPGRADE,
            header::CONNECTION,
            HeaderName::from_static("sec-websocket-protocol"),
            HeaderName::from_static("sec-websocket-version"),
            HeaderName::from_static("sec-websocket-key"),
            HeaderName::from_static("sec-websocket-extensions"),
        ])
        .max_age(Duration::from_secs(86_400))
}

/// `OPTIONS *` always answers `204` with the allow-list headers
/// (spec.md §4.1), independent of whether any route matches the
/// request path. `CorsLayer` only answers a real preflight (an
/// `Origin` + `Access-Control-Request-Method` pair) and answers it with
/// `200`, so a bare `OPTIONS` falls through to a router 404/405 and a
/// real preflight gets the wrong status code unless this runs first.
async fn cors_preflight(request: axum::extract::Request, next: middleware::Next) -> axum::response::Response {
    if request.method() != Method::OPTIONS {
        return next.run(request).await;
    }

    let mut response = axum::response::Response::new(Body::empty());
    *response.status_mut() = StatusCode::NO_CONTENT;
    let headers = response.headers_mut();
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(CORS_ALLOW_METHODS),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(CORS_ALLOW_HEADERS),
    );
    headers.insert(header::ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static(CORS_MAX_AGE));
    response
}

async fn security_headers(request: axum::extract::Request, next: middleware::Next) -> axum::response::Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(HeaderName::from_static("x-frame-options"), HeaderValue::from_static("DENY"));
    headers.insert(
        header::REFERRER_POLICY,
        HeaderValue::from_static("no-referrer"),
    );
    response
}
