#![allow(clippy::unwrap_used, clippy::expect_used)]
//! End-to-end scenarios driving the assembled gateway app over a live
//! listener with `reqwest` and `tokio-tungstenite`, the same way the
//! teacher's own `tests/chat_ui.rs` and `tests/auth_middleware.rs` drive
//! `build_gateway_app` rather than calling handlers directly.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use sqlx::sqlite::SqlitePoolOptions;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use roombus_config::Config;
use roombus_credentials::ApiKeyStore;
use roombus_gateway::server::{ServerConfig, build_gateway_app};
use roombus_room::{SqliteLogBucketStore, SqliteUsageCounterStore};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Spin up a gateway on an ephemeral port with a fresh in-memory database,
/// returning the bound address. `configure` tweaks the default `Config`
/// (bypass list, timeouts) for the scenario under test.
async fn start_test_server(configure: impl FnOnce(&mut Config)) -> SocketAddr {
    let mut config = Config::default();
    configure(&mut config);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite pool");

    let api_keys = Arc::new(ApiKeyStore::new(pool.clone()).await.expect("api key store"));
    let log_store = Arc::new(SqliteLogBucketStore::new(pool.clone()).await.expect("log store"));
    let usage_store = Arc::new(SqliteUsageCounterStore::new(pool).await.expect("usage store"));

    let app = build_gateway_app(ServerConfig {
        config: Arc::new(config),
        api_keys,
        log_store,
        usage_store,
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .expect("server exited");
    });
    addr
}

async fn connect_ws(addr: SocketAddr, project_id: &str, role: &str, api_key: Option<&str>) -> WsStream {
    let mut url = format!("ws://{addr}/websocket?projectId={project_id}&type={role}");
    if let Some(key) = api_key {
        url.push_str(&format!("&apiKey={key}"));
    }
    let (ws, _) = connect_async(url).await.expect("ws connect");
    ws
}

async fn connect_ws_with_header(addr: SocketAddr, project_id: &str, role: &str, api_key: &str) -> WsStream {
    let url = format!("ws://{addr}/websocket?projectId={project_id}&type={role}");
    let mut request = url.into_client_request().expect("client request");
    request
        .headers_mut()
        .insert("x-api-key", api_key.parse().expect("header value"));
    let (ws, _) = connect_async(request).await.expect("ws connect");
    ws
}

async fn next_json(ws: &mut WsStream) -> Value {
    let msg = ws.next().await.expect("stream ended").expect("ws error");
    serde_json::from_str(msg.to_text().expect("text frame")).expect("valid json frame")
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[tokio::test]
async fn health_check_returns_ok() {
    let addr = start_test_server(|_| {}).await;
    let resp = reqwest::get(format!("http://{addr}/health")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
}

/// spec.md §4.1's decision table: any `OPTIONS` request answers `204`
/// with the CORS allow-list headers, whether it's a real preflight (sent
/// with `Origin` + `Access-Control-Request-Method`) or a bare `OPTIONS`
/// to a path no route matches.
#[tokio::test]
async fn options_requests_always_answer_no_content() {
    let addr = start_test_server(|_| {}).await;
    let client = reqwest::Client::new();

    let preflight = client
        .request(reqwest::Method::OPTIONS, format!("http://{addr}/status"))
        .header("origin", "https://example.com")
        .header("access-control-request-method", "GET")
        .send()
        .await
        .unwrap();
    assert_eq!(preflight.status(), 204);
    assert_eq!(preflight.headers()["access-control-allow-origin"], "*");
    assert!(preflight.headers()["access-control-allow-methods"].to_str().unwrap().contains("GET"));

    let bare = client
        .request(reqwest::Method::OPTIONS, format!("http://{addr}/no-such-route"))
        .send()
        .await
        .unwrap();
    assert_eq!(bare.status(), 204);
    assert_eq!(bare.headers()["access-control-allow-origin"], "*");
}

/// S1: a runtime's query is forwarded to the sole connected agent, the
/// agent's reply is relayed back unchanged, and no pending request remains.
#[tokio::test]
async fn happy_path_query_round_trip() {
    let addr = start_test_server(|cfg| {
        cfg.bypass_projects.insert("proj-happy".to_string());
    })
    .await;

    let mut runtime = connect_ws(addr, "proj-happy", "runtime", None).await;
    assert_eq!(next_json(&mut runtime).await["type"], "connected");

    let mut agent = connect_ws(addr, "proj-happy", "agent", None).await;
    assert_eq!(next_json(&mut agent).await["type"], "connected");

    let query = json!({
        "type": "graphql_query",
        "timestamp": now_ms(),
        "requestId": "q1",
        "query": "{ ping }",
    });
    runtime.send(Message::Text(query.to_string().into())).await.unwrap();

    let forwarded = next_json(&mut agent).await;
    assert_eq!(forwarded["type"], "graphql_query");
    assert_eq!(forwarded["requestId"], "q1");
    assert!(forwarded["runtimeId"].is_string());

    let reply = json!({
        "type": "query_response",
        "timestamp": now_ms(),
        "requestId": "q1",
        "data": { "pong": true },
    });
    agent.send(Message::Text(reply.to_string().into())).await.unwrap();

    let answer = next_json(&mut runtime).await;
    assert_eq!(answer["type"], "query_response");
    assert_eq!(answer["data"]["pong"], true);

    let status: Value = reqwest::get(format!("http://{addr}/status?projectId=proj-happy"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["pendingCount"], 0);
    assert_eq!(status["runtimeConnected"], true);
    assert_eq!(status["agentCount"], 1);
}

/// S2: a query with no agent reply synthesizes a timeout error after
/// `requestTimeout` elapses.
#[tokio::test]
async fn request_times_out_without_agent_reply() {
    let addr = start_test_server(|cfg| {
        cfg.bypass_projects.insert("proj-timeout".to_string());
        cfg.request_timeout = Duration::from_millis(150);
    })
    .await;

    let mut runtime = connect_ws(addr, "proj-timeout", "runtime", None).await;
    assert_eq!(next_json(&mut runtime).await["type"], "connected");

    let mut agent = connect_ws(addr, "proj-timeout", "agent", None).await;
    assert_eq!(next_json(&mut agent).await["type"], "connected");

    let query = json!({
        "type": "graphql_query",
        "timestamp": now_ms(),
        "requestId": "q-timeout",
        "query": "{ slow }",
    });
    runtime.send(Message::Text(query.to_string().into())).await.unwrap();
    let forwarded = next_json(&mut agent).await;
    assert_eq!(forwarded["requestId"], "q-timeout");

    let error = next_json(&mut runtime).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["requestId"], "q-timeout");
    assert!(error["message"].as_str().unwrap().contains("timeout"));
}

/// S3: with no agent connected, `graphql_query` answers immediately from
/// the deterministic fallback fixture.
#[tokio::test]
async fn no_agent_fallback_answers_immediately() {
    let addr = start_test_server(|cfg| {
        cfg.bypass_projects.insert("proj-noagent".to_string());
    })
    .await;

    let mut runtime = connect_ws(addr, "proj-noagent", "runtime", None).await;
    assert_eq!(next_json(&mut runtime).await["type"], "connected");

    let query = json!({
        "type": "graphql_query",
        "timestamp": now_ms(),
        "requestId": "q2",
        "query": "users list",
    });
    runtime.send(Message::Text(query.to_string().into())).await.unwrap();

    let answer = next_json(&mut runtime).await;
    assert_eq!(answer["type"], "query_response");
    assert_eq!(answer["requestId"], "q2");
    assert!(answer["data"]["users"].as_array().unwrap().len() > 0);
}

/// S4: a second runtime cannot join a project that already has one
/// connected; once the first disconnects, a new runtime is admitted.
#[tokio::test]
async fn runtime_singleton_rejects_second_connection() {
    let addr = start_test_server(|cfg| {
        cfg.bypass_projects.insert("proj-singleton".to_string());
    })
    .await;

    let mut first = connect_ws(addr, "proj-singleton", "runtime", None).await;
    assert_eq!(next_json(&mut first).await["type"], "connected");

    let url = format!("ws://{addr}/websocket?projectId=proj-singleton&type=runtime");
    match connect_async(url).await {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), 409);
        },
        other => panic!("expected an HTTP 409 upgrade rejection, got {other:?}"),
    }

    first.close(None).await.ok();
    drop(first);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut second = connect_ws(addr, "proj-singleton", "runtime", None).await;
    assert_eq!(next_json(&mut second).await["type"], "connected");
}

/// S5: a newly connected admin is replayed the project's recent message
/// history before its own `connected` acknowledgement.
#[tokio::test]
async fn admin_replay_receives_recent_history() {
    let addr = start_test_server(|cfg| {
        cfg.bypass_projects.insert("proj-admin".to_string());
    })
    .await;

    let mut prod = connect_ws(addr, "proj-admin", "prod", None).await;
    assert_eq!(next_json(&mut prod).await["type"], "connected");

    for i in 0..3 {
        let ping = json!({
            "type": "ping",
            "timestamp": now_ms(),
            "requestId": format!("ping-{i}"),
        });
        prod.send(Message::Text(ping.to_string().into())).await.unwrap();
        assert_eq!(next_json(&mut prod).await["type"], "pong");
    }

    let mut admin = connect_ws(addr, "proj-admin", "admin", None).await;
    let replay = next_json(&mut admin).await;
    assert_eq!(replay["type"], "historical_logs");
    assert_eq!(replay["count"], 3);
    assert_eq!(replay["logs"].as_array().unwrap().len(), 3);

    assert_eq!(next_json(&mut admin).await["type"], "connected");
}

/// S6: credential round trip. A websocket upgrade is rejected without a
/// valid key, an issued key admits it over either the query param or the
/// `x-api-key` header, and `/usage` reflects the recorded traffic.
#[tokio::test]
async fn credential_round_trip_gates_websocket_access() {
    let addr = start_test_server(|_| {}).await;

    let bare_url = format!("ws://{addr}/websocket?projectId=proj-cred&type=agent");
    match connect_async(bare_url).await {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), 403);
        },
        other => panic!("expected an HTTP 403 rejection without a key, got {other:?}"),
    }

    let client = reqwest::Client::new();
    let created: Value = client
        .post(format!("http://{addr}/api-keys"))
        .json(&json!({ "projectId": "proj-cred" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let api_key = created["apiKey"].as_str().expect("apiKey in response").to_string();

    let mut agent = connect_ws(addr, "proj-cred", "agent", Some(&api_key)).await;
    assert_eq!(next_json(&mut agent).await["type"], "connected");

    let mut runtime = connect_ws_with_header(addr, "proj-cred", "runtime", &api_key).await;
    assert_eq!(next_json(&mut runtime).await["type"], "connected");

    let ping = json!({ "type": "ping", "timestamp": now_ms() });
    runtime.send(Message::Text(ping.to_string().into())).await.unwrap();
    assert_eq!(next_json(&mut runtime).await["type"], "pong");

    let usage: Value = reqwest::get(format!("http://{addr}/usage?projectId=proj-cred"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(usage["totalRequests"].as_i64().unwrap() >= 1);
}
