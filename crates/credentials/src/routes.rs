//! `/api-keys*` management routes (spec.md §6), mounted by the gateway.
//!
//! When `service_key` is configured, every route here requires a matching
//! `Authorization: Bearer <service_key>` header; otherwise the check is
//! skipped entirely (spec.md §4.1: service-key enforcement is optional).

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};

use crate::{ApiKeyStore, Error};

/// Application state needed by the credential routes.
#[derive(Clone)]
pub struct CredentialState {
    pub store: Arc<ApiKeyStore>,
    pub service_key: Option<Arc<str>>,
}

impl axum::extract::FromRef<CredentialState> for Arc<ApiKeyStore> {
    fn from_ref(state: &CredentialState) -> Self {
        Arc::clone(&state.store)
    }
}

/// Build the `/api-keys` sub-router. Caller nests it under the gateway's
/// root router (e.g. `.nest("/api-keys", credential_routes(state))`).
pub fn credential_routes(state: CredentialState) -> axum::Router {
    let guarded = state.service_key.is_some();

    let router = axum::Router::new()
        .route("/", get(list_handler).post(create_handler))
        .route(
            "/{project_id}",
            get(describe_handler).delete(revoke_handler),
        );

    let router = if guarded {
        router.route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_service_key,
        ))
    } else {
        router
    };

    router.with_state(state)
}

async fn require_service_key(
    State(state): State<CredentialState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.service_key.as_deref() else {
        return next.run(request).await;
    };

    let presented = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    match presented {
        Some(token) if token == expected => next.run(request).await,
        _ => (StatusCode::UNAUTHORIZED, "invalid or missing service key").into_response(),
    }
}

#[derive(Debug, serde::Deserialize)]
struct CreateApiKeyRequest {
    #[serde(rename = "projectId")]
    project_id: String,
    #[serde(rename = "createdBy", default)]
    created_by: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

async fn create_handler(
    State(state): State<CredentialState>,
    Json(body): Json<CreateApiKeyRequest>,
) -> Response {
    if body.project_id.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "projectId is required").into_response();
    }

    match state
        .store
        .create(body.project_id.trim(), body.created_by, body.description)
        .await
    {
        Ok(created) => (StatusCode::CREATED, Json(created)).into_response(),
        Err(err @ Error::AlreadyExists { .. }) => {
            (StatusCode::CONFLICT, err.to_string()).into_response()
        },
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

async fn list_handler(State(state): State<CredentialState>) -> Response {
    match state.store.list().await {
        Ok(keys) => Json(serde_json::json!({ "apiKeys": keys })).into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

async fn describe_handler(
    State(state): State<CredentialState>,
    Path(project_id): Path<String>,
) -> Response {
    match state.store.describe(&project_id).await {
        Ok(Some(description)) => Json(description).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "no active key for project").into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

async fn revoke_handler(
    State(state): State<CredentialState>,
    Path(project_id): Path<String>,
) -> Response {
    match state.store.revoke(&project_id).await {
        Ok(true) => Json(serde_json::json!({ "ok": true })).into_response(),
        Ok(false) => (StatusCode::NOT_FOUND, "no active key for project").into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{self, Request as HttpRequest};
    use sqlx::SqlitePool;
    use tower::ServiceExt;

    use super::*;

    async fn test_state(service_key: Option<&str>) -> CredentialState {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = Arc::new(ApiKeyStore::new(pool).await.unwrap());
        CredentialState {
            store,
            service_key: service_key.map(Into::into),
        }
    }

    #[tokio::test]
    async fn create_without_service_key_succeeds() {
        let state = test_state(None).await;
        let app = credential_routes(state);

        let response = app
            .oneshot(
                HttpRequest::builder()
                    .method(http::Method::POST)
                    .uri("/")
                    .header(http::header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"projectId":"acme"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn create_requires_service_key_when_configured() {
        let state = test_state(Some("secret")).await;
        let app = credential_routes(state);

        let response = app
            .oneshot(
                HttpRequest::builder()
                    .method(http::Method::POST)
                    .uri("/")
                    .header(http::header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"projectId":"acme"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn create_with_correct_service_key_succeeds() {
        let state = test_state(Some("secret")).await;
        let app = credential_routes(state);

        let response = app
            .oneshot(
                HttpRequest::builder()
                    .method(http::Method::POST)
                    .uri("/")
                    .header(http::header::CONTENT_TYPE, "application/json")
                    .header(http::header::AUTHORIZATION, "Bearer secret")
                    .body(Body::from(r#"{"projectId":"acme"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn describe_missing_project_returns_404() {
        let state = test_state(None).await;
        let app = credential_routes(state);

        let response = app
            .oneshot(
                HttpRequest::builder()
                    .method(http::Method::GET)
                    .uri("/nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
