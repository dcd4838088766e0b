//! Front Router admission errors (spec.md §4.1, §4.2, §7 kind 6).
//!
//! Each variant names one documented failure mode and carries its own
//! status code + JSON body; no blanket `IntoResponse` impl that guesses
//! a generic shape, every error case is mapped explicitly.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("projectId is required")]
    MissingProjectId,

    #[error("projectId {0:?} does not match the required pattern")]
    MalformedProjectId(String),

    #[error("invalid or missing apiKey for project {0:?}")]
    InvalidApiKey(String),

    #[error("{0:?} is not a valid client role")]
    InvalidRole(String),
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::MissingProjectId | Error::MalformedProjectId(_) | Error::InvalidRole(_) => {
                StatusCode::BAD_REQUEST
            },
            Error::InvalidApiKey(_) => StatusCode::FORBIDDEN,
        };
        (status, Json(json!({ "error": self.to_string(), "message": self.to_string() }))).into_response()
    }
}
