use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

#[derive(Serialize, Debug, Default)]
pub struct ControlResult {
    success: bool,
    error: Option<String>,
    message: Option<String>,
}

impl ControlResult {
    pub fn new(success: bool, error: Option<String>, message: Option<String>) -> Self {
        Self {
            success,
            error,
            message,
        }
    }

    pub fn success(message: Option<String>) -> Self {
        Self::new(true, None, message)
    }

    pub fn error(err_message: String) -> Self {
        Self::new(false, Some(err_message), None)
    }
}

pub(crate) fn error_response(status: StatusCode, e: impl std::fmt::Display) -> Response {
    tracing::warn!("{}: {}", status, e);
    (status, Json(ControlResult::error(e.to_string()))).into_response()
}
