use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use stage_scan_align::{ScanField, ScanTable};
use tokio::sync::Mutex;

use super::common::error_response;

#[derive(Deserialize, Debug)]
pub struct UpdateRowRequest {
    #[serde(rename = "Field")]
    field: String,

    /// Number or text as typed by the operator
    #[serde(rename = "Value")]
    value: serde_json::Value,
}

pub(crate) async fn handle_table(State(table): State<Arc<Mutex<ScanTable>>>) -> impl IntoResponse {
    Json(table.lock().await.rows().to_vec())
}

pub(crate) async fn handle_table_update(
    Path(row): Path<usize>,
    State(table): State<Arc<Mutex<ScanTable>>>,
    Json(input): Json<UpdateRowRequest>,
) -> impl IntoResponse {
    tracing::debug!("handle_table_update {}: {:?}", row, input);

    let field = match input.field.parse::<ScanField>() {
        Ok(f) => f,
        Err(e) => return error_response(StatusCode::UNPROCESSABLE_ENTITY, e),
    };
    let text = match input.value {
        serde_json::Value::String(s) => s,
        v => v.to_string(),
    };

    match table.lock().await.set_field(row, field, &text) {
        Ok(updated) => Json(updated).into_response(),
        Err(e) => error_response(StatusCode::UNPROCESSABLE_ENTITY, e),
    }
}
