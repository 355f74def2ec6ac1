use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use stage_scan_align::{ChannelCatalog, Config};
use tokio::sync::Mutex;

use super::common::{error_response, ControlResult};

pub(crate) async fn handle_catalog(
    State(catalog): State<Arc<Mutex<ChannelCatalog>>>,
) -> impl IntoResponse {
    Json(catalog.lock().await.clone())
}

pub(crate) async fn handle_catalog_reload(
    State(config): State<Config>,
    State(catalog): State<Arc<Mutex<ChannelCatalog>>>,
) -> impl IntoResponse {
    match ChannelCatalog::load_xlsx(&config.channel_catalog, config.motor_suffixes()) {
        Ok(new_catalog) => {
            let count = new_catalog.entries().len();
            *catalog.lock().await = new_catalog;
            Json(ControlResult::success(Some(format!(
                "{count} channels loaded"
            ))))
            .into_response()
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}
