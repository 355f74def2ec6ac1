use std::path::PathBuf;
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Deserialize;
use stage_scan_align::scan_result::{default_file_name, ResultFileError};
use stage_scan_align::{
    ChannelCatalog, Config, ControllerError, FitKind, ScanResult, ScanTable, StartError,
};
use tokio::sync::Mutex;

use super::common::{error_response, ControlResult};
use crate::Scanner;

#[derive(Deserialize, Debug)]
pub struct StartRequest {
    #[serde(rename = "Row")]
    row: usize,

    #[serde(rename = "Motor")]
    motor: String,

    #[serde(rename = "Detector")]
    detector: String,

    #[serde(rename = "Fits", default)]
    fits: Vec<FitKind>,
}

#[derive(Deserialize, Debug)]
pub struct LoadRequest {
    #[serde(rename = "Path")]
    path: PathBuf,
}

pub(crate) async fn handle_scan_start(
    State(table): State<Arc<Mutex<ScanTable>>>,
    State(catalog): State<Arc<Mutex<ChannelCatalog>>>,
    State(scanner): State<Arc<Mutex<Scanner>>>,
    Json(input): Json<StartRequest>,
) -> impl IntoResponse {
    tracing::debug!("handle_scan_start: {:?}", input);

    let binding = match catalog.lock().await.resolve(&input.motor, &input.detector) {
        Ok(b) => b,
        Err(e) => return error_response(StatusCode::UNPROCESSABLE_ENTITY, e),
    };
    let row = match table.lock().await.read(input.row) {
        Ok(r) => r,
        Err(e) => return error_response(StatusCode::UNPROCESSABLE_ENTITY, e),
    };

    match scanner.lock().await.start(row, binding, input.fits) {
        Ok(()) => Json(ControlResult::success(Some(format!(
            "Scanning {} over {} points",
            input.motor, row.count
        ))))
        .into_response(),
        Err(e @ ControllerError::Start(StartError::InProgress)) => {
            error_response(StatusCode::CONFLICT, e)
        }
        Err(e) => error_response(StatusCode::UNPROCESSABLE_ENTITY, e),
    }
}

pub(crate) async fn handle_scan_cancel(
    State(scanner): State<Arc<Mutex<Scanner>>>,
) -> impl IntoResponse {
    match scanner.lock().await.cancel() {
        Ok(()) => Json(ControlResult::success(None)).into_response(),
        Err(e) => error_response(StatusCode::CONFLICT, e),
    }
}

pub(crate) async fn handle_scan_state(
    State(scanner): State<Arc<Mutex<Scanner>>>,
) -> impl IntoResponse {
    Json(scanner.lock().await.status())
}

pub(crate) async fn handle_scan_stream(
    State(scanner): State<Arc<Mutex<Scanner>>>,
) -> impl IntoResponse {
    match scanner.lock().await.subscribe() {
        Some(mut rx) => {
            let stream = async_stream::stream! {
                loop {
                    let progress = rx.borrow_and_update().clone();
                    let done = progress.is_terminal();
                    yield progress;

                    if done {
                        break;
                    }
                    if let Err(e) = rx.changed().await {
                        tracing::error!("Scan progress stream break: {}", e);
                        break;
                    }
                }
            };
            axum_streams::StreamBodyAs::json_nl(stream).into_response()
        }
        None => error_response(StatusCode::NOT_FOUND, "No scan has been started"),
    }
}

pub(crate) async fn handle_scan_save(
    State(config): State<Config>,
    State(scanner): State<Arc<Mutex<Scanner>>>,
) -> impl IntoResponse {
    let Some(snapshot) = scanner.lock().await.last_result() else {
        return error_response(StatusCode::NOT_FOUND, "No completed scan to save");
    };

    let pattern = config
        .data_log_file
        .unwrap_or_else(|| PathBuf::from("scan-%Y%m%d-%H%M%S"));
    let label = format!("{} vs {}", snapshot.motor, snapshot.detector);

    let res = default_file_name(&pattern).and_then(|path| {
        ScanResult::from_snapshot(label, &snapshot)
            .save(&path)
            .map(|_| path)
    });

    match res {
        Ok(path) => Json(ControlResult::success(Some(path.display().to_string()))).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

pub(crate) async fn handle_scan_load(Json(input): Json<LoadRequest>) -> impl IntoResponse {
    match ScanResult::load(&input.path) {
        Ok(result) => Json(result).into_response(),
        Err(e @ ResultFileError::Io(..)) => error_response(StatusCode::NOT_FOUND, e),
        Err(e) => error_response(StatusCode::UNPROCESSABLE_ENTITY, e),
    }
}
