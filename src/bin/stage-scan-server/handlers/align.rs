use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Deserialize;
use stage_scan_align::{
    ChannelCatalog, Config, ControllerError, ScanTable, Stage, StagePlan, StartError,
};
use tokio::sync::Mutex;

use super::common::{error_response, ControlResult};
use crate::Scanner;

#[derive(Deserialize, Debug)]
pub struct AlignRequest {
    #[serde(rename = "Stage")]
    stage: Stage,
}

/// Stage scan with the configured motor, row and pinned fit; the optimum
/// arrives with the finished progress.
pub(crate) async fn handle_align_start(
    State(config): State<Config>,
    State(table): State<Arc<Mutex<ScanTable>>>,
    State(catalog): State<Arc<Mutex<ChannelCatalog>>>,
    State(scanner): State<Arc<Mutex<Scanner>>>,
    Json(input): Json<AlignRequest>,
) -> impl IntoResponse {
    tracing::debug!("handle_align_start: {:?}", input);

    let plan = {
        let catalog = catalog.lock().await;
        let table = table.lock().await;
        match StagePlan::new(&config.alignment, input.stage, &catalog, &table) {
            Ok(p) => p,
            Err(e) => return error_response(StatusCode::UNPROCESSABLE_ENTITY, e),
        }
    };

    let kind = plan.stage.fit_kind();
    match scanner.lock().await.start(plan.row, plan.binding, [kind]) {
        Ok(()) => Json(ControlResult::success(Some(format!(
            "{}, fit {}",
            plan.stage.title(),
            kind
        ))))
        .into_response(),
        Err(e @ ControllerError::Start(StartError::InProgress)) => {
            error_response(StatusCode::CONFLICT, e)
        }
        Err(e) => error_response(StatusCode::UNPROCESSABLE_ENTITY, e),
    }
}
