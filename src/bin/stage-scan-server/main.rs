mod handlers;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{FromRef, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use tokio::sync::Mutex;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing_subscriber::prelude::*;

use stage_scan_align::{ChannelCatalog, Config, PvClient, ScanController, ScanTable};

pub(crate) type Scanner = ScanController<PvClient>;

/// HTTP front end of the scan-and-fit engine
#[derive(Parser)]
#[clap(version)]
struct Cli {
    /// Config file, default is <config dir>/stage-scan-align/config.json
    #[clap(long)]
    config: Option<PathBuf>,
}

#[derive(Clone, FromRef)]
struct AppState {
    config: Config,
    table: Arc<Mutex<ScanTable>>,
    catalog: Arc<Mutex<ChannelCatalog>>,
    scanner: Arc<Mutex<Scanner>>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Enable tracing using Tokio's https://tokio.rs/#tk-lib-tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| {
                "stage_scan_align=info,stage_scan_server=debug,tower_http=info".into()
            }),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    tracing::info!("Loading config...");
    let (config, config_file) = Config::load(cli.config)?;
    tracing::info!("Config {:?}:\n{}", config_file, config);

    let catalog = match ChannelCatalog::load_xlsx(&config.channel_catalog, config.motor_suffixes())
    {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("{}, starting with an empty catalog", e);
            ChannelCatalog::default()
        }
    };

    let mut client = PvClient::new(config.pv_server.clone());
    tracing::warn!("Testing connection to {}...", client.addr());
    if let Err(e) = client.test_connection(config.channel_timeout()).await {
        tracing::error!("Process variable server not available: {}", e);
    } else {
        tracing::info!("Connection successful!");
    }

    let scanner = ScanController::new(
        Arc::new(Mutex::new(client)),
        config.channel_timeout(),
        config.settle_fraction,
        config.step_interval(),
    );

    let addr: SocketAddr = config.http_addr.parse()?;

    let app = Router::new()
        .route("/config", get(handle_config))
        .route("/catalog", get(handlers::handle_catalog))
        .route("/catalog/reload", post(handlers::handle_catalog_reload))
        .route("/table", get(handlers::handle_table))
        .route("/table/:row", post(handlers::handle_table_update))
        .route("/scan/start", post(handlers::handle_scan_start))
        .route("/scan/cancel", post(handlers::handle_scan_cancel))
        .route("/scan/state", get(handlers::handle_scan_state))
        .route("/scan/stream", get(handlers::handle_scan_stream))
        .route("/scan/save", post(handlers::handle_scan_save))
        .route("/scan/load", post(handlers::handle_scan_load))
        .route("/align/start", post(handlers::handle_align_start))
        .with_state(AppState {
            table: Arc::new(Mutex::new(ScanTable::new(config.scan_table.clone()))),
            catalog: Arc::new(Mutex::new(catalog)),
            scanner: Arc::new(Mutex::new(scanner)),
            config,
        })
        // Using tower to add tracing layer
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));

    tracing::info!("Listening on {}", addr);
    axum_server::bind(addr)
        .serve(app.into_make_service())
        .await?;
    Ok(())
}

async fn handle_config(State(config): State<Config>) -> impl IntoResponse {
    Json(config)
}
