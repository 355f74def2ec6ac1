use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stage_scan_align::{simulator, Config, SimulatedInstrument};

/// Simulated instrument: two noisy stages and a detector behind the
/// process variable line protocol
#[derive(Parser)]
#[clap(version)]
struct Cli {
    /// Config file, default is <config dir>/stage-scan-align/config.json
    #[clap(long)]
    config: Option<PathBuf>,

    /// Listen address, PvServer from config by default
    #[clap(long)]
    bind: Option<String>,

    /// Channel name prefix
    #[clap(long)]
    prefix: Option<String>,

    /// Noise generator seed
    #[clap(long)]
    seed: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stage_scan_align=info,pv_simulator=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let (config, _) = Config::load(cli.config)?;

    let mut sim_config = config.simulator.clone();
    if let Some(prefix) = cli.prefix {
        sim_config.prefix = prefix;
    }
    if cli.seed.is_some() {
        sim_config.seed = cli.seed;
    }
    let addr = cli.bind.unwrap_or(config.pv_server);

    let instrument = SimulatedInstrument::new(sim_config);
    for name in instrument.channel_names() {
        tracing::info!("Serving {}", name);
    }

    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", listener.local_addr()?);

    simulator::serve(listener, Arc::new(Mutex::new(instrument))).await?;
    Ok(())
}
