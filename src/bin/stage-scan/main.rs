mod cli;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stage_scan_align::alignment::align_sequence;
use stage_scan_align::fit::fit_all;
use stage_scan_align::scan_result::default_file_name;
use stage_scan_align::{
    ChannelCatalog, Config, FitKind, PvClient, ScanEngine, ScanField, ScanResult, ScanTable,
    Stage, StepOutcome,
};

use cli::{AlignArgs, Cli, Command, ScanArgs};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stage_scan_align=info,stage_scan=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cmd = Cli::parse();

    tracing::debug!("Loading config...");
    let (config, config_file) = Config::load(cmd.config)?;
    tracing::debug!("Config {:?}:\n{}", config_file, config);

    match cmd.command {
        Command::Scan(args) => scan(&config, args).await,
        Command::Align(args) => align(&config, args).await,
        Command::Replay { json_file } => replay(&json_file),
        Command::CatalogTemplate { xlsx_file, prefix } => {
            let prefix = prefix.unwrap_or_else(|| config.simulator.prefix.clone());
            ChannelCatalog::simulator_template(&prefix).save_xlsx(&xlsx_file)?;
            println!("Catalog for prefix '{}' written to {:?}", prefix, xlsx_file);
            Ok(())
        }
    }
}

async fn scan(config: &Config, args: ScanArgs) -> anyhow::Result<()> {
    let catalog = ChannelCatalog::load_xlsx(&config.channel_catalog, config.motor_suffixes())?;
    let binding = catalog.resolve(&args.motor, &args.detector)?;

    let row_index = args.row as usize - 1;
    let mut table = ScanTable::new(config.scan_table.clone());
    let overrides = [
        (ScanField::Start, &args.start),
        (ScanField::End, &args.end),
        (ScanField::Count, &args.count),
        (ScanField::Step, &args.step),
        (ScanField::Dwell, &args.dwell),
    ];
    for (field, value) in overrides {
        if let Some(text) = value {
            table.set_field(row_index, field, text)?;
        }
    }
    let row = table.read(row_index)?;

    let fits = if args.fits.is_empty() {
        vec![FitKind::Gaussian]
    } else {
        args.fits
    };

    let mut client = connect(config).await?;

    let mut engine = ScanEngine::new(config.channel_timeout(), config.settle_fraction);
    engine.start(row, binding, fits)?;

    let outcome = engine
        .run(&mut client, |s| {
            if let (Some(x), Some(y)) = (s.x.last(), s.y.last()) {
                println!("{:>4}/{:<4} {:>12.6} {:>12.6}", s.step, s.total, x, y);
            }
        })
        .await;

    if args.save {
        let path = match args.output {
            Some(p) => p,
            None => default_file_name(&data_log_pattern(config))?,
        };
        let snapshot = engine.snapshot();
        let label = format!("{} vs {}", snapshot.motor, snapshot.detector);
        ScanResult::from_snapshot(label, &snapshot).save(&path)?;
        println!("Saved to {:?}", path);
    }

    match outcome {
        StepOutcome::Finished(report) => {
            print!("{report}");
            Ok(())
        }
        StepOutcome::Aborted(reason) => Err(anyhow::anyhow!("Scan aborted: {reason}")),
        other => Err(anyhow::anyhow!("Scan stopped unexpectedly: {other:?}")),
    }
}

async fn connect(config: &Config) -> anyhow::Result<PvClient> {
    let mut client = PvClient::new(config.pv_server.clone());
    tracing::info!("Testing connection to {}...", client.addr());
    client
        .test_connection(config.channel_timeout())
        .await
        .with_context(|| format!("Process variable server {} not available", client.addr()))?;
    Ok(client)
}

fn data_log_pattern(config: &Config) -> PathBuf {
    config
        .data_log_file
        .clone()
        .unwrap_or_else(|| PathBuf::from("scan-%Y%m%d-%H%M%S"))
}

async fn align(config: &Config, args: AlignArgs) -> anyhow::Result<()> {
    let catalog = ChannelCatalog::load_xlsx(&config.channel_catalog, config.motor_suffixes())?;
    let table = ScanTable::new(config.scan_table.clone());
    let stages = if args.stages.is_empty() {
        Stage::SEQUENCE.to_vec()
    } else {
        args.stages
    };
    let mut alignment = config.alignment.clone();
    alignment.move_to_optimum &= !args.no_move;

    let mut client = connect(config).await?;
    let mut engine = ScanEngine::new(config.channel_timeout(), config.settle_fraction);

    let done = align_sequence(
        &mut engine,
        &mut client,
        &alignment,
        &catalog,
        &table,
        &stages,
        |stage, s| {
            if let (Some(x), Some(y)) = (s.x.last(), s.y.last()) {
                println!(
                    "{:<6}{:>4}/{:<4} {:>12.6} {:>12.6}",
                    stage, s.step, s.total, x, y
                );
            }
        },
    )
    .await?;

    for a in &done {
        if args.save {
            let pattern = format!("{}-{}", data_log_pattern(config).display(), a.stage);
            let path = default_file_name(Path::new(&pattern))?;
            ScanResult::from_snapshot(a.stage.title(), &a.snapshot).save(&path)?;
            println!("{} saved to {:?}", a.stage.title(), path);
        }
        println!("{a}");
    }
    Ok(())
}

fn replay(json_file: &Path) -> anyhow::Result<()> {
    let result = ScanResult::load(json_file)?;

    println!("{}: {} points", result.label, result.x.len());
    println!("{} -> {}", result.motor, result.detector);

    println!("\nSaved:");
    print!("{}", result.report());

    println!("\nRefitted:");
    for (kind, res) in fit_all(result.kinds(), &result.x, &result.y) {
        match res {
            Ok(curve) => {
                print!("{kind}:");
                for (name, v) in kind.parameter_names().iter().zip(&curve.parameters) {
                    print!(" {name}={v:.6}");
                }
                match kind.optimum(&curve.parameters) {
                    Some(o) => println!(" -> optimum {o:.6}"),
                    None => println!(),
                }
            }
            Err(e) => println!("{kind}: {e}"),
        }
    }

    Ok(())
}
