use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use stage_scan_align::{FitKind, Stage};

/// Scan a motor, read a detector and fit the response
#[derive(Parser)]
#[clap(version)]
pub struct Cli {
    /// Config file, default is <config dir>/stage-scan-align/config.json
    #[clap(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run one scan against the process variable server
    Scan(ScanArgs),

    /// Align sample stages: z on the beam edge, then theta on the peak
    Align(AlignArgs),

    /// Reload a saved scan, refit it and print the result
    Replay {
        /// The json-file written by `scan --save` or the server
        json_file: PathBuf,
    },

    /// Write a channel catalog for the simulated instrument
    CatalogTemplate {
        /// Output .xlsx file
        xlsx_file: PathBuf,

        /// Channel prefix, the simulator one from config by default
        #[clap(long)]
        prefix: Option<String>,
    },
}

#[derive(Args)]
pub struct AlignArgs {
    /// Stage to align (z, theta), repeat for a sequence; z then theta by default
    #[clap(long = "stage")]
    pub stages: Vec<Stage>,

    /// Leave the motors at the end of their scans
    #[clap(long)]
    pub no_move: bool,

    /// Save every stage scan as json, named by the DataLogFile pattern
    #[clap(long)]
    pub save: bool,
}

#[derive(Args)]
pub struct ScanArgs {
    /// Motor alias from the channel catalog
    #[clap(long)]
    pub motor: String,

    /// Detector alias from the channel catalog
    #[clap(long)]
    pub detector: String,

    /// Scan table row, starting from 1
    #[clap(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    pub row: u32,

    /// Fit function, repeat for several (linear, gaussian, lorentz, erf)
    #[clap(long = "fit")]
    pub fits: Vec<FitKind>,

    #[clap(long, allow_hyphen_values = true)]
    pub start: Option<String>,

    #[clap(long, allow_hyphen_values = true)]
    pub end: Option<String>,

    /// Number of points
    #[clap(long)]
    pub count: Option<String>,

    #[clap(long, allow_hyphen_values = true)]
    pub step: Option<String>,

    /// Detector integration time, seconds
    #[clap(long)]
    pub dwell: Option<String>,

    /// Save the result as json
    #[clap(long)]
    pub save: bool,

    /// Output file for --save, the DataLogFile pattern by default
    #[clap(long, requires = "save")]
    pub output: Option<PathBuf>,
}
