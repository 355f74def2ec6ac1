mod config;

pub mod alignment;
pub mod catalog;
pub mod channel;
pub mod fit;
pub mod pv_client;
pub mod pv_codec;
pub mod scan_controller;
pub mod scan_engine;
pub mod scan_result;
pub mod scan_table;
pub mod simulator;

pub use alignment::{AlignError, Alignment, Stage, StagePlan};
pub use catalog::{ChannelCatalog, ChannelKind, ConfigurationError, MotorSuffixes};
pub use channel::{ChannelAccess, ChannelBinding, ChannelError};
pub use config::{AlignmentConfig, Config, ConfigError, SimulatorConfig, StageConfig};
pub use fit::{FitError, FitKind, FittedCurve};
pub use pv_client::PvClient;
pub use scan_controller::{ControllerError, ScanController, ScanProgress};
pub use scan_engine::{
    AbortReason, ScanEngine, ScanReport, ScanRun, ScanSnapshot, ScanState, StartError,
    StepOutcome,
};
pub use scan_result::{ResultFileError, ScanResult};
pub use scan_table::{ScanField, ScanParameterRow, ScanTable, ValidationError};
pub use simulator::SimulatedInstrument;
