use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::catalog::MotorSuffixes;
use crate::scan_table::{default_rows, ScanParameterRow};

#[derive(Deserialize, Clone, Serialize, Debug, PartialEq)]
#[serde(default)]
pub struct SimulatorConfig {
    #[serde(rename = "Prefix")]
    pub prefix: String,

    #[serde(rename = "ScanPeriodMs")]
    pub scan_period_ms: u64,

    #[serde(rename = "MotorNoise")]
    pub motor_noise: f64,

    #[serde(rename = "DetectorNoise")]
    pub detector_noise: f64,

    #[serde(rename = "ZCenter")]
    pub z_center: f64,

    #[serde(rename = "ZWidth")]
    pub z_width: f64,

    #[serde(rename = "ThetaCenter")]
    pub theta_center: f64,

    #[serde(rename = "ThetaWidth")]
    pub theta_width: f64,

    #[serde(rename = "Seed")]
    pub seed: Option<u64>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            prefix: "sim:".to_owned(),
            scan_period_ms: 1000,
            motor_noise: 0.01,
            detector_noise: 0.01,
            z_center: 4.0,
            z_width: 0.5,
            theta_center: 10.0,
            theta_width: 1.5,
            seed: None,
        }
    }
}

#[derive(Deserialize, Clone, Serialize, Debug, PartialEq)]
#[serde(default)]
pub struct StageConfig {
    /// Motor alias in the channel catalog
    #[serde(rename = "Motor")]
    pub motor: String,

    /// Scan table row, starting from 0
    #[serde(rename = "Row")]
    pub row: usize,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            motor: "Z".to_owned(),
            row: 0,
        }
    }
}

#[derive(Deserialize, Clone, Serialize, Debug, PartialEq)]
#[serde(default)]
pub struct AlignmentConfig {
    /// Detector alias in the channel catalog
    #[serde(rename = "Detector")]
    pub detector: String,

    #[serde(rename = "Z")]
    pub z: StageConfig,

    #[serde(rename = "Theta")]
    pub theta: StageConfig,

    /// Leave the stage at the fitted optimum after its scan
    #[serde(rename = "MoveToOptimum")]
    pub move_to_optimum: bool,
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self {
            detector: "Intensity".to_owned(),
            z: StageConfig {
                motor: "Z".to_owned(),
                row: 0,
            },
            theta: StageConfig {
                motor: "Theta".to_owned(),
                row: 1,
            },
            move_to_optimum: true,
        }
    }
}

#[derive(Deserialize, Clone, Serialize, Debug, PartialEq)]
#[serde(default)]
pub struct Config {
    #[serde(rename = "PvServer")]
    pub pv_server: String,

    #[serde(rename = "HttpAddr")]
    pub http_addr: String,

    #[serde(rename = "ChannelCatalog")]
    pub channel_catalog: PathBuf,

    #[serde(rename = "ChannelTimeoutMs")]
    pub channel_timeout_ms: u64,

    #[serde(rename = "SettleFraction")]
    pub settle_fraction: f64,

    #[serde(rename = "StepIntervalMs")]
    pub step_interval_ms: u64,

    #[serde(rename = "CommandSuffix")]
    pub command_suffix: String,

    #[serde(rename = "ReadbackSuffix")]
    pub readback_suffix: String,

    /// chrono format pattern, "-scan.json" is appended
    #[serde(rename = "DataLogFile")]
    pub data_log_file: Option<PathBuf>,

    #[serde(rename = "ScanTable")]
    pub scan_table: Vec<ScanParameterRow>,

    #[serde(rename = "Alignment")]
    pub alignment: AlignmentConfig,

    #[serde(rename = "Simulator")]
    pub simulator: SimulatorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pv_server: "127.0.0.1:5064".to_owned(),
            http_addr: "0.0.0.0:3000".to_owned(),
            channel_catalog: PathBuf::from("scan_pvs_table.xlsx"),
            channel_timeout_ms: 1000,
            settle_fraction: 0.1,
            step_interval_ms: 500,
            command_suffix: ".VAL".to_owned(),
            readback_suffix: ".RBV".to_owned(),
            data_log_file: Some(PathBuf::from("scan-%Y%m%d-%H%M%S")),
            scan_table: default_rows(),
            alignment: AlignmentConfig::default(),
            simulator: SimulatorConfig::default(),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    NoConfigDir,
    Read(PathBuf, std::io::Error),
    Parse(PathBuf, serde_json::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::NoConfigDir => write!(f, "Failed to get config directory!"),
            ConfigError::Read(path, e) => write!(f, "Failed to read {:?}: {}", path, e),
            ConfigError::Parse(path, e) => write!(f, "Invalid config file {:?}: {}", path, e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    /// `<config dir>/stage-scan-align/config.json`
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        directories::BaseDirs::new()
            .map(|base_dirs| {
                base_dirs
                    .config_dir()
                    .join(Path::new("stage-scan-align"))
                    .join(Path::new("config.json"))
            })
            .ok_or(ConfigError::NoConfigDir)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Read(path.to_owned(), e))?;
        serde_json::from_str::<Config>(&contents)
            .map_err(|e| ConfigError::Parse(path.to_owned(), e))
    }

    /// Load the given or the default config file. A missing file gives the
    /// built-in defaults, a broken one is an error.
    pub fn load(path: Option<PathBuf>) -> Result<(Self, PathBuf), ConfigError> {
        let path = match path {
            Some(p) => p,
            None => Self::default_path()?,
        };

        match Self::load_from(&path) {
            Ok(config) => Ok((config, path)),
            Err(ConfigError::Read(_, e)) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!("Config file {:?} not found, using defaults", path);
                Ok((Self::default(), path))
            }
            Err(e) => Err(e),
        }
    }

    pub fn channel_timeout(&self) -> Duration {
        Duration::from_millis(self.channel_timeout_ms)
    }

    pub fn step_interval(&self) -> Duration {
        Duration::from_millis(self.step_interval_ms)
    }

    pub fn motor_suffixes(&self) -> MotorSuffixes {
        MotorSuffixes {
            command: self.command_suffix.clone(),
            readback: self.readback_suffix.clone(),
        }
    }
}

impl std::fmt::Display for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "PvServer: {}", self.pv_server)?;
        writeln!(f, "HttpAddr: {}", self.http_addr)?;
        writeln!(f, "ChannelCatalog: {:?}", self.channel_catalog)?;
        writeln!(f, "ChannelTimeoutMs: {}", self.channel_timeout_ms)?;
        writeln!(f, "SettleFraction: {}", self.settle_fraction)?;
        writeln!(f, "StepIntervalMs: {}", self.step_interval_ms)?;
        writeln!(
            f,
            "Suffixes: {} / {}",
            self.command_suffix, self.readback_suffix
        )?;
        writeln!(f, "DataLogFile: {:?}", self.data_log_file)?;

        // write scan table as a table
        writeln!(f, "ScanTable:")?;
        writeln!(f, "  Start\t| Middle\t| End\t| Step\t| N\t| Time")?;
        writeln!(f, "  -----\t| ------\t| ---\t| ----\t| -\t| ----")?;
        for r in &self.scan_table {
            writeln!(
                f,
                "  {:.3}\t| {:.3}\t| {:.3}\t| {:.3}\t| {}\t| {:.3}",
                r.start, r.middle, r.end, r.step, r.count, r.dwell
            )?;
        }

        let a = &self.alignment;
        writeln!(f, "Alignment: detector {}", a.detector)?;
        writeln!(f, "  Z: {} row {}", a.z.motor, a.z.row + 1)?;
        writeln!(f, "  Theta: {} row {}", a.theta.motor, a.theta.row + 1)?;
        writeln!(f, "  MoveToOptimum: {}", a.move_to_optimum)?;

        writeln!(f, "Simulator:")?;
        writeln!(f, "  Prefix: {}", self.simulator.prefix)?;
        writeln!(f, "  ScanPeriodMs: {}", self.simulator.scan_period_ms)?;
        writeln!(f, "  MotorNoise: {}", self.simulator.motor_noise)?;
        writeln!(f, "  DetectorNoise: {}", self.simulator.detector_noise)?;
        writeln!(
            f,
            "  Z: center {} width {}",
            self.simulator.z_center, self.simulator.z_width
        )?;
        writeln!(
            f,
            "  Theta: center {} width {}",
            self.simulator.theta_center, self.simulator.theta_width
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn partial_file_uses_defaults() {
        let config: Config = serde_json::from_str(
            r#"{
                "PvServer": "10.0.0.5:5064",
                "ChannelTimeoutMs": 250,
                "Simulator": { "Prefix": "bl1:" },
                "Alignment": { "Theta": { "Motor": "Chi" } }
            }"#,
        )
        .unwrap();

        assert_eq!(config.pv_server, "10.0.0.5:5064");
        assert_eq!(config.channel_timeout(), Duration::from_millis(250));
        assert_eq!(config.simulator.prefix, "bl1:");
        assert_eq!(config.simulator.scan_period_ms, 1000);
        assert_eq!(config.scan_table, default_rows());
        assert_eq!(config.motor_suffixes(), MotorSuffixes::default());
        assert_eq!(config.alignment.theta.motor, "Chi");
        assert_eq!(config.alignment.theta.row, 0);
        assert_eq!(config.alignment.z, AlignmentConfig::default().z);
    }

    #[test]
    fn roundtrip() {
        let config = Config::default();
        let text = serde_json::to_string_pretty(&config).unwrap();
        assert!(text.contains("\"SettleFraction\""));
        assert_eq!(serde_json::from_str::<Config>(&text).unwrap(), config);
    }

    #[test]
    fn missing_file_gives_defaults() {
        let path = std::env::temp_dir().join("stage-scan-align-no-such-config.json");
        let (config, p) = Config::load(Some(path.clone())).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(p, path);
    }

    #[test]
    fn broken_file_is_error() {
        let path = std::env::temp_dir().join(format!(
            "stage-scan-align-broken-{}.json",
            std::process::id()
        ));
        std::fs::write(&path, "{ not json").unwrap();
        let res = Config::load(Some(path.clone()));
        std::fs::remove_file(&path).ok();
        assert!(matches!(res, Err(ConfigError::Parse(..))));
    }
}
