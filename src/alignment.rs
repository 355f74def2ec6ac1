use serde::{Deserialize, Serialize};

use crate::catalog::{ChannelCatalog, ConfigurationError};
use crate::channel::{ChannelAccess, ChannelBinding};
use crate::config::{AlignmentConfig, StageConfig};
use crate::fit::FitKind;
use crate::scan_engine::{
    AbortReason, ScanEngine, ScanReport, ScanSnapshot, StartError, StepOutcome,
};
use crate::scan_table::{ScanParameterRow, ScanTable, ValidationError};

/// Sample stage aligned against the beam.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Stage {
    Z,
    Theta,
}

impl Stage {
    /// Height first, then tilt
    pub const SEQUENCE: [Stage; 2] = [Stage::Z, Stage::Theta];

    /// Z cuts the beam with the sample edge, theta rocks through the peak.
    pub fn fit_kind(self) -> FitKind {
        match self {
            Stage::Z => FitKind::ErrorFunction,
            Stage::Theta => FitKind::Gaussian,
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            Stage::Z => "Z-stage Alignment",
            Stage::Theta => "Theta-stage Alignment",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Z => f.pad("Z"),
            Stage::Theta => f.pad("Theta"),
        }
    }
}

impl std::str::FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "z" => Ok(Stage::Z),
            "theta" | "th" => Ok(Stage::Theta),
            other => Err(format!("Unknown stage '{other}', expected z or theta")),
        }
    }
}

#[derive(Debug)]
pub enum AlignError {
    Configuration(ConfigurationError),
    Validation(ValidationError),
    Start(StartError),
    Aborted { stage: Stage, reason: AbortReason },
    NoOptimum(Stage),
    OffScan { stage: Stage, best: f64 },
}

impl std::fmt::Display for AlignError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlignError::Configuration(e) => write!(f, "{e}"),
            AlignError::Validation(e) => write!(f, "{e}"),
            AlignError::Start(e) => write!(f, "{e}"),
            AlignError::Aborted { stage, reason } => {
                write!(f, "{} aborted: {}", stage.title(), reason)
            }
            AlignError::NoOptimum(stage) => write!(f, "{}: no fit to the data", stage.title()),
            AlignError::OffScan { stage, best } => write!(
                f,
                "{}: fitted optimum {:.3} is outside the scanned range",
                stage.title(),
                best
            ),
        }
    }
}

impl std::error::Error for AlignError {}

impl From<ConfigurationError> for AlignError {
    fn from(e: ConfigurationError) -> Self {
        AlignError::Configuration(e)
    }
}

impl From<ValidationError> for AlignError {
    fn from(e: ValidationError) -> Self {
        AlignError::Validation(e)
    }
}

impl From<StartError> for AlignError {
    fn from(e: StartError) -> Self {
        AlignError::Start(e)
    }
}

/// Everything a stage scan needs, resolved before any motion.
#[derive(Debug, Clone)]
pub struct StagePlan {
    pub stage: Stage,
    pub row: ScanParameterRow,
    pub binding: ChannelBinding,
}

impl StagePlan {
    pub fn new(
        config: &AlignmentConfig,
        stage: Stage,
        catalog: &ChannelCatalog,
        table: &ScanTable,
    ) -> Result<Self, AlignError> {
        let StageConfig { motor, row } = match stage {
            Stage::Z => &config.z,
            Stage::Theta => &config.theta,
        };
        let binding = catalog.resolve(motor, &config.detector)?;
        let row = table.read(*row)?;
        row.validate()?;

        Ok(Self {
            stage,
            row,
            binding,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Alignment {
    pub stage: Stage,
    pub best: f64,
    pub report: ScanReport,
    pub snapshot: ScanSnapshot,
}

impl std::fmt::Display for Alignment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Optimized {}: {:.3}", self.stage, self.best)
    }
}

/// Scan one stage with its pinned fit and take the fitted center as the
/// best position, optionally leaving the motor there.
pub async fn align<C: ChannelAccess>(
    engine: &mut ScanEngine,
    channels: &mut C,
    plan: StagePlan,
    move_to_optimum: bool,
    observer: impl FnMut(&ScanSnapshot),
) -> Result<Alignment, AlignError> {
    let StagePlan {
        stage,
        row,
        binding,
    } = plan;
    let kind = stage.fit_kind();
    let command = binding.motor_command_channel.clone();

    tracing::info!("{} ({})", stage.title(), kind);
    engine.start(row, binding, [kind])?;

    let report = match engine.run(channels, observer).await {
        StepOutcome::Finished(report) => report,
        StepOutcome::Aborted(reason) => return Err(AlignError::Aborted { stage, reason }),
        _ => return Err(AlignError::NoOptimum(stage)),
    };
    let best = report
        .optima
        .get(&kind)
        .copied()
        .filter(|b| b.is_finite())
        .ok_or(AlignError::NoOptimum(stage))?;

    let (lo, hi) = (row.start.min(row.end), row.start.max(row.end));
    if best < lo || best > hi {
        return Err(AlignError::OffScan { stage, best });
    }

    if move_to_optimum {
        channels
            .set(&command, best, engine.channel_timeout())
            .await
            .map_err(|e| AlignError::Aborted {
                stage,
                reason: AbortReason::from(&e),
            })?;
    }

    let alignment = Alignment {
        stage,
        best,
        report,
        snapshot: engine.snapshot(),
    };
    tracing::info!("{}", alignment);
    Ok(alignment)
}

/// Align `stages` in order, each one starting where the previous one left
/// its motor. Stops at the first failure.
pub async fn align_sequence<C: ChannelAccess>(
    engine: &mut ScanEngine,
    channels: &mut C,
    config: &AlignmentConfig,
    catalog: &ChannelCatalog,
    table: &ScanTable,
    stages: &[Stage],
    mut observer: impl FnMut(Stage, &ScanSnapshot),
) -> Result<Vec<Alignment>, AlignError> {
    // every stage resolves before anything moves
    let plans = stages
        .iter()
        .map(|s| StagePlan::new(config, *s, catalog, table))
        .collect::<Result<Vec<_>, _>>()?;

    let mut done = Vec::with_capacity(plans.len());
    for plan in plans {
        let stage = plan.stage;
        let observe = |s: &ScanSnapshot| observer(stage, s);
        done.push(align(engine, channels, plan, config.move_to_optimum, observe).await?);
    }
    Ok(done)
}

#[cfg(test)]
mod test {
    use super::*;

    use std::time::Duration;

    use crate::config::SimulatorConfig;
    use crate::pv_codec::{PvRequest, PvResponse};
    use crate::simulator::SimulatedInstrument;

    fn instrument() -> (SimulatedInstrument, SimulatorConfig) {
        let config = SimulatorConfig {
            motor_noise: 0.0,
            detector_noise: 0.0,
            seed: Some(3),
            ..Default::default()
        };
        (SimulatedInstrument::new(config.clone()), config)
    }

    fn readback(sim: &mut SimulatedInstrument, name: &str) -> f64 {
        match sim.handle(PvRequest::Get(name.to_owned())) {
            PvResponse::Ok(v) => v,
            PvResponse::Err(e) => panic!("{e}"),
        }
    }

    fn engine() -> ScanEngine {
        ScanEngine::new(Duration::from_millis(100), 0.1)
    }

    #[test]
    fn stage_names() {
        assert_eq!("z".parse::<Stage>(), Ok(Stage::Z));
        assert_eq!(" Theta".parse::<Stage>(), Ok(Stage::Theta));
        assert!("chi".parse::<Stage>().is_err());
        assert_eq!(Stage::Z.fit_kind(), FitKind::ErrorFunction);
        assert_eq!(Stage::Theta.fit_kind(), FitKind::Gaussian);
    }

    #[tokio::test(start_paused = true)]
    async fn z_then_theta() {
        let (mut sim, sim_config) = instrument();
        let catalog = ChannelCatalog::simulator_template("sim:");
        let table = ScanTable::default();
        let config = AlignmentConfig::default();

        // detune the tilt so the theta scan has something to find
        sim.handle(PvRequest::Put("sim:theta.VAL".to_owned(), 9.5));

        let mut seen = vec![];
        let done = align_sequence(
            &mut engine(),
            &mut sim,
            &config,
            &catalog,
            &table,
            &Stage::SEQUENCE,
            |stage, _| seen.push(stage),
        )
        .await
        .unwrap();

        assert_eq!(done.len(), 2);
        assert_eq!(done[0].stage, Stage::Z);
        assert!((done[0].best - sim_config.z_center).abs() < 1e-2, "{}", done[0]);
        assert_eq!(done[1].stage, Stage::Theta);
        assert!((done[1].best - sim_config.theta_center).abs() < 1e-2, "{}", done[1]);

        assert_eq!(seen.iter().filter(|s| **s == Stage::Z).count(), 11);
        assert_eq!(seen.iter().filter(|s| **s == Stage::Theta).count(), 11);
        assert!(done[0].report.parameters.contains_key(&FitKind::ErrorFunction));
        assert_eq!(done[0].snapshot.fits.len(), 1);
        assert_eq!(done[1].to_string(), format!("Optimized Theta: {:.3}", done[1].best));

        // both motors were left at their optimum
        assert_eq!(readback(&mut sim, "sim:z.RBV"), done[0].best);
        assert_eq!(readback(&mut sim, "sim:theta.RBV"), done[1].best);
    }

    #[tokio::test(start_paused = true)]
    async fn stays_put_when_asked() {
        let (mut sim, _) = instrument();
        let catalog = ChannelCatalog::simulator_template("sim:");
        let table = ScanTable::default();
        let config = AlignmentConfig {
            move_to_optimum: false,
            ..Default::default()
        };

        let plan = StagePlan::new(&config, Stage::Theta, &catalog, &table).unwrap();
        let end = plan.row.end;
        sim.handle(PvRequest::Put("sim:z.VAL".to_owned(), 10.0));
        let a = align(&mut engine(), &mut sim, plan, false, |_| {})
            .await
            .unwrap();

        assert_eq!(a.stage, Stage::Theta);
        assert_eq!(readback(&mut sim, "sim:theta.RBV"), end);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_alias_moves_nothing() {
        let (mut sim, _) = instrument();
        let catalog = ChannelCatalog::simulator_template("sim:");
        let table = ScanTable::default();
        let mut config = AlignmentConfig::default();
        config.theta.motor = "Chi".to_owned();

        let z_before = readback(&mut sim, "sim:z.RBV");
        let res = align_sequence(
            &mut engine(),
            &mut sim,
            &config,
            &catalog,
            &table,
            &Stage::SEQUENCE,
            |_, _| {},
        )
        .await;

        assert!(matches!(res, Err(AlignError::Configuration(_))));
        assert_eq!(readback(&mut sim, "sim:z.RBV"), z_before);
    }
}
