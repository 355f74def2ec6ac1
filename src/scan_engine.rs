use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::channel::{ChannelAccess, ChannelBinding, ChannelError};
use crate::fit::{fit_all, FitKind, FittedCurve, MIN_FIT_POINTS};
use crate::scan_table::{ScanParameterRow, ValidationError};

/// Mutable state of one scan, owned by the engine.
#[derive(Debug, Clone, Default)]
pub struct ScanRun {
    pub positions: Vec<f64>,
    pub observed_x: Vec<f64>,
    pub observed_y: Vec<f64>,
    pub current_step: usize,
    pub active_fits: BTreeSet<FitKind>,
    pub fit_results: BTreeMap<FitKind, FittedCurve>,
}

impl ScanRun {
    fn new(positions: Vec<f64>, active_fits: BTreeSet<FitKind>) -> Self {
        Self {
            positions,
            active_fits,
            ..Default::default()
        }
    }

    /// Fitted coefficients and optima of every non-empty curve
    pub fn report(&self) -> ScanReport {
        let parameters = self
            .fit_results
            .iter()
            .filter(|(_, c)| !c.is_empty())
            .map(|(k, c)| (*k, c.parameters.clone()))
            .collect::<BTreeMap<_, _>>();
        let optima = parameters
            .iter()
            .filter_map(|(k, p)| k.optimum(p).map(|o| (*k, o)))
            .collect();

        ScanReport { parameters, optima }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanReport {
    pub parameters: BTreeMap<FitKind, Vec<f64>>,
    pub optima: BTreeMap<FitKind, f64>,
}

impl std::fmt::Display for ScanReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.parameters.is_empty() {
            return writeln!(f, "No fits available");
        }
        for (kind, p) in &self.parameters {
            write!(f, "{kind}:")?;
            for (name, v) in kind.parameter_names().iter().zip(p) {
                write!(f, " {name}={v:.6}")?;
            }
            match self.optima.get(kind) {
                Some(o) => writeln!(f, " -> optimum {o:.6}")?,
                None => writeln!(f)?,
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AbortReason {
    Cancelled,
    Channel { channel: String, message: String },
}

impl From<&ChannelError> for AbortReason {
    fn from(e: &ChannelError) -> Self {
        AbortReason::Channel {
            channel: e.channel().to_owned(),
            message: e.to_string(),
        }
    }
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbortReason::Cancelled => write!(f, "cancelled by operator"),
            AbortReason::Channel { message, .. } => write!(f, "{message}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScanState {
    Idle,
    Stepping,
    Finished,
    Aborted(AbortReason),
}

#[derive(Debug, Clone, PartialEq)]
pub enum StartError {
    Validation(ValidationError),
    InProgress,
}

impl std::fmt::Display for StartError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartError::Validation(e) => write!(f, "{e}"),
            StartError::InProgress => write!(f, "A scan is already in progress"),
        }
    }
}

impl std::error::Error for StartError {}

impl From<ValidationError> for StartError {
    fn from(e: ValidationError) -> Self {
        StartError::Validation(e)
    }
}

/// What observers get after every step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanSnapshot {
    pub step: usize,
    pub total: usize,
    /// Axis labels, "alias (units)"
    pub motor: String,
    pub detector: String,
    /// Catalog aliases of the bound channels
    pub motor_alias: String,
    pub detector_alias: String,
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub fits: BTreeMap<FitKind, FittedCurve>,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Idle,
    Stepped(ScanSnapshot),
    Finished(ScanReport),
    Aborted(AbortReason),
}

impl StepOutcome {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepOutcome::Idle | StepOutcome::Finished(_) | StepOutcome::Aborted(_)
        )
    }
}

/// Step-by-step scan state machine: Idle -> Stepping -> Finished | Aborted.
///
/// Every [`ScanEngine::advance`] performs at most one motor move and one
/// detector read, so the caller decides the pacing (a tight loop in
/// [`ScanEngine::run`], a timer tick in the scan controller).
pub struct ScanEngine {
    channel_timeout: Duration,
    settle_fraction: f64,

    state: ScanState,
    run: ScanRun,
    dwell: f64,
    binding: Option<ChannelBinding>,
    cancel_requested: bool,
}

impl ScanEngine {
    pub fn new(channel_timeout: Duration, settle_fraction: f64) -> Self {
        Self {
            channel_timeout,
            settle_fraction,

            state: ScanState::Idle,
            run: ScanRun::default(),
            dwell: 0.0,
            binding: None,
            cancel_requested: false,
        }
    }

    pub fn state(&self) -> &ScanState {
        &self.state
    }

    pub fn scan_run(&self) -> &ScanRun {
        &self.run
    }

    pub fn binding(&self) -> Option<&ChannelBinding> {
        self.binding.as_ref()
    }

    pub fn channel_timeout(&self) -> Duration {
        self.channel_timeout
    }

    pub fn start(
        &mut self,
        row: ScanParameterRow,
        binding: ChannelBinding,
        fits: impl IntoIterator<Item = FitKind>,
    ) -> Result<(), StartError> {
        if self.state == ScanState::Stepping {
            return Err(StartError::InProgress);
        }
        row.validate()?;

        tracing::info!(
            "Scan {} from {} to {} in {} points, detector {}",
            binding.motor_alias,
            row.start,
            row.end,
            row.count,
            binding.detector_alias
        );

        self.run = ScanRun::new(row.positions(), fits.into_iter().collect());
        self.dwell = row.dwell;
        self.binding = Some(binding);
        self.cancel_requested = false;
        self.state = ScanState::Stepping;

        Ok(())
    }

    /// Takes effect at the beginning of the next step.
    pub fn cancel(&mut self) {
        if self.state == ScanState::Stepping {
            self.cancel_requested = true;
        }
    }

    pub async fn advance<C: ChannelAccess>(&mut self, channels: &mut C) -> StepOutcome {
        match &self.state {
            ScanState::Idle => return StepOutcome::Idle,
            ScanState::Finished => return StepOutcome::Finished(self.run.report()),
            ScanState::Aborted(reason) => return StepOutcome::Aborted(reason.clone()),
            ScanState::Stepping => {}
        }

        if self.cancel_requested {
            return self.abort(AbortReason::Cancelled);
        }

        let i = self.run.current_step;
        let Some(&target) = self.run.positions.get(i) else {
            let report = self.run.report();
            tracing::info!("Scan finished after {} steps", i);
            for line in report.to_string().lines() {
                tracing::info!("{}", line);
            }
            self.state = ScanState::Finished;
            return StepOutcome::Finished(report);
        };

        let Some(binding) = &self.binding else {
            return StepOutcome::Idle;
        };
        let (x, y) = match self.measure(channels, binding, target).await {
            Ok(v) => v,
            Err(e) => {
                tracing::error!("Step {}: {}", i, e);
                return self.abort(AbortReason::from(&e));
            }
        };

        self.run.observed_x.push(x);
        self.run.observed_y.push(y);
        if self.run.observed_x.len() >= MIN_FIT_POINTS {
            self.refit();
        }
        self.run.current_step += 1;

        StepOutcome::Stepped(self.snapshot())
    }

    /// Drive the scan to a terminal state, `observer` sees every step.
    pub async fn run<C: ChannelAccess>(
        &mut self,
        channels: &mut C,
        mut observer: impl FnMut(&ScanSnapshot),
    ) -> StepOutcome {
        loop {
            match self.advance(channels).await {
                StepOutcome::Stepped(snapshot) => observer(&snapshot),
                terminal => return terminal,
            }
        }
    }

    pub fn snapshot(&self) -> ScanSnapshot {
        let (motor, detector) = self
            .binding
            .as_ref()
            .map(|b| b.axis_labels())
            .unwrap_or_default();
        let (motor_alias, detector_alias) = self
            .binding
            .as_ref()
            .map(|b| (b.motor_alias.clone(), b.detector_alias.clone()))
            .unwrap_or_default();

        ScanSnapshot {
            step: self.run.current_step,
            total: self.run.positions.len(),
            motor,
            detector,
            motor_alias,
            detector_alias,
            x: self.run.observed_x.clone(),
            y: self.run.observed_y.clone(),
            fits: self.run.fit_results.clone(),
            status: self.status_text(),
        }
    }

    fn status_text(&self) -> String {
        match &self.state {
            ScanState::Idle => "Idle".to_owned(),
            ScanState::Stepping => {
                match (self.run.observed_x.last(), self.run.observed_y.last()) {
                    (Some(x), Some(y)) => format!(
                        "Step {}/{}: x = {:.4}, y = {:.4}",
                        self.run.current_step,
                        self.run.positions.len(),
                        x,
                        y
                    ),
                    _ => format!("Starting, {} points", self.run.positions.len()),
                }
            }
            ScanState::Finished => format!("Finished, {} points", self.run.current_step),
            ScanState::Aborted(reason) => format!(
                "Aborted at step {}: {}",
                self.run.current_step, reason
            ),
        }
    }

    fn abort(&mut self, reason: AbortReason) -> StepOutcome {
        tracing::warn!("Scan aborted: {}", reason);
        self.state = ScanState::Aborted(reason.clone());
        StepOutcome::Aborted(reason)
    }

    /// Move, settle, read back, integrate, read the detector.
    async fn measure<C: ChannelAccess>(
        &self,
        channels: &mut C,
        binding: &ChannelBinding,
        target: f64,
    ) -> Result<(f64, f64), ChannelError> {
        let timeout = self.channel_timeout;

        channels
            .set(&binding.motor_command_channel, target, timeout)
            .await?;

        tokio::time::sleep(seconds(self.dwell * self.settle_fraction)).await;
        let x = channels
            .get(&binding.motor_readback_channel, timeout)
            .await?;

        tokio::time::sleep(seconds(self.dwell)).await;
        let y = channels.get(&binding.detector_channel, timeout).await?;

        tracing::debug!("{} -> x = {}, y = {}", target, x, y);
        Ok((x, y))
    }

    fn refit(&mut self) {
        let run = &mut self.run;
        let results = fit_all(
            run.active_fits.iter().copied(),
            &run.observed_x,
            &run.observed_y,
        );

        for (kind, res) in results {
            match res {
                Ok(curve) => {
                    run.fit_results.insert(kind, curve);
                }
                Err(e) => {
                    tracing::debug!("{} fit failed at step {}: {}", kind, run.current_step, e);
                    run.fit_results.entry(kind).or_insert_with(FittedCurve::empty);
                }
            }
        }
    }
}

fn seconds(s: f64) -> Duration {
    Duration::try_from_secs_f64(s).unwrap_or_default()
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::fit::gaussian;

    const MOTOR_VAL: &str = "bench:m.VAL";
    const MOTOR_RBV: &str = "bench:m.RBV";
    const DETECTOR: &str = "bench:det";
    const NO_FITS: [FitKind; 0] = [];

    /// Motor with a perfect readback and a detector answering `response(x)`
    struct Bench {
        motor: f64,
        response: fn(f64) -> f64,
        detector_reads: usize,
        timeout_at: Option<usize>,
        nan_at: Option<usize>,
        stuck: bool,
        calls: usize,
    }

    impl Bench {
        fn new(response: fn(f64) -> f64) -> Self {
            Self {
                motor: 0.0,
                response,
                detector_reads: 0,
                timeout_at: None,
                nan_at: None,
                stuck: false,
                calls: 0,
            }
        }
    }

    impl ChannelAccess for Bench {
        async fn get(&mut self, channel: &str, timeout: Duration) -> Result<f64, ChannelError> {
            self.calls += 1;
            match channel {
                MOTOR_RBV => Ok(self.motor),
                DETECTOR => {
                    self.detector_reads += 1;
                    if self.timeout_at == Some(self.detector_reads) {
                        Err(ChannelError::Timeout {
                            channel: channel.to_owned(),
                            timeout,
                        })
                    } else if self.nan_at == Some(self.detector_reads) {
                        Ok(f64::NAN)
                    } else {
                        Ok((self.response)(self.motor))
                    }
                }
                _ => Err(ChannelError::Rejected {
                    channel: channel.to_owned(),
                    message: "Unknown channel".to_owned(),
                }),
            }
        }

        async fn set(
            &mut self,
            channel: &str,
            value: f64,
            _timeout: Duration,
        ) -> Result<(), ChannelError> {
            self.calls += 1;
            if channel != MOTOR_VAL {
                return Err(ChannelError::Rejected {
                    channel: channel.to_owned(),
                    message: "read-only".to_owned(),
                });
            }
            if !self.stuck {
                self.motor = value;
            }
            Ok(())
        }
    }

    fn binding() -> ChannelBinding {
        ChannelBinding {
            motor_alias: "M".to_owned(),
            detector_alias: "D".to_owned(),
            motor_command_channel: MOTOR_VAL.to_owned(),
            motor_readback_channel: MOTOR_RBV.to_owned(),
            detector_channel: DETECTOR.to_owned(),
            motor_units: "mm".to_owned(),
            detector_units: "counts".to_owned(),
        }
    }

    fn engine() -> ScanEngine {
        ScanEngine::new(Duration::from_millis(100), 0.1)
    }

    fn peak(x: f64) -> f64 {
        gaussian(x, 5.0, 1.0, 1.0)
    }

    #[tokio::test]
    async fn exactly_n_steps() {
        let mut bench = Bench::new(|x| 2.0 * x + 1.0);
        let mut engine = engine();
        engine
            .start(ScanParameterRow::new(0.0, 1.0, 7, 0.0), binding(), [FitKind::Linear])
            .unwrap();

        let mut steps = vec![];
        let outcome = engine.run(&mut bench, |s| steps.push(s.step)).await;

        assert!(matches!(outcome, StepOutcome::Finished(_)));
        assert_eq!(steps, (1..=7).collect::<Vec<_>>());
        assert_eq!(engine.state(), &ScanState::Finished);

        let run = engine.scan_run();
        assert_eq!(run.current_step, 7);
        assert_eq!(run.observed_x.len(), 7);
        assert_eq!(run.observed_y.len(), 7);
        assert_eq!(run.observed_x, run.positions);

        // terminal state is sticky
        let calls = bench.calls;
        assert!(matches!(engine.advance(&mut bench).await, StepOutcome::Finished(_)));
        assert_eq!(bench.calls, calls);
    }

    #[tokio::test]
    async fn first_fit_at_third_point() {
        let mut bench = Bench::new(|x| 0.5 * x);
        let mut engine = engine();
        engine
            .start(ScanParameterRow::new(0.0, 4.0, 5, 0.0), binding(), [FitKind::Linear])
            .unwrap();

        for step in 1..=5 {
            let StepOutcome::Stepped(s) = engine.advance(&mut bench).await else {
                panic!("step {step} did not happen");
            };
            assert_eq!(s.step, step);
            assert_eq!(s.x.len(), s.y.len());
            if step < 3 {
                assert!(s.fits.is_empty());
            } else {
                let curve = &s.fits[&FitKind::Linear];
                assert!((curve.parameters[0] - 0.5).abs() < 1e-9);
                assert_eq!(curve.dense_x.len(), step * crate::fit::DENSE_FACTOR);
            }
        }
    }

    #[tokio::test]
    async fn failed_fit_keeps_previous_curve() {
        let mut bench = Bench::new(peak);
        bench.nan_at = Some(8);

        let mut engine = engine();
        engine
            .start(
                ScanParameterRow::new(0.0, 10.0, 11, 0.0),
                binding(),
                [FitKind::Linear, FitKind::Gaussian],
            )
            .unwrap();

        let mut last = None;
        for _ in 0..7 {
            if let StepOutcome::Stepped(s) = engine.advance(&mut bench).await {
                last = Some(s);
            }
        }
        let before = last.unwrap();
        assert!(!before.fits[&FitKind::Linear].is_empty());
        assert!(!before.fits[&FitKind::Gaussian].is_empty());

        for _ in 0..4 {
            let StepOutcome::Stepped(s) = engine.advance(&mut bench).await else {
                panic!("scan stopped");
            };
            assert_eq!(s.fits, before.fits);
        }
        assert!(matches!(engine.advance(&mut bench).await, StepOutcome::Finished(_)));
    }

    #[tokio::test]
    async fn first_failed_fit_is_empty_curve() {
        let mut bench = Bench::new(|x| x);
        bench.stuck = true;

        let mut engine = engine();
        engine
            .start(ScanParameterRow::new(0.0, 1.0, 3, 0.0), binding(), [FitKind::Linear])
            .unwrap();

        engine.run(&mut bench, |_| {}).await;
        let curve = &engine.scan_run().fit_results[&FitKind::Linear];
        assert_eq!(curve, &FittedCurve::empty());
        assert_eq!(engine.scan_run().report(), ScanReport::default());
    }

    #[tokio::test]
    async fn one_failing_kind_leaves_others_fitting() {
        // stuck motor: every x is equal, which a line cannot fit
        let mut bench = Bench::new(|x| x + 2.0);
        bench.stuck = true;

        let mut engine = engine();
        engine
            .start(
                ScanParameterRow::new(0.0, 1.0, 5, 0.0),
                binding(),
                [FitKind::Linear, FitKind::Gaussian],
            )
            .unwrap();

        let mut fitted_steps = 0;
        while let StepOutcome::Stepped(s) = engine.advance(&mut bench).await {
            if s.step < MIN_FIT_POINTS {
                assert!(s.fits.is_empty());
                continue;
            }
            fitted_steps += 1;
            assert_eq!(s.fits[&FitKind::Linear], FittedCurve::empty());
            let gauss = &s.fits[&FitKind::Gaussian];
            assert!(!gauss.is_empty());
            assert!((gauss.parameters[2] - 2.0).abs() < 1e-6);
        }
        assert_eq!(fitted_steps, 3);

        let report = engine.scan_run().report();
        assert!(report.parameters.contains_key(&FitKind::Gaussian));
        assert!(!report.parameters.contains_key(&FitKind::Linear));
    }

    #[tokio::test]
    async fn timeout_aborts() {
        let mut bench = Bench::new(peak);
        bench.timeout_at = Some(4);

        let mut engine = engine();
        engine
            .start(ScanParameterRow::new(0.0, 10.0, 11, 0.0), binding(), [FitKind::Gaussian])
            .unwrap();

        let outcome = engine.run(&mut bench, |_| {}).await;
        let StepOutcome::Aborted(reason) = outcome else {
            panic!("scan was not aborted: {outcome:?}");
        };
        assert_eq!(
            reason,
            AbortReason::Channel {
                channel: DETECTOR.to_owned(),
                message: "Channel bench:det did not respond within 0.100 s".to_owned(),
            }
        );

        let calls = bench.calls;
        assert!(matches!(engine.advance(&mut bench).await, StepOutcome::Aborted(_)));
        assert_eq!(bench.calls, calls);

        let run = engine.scan_run();
        assert_eq!(run.current_step, 3);
        assert_eq!(run.observed_x.len(), 3);
        assert_eq!(run.observed_y.len(), 3);
        assert!(engine.snapshot().status.starts_with("Aborted at step 3"));
    }

    #[tokio::test]
    async fn cancel_at_next_step() {
        let mut bench = Bench::new(peak);
        let mut engine = engine();
        engine
            .start(ScanParameterRow::new(0.0, 10.0, 11, 0.0), binding(), NO_FITS)
            .unwrap();

        engine.advance(&mut bench).await;
        engine.advance(&mut bench).await;
        engine.cancel();

        let outcome = engine.advance(&mut bench).await;
        assert_eq!(outcome, StepOutcome::Aborted(AbortReason::Cancelled));
        assert_eq!(AbortReason::Cancelled.to_string(), "cancelled by operator");
        assert_eq!(engine.scan_run().current_step, 2);

        // a new scan starts from scratch
        engine
            .start(ScanParameterRow::new(0.0, 1.0, 2, 0.0), binding(), NO_FITS)
            .unwrap();
        assert_eq!(engine.scan_run().current_step, 0);
        assert!(matches!(engine.run(&mut bench, |_| {}).await, StepOutcome::Finished(_)));
    }

    #[tokio::test]
    async fn start_rules() {
        let mut bench = Bench::new(peak);
        let mut engine = engine();

        assert_eq!(engine.advance(&mut bench).await, StepOutcome::Idle);

        let mut row = ScanParameterRow::new(0.0, 1.0, 0, 0.0);
        assert_eq!(
            engine.start(row, binding(), NO_FITS),
            Err(StartError::Validation(ValidationError::EmptyScan))
        );
        row = ScanParameterRow::new(0.0, f64::INFINITY, 3, 0.0);
        assert_eq!(
            engine.start(row, binding(), NO_FITS),
            Err(StartError::Validation(ValidationError::NonFiniteRow))
        );
        assert_eq!(engine.state(), &ScanState::Idle);

        engine
            .start(ScanParameterRow::new(0.0, 1.0, 3, 0.0), binding(), NO_FITS)
            .unwrap();
        assert_eq!(
            engine.start(ScanParameterRow::new(0.0, 1.0, 3, 0.0), binding(), NO_FITS),
            Err(StartError::InProgress)
        );
    }

    #[tokio::test]
    async fn channel_rejection_aborts() {
        let mut bench = Bench::new(peak);
        let mut b = binding();
        b.motor_command_channel = "bench:m.RBV".to_owned();

        let mut engine = engine();
        engine
            .start(ScanParameterRow::new(0.0, 1.0, 3, 0.0), b, NO_FITS)
            .unwrap();

        match engine.advance(&mut bench).await {
            StepOutcome::Aborted(AbortReason::Channel { channel, .. }) => {
                assert_eq!(channel, "bench:m.RBV")
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(engine.scan_run().observed_x.is_empty());
    }

    #[test]
    fn report_text() {
        let report = ScanReport {
            parameters: maplit::btreemap! {
                FitKind::Linear => vec![2.0, 1.0],
                FitKind::Gaussian => vec![5.0, 1.0, 3.0],
            },
            optima: maplit::btreemap! { FitKind::Gaussian => 5.0 },
        };
        assert_eq!(
            report.to_string(),
            "Linear: slope=2.000000 intercept=1.000000\n\
             Gaussian: x0=5.000000 width=1.000000 scale=3.000000 -> optimum 5.000000\n"
        );
        assert_eq!(ScanReport::default().to_string(), "No fits available\n");
    }

    #[tokio::test(start_paused = true)]
    async fn gaussian_alignment() {
        let mut bench = Bench::new(peak);
        let mut engine = engine();
        engine
            .start(
                ScanParameterRow::new(0.0, 10.0, 11, 0.5),
                binding(),
                [FitKind::Gaussian, FitKind::Linear],
            )
            .unwrap();

        let begin = tokio::time::Instant::now();
        let mut steps = 0;
        let outcome = engine.run(&mut bench, |_| steps += 1).await;
        let elapsed = begin.elapsed();

        let StepOutcome::Finished(report) = outcome else {
            panic!("scan did not finish: {outcome:?}");
        };
        assert_eq!(steps, 11);
        let x0 = report.optima[&FitKind::Gaussian];
        assert!((x0 - 5.0).abs() < 1e-3, "{x0}");
        assert!(!report.optima.contains_key(&FitKind::Linear));
        assert!(report.parameters.contains_key(&FitKind::Linear));

        // settle (10%) + dwell per point
        assert!(elapsed >= Duration::from_millis(11 * 550), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(11 * 550 + 50), "{elapsed:?}");
    }
}
