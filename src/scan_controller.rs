use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::MissedTickBehavior;

use crate::channel::{ChannelAccess, ChannelBinding};
use crate::fit::FitKind;
use crate::scan_engine::{ScanEngine, ScanReport, ScanSnapshot, StartError, StepOutcome};
use crate::scan_table::ScanParameterRow;

#[derive(Debug, Clone, PartialEq)]
pub enum ControllerError {
    Start(StartError),
    NothingToCancel,
}

impl std::fmt::Display for ControllerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControllerError::Start(e) => write!(f, "{e}"),
            ControllerError::NothingToCancel => write!(f, "No scan in progress"),
        }
    }
}

impl std::error::Error for ControllerError {}

impl From<StartError> for ControllerError {
    fn from(e: StartError) -> Self {
        ControllerError::Start(e)
    }
}

#[derive(Debug, Clone, Serialize)]
pub enum ScanProgress {
    Idle,
    Stepping(ScanSnapshot),
    Finished {
        snapshot: ScanSnapshot,
        report: ScanReport,
    },
    Aborted {
        snapshot: ScanSnapshot,
        reason: String,
    },
}

impl ScanProgress {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ScanProgress::Finished { .. } | ScanProgress::Aborted { .. })
    }

    pub fn snapshot(&self) -> Option<&ScanSnapshot> {
        match self {
            ScanProgress::Idle => None,
            ScanProgress::Stepping(s)
            | ScanProgress::Finished { snapshot: s, .. }
            | ScanProgress::Aborted { snapshot: s, .. } => Some(s),
        }
    }
}

impl std::fmt::Display for ScanProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanProgress::Idle => write!(f, "Idle"),
            ScanProgress::Stepping(s) | ScanProgress::Finished { snapshot: s, .. } => {
                write!(f, "{}", s.status)
            }
            ScanProgress::Aborted { reason, .. } => write!(f, "Aborted: {reason}"),
        }
    }
}

#[derive(Debug)]
enum ScanCommand {
    Cancel,
}

/// Runs one scan at a time in a background task, one step per tick.
pub struct ScanController<C> {
    channels: Arc<Mutex<C>>,
    channel_timeout: Duration,
    settle_fraction: f64,
    step_interval: Duration,

    task: Option<tokio::task::JoinHandle<()>>,
    commands: Option<mpsc::Sender<ScanCommand>>,
    rx: Option<watch::Receiver<ScanProgress>>,
}

impl<C> ScanController<C>
where
    C: ChannelAccess + Send + 'static,
{
    pub fn new(
        channels: Arc<Mutex<C>>,
        channel_timeout: Duration,
        settle_fraction: f64,
        step_interval: Duration,
    ) -> Self {
        Self {
            channels,
            channel_timeout,
            settle_fraction,
            step_interval,

            task: None,
            commands: None,
            rx: None,
        }
    }

    pub fn subscribe(&self) -> Option<watch::Receiver<ScanProgress>> {
        self.rx.as_ref().map(|rx| rx.clone())
    }

    pub fn status(&self) -> ScanProgress {
        self.rx
            .as_ref()
            .map(|rx| rx.borrow().clone())
            .unwrap_or(ScanProgress::Idle)
    }

    /// Snapshot of the last completed or aborted scan
    pub fn last_result(&self) -> Option<ScanSnapshot> {
        match self.status() {
            ScanProgress::Finished { snapshot, .. } | ScanProgress::Aborted { snapshot, .. } => {
                Some(snapshot)
            }
            _ => None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().map_or(false, |t| !t.is_finished())
    }

    pub fn start(
        &mut self,
        row: ScanParameterRow,
        binding: ChannelBinding,
        fits: impl IntoIterator<Item = FitKind>,
    ) -> Result<(), ControllerError> {
        if self.is_running() {
            return Err(StartError::InProgress.into());
        }

        let mut engine = ScanEngine::new(self.channel_timeout, self.settle_fraction);
        engine.start(row, binding, fits)?;

        let (tx, rx) = watch::channel(ScanProgress::Stepping(engine.snapshot()));
        let (cmd_tx, cmd_rx) = mpsc::channel(1);

        self.rx.replace(rx);
        self.commands.replace(cmd_tx);
        self.task.replace(tokio::spawn(scan_task(
            engine,
            self.channels.clone(),
            tx,
            cmd_rx,
            self.step_interval,
        )));

        Ok(())
    }

    pub fn cancel(&mut self) -> Result<(), ControllerError> {
        if self.is_running() {
            if let Some(commands) = &self.commands {
                if commands.try_send(ScanCommand::Cancel).is_ok() {
                    tracing::info!("Scan cancel requested");
                }
                return Ok(());
            }
        }
        Err(ControllerError::NothingToCancel)
    }
}

async fn scan_task<C: ChannelAccess + Send>(
    mut engine: ScanEngine,
    channels: Arc<Mutex<C>>,
    tx: watch::Sender<ScanProgress>,
    mut commands: mpsc::Receiver<ScanCommand>,
    step_interval: Duration,
) {
    let mut ticker = tokio::time::interval(step_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        while let Ok(cmd) = commands.try_recv() {
            match cmd {
                ScanCommand::Cancel => engine.cancel(),
            }
        }

        let outcome = {
            let mut guard = channels.lock().await;
            engine.advance(&mut *guard).await
        };

        let progress = match outcome {
            StepOutcome::Stepped(snapshot) => ScanProgress::Stepping(snapshot),
            StepOutcome::Finished(report) => ScanProgress::Finished {
                snapshot: engine.snapshot(),
                report,
            },
            StepOutcome::Aborted(reason) => ScanProgress::Aborted {
                snapshot: engine.snapshot(),
                reason: reason.to_string(),
            },
            StepOutcome::Idle => ScanProgress::Idle,
        };

        let done = progress.is_terminal() || matches!(progress, ScanProgress::Idle);
        tx.send(progress).ok();
        if done {
            break;
        }
    }
}
