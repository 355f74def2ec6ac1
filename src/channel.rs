use std::future::Future;
use std::io::Error as IoError;
use std::time::Duration;

use serde::Serialize;

#[derive(Debug)]
pub enum ChannelError {
    Timeout { channel: String, timeout: Duration },
    Rejected { channel: String, message: String },
    Io { channel: String, error: IoError },
}

impl ChannelError {
    pub fn channel(&self) -> &str {
        match self {
            ChannelError::Timeout { channel, .. }
            | ChannelError::Rejected { channel, .. }
            | ChannelError::Io { channel, .. } => channel,
        }
    }
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelError::Timeout { channel, timeout } => write!(
                f,
                "Channel {} did not respond within {:.3} s",
                channel,
                timeout.as_secs_f64()
            ),
            ChannelError::Rejected { channel, message } => {
                write!(f, "Channel {channel} rejected the request: {message}")
            }
            ChannelError::Io { channel, error } => write!(f, "Channel {channel}: {error}"),
        }
    }
}

impl std::error::Error for ChannelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ChannelError::Io { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Read/write access to process variables. Each call is one atomic
/// request/response bounded by `timeout`.
pub trait ChannelAccess {
    fn get(
        &mut self,
        channel: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<f64, ChannelError>> + Send;

    fn set(
        &mut self,
        channel: &str,
        value: f64,
        timeout: Duration,
    ) -> impl Future<Output = Result<(), ChannelError>> + Send;
}

/// Channels resolved for one motor/detector pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelBinding {
    pub motor_alias: String,
    pub detector_alias: String,

    pub motor_command_channel: String,
    pub motor_readback_channel: String,
    pub detector_channel: String,

    pub motor_units: String,
    pub detector_units: String,
}

impl ChannelBinding {
    /// Plot axis labels, "alias (units)"
    pub fn axis_labels(&self) -> (String, String) {
        (
            format!("{} ({})", self.motor_alias, self.motor_units),
            format!("{} ({})", self.detector_alias, self.detector_units),
        )
    }
}
