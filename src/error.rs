use crate::settings::SettingsError;
use crate::supervisor::{RestartReason, WatchdogError};
use thiserror::Error;

/// Why a payload task or the whole payload stopped.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("controlled restart: {0}")]
    Restart(RestartReason),
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error(transparent)]
    Watchdog(#[from] WatchdogError),
    #[error("failed to start image pipeline: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("task `{0}` stopped unexpectedly")]
    TaskEnded(&'static str),
}

impl PayloadError {
    pub fn restart_reason(&self) -> Option<RestartReason> {
        match self {
            PayloadError::Restart(reason) => Some(*reason),
            _ => None,
        }
    }
}
