//! Audible alert sequences and the boot health latch.

use crate::hal::Alert;
use crate::state::StateStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

const ERROR_BEEPS: usize = 3;
const ERROR_BEEP: Duration = Duration::from_millis(50);
const READY_BEEP: Duration = Duration::from_millis(100);

#[derive(Clone)]
pub struct Annunciator {
    alert: Arc<Mutex<Box<dyn Alert>>>,
    state: StateStore,
    healthy: Arc<AtomicBool>,
}

impl core::fmt::Debug for Annunciator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Annunciator")
            .field("healthy", &self.healthy.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Annunciator {
    pub fn new(alert: Box<dyn Alert>, state: StateStore) -> Self {
        Self {
            alert: Arc::new(Mutex::new(alert)),
            state,
            healthy: Arc::new(AtomicBool::new(true)),
        }
    }

    fn drive(&self, on: bool) {
        self.alert.lock().unwrap_or_else(PoisonError::into_inner).set(on);
    }

    /// Three short beeps when audible alerts are enabled. Also latches the
    /// boot check as failed.
    pub async fn signal_error(&self) {
        warn!("error signalled");
        if self.state.get_status().buzzer_enabled {
            for _ in 0..ERROR_BEEPS {
                self.drive(true);
                sleep(ERROR_BEEP).await;
                self.drive(false);
                sleep(ERROR_BEEP).await;
            }
        }
        self.mark_failed();
    }

    pub async fn signal_ready(&self) {
        self.drive(true);
        sleep(READY_BEEP).await;
        self.drive(false);
    }

    /// Hold the alert on for `duration`.
    pub async fn hold(&self, duration: Duration) {
        self.drive(true);
        sleep(duration).await;
        self.drive(false);
    }

    pub fn mark_failed(&self) {
        self.healthy.store(false, Ordering::SeqCst);
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}
