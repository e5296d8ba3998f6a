//! Liveness supervision and the controlled-restart line.
//!
//! Every task registers with the [`Watchdog`] and feeds its handle at least
//! once per loop iteration. A task that stays silent past the timeout gets
//! the whole payload restarted. Restarts from any source go through the
//! [`RestartLine`]; the first request wins.

use core::fmt;
use heapless::Vec;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{error, warn};

pub const MAX_SUPERVISED_TASKS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    /// `CTL,SYS,REBOOT` from the ground.
    OperatorCommand,
    /// Camera reconfiguration and the rollback to defaults both failed.
    ReconfigurationFailed,
    BootCheckFailed,
    /// The named task stopped feeding the watchdog.
    Watchdog(&'static str),
}

impl fmt::Display for RestartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartReason::OperatorCommand => write!(f, "operator reboot command"),
            RestartReason::ReconfigurationFailed => write!(f, "camera reconfiguration and rollback failed"),
            RestartReason::BootCheckFailed => write!(f, "boot check failed"),
            RestartReason::Watchdog(task) => write!(f, "watchdog expired for task `{}`", task),
        }
    }
}

/// Shared record of the first restart request.
#[derive(Debug, Clone)]
pub struct RestartLine {
    requested: Arc<watch::Sender<Option<RestartReason>>>,
}

impl Default for RestartLine {
    fn default() -> Self {
        Self::new()
    }
}

impl RestartLine {
    pub fn new() -> Self {
        let (requested, _) = watch::channel(None);
        Self {
            requested: Arc::new(requested),
        }
    }

    pub fn request(&self, reason: RestartReason) {
        let first = self.requested.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
        if first {
            error!("controlled restart requested: {}", reason);
        }
    }

    pub fn requested(&self) -> Option<RestartReason> {
        *self.requested.borrow()
    }

    /// Resolve with the reason once a restart has been requested.
    pub async fn wait(&self) -> RestartReason {
        let mut rx = self.requested.subscribe();
        loop {
            let current = *rx.borrow_and_update();
            if let Some(reason) = current {
                return reason;
            }
            if rx.changed().await.is_err() {
                // The sender lives in self, so this cannot happen while
                // self is borrowed; park instead of spinning.
                std::future::pending::<()>().await;
            }
        }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogError {
    #[error("watchdog already supervises {0} tasks")]
    Full(usize),
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    name: &'static str,
    last_feed: Instant,
}

#[derive(Debug)]
struct Registry {
    entries: Vec<Entry, MAX_SUPERVISED_TASKS>,
}

#[derive(Debug, Clone)]
pub struct Watchdog {
    registry: Arc<Mutex<Registry>>,
    timeout: Duration,
}

impl Watchdog {
    pub fn new(timeout: Duration) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry { entries: Vec::new() })),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Put `name` under supervision, starting its clock now. Registering a
    /// name twice hands back the same slot.
    pub fn register(&self, name: &'static str) -> Result<WatchdogHandle, WatchdogError> {
        let mut registry = self.registry();
        let now = Instant::now();
        let slot = match registry.entries.iter().position(|entry| entry.name == name) {
            Some(slot) => {
                registry.entries[slot].last_feed = now;
                slot
            }
            None => {
                registry
                    .entries
                    .push(Entry { name, last_feed: now })
                    .map_err(|_| WatchdogError::Full(MAX_SUPERVISED_TASKS))?;
                registry.entries.len() - 1
            }
        };
        Ok(WatchdogHandle {
            watchdog: self.clone(),
            slot,
        })
    }

    pub fn supervised(&self) -> usize {
        self.registry().entries.len()
    }

    /// The first task whose last feed is older than the timeout.
    pub fn expired(&self, now: Instant) -> Option<&'static str> {
        self.registry()
            .entries
            .iter()
            .find(|entry| now.saturating_duration_since(entry.last_feed) > self.timeout)
            .map(|entry| entry.name)
    }

    /// Poll until some task expires, then request a restart naming it.
    pub async fn supervise(&self, restart: RestartLine, poll: Duration) -> RestartReason {
        let mut ticker = interval(poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Some(task) = self.expired(Instant::now()) {
                warn!(task, "task missed its liveness deadline");
                let reason = RestartReason::Watchdog(task);
                restart.request(reason);
                return reason;
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct WatchdogHandle {
    watchdog: Watchdog,
    slot: usize,
}

impl WatchdogHandle {
    pub fn feed(&self) {
        let mut registry = self.watchdog.registry();
        if let Some(entry) = registry.entries.get_mut(self.slot) {
            entry.last_feed = Instant::now();
        }
    }

    pub fn name(&self) -> &'static str {
        self.watchdog
            .registry()
            .entries
            .get(self.slot)
            .map_or("unknown", |entry| entry.name)
    }
}
