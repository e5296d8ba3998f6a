//! Third-party relay forwarding with a per-window cap.

use crate::datalink::{InboundLine, MAX_LINE_SIZE};
use crate::downlink::Downlink;
use crate::settings::{ms, PayloadSettings};
use crate::state::StateStore;
use crate::status::StatusCode;
use crate::supervisor::WatchdogHandle;
use arrayvec::ArrayString;
use core::fmt::Write;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, warn};

pub const RELAY_TAG: &str = "##RELAY,";
const RELAY_FRAME_SIZE: usize = MAX_LINE_SIZE + RELAY_TAG.len();

pub type RelayFrame = ArrayString<RELAY_FRAME_SIZE>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Forward,
    /// Cap reached; the first refusal in a window carries a warning.
    Warn,
    Suppress,
}

/// Counts forwards since the window opened.
#[derive(Debug, Clone)]
pub struct RelayWindow {
    started: Instant,
    length: Duration,
    cap: u32,
    forwarded: u32,
    warned: bool,
}

impl RelayWindow {
    pub fn new(length: Duration, cap: u32, now: Instant) -> Self {
        Self {
            started: now,
            length,
            cap,
            forwarded: 0,
            warned: false,
        }
    }

    /// Open a fresh window once the current one is older than its length.
    pub fn roll(&mut self, now: Instant) {
        if now.saturating_duration_since(self.started) > self.length {
            if self.forwarded > 0 {
                debug!(forwarded = self.forwarded, "relay window reset");
            }
            self.started = now;
            self.forwarded = 0;
            self.warned = false;
        }
    }

    pub fn admit(&mut self) -> Admission {
        if self.forwarded < self.cap {
            self.forwarded += 1;
            Admission::Forward
        } else if !self.warned {
            self.warned = true;
            Admission::Warn
        } else {
            Admission::Suppress
        }
    }

    pub fn forwarded(&self) -> u32 {
        self.forwarded
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayTiming {
    pub idle_recheck: Duration,
    pub wait: Duration,
    pub window: Duration,
    pub cap: u32,
}

impl Default for RelayTiming {
    fn default() -> Self {
        Self {
            idle_recheck: Duration::from_secs(2),
            wait: Duration::from_secs(1),
            window: Duration::from_secs(120),
            cap: 80,
        }
    }
}

impl RelayTiming {
    pub fn from_settings(settings: &PayloadSettings) -> Self {
        Self {
            idle_recheck: ms(settings.relay_idle_recheck_ms),
            wait: ms(settings.relay_wait_ms),
            window: ms(settings.relay_window_ms),
            cap: settings.relay_window_cap,
        }
    }
}

pub fn relay_frame(line: &str) -> RelayFrame {
    let mut frame = RelayFrame::new();
    let _ = write!(frame, "{}{}", RELAY_TAG, line);
    frame
}

pub struct RelayForwarder {
    state: StateStore,
    downlink: Downlink,
    timing: RelayTiming,
    window: RelayWindow,
}

impl RelayForwarder {
    pub fn new(state: StateStore, downlink: Downlink, timing: RelayTiming) -> Self {
        Self {
            window: RelayWindow::new(timing.window, timing.cap, Instant::now()),
            state,
            downlink,
            timing,
        }
    }

    pub async fn run(mut self, mut relay: mpsc::Receiver<InboundLine>, watchdog: WatchdogHandle) {
        loop {
            watchdog.feed();
            if !self.state.get_status().relay_enabled {
                sleep(self.timing.idle_recheck).await;
                continue;
            }

            self.window.roll(Instant::now());
            match timeout(self.timing.wait, relay.recv()).await {
                Ok(Some(line)) => self.forward(&line).await,
                Ok(None) => {
                    // Link side is gone; nothing more will arrive.
                    sleep(self.timing.idle_recheck).await;
                }
                Err(_) => {}
            }
        }
    }

    async fn forward(&mut self, line: &str) {
        match self.window.admit() {
            Admission::Forward => {
                if let Err(e) = self.downlink.send_text(&relay_frame(line)).await {
                    warn!("relay frame dropped: {}", e);
                }
            }
            Admission::Warn => {
                warn!(cap = self.timing.cap, "relay rate limit reached");
                self.downlink.report_bare(StatusCode::RelayRateLimited).await;
            }
            Admission::Suppress => debug!("relay line suppressed by rate limit"),
        }
    }
}
