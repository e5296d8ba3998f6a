//! Link multiplexer: the only task that touches the radio transport.
//!
//! Each iteration makes exactly one transmit attempt, then drains whatever
//! inbound bytes are buffered, splitting them into lines and routing each
//! line by its two-character prefix:
//!
//! - `@@` command lines go to the command queue
//! - `##` relay lines go to the relay queue, but only while relay is
//!   enabled and no image transmission is in progress
//!
//! Anything else is dropped.

use crate::downlink::TxQueue;
use crate::hal::{Transport, TransportError};
use crate::settings::{ms, PayloadSettings};
use crate::state::StateStore;
use crate::supervisor::WatchdogHandle;
use arrayvec::ArrayString;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::yield_now;
use tokio::time::sleep;
use tracing::{debug, error, trace, warn};

pub const MAX_LINE_SIZE: usize = 512;
pub const COMMAND_QUEUE_CAPACITY: usize = 10;
pub const RELAY_QUEUE_CAPACITY: usize = 10;

pub const COMMAND_PREFIX: &str = "@@";
pub const RELAY_PREFIX: &str = "##";
const LINE_TERMINATOR: u8 = b'\n';

pub type InboundLine = ArrayString<MAX_LINE_SIZE>;

/// Bounded command and relay queues, in (sender, receiver) pairs.
pub fn inbound_queues() -> (
    (mpsc::Sender<InboundLine>, mpsc::Receiver<InboundLine>),
    (mpsc::Sender<InboundLine>, mpsc::Receiver<InboundLine>),
) {
    (
        mpsc::channel(COMMAND_QUEUE_CAPACITY),
        mpsc::channel(RELAY_QUEUE_CAPACITY),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineClass<'a> {
    Command(&'a str),
    Relay(&'a str),
    Unknown,
}

pub fn classify(line: &str) -> LineClass<'_> {
    if let Some(rest) = line.strip_prefix(COMMAND_PREFIX) {
        LineClass::Command(rest)
    } else if let Some(rest) = line.strip_prefix(RELAY_PREFIX) {
        LineClass::Relay(rest)
    } else {
        LineClass::Unknown
    }
}

/// Collects inbound bytes into terminator-delimited lines.
#[derive(Debug, Default)]
pub struct LineAssembler {
    buffer: heapless::Vec<u8, MAX_LINE_SIZE>,
    overflows: u32,
    rejected: u32,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one byte; returns a line when `byte` completes one.
    ///
    /// A line that outgrows the buffer is discarded whole and assembly
    /// restarts with the next byte. Lines of two bytes or fewer carry no
    /// payload after the prefix and are ignored.
    pub fn push(&mut self, byte: u8) -> Option<InboundLine> {
        if byte != LINE_TERMINATOR {
            // Leave room for the terminator, as the receive buffer always has.
            if self.buffer.len() < MAX_LINE_SIZE - 1 {
                let _ = self.buffer.push(byte);
            } else {
                self.overflows = self.overflows.wrapping_add(1);
                warn!("inbound line overflowed {} bytes, discarded", MAX_LINE_SIZE - 1);
                self.buffer.clear();
            }
            return None;
        }

        let mut bytes: &[u8] = &self.buffer;
        if let [head @ .., b'\r'] = bytes {
            bytes = head;
        }
        let line = if bytes.len() > 2 {
            match core::str::from_utf8(bytes) {
                Ok(text) => InboundLine::from(text).ok(),
                Err(_) => {
                    debug!("dropping non-UTF-8 inbound line");
                    self.rejected = self.rejected.wrapping_add(1);
                    None
                }
            }
        } else {
            None
        };
        self.buffer.clear();
        line
    }

    pub fn partial_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn overflows(&self) -> u32 {
        self.overflows
    }

    /// Complete lines thrown away because they were not valid UTF-8.
    pub fn rejected(&self) -> u32 {
        self.rejected
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTiming {
    /// Longest wait for an outbound packet per iteration.
    pub poll: Duration,
    /// Sleep when an iteration found nothing to do.
    pub idle: Duration,
    /// Longest wait for room in the command or relay queue.
    pub forward: Duration,
}

impl Default for LinkTiming {
    fn default() -> Self {
        Self {
            poll: Duration::from_millis(10),
            idle: Duration::from_millis(10),
            forward: Duration::from_millis(50),
        }
    }
}

impl LinkTiming {
    pub fn from_settings(settings: &PayloadSettings) -> Self {
        Self {
            poll: ms(settings.link_poll_ms),
            idle: ms(settings.link_idle_ms),
            forward: ms(settings.inbound_forward_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LinkStats {
    pub packets_sent: u32,
    pub bytes_sent: u64,
    pub write_errors: u32,
    pub lines_received: u32,
    pub commands_forwarded: u32,
    pub relays_forwarded: u32,
    pub relays_suppressed: u32,
    pub lines_dropped: u32,
}

pub struct LinkMultiplexer {
    transport: Box<dyn Transport>,
    tx_queue: TxQueue,
    state: StateStore,
    commands: mpsc::Sender<InboundLine>,
    relay: mpsc::Sender<InboundLine>,
    assembler: LineAssembler,
    timing: LinkTiming,
    stats: LinkStats,
}

impl LinkMultiplexer {
    pub fn new(
        transport: Box<dyn Transport>,
        tx_queue: TxQueue,
        state: StateStore,
        commands: mpsc::Sender<InboundLine>,
        relay: mpsc::Sender<InboundLine>,
        timing: LinkTiming,
    ) -> Self {
        Self {
            transport,
            tx_queue,
            state,
            commands,
            relay,
            assembler: LineAssembler::new(),
            timing,
            stats: LinkStats::default(),
        }
    }

    pub fn stats(&self) -> LinkStats {
        self.stats
    }

    pub async fn run(mut self, watchdog: WatchdogHandle) {
        loop {
            watchdog.feed();
            self.run_once().await;
        }
    }

    /// One multiplexer iteration. Returns whether any work was done.
    pub async fn run_once(&mut self) -> bool {
        let mut did_work = self.transmit_one().await;

        if self.transport.bytes_available() > 0 {
            did_work = true;
            self.drain_inbound().await;
        }

        if !did_work {
            sleep(self.timing.idle).await;
        }
        did_work
    }

    async fn transmit_one(&mut self) -> bool {
        let Some(packet) = self.tx_queue.dequeue(self.timing.poll).await else {
            return false;
        };

        match self.transport.write(packet.as_bytes()) {
            Ok(()) => {
                self.stats.packets_sent = self.stats.packets_sent.wrapping_add(1);
                self.stats.bytes_sent = self.stats.bytes_sent.wrapping_add(packet.len() as u64);
                trace!(len = packet.len(), kind = ?packet.kind(), "packet transmitted");
            }
            Err(e) => {
                self.stats.write_errors = self.stats.write_errors.wrapping_add(1);
                error!("transport write failed, packet lost: {}", e);
            }
        }
        true
    }

    async fn drain_inbound(&mut self) {
        loop {
            let byte = match self.transport.read() {
                Ok(byte) => byte,
                Err(nb::Error::WouldBlock) => break,
                Err(nb::Error::Other(e)) => {
                    self.report_read_error(&e);
                    break;
                }
            };

            let rejected = self.assembler.rejected();
            if let Some(line) = self.assembler.push(byte) {
                self.stats.lines_received = self.stats.lines_received.wrapping_add(1);
                self.dispatch(&line).await;
                // Let the interpreter see the line before more bytes arrive.
                yield_now().await;
            } else if self.assembler.rejected() != rejected {
                self.stats.lines_received = self.stats.lines_received.wrapping_add(1);
                self.stats.lines_dropped = self.stats.lines_dropped.wrapping_add(1);
            }
        }
    }

    fn report_read_error(&self, e: &TransportError) {
        error!("transport read failed: {}", e);
    }

    async fn dispatch(&mut self, line: &str) {
        match classify(line) {
            LineClass::Command(body) => {
                if self.forward(Route::Command, body).await {
                    self.stats.commands_forwarded = self.stats.commands_forwarded.wrapping_add(1);
                }
            }
            LineClass::Relay(body) => {
                let status = self.state.get_status();
                if status.relay_enabled && !status.ssdv_transmitting {
                    if self.forward(Route::Relay, body).await {
                        self.stats.relays_forwarded = self.stats.relays_forwarded.wrapping_add(1);
                    }
                } else {
                    debug!(
                        relay_enabled = status.relay_enabled,
                        transmitting = status.ssdv_transmitting,
                        "relay line withheld"
                    );
                    self.stats.relays_suppressed = self.stats.relays_suppressed.wrapping_add(1);
                }
            }
            LineClass::Unknown => {
                debug!("dropping unprefixed inbound line");
                self.stats.lines_dropped = self.stats.lines_dropped.wrapping_add(1);
            }
        }
    }

    async fn forward(&mut self, route: Route, body: &str) -> bool {
        let Ok(line) = InboundLine::from(body) else {
            return false;
        };
        let queue = match route {
            Route::Command => &self.commands,
            Route::Relay => &self.relay,
        };
        match queue.send_timeout(line, self.timing.forward).await {
            Ok(()) => true,
            Err(e) => {
                warn!(?route, "inbound queue unavailable, line dropped: {}", e);
                self.stats.lines_dropped = self.stats.lines_dropped.wrapping_add(1);
                false
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Route {
    Command,
    Relay,
}
