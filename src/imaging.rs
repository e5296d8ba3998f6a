//! Image capture and packetised transmission.
//!
//! The codec is pull based: it asks for input, hands back one fixed-size
//! packet at a time, and finally reports completion. [`PacketStream`]
//! turns that protocol into an iterator over packets. Constructing a new
//! stream re-initialises the codec, so a stream can always be restarted
//! from the first packet.
//!
//! [`ImageProducer`] runs one capture-encode-transmit cycle per period.
//! For the length of a cycle it holds the transmission permit, which other
//! tasks read as "image transmission in progress". The camera lock is held
//! from capture until the frame is released; the permit is held until the
//! transmit queue has drained.

use crate::alert::Annunciator;
use crate::camera::{CameraResource, Frame};
use crate::downlink::{Downlink, QueueError, MAX_PACKET_SIZE};
use crate::settings::{ms, PayloadSettings};
use crate::state::{PacketType, StateStore};
use crate::status::{StatusCode, StatusPayload};
use crate::supervisor::WatchdogHandle;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

pub const CODEC_PACKET_SIZE: usize = 256;
pub const FEED_CHUNK_SIZE: usize = 128;

const_assert!(CODEC_PACKET_SIZE <= MAX_PACKET_SIZE);
const_assert!(FEED_CHUNK_SIZE > 0);

// Longest single sleep between watchdog feeds while idling.
const IDLE_SLICE: Duration = Duration::from_secs(1);

pub type CodecErrorCode = i32;
pub type CodecPacket = heapless::Vec<u8, CODEC_PACKET_SIZE>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecParams {
    pub callsign: String,
    pub packet_type: PacketType,
    pub image_id: u8,
    pub quality: u8,
    pub packet_size: usize,
}

/// Result of one pull on the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecStep {
    NeedMoreInput,
    /// `out` now holds one complete packet.
    PacketReady,
    Done,
    Error(CodecErrorCode),
}

pub trait ImageCodec: Send {
    fn init(&mut self, params: &CodecParams);

    fn feed(&mut self, bytes: &[u8]);

    /// Pull the next packet into `out`, which is exactly one packet long.
    fn next(&mut self, out: &mut [u8]) -> CodecStep;
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum EncodeError {
    #[error("codec error {0}")]
    Codec(CodecErrorCode),
    #[error("codec wanted more input after the whole frame was fed")]
    InputExhausted,
}

/// Lazily encoded packets of one frame.
pub struct PacketStream<'a> {
    codec: &'a mut dyn ImageCodec,
    input: &'a [u8],
    offset: usize,
    out: [u8; CODEC_PACKET_SIZE],
    finished: bool,
}

impl<'a> PacketStream<'a> {
    pub fn new(codec: &'a mut dyn ImageCodec, params: &CodecParams, input: &'a [u8]) -> Self {
        debug_assert_eq!(params.packet_size, CODEC_PACKET_SIZE);
        codec.init(params);
        Self {
            codec,
            input,
            offset: 0,
            out: [0; CODEC_PACKET_SIZE],
            finished: false,
        }
    }

    /// Bytes of the frame handed to the codec so far.
    pub fn consumed(&self) -> usize {
        self.offset
    }

    fn feed_chunk(&mut self) -> bool {
        if self.offset >= self.input.len() {
            return false;
        }
        let end = (self.offset + FEED_CHUNK_SIZE).min(self.input.len());
        self.codec.feed(&self.input[self.offset..end]);
        self.offset = end;
        true
    }
}

impl Iterator for PacketStream<'_> {
    type Item = Result<CodecPacket, EncodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        loop {
            match self.codec.next(&mut self.out) {
                CodecStep::NeedMoreInput => {
                    if !self.feed_chunk() {
                        self.finished = true;
                        return Some(Err(EncodeError::InputExhausted));
                    }
                }
                CodecStep::PacketReady => {
                    // out is exactly CODEC_PACKET_SIZE bytes
                    return Some(Ok(CodecPacket::from_slice(&self.out).unwrap_or_default()));
                }
                CodecStep::Done => {
                    self.finished = true;
                    return None;
                }
                CodecStep::Error(code) => {
                    self.finished = true;
                    return Some(Err(EncodeError::Codec(code)));
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageTiming {
    /// Recheck interval while image transmission is disabled.
    pub idle_recheck: Duration,
    pub packet_attempts: u8,
    pub packet_retry: Duration,
    /// Pause after each packet so lower-priority work gets the CPU.
    pub packet_yield: Duration,
    pub drain_poll: Duration,
    /// Extra wait after the queue drains for the UART to finish sending.
    pub link_flush: Duration,
}

impl Default for ImageTiming {
    fn default() -> Self {
        Self {
            idle_recheck: Duration::from_secs(5),
            packet_attempts: 3,
            packet_retry: Duration::from_millis(100),
            packet_yield: Duration::from_millis(20),
            drain_poll: Duration::from_millis(200),
            link_flush: Duration::from_millis(500),
        }
    }
}

impl ImageTiming {
    pub fn from_settings(settings: &PayloadSettings) -> Self {
        Self {
            idle_recheck: ms(settings.image_idle_recheck_ms),
            packet_attempts: settings.image_packet_attempts,
            packet_retry: ms(settings.image_packet_retry_ms),
            packet_yield: ms(settings.image_packet_yield_ms),
            drain_poll: ms(settings.drain_poll_ms),
            link_flush: ms(settings.link_flush_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Disabled,
    CaptureFailed { image_id: u8 },
    Transmitted { image_id: u8, packets: u32, dropped: u32, error: Option<EncodeError> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ImageStats {
    pub cycles: u32,
    pub capture_failures: u32,
    pub packets_sent: u32,
    pub packets_dropped: u32,
    pub encode_errors: u32,
}

pub struct ImageProducer {
    state: StateStore,
    camera: CameraResource,
    codec: Box<dyn ImageCodec>,
    downlink: Downlink,
    annunciator: Annunciator,
    callsign: String,
    timing: ImageTiming,
    next_image_id: u8,
    stats: ImageStats,
}

impl ImageProducer {
    pub fn new(
        state: StateStore,
        camera: CameraResource,
        codec: Box<dyn ImageCodec>,
        downlink: Downlink,
        annunciator: Annunciator,
        callsign: &str,
        timing: ImageTiming,
    ) -> Self {
        Self {
            state,
            camera,
            codec,
            downlink,
            annunciator,
            callsign: callsign.to_string(),
            timing,
            next_image_id: 0,
            stats: ImageStats::default(),
        }
    }

    pub fn next_image_id(&self) -> u8 {
        self.next_image_id
    }

    pub fn stats(&self) -> ImageStats {
        self.stats
    }

    pub async fn run(mut self, watchdog: WatchdogHandle) {
        loop {
            watchdog.feed();
            match self.cycle(&watchdog).await {
                CycleOutcome::Disabled | CycleOutcome::CaptureFailed { .. } => {
                    sleep_fed(self.timing.idle_recheck, &watchdog).await;
                }
                CycleOutcome::Transmitted { .. } => {
                    let cycle = Duration::from_secs(u64::from(self.state.get_config().ssdv_cycle_secs));
                    sleep_fed(cycle, &watchdog).await;
                }
            }
        }
    }

    /// One capture-encode-transmit pass. Returns once the transmit queue
    /// has drained and the transmission permit is released.
    pub async fn cycle(&mut self, watchdog: &WatchdogHandle) -> CycleOutcome {
        if !self.state.get_status().ssdv_enabled {
            return CycleOutcome::Disabled;
        }

        let image_id = self.next_image_id;
        self.next_image_id = self.next_image_id.wrapping_add(1);
        self.stats.cycles = self.stats.cycles.wrapping_add(1);

        let permit = self.state.begin_transmission();
        self.downlink
            .report(StatusCode::SsdvEncodeStart, image_id.into())
            .await;

        let resource = self.camera.clone();
        let mut camera = resource.lock().await;
        for _ in 1..camera.buffered_frames() {
            if let Some(stale) = camera.capture() {
                camera.release(stale);
            }
        }
        let Some(frame) = camera.capture().filter(|frame| !frame.is_empty()) else {
            drop(camera);
            warn!(image_id, "capture failed");
            self.stats.capture_failures = self.stats.capture_failures.wrapping_add(1);
            self.downlink.report_bare(StatusCode::CamCaptureFail).await;
            permit.release();
            self.annunciator.signal_error().await;
            return CycleOutcome::CaptureFailed { image_id };
        };

        info!(image_id, bytes = frame.len(), "frame captured, encoding");
        let (packets, dropped, error) = self.encode_frame(&frame, image_id, watchdog).await;
        camera.release(frame);
        drop(camera);

        self.await_drained(watchdog).await;
        sleep(self.timing.link_flush).await;

        self.downlink
            .report(StatusCode::SsdvEncodeEnd, image_id.into())
            .await;
        permit.release();
        info!(image_id, packets, dropped, "image transmitted");

        CycleOutcome::Transmitted {
            image_id,
            packets,
            dropped,
            error,
        }
    }

    async fn encode_frame(
        &mut self,
        frame: &Frame,
        image_id: u8,
        watchdog: &WatchdogHandle,
    ) -> (u32, u32, Option<EncodeError>) {
        let config = self.state.get_config();
        let params = CodecParams {
            callsign: self.callsign.clone(),
            packet_type: config.ssdv_type,
            image_id,
            quality: config.ssdv_quality,
            packet_size: CODEC_PACKET_SIZE,
        };

        let mut packets = 0u32;
        let mut dropped = 0u32;
        let mut error = None;
        let downlink = &self.downlink;
        let timing = self.timing;

        let stream = PacketStream::new(self.codec.as_mut(), &params, frame.bytes());
        for item in stream {
            watchdog.feed();
            let packet = match item {
                Ok(packet) => packet,
                Err(e) => {
                    warn!(image_id, "encoding stopped: {}", e);
                    let payload = match e {
                        EncodeError::Codec(code) => StatusPayload::from(code),
                        EncodeError::InputExhausted => StatusPayload::from("input exhausted"),
                    };
                    downlink.report(StatusCode::SsdvEncodeError, payload).await;
                    error = Some(e);
                    break;
                }
            };

            if let Err(e) = send_packet(downlink, &timing, &packet).await {
                debug!(image_id, packet = packets, "packet dropped: {}", e);
                downlink.report_bare(StatusCode::SsdvTxBufferFull).await;
                dropped += 1;
            }
            packets += 1;
            sleep(timing.packet_yield).await;
        }

        self.stats.packets_sent = self.stats.packets_sent.wrapping_add(packets - dropped);
        self.stats.packets_dropped = self.stats.packets_dropped.wrapping_add(dropped);
        if error.is_some() {
            self.stats.encode_errors = self.stats.encode_errors.wrapping_add(1);
        }
        (packets, dropped, error)
    }

    /// Wait for the multiplexer to write every queued packet, feeding the
    /// watchdog while the link is busy.
    async fn await_drained(&mut self, watchdog: &WatchdogHandle) {
        let queue = self.downlink.queue();
        while timeout(self.timing.drain_poll, queue.wait_drained()).await.is_err() {
            watchdog.feed();
        }
    }
}

async fn send_packet(downlink: &Downlink, timing: &ImageTiming, packet: &[u8]) -> Result<(), QueueError> {
    let mut attempt = 1;
    loop {
        match downlink.send_binary(packet).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt >= timing.packet_attempts => return Err(e),
            Err(_) => {
                attempt += 1;
                sleep(timing.packet_retry).await;
            }
        }
    }
}

async fn sleep_fed(duration: Duration, watchdog: &WatchdogHandle) {
    let mut remaining = duration;
    while !remaining.is_zero() {
        let slice = remaining.min(IDLE_SLICE);
        sleep(slice).await;
        remaining -= slice;
        watchdog.feed();
    }
}
