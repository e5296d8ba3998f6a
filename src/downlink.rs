//! Transmit arbitration queue.
//!
//! Every producer hands its outbound traffic to one bounded queue; the link
//! multiplexer is the only consumer. Priority traffic (text frames) always
//! leaves before normal traffic (image packets) that is still waiting, and
//! each class keeps its own insertion order.

use crate::settings::{ms, PayloadSettings};
use crate::status::{StatusCode, StatusPayload, StatusReport};
use arrayvec::ArrayString;
use core::fmt::Write;
use core::ops::Deref;
use heapless::{Deque, Vec};
use static_assertions::const_assert;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

pub const MAX_PACKET_SIZE: usize = 512;
pub const TX_QUEUE_CAPACITY: usize = 120;

const TEXT_FRAME_HEAD: &str = "** ";
const TEXT_FRAME_TAIL: &str = " **";

const_assert!(TX_QUEUE_CAPACITY > 0);
const_assert!(MAX_PACKET_SIZE > TEXT_FRAME_HEAD.len() + TEXT_FRAME_TAIL.len());

pub type PacketBuffer = Vec<u8, MAX_PACKET_SIZE>;
pub type TextFrame = ArrayString<MAX_PACKET_SIZE>;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("payload of {len} bytes exceeds the {max} byte packet limit")]
    Oversize { len: usize, max: usize },
    #[error("transmit queue full after {attempts} attempts")]
    Full { attempts: u8 },
    #[error("transmit queue closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Text,
    Binary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Normal,
    High,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundPacket {
    data: PacketBuffer,
    kind: PacketKind,
}

impl OutboundPacket {
    pub fn new(bytes: &[u8], kind: PacketKind) -> Result<Self, QueueError> {
        let data = Vec::from_slice(bytes).map_err(|()| QueueError::Oversize {
            len: bytes.len(),
            max: MAX_PACKET_SIZE,
        })?;
        Ok(Self { data, kind })
    }

    pub fn binary(bytes: &[u8]) -> Result<Self, QueueError> {
        Self::new(bytes, PacketKind::Binary)
    }

    /// Wrap `content` as `** <content> **`, cutting the content short if
    /// the frame would not fit in one packet.
    pub fn text(content: &str) -> Self {
        let frame = frame_text(content);
        Self {
            // frame_text never produces more than MAX_PACKET_SIZE bytes
            data: Vec::from_slice(frame.as_bytes()).unwrap_or_default(),
            kind: PacketKind::Text,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn kind(&self) -> PacketKind {
        self.kind
    }
}

pub fn frame_text(content: &str) -> TextFrame {
    let room = MAX_PACKET_SIZE - TEXT_FRAME_HEAD.len() - TEXT_FRAME_TAIL.len();
    let mut end = content.len().min(room);
    while !content.is_char_boundary(end) {
        end -= 1;
    }

    let mut frame = TextFrame::new();
    let _ = write!(frame, "{}{}{}", TEXT_FRAME_HEAD, &content[..end], TEXT_FRAME_TAIL);
    frame
}

/// How long a producer may wait for room, and how often it tries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueuePolicy {
    pub wait: Duration,
    pub attempts: u8,
    pub pause: Duration,
}

impl Default for EnqueuePolicy {
    fn default() -> Self {
        Self {
            wait: Duration::from_millis(500),
            attempts: 3,
            pause: Duration::from_millis(50),
        }
    }
}

impl EnqueuePolicy {
    pub fn from_settings(settings: &PayloadSettings) -> Self {
        Self {
            wait: ms(settings.tx_enqueue_timeout_ms),
            attempts: settings.tx_enqueue_attempts,
            pause: ms(settings.tx_retry_pause_ms),
        }
    }
}

#[derive(Debug, Default)]
struct Lanes {
    priority: Deque<OutboundPacket, TX_QUEUE_CAPACITY>,
    normal: Deque<OutboundPacket, TX_QUEUE_CAPACITY>,
}

impl Lanes {
    fn len(&self) -> usize {
        self.priority.len() + self.normal.len()
    }
}

#[derive(Debug)]
struct QueueInner {
    lanes: Mutex<Lanes>,
    // Free slots; bounds the two lanes together.
    slots: Semaphore,
    // Packets waiting for the consumer.
    ready: Semaphore,
    // Packets queued or still being written by the consumer.
    pending: watch::Sender<usize>,
}

/// Cloneable producer/consumer handle to the transmit queue.
#[derive(Debug, Clone)]
pub struct TxQueue {
    inner: Arc<QueueInner>,
    policy: EnqueuePolicy,
}

impl TxQueue {
    pub fn new(policy: EnqueuePolicy) -> Self {
        let (pending, _) = watch::channel(0);
        Self {
            inner: Arc::new(QueueInner {
                lanes: Mutex::new(Lanes::default()),
                slots: Semaphore::new(TX_QUEUE_CAPACITY),
                ready: Semaphore::new(0),
                pending,
            }),
            policy,
        }
    }

    pub fn capacity(&self) -> usize {
        TX_QUEUE_CAPACITY
    }

    /// Packets waiting in the queue.
    pub fn len(&self) -> usize {
        self.lanes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Packets not yet handed to the transport, including one being written.
    pub fn pending(&self) -> usize {
        *self.inner.pending.borrow()
    }

    pub fn policy(&self) -> EnqueuePolicy {
        self.policy
    }

    fn lanes(&self) -> MutexGuard<'_, Lanes> {
        self.inner.lanes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `packet`, waiting a bounded time for room.
    ///
    /// Each attempt waits up to the policy's wait; after the last failed
    /// attempt the packet is handed back to the caller as an error. Never
    /// blocks indefinitely.
    pub async fn enqueue(&self, packet: OutboundPacket, priority: Priority) -> Result<(), QueueError> {
        let attempts = self.policy.attempts;
        for attempt in 1..=attempts {
            match timeout(self.policy.wait, self.inner.slots.acquire()).await {
                Ok(Ok(permit)) => {
                    permit.forget();
                    self.push(packet, priority);
                    return Ok(());
                }
                Ok(Err(_)) => return Err(QueueError::Closed),
                Err(_) => {
                    debug!(attempt, attempts, "transmit queue full");
                    if attempt < attempts {
                        sleep(self.policy.pause).await;
                    }
                }
            }
        }
        Err(QueueError::Full { attempts })
    }

    fn push(&self, packet: OutboundPacket, priority: Priority) {
        {
            let mut lanes = self.lanes();
            let lane = match priority {
                Priority::High => &mut lanes.priority,
                Priority::Normal => &mut lanes.normal,
            };
            // A slot permit was taken, so the lane has room.
            if lane.push_back(packet).is_err() {
                warn!("transmit lane rejected a packet despite a free slot");
                self.inner.slots.add_permits(1);
                return;
            }
            self.inner.pending.send_modify(|pending| *pending += 1);
        }
        self.inner.ready.add_permits(1);
    }

    /// Take the next packet, waiting at most `wait`.
    ///
    /// The returned guard counts as pending until it is dropped, so drop it
    /// only once the bytes have been written to the transport.
    pub async fn dequeue(&self, wait: Duration) -> Option<InFlight> {
        let permit = timeout(wait, self.inner.ready.acquire()).await.ok()?.ok()?;
        permit.forget();

        let packet = {
            let mut lanes = self.lanes();
            lanes.priority.pop_front().or_else(|| lanes.normal.pop_front())
        };
        match packet {
            Some(packet) => {
                self.inner.slots.add_permits(1);
                Some(InFlight {
                    packet,
                    queue: Arc::clone(&self.inner),
                })
            }
            None => None,
        }
    }

    /// Resolve once every queued packet has been dequeued and written.
    pub async fn wait_drained(&self) {
        let mut pending = self.inner.pending.subscribe();
        let _ = pending.wait_for(|count| *count == 0).await;
    }

    pub fn close(&self) {
        self.inner.slots.close();
        self.inner.ready.close();
    }
}

/// A dequeued packet on its way to the transport.
#[derive(Debug)]
pub struct InFlight {
    packet: OutboundPacket,
    queue: Arc<QueueInner>,
}

impl Deref for InFlight {
    type Target = OutboundPacket;

    fn deref(&self) -> &OutboundPacket {
        &self.packet
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.queue
            .pending
            .send_modify(|pending| *pending = pending.saturating_sub(1));
    }
}

/// Producer-side helper: text framing and status reports.
#[derive(Debug, Clone)]
pub struct Downlink {
    queue: TxQueue,
}

impl Downlink {
    pub fn new(queue: TxQueue) -> Self {
        Self { queue }
    }

    pub fn queue(&self) -> &TxQueue {
        &self.queue
    }

    /// Queue a text frame ahead of any waiting binary traffic.
    pub async fn send_text(&self, content: &str) -> Result<(), QueueError> {
        self.queue.enqueue(OutboundPacket::text(content), Priority::High).await
    }

    pub async fn send_binary(&self, bytes: &[u8]) -> Result<(), QueueError> {
        let packet = OutboundPacket::binary(bytes)?;
        self.queue.enqueue(packet, Priority::Normal).await
    }

    /// Report a status code. Reports are best effort: a full queue is
    /// logged and otherwise ignored.
    pub async fn report(&self, code: StatusCode, payload: StatusPayload<'_>) {
        let report = StatusReport::new(code, payload);
        info!("status {}", report);
        let mut line = ArrayString::<96>::new();
        let _ = write!(line, "{}", report);
        if let Err(e) = self.send_text(&line).await {
            warn!("status 0x{:04X} not queued: {}", code.value(), e);
        }
    }

    pub async fn report_bare(&self, code: StatusCode) {
        self.report(code, StatusPayload::None).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_framing() {
        let packet = OutboundPacket::text("Code: 0x1000");
        assert_eq!(packet.as_bytes(), b"** Code: 0x1000 **");
        assert_eq!(packet.kind(), PacketKind::Text);
    }

    #[test]
    fn test_text_framing_truncates_long_content() {
        let content = "x".repeat(MAX_PACKET_SIZE * 2);
        let frame = frame_text(&content);
        assert_eq!(frame.len(), MAX_PACKET_SIZE);
        assert!(frame.starts_with("** "));
        assert!(frame.ends_with(" **"));
    }

    #[test]
    fn test_oversize_binary_rejected() {
        let bytes = [0u8; MAX_PACKET_SIZE + 1];
        assert_eq!(
            OutboundPacket::binary(&bytes),
            Err(QueueError::Oversize { len: MAX_PACKET_SIZE + 1, max: MAX_PACKET_SIZE })
        );
    }

    #[tokio::test]
    async fn test_priority_lane_leaves_first() {
        let queue = TxQueue::new(EnqueuePolicy::default());
        queue.enqueue(OutboundPacket::binary(b"n1").unwrap(), Priority::Normal).await.unwrap();
        queue.enqueue(OutboundPacket::binary(b"n2").unwrap(), Priority::Normal).await.unwrap();
        queue.enqueue(OutboundPacket::text("p1"), Priority::High).await.unwrap();

        let wait = Duration::from_millis(10);
        assert_eq!(queue.dequeue(wait).await.unwrap().as_bytes(), b"** p1 **");
        assert_eq!(queue.dequeue(wait).await.unwrap().as_bytes(), b"n1");
        assert_eq!(queue.dequeue(wait).await.unwrap().as_bytes(), b"n2");
        assert!(queue.dequeue(wait).await.is_none());
    }

    #[tokio::test]
    async fn test_pending_counts_in_flight_packet() {
        let queue = TxQueue::new(EnqueuePolicy::default());
        queue.enqueue(OutboundPacket::binary(b"a").unwrap(), Priority::Normal).await.unwrap();
        assert_eq!(queue.pending(), 1);

        let in_flight = queue.dequeue(Duration::from_millis(10)).await.unwrap();
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.pending(), 1);
        drop(in_flight);
        assert_eq!(queue.pending(), 0);
    }
}
