//! Simulated radio serial link

use super::lock;
use crate::hal::{Transport, TransportError};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct Airwaves {
    inbound: VecDeque<u8>,
    written: Vec<Vec<u8>>,
    fail_writes: bool,
}

/// Radio end of the link, owned by the link multiplexer.
///
/// # Example
///
/// ```
/// use habtracker::hal::Transport;
/// use habtracker::sim::SimRadio;
///
/// let (mut radio, control) = SimRadio::new();
/// control.inject_line("@@GET,RELAY");
/// assert_eq!(radio.bytes_available(), 12);
///
/// radio.write(b"** Code: 0x1000 **").unwrap();
/// assert_eq!(control.take_text(), vec!["** Code: 0x1000 **".to_string()]);
/// ```
#[derive(Debug)]
pub struct SimRadio {
    air: Arc<Mutex<Airwaves>>,
}

/// Ground end of the link.
#[derive(Debug, Clone)]
pub struct RadioControl {
    air: Arc<Mutex<Airwaves>>,
}

impl SimRadio {
    pub fn new() -> (Self, RadioControl) {
        let air = Arc::new(Mutex::new(Airwaves::default()));
        (Self { air: Arc::clone(&air) }, RadioControl { air })
    }
}

impl Transport for SimRadio {
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut air = lock(&self.air);
        if air.fail_writes {
            return Err(TransportError::Write("simulated write failure".into()));
        }
        air.written.push(bytes.to_vec());
        Ok(())
    }

    fn bytes_available(&self) -> usize {
        lock(&self.air).inbound.len()
    }

    fn read(&mut self) -> nb::Result<u8, TransportError> {
        lock(&self.air).inbound.pop_front().ok_or(nb::Error::WouldBlock)
    }
}

impl RadioControl {
    /// Another radio end on the same link, for the next boot.
    pub fn attach(&self) -> SimRadio {
        SimRadio {
            air: Arc::clone(&self.air),
        }
    }

    /// Queue raw bytes as if received over the air.
    pub fn inject(&self, bytes: &[u8]) {
        lock(&self.air).inbound.extend(bytes.iter().copied());
    }

    /// Queue `line` plus the line terminator.
    pub fn inject_line(&self, line: &str) {
        let mut air = lock(&self.air);
        air.inbound.extend(line.bytes());
        air.inbound.push_back(b'\n');
    }

    /// Everything written since the last take, one entry per write.
    pub fn take_written(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut lock(&self.air).written)
    }

    /// Like [`take_written`](Self::take_written), decoded lossily as text.
    pub fn take_text(&self) -> Vec<String> {
        self.take_written()
            .iter()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            .collect()
    }

    pub fn pending_inbound(&self) -> usize {
        lock(&self.air).inbound.len()
    }

    pub fn fail_writes(&self, fail: bool) {
        lock(&self.air).fail_writes = fail;
    }
}
