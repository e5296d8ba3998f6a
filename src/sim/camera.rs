//! Simulated image sensor

use super::lock;
use crate::camera::{Camera, DriverErrorCode, Frame};
use crate::state::{Configuration, FrameSize};
use std::sync::{Arc, Mutex};

/// Error code returned by a scripted init failure.
pub const SIM_INIT_ERROR: DriverErrorCode = 0x105;

const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CameraCounters {
    pub inits: u32,
    pub deinits: u32,
    pub captures: u32,
    pub releases: u32,
}

impl CameraCounters {
    /// Frames handed out and not yet returned.
    pub fn outstanding(&self) -> u32 {
        self.captures - self.releases
    }
}

#[derive(Debug)]
struct Script {
    counters: CameraCounters,
    failing_inits: u32,
    failing_captures: u32,
    buffered: usize,
    active: Option<Configuration>,
}

#[derive(Debug)]
pub struct SimCamera {
    script: Arc<Mutex<Script>>,
}

#[derive(Debug, Clone)]
pub struct CameraControl {
    script: Arc<Mutex<Script>>,
}

impl SimCamera {
    pub fn new() -> (Self, CameraControl) {
        let script = Arc::new(Mutex::new(Script {
            counters: CameraCounters::default(),
            failing_inits: 0,
            failing_captures: 0,
            buffered: 1,
            active: None,
        }));
        (
            Self {
                script: Arc::clone(&script),
            },
            CameraControl { script },
        )
    }
}

/// A JPEG-shaped frame whose length scales with the frame size.
fn synth_frame(size: FrameSize, sequence: u32) -> Vec<u8> {
    let (width, height) = size.pixels();
    let body = usize::from(width) * usize::from(height) / 200;
    let mut data = Vec::with_capacity(body + 4);
    data.extend_from_slice(&JPEG_SOI);
    data.extend((0..body).map(|i| {
        // Keep 0xFF out of the body so the only end marker is the real one.
        ((i as u32).wrapping_add(sequence) % 0xFF) as u8
    }));
    data.extend_from_slice(&JPEG_EOI);
    data
}

impl Camera for SimCamera {
    fn init(&mut self, config: &Configuration) -> Result<(), DriverErrorCode> {
        let mut script = lock(&self.script);
        script.counters.inits += 1;
        if script.failing_inits > 0 {
            script.failing_inits -= 1;
            return Err(SIM_INIT_ERROR);
        }
        script.active = Some(*config);
        Ok(())
    }

    fn deinit(&mut self) {
        let mut script = lock(&self.script);
        script.counters.deinits += 1;
        script.active = None;
    }

    fn capture(&mut self) -> Option<Frame> {
        let mut script = lock(&self.script);
        let config = script.active?;
        if script.failing_captures > 0 {
            script.failing_captures -= 1;
            return None;
        }
        script.counters.captures += 1;
        Some(Frame::new(synth_frame(config.camera_size, script.counters.captures)))
    }

    fn release(&mut self, _frame: Frame) {
        lock(&self.script).counters.releases += 1;
    }

    fn buffered_frames(&self) -> usize {
        lock(&self.script).buffered
    }
}

impl CameraControl {
    /// Make the next `count` init calls fail.
    pub fn fail_inits(&self, count: u32) {
        lock(&self.script).failing_inits = count;
    }

    /// Make the next `count` captures return no frame.
    pub fn fail_captures(&self, count: u32) {
        lock(&self.script).failing_captures = count;
    }

    pub fn set_buffered_frames(&self, count: usize) {
        lock(&self.script).buffered = count.max(1);
    }

    pub fn counters(&self) -> CameraCounters {
        lock(&self.script).counters
    }

    /// Configuration of the last successful init, if the driver is up.
    pub fn active_config(&self) -> Option<Configuration> {
        lock(&self.script).active
    }
}
