//! Simulated positioning receiver, ADC, temperature sensor and buzzer

use super::lock;
use crate::hal::{AdcErrorCode, Alert, Fix, GpsReceiver, TemperatureSensor, VoltageSampler};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct GpsState {
    raw: VecDeque<u8>,
    bytes_fed: usize,
    fix: Fix,
    updated: bool,
}

/// Positioning receiver whose fixes are published by a [`GpsControl`].
#[derive(Debug)]
pub struct SimGps {
    state: Arc<Mutex<GpsState>>,
}

#[derive(Debug, Clone)]
pub struct GpsControl {
    state: Arc<Mutex<GpsState>>,
}

impl SimGps {
    pub fn new() -> (Self, GpsControl) {
        let state = Arc::new(Mutex::new(GpsState::default()));
        (
            Self {
                state: Arc::clone(&state),
            },
            GpsControl { state },
        )
    }
}

impl GpsReceiver for SimGps {
    fn next_byte(&mut self) -> Option<u8> {
        lock(&self.state).raw.pop_front()
    }

    fn feed(&mut self, _byte: u8) {
        lock(&self.state).bytes_fed += 1;
    }

    fn take_location_update(&mut self) -> bool {
        std::mem::take(&mut lock(&self.state).updated)
    }

    fn fix(&self) -> Fix {
        lock(&self.state).fix
    }
}

impl GpsControl {
    /// Another receiver sharing this control, for the next boot.
    pub fn attach(&self) -> SimGps {
        SimGps {
            state: Arc::clone(&self.state),
        }
    }

    /// Make `fix` current and flag a location update.
    pub fn publish(&self, fix: Fix) {
        let mut state = lock(&self.state);
        state.fix = fix;
        state.updated = true;
    }

    /// Queue raw sentence bytes for the parser.
    pub fn inject_raw(&self, bytes: &[u8]) {
        lock(&self.state).raw.extend(bytes.iter().copied());
    }

    pub fn bytes_fed(&self) -> usize {
        lock(&self.state).bytes_fed
    }
}

/// 12-bit ADC with a 3.3 V reference.
#[derive(Debug, Clone)]
pub struct SimVoltage {
    raw: u32,
    failure: Option<AdcErrorCode>,
}

impl SimVoltage {
    pub const FULL_SCALE: u32 = 4095;
    pub const REFERENCE_MV: u32 = 3300;

    pub fn new(raw: u32) -> Self {
        Self { raw, failure: None }
    }

    /// Every sample fails with `code`.
    pub fn failing(code: AdcErrorCode) -> Self {
        Self {
            raw: 0,
            failure: Some(code),
        }
    }
}

impl VoltageSampler for SimVoltage {
    fn sample(&mut self) -> Result<u32, AdcErrorCode> {
        match self.failure {
            Some(code) => Err(code),
            None => Ok(self.raw),
        }
    }

    fn raw_to_millivolts(&self, raw: u32) -> u32 {
        raw * Self::REFERENCE_MV / Self::FULL_SCALE
    }
}

#[derive(Debug, Clone)]
pub struct SimTemperature {
    celsius: f32,
}

impl SimTemperature {
    pub fn new(celsius: f32) -> Self {
        Self { celsius }
    }
}

impl TemperatureSensor for SimTemperature {
    fn read_celsius(&mut self) -> f32 {
        self.celsius
    }
}

/// Buzzer that records every level change.
#[derive(Debug)]
pub struct SimAlert {
    log: Arc<Mutex<Vec<bool>>>,
}

#[derive(Debug, Clone)]
pub struct AlertLog {
    log: Arc<Mutex<Vec<bool>>>,
}

impl SimAlert {
    pub fn new() -> (Self, AlertLog) {
        let log = Arc::new(Mutex::new(Vec::new()));
        (Self { log: Arc::clone(&log) }, AlertLog { log })
    }
}

impl Alert for SimAlert {
    fn set(&mut self, on: bool) {
        lock(&self.log).push(on);
    }
}

impl AlertLog {
    /// Number of times the buzzer was switched on.
    pub fn activations(&self) -> usize {
        lock(&self.log).iter().filter(|&&on| on).count()
    }

    pub fn is_on(&self) -> bool {
        lock(&self.log).last().copied().unwrap_or(false)
    }
}
