//! Contracts for the hardware collaborators the payload drives.
//!
//! Drivers, the positioning-sentence parser and ADC calibration live
//! outside this crate. The task code only sees these traits; `crate::sim`
//! provides in-memory implementations.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport write failed: {0}")]
    Write(String),
    #[error("transport read failed: {0}")]
    Read(String),
    #[error("transport disconnected")]
    Disconnected,
}

/// The half-duplex serial link to the radio. Owned by the link
/// multiplexer alone.
pub trait Transport: Send {
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    fn bytes_available(&self) -> usize;

    /// Next inbound byte, or `WouldBlock` when none is buffered.
    fn read(&mut self) -> nb::Result<u8, TransportError>;
}

/// UTC date and time as reported by the positioning receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GpsTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

/// Latest decoded position, time and velocity. May be stale.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Fix {
    pub time: GpsTime,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude_m: f64,
    pub speed_kmh: f64,
    pub satellites: u32,
    pub heading_deg: f64,
    pub location_valid: bool,
}

/// Positioning-sentence parser fed from its own serial line.
pub trait GpsReceiver: Send {
    /// Move any buffered receiver bytes into the parser.
    fn poll(&mut self) {
        while let Some(byte) = self.next_byte() {
            self.feed(byte);
        }
    }

    fn next_byte(&mut self) -> Option<u8>;

    fn feed(&mut self, byte: u8);

    /// True once per new location; reading it clears it.
    fn take_location_update(&mut self) -> bool;

    fn fix(&self) -> Fix;
}

/// Raw-sample ADC error code as reported by the driver.
pub type AdcErrorCode = i32;

pub trait VoltageSampler: Send {
    fn sample(&mut self) -> Result<u32, AdcErrorCode>;

    /// Calibrated millivolts at the ADC pin for an averaged raw reading.
    fn raw_to_millivolts(&self, raw: u32) -> u32;
}

pub trait TemperatureSensor: Send {
    fn read_celsius(&mut self) -> f32;
}

/// Audible alert (buzzer) output.
pub trait Alert: Send {
    fn set(&mut self, on: bool);
}
