//! In-memory hardware for the hosted binary and the test suites.
//!
//! Each simulated device comes with a cloneable control handle so a test
//! (or the TCP bridge) can script its behaviour and observe what the
//! payload did with it after the device itself has been moved into a task.

mod camera;
mod codec;
mod radio;
mod sensors;

pub use camera::{CameraControl, CameraCounters, SimCamera, SIM_INIT_ERROR};
pub use codec::{ChunkCodec, CHUNK_HEADER_SIZE, CHUNK_SYNC};
pub use radio::{RadioControl, SimRadio};
pub use sensors::{AlertLog, GpsControl, SimAlert, SimGps, SimTemperature, SimVoltage};

use std::sync::{Mutex, MutexGuard, PoisonError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
