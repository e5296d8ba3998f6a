//! Camera resource: the driver contract, the exclusive camera lock, and
//! the bring-up sequences (setup, calibration, reconfiguration).

use crate::alert::Annunciator;
use crate::downlink::Downlink;
use crate::settings::{ms, PayloadSettings};
use crate::state::Configuration;
use crate::status::{StatusCode, StatusPayload};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::sleep;
use tracing::{info, warn};

/// Driver error code, as returned by the camera driver.
pub type DriverErrorCode = i32;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CameraError {
    #[error("camera init failed with driver error {0}")]
    Init(DriverErrorCode),
    #[error("camera returned no frame")]
    Capture,
    #[error("camera calibration failed")]
    Calibration,
}

/// One captured frame buffer, on loan from the driver until released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    data: Vec<u8>,
}

impl Frame {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

pub trait Camera: Send {
    fn init(&mut self, config: &Configuration) -> Result<(), DriverErrorCode>;

    fn deinit(&mut self);

    fn capture(&mut self) -> Option<Frame>;

    fn release(&mut self, frame: Frame);

    /// Frames the driver keeps queued; all but the newest are stale when a
    /// capture starts.
    fn buffered_frames(&self) -> usize {
        1
    }
}

/// The camera hardware behind its exclusive lock.
#[derive(Clone)]
pub struct CameraResource {
    camera: Arc<Mutex<Box<dyn Camera>>>,
}

impl core::fmt::Debug for CameraResource {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CameraResource").finish_non_exhaustive()
    }
}

pub type CameraGuard<'a> = MutexGuard<'a, Box<dyn Camera>>;

impl CameraResource {
    pub fn new(camera: Box<dyn Camera>) -> Self {
        Self {
            camera: Arc::new(Mutex::new(camera)),
        }
    }

    /// Acquire exclusive access. The lock is released when the guard drops,
    /// on every exit path.
    pub async fn lock(&self) -> CameraGuard<'_> {
        self.camera.lock().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalibrationPolicy {
    pub shots: u8,
    pub interval: Duration,
}

impl Default for CalibrationPolicy {
    fn default() -> Self {
        Self {
            shots: 5,
            interval: Duration::from_millis(500),
        }
    }
}

impl CalibrationPolicy {
    pub fn from_settings(settings: &PayloadSettings) -> Self {
        Self {
            shots: settings.camera_calibrate_shots,
            interval: ms(settings.camera_calibrate_interval_ms),
        }
    }
}

/// Setup, calibration and reconfiguration, reporting each step on the
/// downlink. Callers hold the camera lock and pass the locked driver in.
#[derive(Debug, Clone)]
pub struct CameraBringup {
    downlink: Downlink,
    annunciator: Annunciator,
    calibration: CalibrationPolicy,
}

impl CameraBringup {
    pub fn new(downlink: Downlink, annunciator: Annunciator, calibration: CalibrationPolicy) -> Self {
        Self {
            downlink,
            annunciator,
            calibration,
        }
    }

    pub async fn setup(&self, camera: &mut dyn Camera, config: &Configuration) -> Result<(), CameraError> {
        self.downlink.report_bare(StatusCode::CamInitStart).await;

        if let Err(code) = camera.init(config) {
            warn!(code, "camera init failed");
            self.downlink.report(StatusCode::CamInitFail, StatusPayload::from(code)).await;
            return Err(CameraError::Init(code));
        }

        info!(size = ?config.camera_size, quality = config.camera_quality, "camera initialised");
        self.downlink.report_bare(StatusCode::CamInitOk).await;
        Ok(())
    }

    /// Capture and discard a few frames so exposure and white balance
    /// settle.
    pub async fn calibrate(&self, camera: &mut dyn Camera) -> Result<(), CameraError> {
        self.downlink.report_bare(StatusCode::CamCalibrateStart).await;

        for _ in 0..self.calibration.shots {
            let Some(frame) = camera.capture() else {
                self.downlink.report_bare(StatusCode::CamCalibrateFail).await;
                self.annunciator.signal_error().await;
                return Err(CameraError::Calibration);
            };
            sleep(self.calibration.interval).await;
            camera.release(frame);
        }

        self.downlink.report_bare(StatusCode::CamCalibrateOk).await;
        Ok(())
    }

    pub async fn reconfigure(&self, camera: &mut dyn Camera, config: &Configuration) -> Result<(), CameraError> {
        camera.deinit();
        self.setup(camera, config).await?;
        self.calibrate(camera).await
    }
}
