//! Shared configuration and status store.
//!
//! Configuration and Status each sit behind their own lock. The locks are
//! held only for the copy in or out, so no reader ever sees a half-updated
//! structure and no holder ever waits on I/O while holding one.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Camera frame sizes, numbered as the camera driver numbers them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameSize {
    Qvga = 5,
    Vga = 8,
    Svga = 9,
    Xga = 10,
    Sxga = 12,
    Fhd = 14,
}

/// Sizes that may be selected over the link.
const FRAME_SIZE_TABLE: [(&str, FrameSize); 5] = [
    ("FHD", FrameSize::Fhd),
    ("SXGA", FrameSize::Sxga),
    ("XGA", FrameSize::Xga),
    ("VGA", FrameSize::Vga),
    ("QVGA", FrameSize::Qvga),
];

/// Above this size the camera needs a coarser JPEG quality setting.
pub const QUALITY_COUPLING_SIZE: FrameSize = FrameSize::Svga;
pub const MIN_COUPLED_CAMERA_QUALITY: u8 = 10;

impl FrameSize {
    pub fn from_name(name: &str) -> Option<Self> {
        FRAME_SIZE_TABLE
            .iter()
            .find(|(table_name, _)| *table_name == name)
            .map(|(_, size)| *size)
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn pixels(self) -> (u16, u16) {
        match self {
            FrameSize::Qvga => (320, 240),
            FrameSize::Vga => (640, 480),
            FrameSize::Svga => (800, 600),
            FrameSize::Xga => (1024, 768),
            FrameSize::Sxga => (1280, 1024),
            FrameSize::Fhd => (1920, 1080),
        }
    }
}

/// Image codec packet type, numbered as the codec numbers it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PacketType {
    /// With forward error correction.
    Normal = 0,
    NoFec = 1,
}

impl PacketType {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "NORMAL" => Some(PacketType::Normal),
            "NOFEC" => Some(PacketType::NoFec),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    pub camera_size: FrameSize,
    pub camera_quality: u8,
    pub ssdv_type: PacketType,
    pub ssdv_quality: u8,
    pub ssdv_cycle_secs: u16,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            camera_size: FrameSize::Vga,
            camera_quality: 5,
            ssdv_type: PacketType::NoFec,
            ssdv_quality: 2,
            ssdv_cycle_secs: 60,
        }
    }
}

impl Configuration {
    /// This configuration with the camera fields put back to their defaults.
    pub fn with_default_camera(self) -> Self {
        let defaults = Configuration::default();
        Self {
            camera_size: defaults.camera_size,
            camera_quality: defaults.camera_quality,
            ..self
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub relay_enabled: bool,
    pub ssdv_enabled: bool,
    pub buzzer_enabled: bool,
    pub ssdv_transmitting: bool,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            relay_enabled: true,
            ssdv_enabled: true,
            buzzer_enabled: true,
            ssdv_transmitting: false,
        }
    }
}

/// Selector for a single Status field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusField {
    RelayEnabled,
    SsdvEnabled,
    BuzzerEnabled,
    SsdvTransmitting,
}

#[derive(Debug, Default)]
struct StoreInner {
    config: Mutex<Configuration>,
    status: Mutex<Status>,
}

/// Cloneable handle to the process-wide configuration and status.
#[derive(Debug, Clone, Default)]
pub struct StateStore {
    inner: Arc<StoreInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // The guarded values are plain data copied in one step, so a poisoned
    // lock still holds a whole structure.
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_initial(config: Configuration, status: Status) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                config: Mutex::new(config),
                status: Mutex::new(status),
            }),
        }
    }

    pub fn get_config(&self) -> Configuration {
        *lock(&self.inner.config)
    }

    pub fn replace_config(&self, config: Configuration) {
        *lock(&self.inner.config) = config;
    }

    pub fn get_status(&self) -> Status {
        *lock(&self.inner.status)
    }

    pub fn set_status_field(&self, field: StatusField, value: bool) {
        let mut status = lock(&self.inner.status);
        match field {
            StatusField::RelayEnabled => status.relay_enabled = value,
            StatusField::SsdvEnabled => status.ssdv_enabled = value,
            StatusField::BuzzerEnabled => status.buzzer_enabled = value,
            StatusField::SsdvTransmitting => status.ssdv_transmitting = value,
        }
    }

    pub fn is_transmitting(&self) -> bool {
        self.get_status().ssdv_transmitting
    }

    /// Raise the transmission-in-progress flag for the lifetime of the
    /// returned permit.
    ///
    /// The flag is advisory: it tells the interpreter to refuse camera
    /// reconfiguration and the link to withhold relay traffic. It grants no
    /// access to the camera itself.
    pub fn begin_transmission(&self) -> TransmissionPermit {
        self.set_status_field(StatusField::SsdvTransmitting, true);
        TransmissionPermit {
            store: self.clone(),
            released: false,
        }
    }
}

#[derive(Debug)]
#[must_use = "dropping the permit clears the transmission flag"]
pub struct TransmissionPermit {
    store: StateStore,
    released: bool,
}

impl TransmissionPermit {
    pub fn release(mut self) {
        self.clear();
    }

    fn clear(&mut self) {
        if !self.released {
            self.store.set_status_field(StatusField::SsdvTransmitting, false);
            self.released = true;
        }
    }
}

impl Drop for TransmissionPermit {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let store = StateStore::new();
        let config = store.get_config();
        assert_eq!(config.camera_size, FrameSize::Vga);
        assert_eq!(config.camera_quality, 5);
        assert_eq!(config.ssdv_type, PacketType::NoFec);
        assert_eq!(config.ssdv_quality, 2);
        assert_eq!(config.ssdv_cycle_secs, 60);

        let status = store.get_status();
        assert!(status.relay_enabled);
        assert!(status.ssdv_enabled);
        assert!(status.buzzer_enabled);
        assert!(!status.ssdv_transmitting);
    }

    #[test]
    fn test_single_field_update_leaves_others() {
        let store = StateStore::new();
        store.set_status_field(StatusField::RelayEnabled, false);
        let status = store.get_status();
        assert!(!status.relay_enabled);
        assert!(status.ssdv_enabled);
        assert!(status.buzzer_enabled);
    }

    #[test]
    fn test_permit_raises_and_clears_flag() {
        let store = StateStore::new();
        let permit = store.begin_transmission();
        assert!(store.is_transmitting());
        permit.release();
        assert!(!store.is_transmitting());

        {
            let _permit = store.begin_transmission();
            assert!(store.is_transmitting());
        }
        assert!(!store.is_transmitting());
    }

    #[test]
    fn test_frame_size_table() {
        assert_eq!(FrameSize::from_name("FHD"), Some(FrameSize::Fhd));
        assert_eq!(FrameSize::from_name("QVGA").map(FrameSize::code), Some(5));
        assert_eq!(FrameSize::from_name("SVGA"), None);
        assert_eq!(FrameSize::from_name("vga"), None);
        assert!(FrameSize::Xga > QUALITY_COUPLING_SIZE);
        assert!(FrameSize::Vga < QUALITY_COUPLING_SIZE);
    }

    #[test]
    fn test_default_camera_rollback_keeps_codec_fields() {
        let config = Configuration {
            camera_size: FrameSize::Fhd,
            camera_quality: 15,
            ssdv_type: PacketType::Normal,
            ssdv_quality: 4,
            ssdv_cycle_secs: 30,
        };
        let rolled_back = config.with_default_camera();
        assert_eq!(rolled_back.camera_size, FrameSize::Vga);
        assert_eq!(rolled_back.camera_quality, 5);
        assert_eq!(rolled_back.ssdv_type, PacketType::Normal);
        assert_eq!(rolled_back.ssdv_cycle_secs, 30);
    }
}
