//! Boot-time tunables.
//!
//! The defaults are the flight values. A JSON file may override any subset
//! of them; fields that are absent keep their default.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const MAX_CALLSIGN_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid settings JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid setting `{field}`: {reason}")]
    Invalid { field: &'static str, reason: &'static str },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PayloadSettings {
    pub callsign: String,
    /// Developer mode: positioning init is skipped and telemetry frames
    /// carry no position.
    pub debug_mode: bool,

    // Transmit arbitration
    pub tx_enqueue_timeout_ms: u64,
    pub tx_enqueue_attempts: u8,
    pub tx_retry_pause_ms: u64,
    pub link_poll_ms: u64,
    pub link_idle_ms: u64,
    pub inbound_forward_timeout_ms: u64,

    // Command interpreter
    pub command_wait_ms: u64,
    pub restart_grace_ms: u64,

    // Telemetry
    pub telemetry_period_ms: u64,
    pub gps_update_attempts: u8,
    pub gps_retry_ms: u64,

    // Camera
    pub camera_calibrate_shots: u8,
    pub camera_calibrate_interval_ms: u64,

    // Image pipeline
    pub image_idle_recheck_ms: u64,
    pub image_packet_attempts: u8,
    pub image_packet_retry_ms: u64,
    pub image_packet_yield_ms: u64,
    pub drain_poll_ms: u64,
    pub link_flush_ms: u64,

    // Relay
    pub relay_idle_recheck_ms: u64,
    pub relay_wait_ms: u64,
    pub relay_window_ms: u64,
    pub relay_window_cap: u32,

    // Liveness supervision
    pub watchdog_timeout_ms: u64,
    pub watchdog_poll_ms: u64,

    // Boot
    pub gps_init_timeout_ms: u64,
    pub gps_init_poll_ms: u64,
    pub boot_settle_ms: u64,
    pub boot_fail_alert_ms: u64,

    // Voltage divider
    pub divider_r1_ohms: u32,
    pub divider_r2_ohms: u32,
    pub voltage_correction: f32,
}

impl Default for PayloadSettings {
    fn default() -> Self {
        Self {
            callsign: String::from("BG7ZDQ"),
            debug_mode: false,

            tx_enqueue_timeout_ms: 500,
            tx_enqueue_attempts: 3,
            tx_retry_pause_ms: 50,
            link_poll_ms: 10,
            link_idle_ms: 10,
            inbound_forward_timeout_ms: 50,

            command_wait_ms: 1000,
            restart_grace_ms: 1000,

            telemetry_period_ms: 20_000,
            gps_update_attempts: 3,
            gps_retry_ms: 1000,

            camera_calibrate_shots: 5,
            camera_calibrate_interval_ms: 500,

            image_idle_recheck_ms: 5000,
            image_packet_attempts: 3,
            image_packet_retry_ms: 100,
            image_packet_yield_ms: 20,
            drain_poll_ms: 200,
            link_flush_ms: 500,

            relay_idle_recheck_ms: 2000,
            relay_wait_ms: 1000,
            relay_window_ms: 120_000,
            relay_window_cap: 80,

            watchdog_timeout_ms: 120_000,
            watchdog_poll_ms: 1000,

            gps_init_timeout_ms: 60_000,
            gps_init_poll_ms: 2000,
            boot_settle_ms: 2000,
            boot_fail_alert_ms: 2000,

            divider_r1_ohms: 10_000,
            divider_r2_ohms: 1_000,
            voltage_correction: 0.9518,
        }
    }
}

impl PayloadSettings {
    pub fn from_json(json: &str) -> Result<Self, SettingsError> {
        let settings: Self = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.callsign.is_empty() || self.callsign.len() > MAX_CALLSIGN_LEN {
            return Err(SettingsError::Invalid {
                field: "callsign",
                reason: "must be 1 to 16 characters",
            });
        }
        if self.callsign.contains(',') {
            return Err(SettingsError::Invalid {
                field: "callsign",
                reason: "must not contain the field delimiter",
            });
        }
        if self.tx_enqueue_attempts == 0 || self.image_packet_attempts == 0 || self.gps_update_attempts == 0 {
            return Err(SettingsError::Invalid {
                field: "attempts",
                reason: "retry counts must be at least 1",
            });
        }
        let periods = [
            ("telemetry_period_ms", self.telemetry_period_ms),
            ("watchdog_poll_ms", self.watchdog_poll_ms),
            ("image_idle_recheck_ms", self.image_idle_recheck_ms),
            ("relay_idle_recheck_ms", self.relay_idle_recheck_ms),
            ("link_idle_ms", self.link_idle_ms),
            ("drain_poll_ms", self.drain_poll_ms),
            ("gps_init_poll_ms", self.gps_init_poll_ms),
        ];
        if let Some(&(field, _)) = periods.iter().find(|(_, value)| *value == 0) {
            return Err(SettingsError::Invalid {
                field,
                reason: "period must be non-zero",
            });
        }
        if self.divider_r2_ohms == 0 {
            return Err(SettingsError::Invalid {
                field: "divider_r2_ohms",
                reason: "must be non-zero",
            });
        }
        if self.watchdog_timeout_ms <= self.watchdog_poll_ms {
            return Err(SettingsError::Invalid {
                field: "watchdog_timeout_ms",
                reason: "must exceed the supervisor poll interval",
            });
        }
        if self.relay_window_ms == 0 {
            return Err(SettingsError::Invalid {
                field: "relay_window_ms",
                reason: "must be non-zero",
            });
        }
        Ok(())
    }
}

/// Shorthand used throughout the task loops.
pub(crate) fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = PayloadSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.relay_window_cap, 80);
        assert_eq!(settings.tx_enqueue_attempts, 3);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let settings = PayloadSettings::from_json(r#"{"callsign":"N0CALL","debug_mode":true}"#).unwrap();
        assert_eq!(settings.callsign, "N0CALL");
        assert!(settings.debug_mode);
        assert_eq!(settings.telemetry_period_ms, 20_000);
    }

    #[test]
    fn test_rejects_bad_callsign() {
        let err = PayloadSettings::from_json(r#"{"callsign":"A,B"}"#).unwrap_err();
        assert!(matches!(err, SettingsError::Invalid { field: "callsign", .. }));
    }

    #[test]
    fn test_rejects_zero_periods() {
        for field in ["telemetry_period_ms", "watchdog_poll_ms", "image_idle_recheck_ms", "relay_idle_recheck_ms"] {
            let json = format!(r#"{{"debug_mode":true,"{}":0}}"#, field);
            let err = PayloadSettings::from_json(&json).unwrap_err();
            assert!(
                matches!(err, SettingsError::Invalid { field: rejected, .. } if rejected == field),
                "{} accepted as zero",
                field
            );
        }
    }

    #[test]
    fn test_rejects_malformed_json() {
        assert!(matches!(PayloadSettings::from_json("{"), Err(SettingsError::Json(_))));
    }
}
