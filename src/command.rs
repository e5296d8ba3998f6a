//! Ground command interpreter.
//!
//! Command lines arrive from the link multiplexer with the `@@` prefix
//! already stripped, as `VERB,TARGET[,VALUE]`. Every command is answered
//! with one or more status reports; malformed or out-of-range commands get
//! a negative acknowledgement and change nothing.
//!
//! `SET` is refused with a busy code while an image transmission holds the
//! transmission flag. Camera-affecting settings are applied under the
//! camera lock and followed by a full reconfiguration; if that fails the
//! camera settings are rolled back to defaults and reconfigured once more,
//! and a second failure restarts the payload.

use crate::camera::{CameraBringup, CameraResource};
use crate::datalink::InboundLine;
use crate::downlink::Downlink;
use crate::error::PayloadError;
use crate::settings::{ms, PayloadSettings};
use crate::state::{
    Configuration, FrameSize, PacketType, StateStore, StatusField, MIN_COUPLED_CAMERA_QUALITY, QUALITY_COUPLING_SIZE,
};
use crate::status::{StatusCode, StatusPayload};
use crate::supervisor::{RestartLine, RestartReason, WatchdogHandle};
use core::ops::RangeInclusive;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

pub const CAMERA_QUALITY_RANGE: RangeInclusive<u8> = 5..=20;
pub const SSDV_QUALITY_RANGE: RangeInclusive<u8> = 0..=6;
pub const SSDV_CYCLE_RANGE: RangeInclusive<u16> = 10..=100;

/// A parsed command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request<'a> {
    Get { target: &'a str },
    Ctl { target: &'a str, value: &'a str },
    Set { target: &'a str, value: &'a str },
}

/// Split a command line into a request, or name the NACK it earns.
///
/// Empty tokens are skipped, so `GET,,RELAY` reads as `GET,RELAY`. The
/// value is only required once the verb is known not to be `GET`.
pub fn parse(line: &str) -> Result<Request<'_>, StatusCode> {
    let mut tokens = line.split(',').filter(|token| !token.is_empty());
    let (Some(verb), Some(target)) = (tokens.next(), tokens.next()) else {
        return Err(StatusCode::CmdNackFormatError);
    };
    let value = tokens.next();

    if verb == "GET" {
        return Ok(Request::Get { target });
    }
    let Some(value) = value else {
        return Err(StatusCode::CmdNackNoValue);
    };
    match verb {
        "CTL" => Ok(Request::Ctl { target, value }),
        "SET" => Ok(Request::Set { target, value }),
        _ => Err(StatusCode::CmdNackInvalidType),
    }
}

/// Parse `value` and check it against `range`; `nack` covers both a
/// non-numeric value and one out of range.
fn ranged<T>(value: &str, range: RangeInclusive<T>, nack: StatusCode) -> Result<T, StatusCode>
where
    T: core::str::FromStr + PartialOrd,
{
    value
        .parse::<T>()
        .ok()
        .filter(|parsed| range.contains(parsed))
        .ok_or(nack)
}

/// What a validated `SET` changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Setting {
    CameraSize(FrameSize),
    CameraQuality(u8),
    SsdvType(PacketType),
    SsdvQuality(u8),
    SsdvCycle(u16),
}

impl Setting {
    fn validate(target: &str, value: &str, current: &Configuration) -> Result<Self, StatusCode> {
        match target {
            "CAM_SIZE" => FrameSize::from_name(value)
                .map(Setting::CameraSize)
                .ok_or(StatusCode::CmdNackInvalidType),
            "CAM_QUALITY" => {
                let quality = ranged(value, CAMERA_QUALITY_RANGE, StatusCode::CmdNackSetCamQuality)?;
                if current.camera_size > QUALITY_COUPLING_SIZE && quality < MIN_COUPLED_CAMERA_QUALITY {
                    return Err(StatusCode::CmdNackSetCamQualityLow);
                }
                Ok(Setting::CameraQuality(quality))
            }
            "SSDV_TYPE" => PacketType::from_name(value)
                .map(Setting::SsdvType)
                .ok_or(StatusCode::CmdNackInvalidType),
            "SSDV_QUALITY" => ranged(value, SSDV_QUALITY_RANGE, StatusCode::CmdNackSetSsdvQuality).map(Setting::SsdvQuality),
            "SSDV_CYCLE" => ranged(value, SSDV_CYCLE_RANGE, StatusCode::CmdNackSetSsdvCycle).map(Setting::SsdvCycle),
            _ => Err(StatusCode::CmdNackInvalidSet),
        }
    }

    fn apply(self, config: &mut Configuration) {
        match self {
            Setting::CameraSize(size) => config.camera_size = size,
            Setting::CameraQuality(quality) => config.camera_quality = quality,
            Setting::SsdvType(packet_type) => config.ssdv_type = packet_type,
            Setting::SsdvQuality(quality) => config.ssdv_quality = quality,
            Setting::SsdvCycle(secs) => config.ssdv_cycle_secs = secs,
        }
    }

    fn ack(self) -> (StatusCode, i64) {
        match self {
            Setting::CameraSize(size) => (StatusCode::CmdAckCamSize, size.code().into()),
            Setting::CameraQuality(quality) => (StatusCode::CmdAckCamQuality, quality.into()),
            Setting::SsdvType(packet_type) => (StatusCode::CmdAckSsdvType, packet_type.code().into()),
            Setting::SsdvQuality(quality) => (StatusCode::CmdAckSsdvQuality, quality.into()),
            Setting::SsdvCycle(secs) => (StatusCode::CmdAckSsdvCycle, secs.into()),
        }
    }

    fn affects_camera(self) -> bool {
        matches!(self, Setting::CameraSize(_) | Setting::CameraQuality(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandTiming {
    /// Longest wait on the command queue per loop iteration.
    pub wait: Duration,
    /// Delay between the restarting report and the restart itself.
    pub restart_grace: Duration,
}

impl Default for CommandTiming {
    fn default() -> Self {
        Self {
            wait: Duration::from_secs(1),
            restart_grace: Duration::from_secs(1),
        }
    }
}

impl CommandTiming {
    pub fn from_settings(settings: &PayloadSettings) -> Self {
        Self {
            wait: ms(settings.command_wait_ms),
            restart_grace: ms(settings.restart_grace_ms),
        }
    }
}

pub struct CommandInterpreter {
    state: StateStore,
    downlink: Downlink,
    camera: CameraResource,
    bringup: CameraBringup,
    restart: RestartLine,
    timing: CommandTiming,
}

impl CommandInterpreter {
    pub fn new(
        state: StateStore,
        downlink: Downlink,
        camera: CameraResource,
        bringup: CameraBringup,
        restart: RestartLine,
        timing: CommandTiming,
    ) -> Self {
        Self {
            state,
            downlink,
            camera,
            bringup,
            restart,
            timing,
        }
    }

    /// Serve the command queue until a command restarts the payload.
    pub async fn run(
        self,
        mut commands: mpsc::Receiver<InboundLine>,
        watchdog: WatchdogHandle,
    ) -> Result<(), PayloadError> {
        loop {
            watchdog.feed();
            match timeout(self.timing.wait, commands.recv()).await {
                Ok(Some(line)) => self.execute(&line).await?,
                Ok(None) => return Err(PayloadError::TaskEnded("command")),
                Err(_) => {}
            }
        }
    }

    /// Execute one command line. Only a restart is returned as an error;
    /// everything else is answered on the downlink.
    pub async fn execute(&self, line: &str) -> Result<(), PayloadError> {
        debug!(line, "command received");
        let request = match parse(line) {
            Ok(request) => request,
            Err(nack) => {
                self.nack(nack).await;
                return Ok(());
            }
        };

        match request {
            Request::Get { target } => {
                self.get(target).await;
                Ok(())
            }
            Request::Ctl { target, value } => self.ctl(target, value).await,
            Request::Set { target, value } => self.set(target, value).await,
        }
    }

    async fn nack(&self, code: StatusCode) {
        warn!("command rejected with 0x{:04X}", code.value());
        self.downlink.report_bare(code).await;
    }

    async fn get(&self, target: &str) {
        match target {
            "RELAY" => {
                let status = self.state.get_status();
                self.downlink
                    .report(StatusCode::CmdAckGetRelayStatus, status.relay_enabled.into())
                    .await;
            }
            "SSDV" => {
                let status = self.state.get_status();
                let config = self.state.get_config();
                self.downlink
                    .report(StatusCode::CmdAckGetSsdvStatus, status.ssdv_enabled.into())
                    .await;
                self.downlink
                    .report(StatusCode::CmdAckGetSsdvCycle, config.ssdv_cycle_secs.into())
                    .await;
                self.downlink
                    .report(StatusCode::CmdAckGetSsdvType, config.ssdv_type.code().into())
                    .await;
                self.downlink
                    .report(StatusCode::CmdAckGetSsdvQuality, config.ssdv_quality.into())
                    .await;
            }
            "CAM" => {
                let config = self.state.get_config();
                self.downlink
                    .report(StatusCode::CmdAckGetCamSize, config.camera_size.code().into())
                    .await;
                self.downlink
                    .report(StatusCode::CmdAckGetCamQuality, config.camera_quality.into())
                    .await;
            }
            _ => self.nack(StatusCode::CmdNackInvalidGet).await,
        }
    }

    async fn ctl(&self, target: &str, value: &str) -> Result<(), PayloadError> {
        let (field, enable, ack) = match (target, value) {
            ("SYS", "REBOOT") => {
                info!("reboot commanded");
                return self.restart_now(RestartReason::OperatorCommand).await;
            }
            ("RELAY", "ON") => (StatusField::RelayEnabled, true, StatusCode::CmdAckRelayOn),
            ("RELAY", "OFF") => (StatusField::RelayEnabled, false, StatusCode::CmdAckRelayOff),
            ("SSDV", "ON") => (StatusField::SsdvEnabled, true, StatusCode::CmdAckSsdvOn),
            ("SSDV", "OFF") => (StatusField::SsdvEnabled, false, StatusCode::CmdAckSsdvOff),
            _ => {
                self.nack(StatusCode::CmdNackInvalidCtl).await;
                return Ok(());
            }
        };

        self.state.set_status_field(field, enable);
        info!(?field, enable, "status updated");
        self.downlink.report_bare(ack).await;
        Ok(())
    }

    async fn set(&self, target: &str, value: &str) -> Result<(), PayloadError> {
        if self.state.is_transmitting() {
            self.nack(StatusCode::CmdNackSsdvBusy).await;
            return Ok(());
        }

        let mut config = self.state.get_config();
        let setting = match Setting::validate(target, value, &config) {
            Ok(setting) => setting,
            Err(nack) => {
                self.nack(nack).await;
                return Ok(());
            }
        };
        setting.apply(&mut config);

        let (ack, payload) = setting.ack();
        self.downlink.report(ack, StatusPayload::Int(payload)).await;
        info!(?setting, "configuration updated");

        if setting.affects_camera() {
            self.reconfigure_camera(config).await
        } else {
            self.state.replace_config(config);
            Ok(())
        }
    }

    /// Apply `config` and bring the camera up with it, rolling the camera
    /// settings back to defaults if that fails.
    async fn reconfigure_camera(&self, config: Configuration) -> Result<(), PayloadError> {
        let mut camera = self.camera.lock().await;
        self.state.replace_config(config);

        let Err(e) = self.bringup.reconfigure(&mut **camera, &config).await else {
            self.downlink.report_bare(StatusCode::CamReconfigOk).await;
            return Ok(());
        };
        warn!("camera reconfiguration failed, restoring defaults: {}", e);
        self.downlink.report_bare(StatusCode::CamReconfigFail).await;

        let fallback = config.with_default_camera();
        self.state.replace_config(fallback);
        match self.bringup.reconfigure(&mut **camera, &fallback).await {
            Ok(()) => {
                self.downlink.report_bare(StatusCode::CamRestoreDefaultOk).await;
                Ok(())
            }
            Err(e) => {
                warn!("camera rollback failed: {}", e);
                self.downlink.report_bare(StatusCode::CamRestoreDefaultFail).await;
                drop(camera);
                self.restart_now(RestartReason::ReconfigurationFailed).await
            }
        }
    }

    async fn restart_now(&self, reason: RestartReason) -> Result<(), PayloadError> {
        self.downlink.report_bare(StatusCode::SysRestarting).await;
        sleep(self.timing.restart_grace).await;
        self.restart.request(reason);
        Err(PayloadError::Restart(reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_verbs() {
        assert_eq!(parse("GET,RELAY"), Ok(Request::Get { target: "RELAY" }));
        assert_eq!(parse("GET,CAM,ignored"), Ok(Request::Get { target: "CAM" }));
        assert_eq!(
            parse("CTL,RELAY,OFF"),
            Ok(Request::Ctl { target: "RELAY", value: "OFF" })
        );
        assert_eq!(
            parse("SET,SSDV_CYCLE,30"),
            Ok(Request::Set { target: "SSDV_CYCLE", value: "30" })
        );
    }

    #[test]
    fn test_parse_skips_empty_tokens() {
        assert_eq!(parse(",,GET,,RELAY"), Ok(Request::Get { target: "RELAY" }));
        assert_eq!(
            parse("SET,,SSDV_QUALITY,,4"),
            Ok(Request::Set { target: "SSDV_QUALITY", value: "4" })
        );
    }

    #[test]
    fn test_parse_errors_in_order() {
        assert_eq!(parse(""), Err(StatusCode::CmdNackFormatError));
        assert_eq!(parse("GET"), Err(StatusCode::CmdNackFormatError));
        assert_eq!(parse("SET,CAM_SIZE"), Err(StatusCode::CmdNackNoValue));
        // The value check comes before the verb check.
        assert_eq!(parse("FOO,BAR"), Err(StatusCode::CmdNackNoValue));
        assert_eq!(parse("FOO,BAR,1"), Err(StatusCode::CmdNackInvalidType));
    }

    #[test]
    fn test_setting_ranges() {
        let config = Configuration::default();
        assert_eq!(
            Setting::validate("SSDV_QUALITY", "6", &config),
            Ok(Setting::SsdvQuality(6))
        );
        assert_eq!(
            Setting::validate("SSDV_QUALITY", "7", &config),
            Err(StatusCode::CmdNackSetSsdvQuality)
        );
        assert_eq!(
            Setting::validate("SSDV_CYCLE", "9", &config),
            Err(StatusCode::CmdNackSetSsdvCycle)
        );
        assert_eq!(
            Setting::validate("SSDV_CYCLE", "abc", &config),
            Err(StatusCode::CmdNackSetSsdvCycle)
        );
        assert_eq!(
            Setting::validate("CAM_QUALITY", "4", &config),
            Err(StatusCode::CmdNackSetCamQuality)
        );
        assert_eq!(
            Setting::validate("CAM_QUALITY", "21", &config),
            Err(StatusCode::CmdNackSetCamQuality)
        );
        assert_eq!(
            Setting::validate("SSDV_TYPE", "TURBO", &config),
            Err(StatusCode::CmdNackInvalidType)
        );
        assert_eq!(Setting::validate("VOLUME", "3", &config), Err(StatusCode::CmdNackInvalidSet));
    }

    #[test]
    fn test_camera_quality_coupled_to_size() {
        let mut config = Configuration::default();
        assert_eq!(
            Setting::validate("CAM_QUALITY", "6", &config),
            Ok(Setting::CameraQuality(6))
        );

        config.camera_size = FrameSize::Xga;
        assert_eq!(
            Setting::validate("CAM_QUALITY", "6", &config),
            Err(StatusCode::CmdNackSetCamQualityLow)
        );
        assert_eq!(
            Setting::validate("CAM_QUALITY", "10", &config),
            Ok(Setting::CameraQuality(10))
        );
    }

    #[test]
    fn test_setting_acks_carry_codes() {
        assert_eq!(
            Setting::CameraSize(FrameSize::Fhd).ack(),
            (StatusCode::CmdAckCamSize, 14)
        );
        assert_eq!(
            Setting::SsdvType(PacketType::Normal).ack(),
            (StatusCode::CmdAckSsdvType, 0)
        );
        assert!(Setting::CameraQuality(12).affects_camera());
        assert!(!Setting::SsdvCycle(30).affects_camera());
    }
}
