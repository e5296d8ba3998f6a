//! Status code namespace shared with the ground station.
//!
//! Every notification, command acknowledgement and error condition the
//! payload reports travels as a 16-bit code, optionally followed by a short
//! payload. Codes are grouped by subsystem in the high byte.

use arrayvec::ArrayString;
use core::fmt::{self, Write};
use serde::{Deserialize, Serialize};

pub const MAX_STATUS_INFO_SIZE: usize = 64;

pub type StatusInfo = ArrayString<MAX_STATUS_INFO_SIZE>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum StatusCode {
    // System (0x10xx)
    SysBooting = 0x1000,
    SysInitOk = 0x1001,
    SysInitFail = 0x1002,
    SysRestarting = 0x1003,
    SysDevModeEnabled = 0x1004,
    RelayRateLimited = 0x1005,

    // Camera (0x20xx)
    CamInitStart = 0x2000,
    CamInitOk = 0x2001,
    CamInitFail = 0x2002,
    CamCalibrateStart = 0x2003,
    CamCalibrateOk = 0x2004,
    CamCalibrateFail = 0x2005,
    CamCaptureFail = 0x2006,
    CamReconfigOk = 0x2007,
    CamReconfigFail = 0x2008,
    CamRestoreDefaultOk = 0x2009,
    CamRestoreDefaultFail = 0x200A,

    // Positioning (0x30xx)
    GpsInitStart = 0x3000,
    GpsInitOk = 0x3001,
    GpsInitFail = 0x3002,

    // Image pipeline (0x40xx)
    SsdvEncodeStart = 0x4000,
    SsdvEncodeEnd = 0x4001,
    SsdvEncodeError = 0x4002,
    SsdvTxBufferFull = 0x4003,

    // Command negative acknowledgements (0x50xx)
    CmdNackFormatError = 0x5001,
    CmdNackNoValue = 0x5002,
    CmdNackInvalidType = 0x5003,
    CmdNackInvalidGet = 0x5004,
    CmdNackInvalidCtl = 0x5005,
    CmdNackInvalidSet = 0x5006,
    CmdNackSsdvBusy = 0x5007,
    CmdNackSetCamQuality = 0x5008,
    CmdNackSetCamQualityLow = 0x5009,
    CmdNackSetSsdvQuality = 0x500A,
    CmdNackSetSsdvCycle = 0x500B,

    // CTL acknowledgements
    CmdAckRelayOn = 0x500C,
    CmdAckRelayOff = 0x500D,
    CmdAckSsdvOn = 0x500E,
    CmdAckSsdvOff = 0x500F,

    // SET acknowledgements
    CmdAckSsdvType = 0x5010,
    CmdAckSsdvQuality = 0x5011,
    CmdAckSsdvCycle = 0x5012,
    CmdAckCamSize = 0x5013,
    CmdAckCamQuality = 0x5014,

    // GET acknowledgements (0x51xx)
    CmdAckGetRelayStatus = 0x5100,
    CmdAckGetSsdvStatus = 0x5101,
    CmdAckGetSsdvType = 0x5102,
    CmdAckGetSsdvQuality = 0x5103,
    CmdAckGetSsdvCycle = 0x5104,
    CmdAckGetCamSize = 0x5105,
    CmdAckGetCamQuality = 0x5106,

    // Sensors (0x60xx)
    AdcSampleFail = 0x6000,
}

impl StatusCode {
    pub fn value(self) -> u16 {
        self as u16
    }

    pub fn is_nack(self) -> bool {
        (0x5001..=0x500B).contains(&self.value())
    }
}

/// Optional payload appended to a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusPayload<'a> {
    None,
    Text(&'a str),
    Int(i64),
    Bool(bool),
}

impl From<bool> for StatusPayload<'_> {
    fn from(value: bool) -> Self {
        StatusPayload::Bool(value)
    }
}

impl From<i64> for StatusPayload<'_> {
    fn from(value: i64) -> Self {
        StatusPayload::Int(value)
    }
}

impl From<u8> for StatusPayload<'_> {
    fn from(value: u8) -> Self {
        StatusPayload::Int(i64::from(value))
    }
}

impl From<u16> for StatusPayload<'_> {
    fn from(value: u16) -> Self {
        StatusPayload::Int(i64::from(value))
    }
}

impl From<i32> for StatusPayload<'_> {
    fn from(value: i32) -> Self {
        StatusPayload::Int(i64::from(value))
    }
}

impl<'a> From<&'a str> for StatusPayload<'a> {
    fn from(value: &'a str) -> Self {
        StatusPayload::Text(value)
    }
}

/// A status code with its rendered payload, ready to be framed as text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub code: StatusCode,
    pub info: Option<StatusInfo>,
}

impl StatusReport {
    pub fn new(code: StatusCode, payload: StatusPayload<'_>) -> Self {
        let mut info = StatusInfo::new();
        // Payloads longer than the info buffer are cut, never rejected.
        let _ = match payload {
            StatusPayload::None => Ok(()),
            StatusPayload::Text(text) => {
                for ch in text.chars() {
                    if info.try_push(ch).is_err() {
                        break;
                    }
                }
                Ok(())
            }
            StatusPayload::Int(value) => write!(info, "{}", value),
            StatusPayload::Bool(value) => info.try_push_str(if value { "1" } else { "0" }).map_err(|_| fmt::Error),
        };

        Self {
            code,
            info: if info.is_empty() { None } else { Some(info) },
        }
    }

    pub fn bare(code: StatusCode) -> Self {
        Self::new(code, StatusPayload::None)
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.info {
            Some(info) => write!(f, "Code: 0x{:04X}, Info: {}", self.code.value(), info),
            None => write!(f, "Code: 0x{:04X}", self.code.value()),
        }
    }
}
