use crate::downlink::{Downlink, QueueError};
use crate::hal::{Fix, GpsReceiver, TemperatureSensor, VoltageSampler};
use crate::settings::{ms, PayloadSettings};
use crate::status::StatusCode;
use crate::supervisor::WatchdogHandle;
use arrayvec::ArrayString;
use core::fmt::{self, Write};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

pub const TELEMETRY_PREFIX: &str = "$$";
pub const MAX_TELEMETRY_LINE: usize = 192;

/// Reported when every voltage sample in a reading failed.
pub const INVALID_VOLTAGE: f32 = -1145.14;

const VOLTAGE_SAMPLES: u32 = 5;
const VOLTAGE_SAMPLE_GAP: Duration = Duration::from_millis(5);
const TEMPERATURE_SETTLE: Duration = Duration::from_millis(50);
const TEMPERATURE_SAMPLES: u32 = 5;
const TEMPERATURE_SAMPLE_GAP: Duration = Duration::from_millis(20);

const DEBUG_TIME_FIELD: &str = "DEBUG_MODE";

pub type TelemetryLine = ArrayString<MAX_TELEMETRY_LINE>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FixValidity {
    /// A location update arrived this cycle.
    Fresh,
    Stale,
}

impl FixValidity {
    pub fn flag(self) -> char {
        match self {
            FixValidity::Fresh => 'A',
            FixValidity::Stale => 'V',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TelemetryFrame {
    pub counter: u16,
    pub fix: Fix,
    pub temperature_c: f32,
    pub voltage_v: f32,
    pub validity: FixValidity,
}

impl TelemetryFrame {
    /// Render as `$$CALLSIGN,counter,time,lat,lon,alt,speed,sats,heading,temp,volt,flag`.
    ///
    /// In debug mode the time field reads `DEBUG_MODE` and every position
    /// field is zero.
    pub fn render(&self, callsign: &str, debug_mode: bool) -> TelemetryLine {
        let mut line = TelemetryLine::new();
        if self.write_to(&mut line, callsign, debug_mode).is_err() {
            warn!("telemetry line truncated at {} bytes", MAX_TELEMETRY_LINE);
        }
        line
    }

    fn write_to(&self, out: &mut impl Write, callsign: &str, debug_mode: bool) -> fmt::Result {
        write!(out, "{}{},{},", TELEMETRY_PREFIX, callsign, self.counter)?;
        if debug_mode {
            write!(out, "{},0.000000,0.000000,0.00,0.00,0,0.00,", DEBUG_TIME_FIELD)?;
        } else {
            let fix = &self.fix;
            let t = &fix.time;
            write!(
                out,
                "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z,",
                t.year, t.month, t.day, t.hour, t.minute, t.second
            )?;
            write!(
                out,
                "{:.6},{:.6},{:.2},{:.2},{},{:.2},",
                fix.latitude, fix.longitude, fix.altitude_m, fix.speed_kmh, fix.satellites, fix.heading_deg
            )?;
        }
        write!(
            out,
            "{:.2},{:.2},{}",
            self.temperature_c,
            self.voltage_v,
            self.validity.flag()
        )
    }
}

/// Numbers successive frames. The counter wraps at 2^16.
#[derive(Debug, Clone)]
pub struct FrameBuilder {
    callsign: String,
    debug_mode: bool,
    next_counter: u16,
}

impl FrameBuilder {
    pub fn new(callsign: &str, debug_mode: bool) -> Self {
        Self {
            callsign: callsign.to_string(),
            debug_mode,
            next_counter: 0,
        }
    }

    /// Start numbering at `counter` instead of zero.
    pub fn with_counter(mut self, counter: u16) -> Self {
        self.next_counter = counter;
        self
    }

    pub fn next_counter(&self) -> u16 {
        self.next_counter
    }

    pub fn build(&mut self, fix: Fix, temperature_c: f32, voltage_v: f32, validity: FixValidity) -> TelemetryFrame {
        let counter = self.next_counter;
        self.next_counter = self.next_counter.wrapping_add(1);
        TelemetryFrame {
            counter,
            fix,
            temperature_c,
            voltage_v,
            validity,
        }
    }

    pub fn render(&self, frame: &TelemetryFrame) -> TelemetryLine {
        frame.render(&self.callsign, self.debug_mode)
    }
}

/// Resistor divider between the supply rail and the ADC pin.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoltageDivider {
    pub r1_ohms: u32,
    pub r2_ohms: u32,
    pub correction: f32,
}

impl Default for VoltageDivider {
    fn default() -> Self {
        Self {
            r1_ohms: 10_000,
            r2_ohms: 1_000,
            correction: 0.9518,
        }
    }
}

impl VoltageDivider {
    pub fn from_settings(settings: &PayloadSettings) -> Self {
        Self {
            r1_ohms: settings.divider_r1_ohms,
            r2_ohms: settings.divider_r2_ohms,
            correction: settings.voltage_correction,
        }
    }

    /// Supply volts for a calibrated pin reading in millivolts.
    pub fn supply_volts(&self, pin_millivolts: u32) -> f32 {
        let ratio = (self.r1_ohms + self.r2_ohms) as f32 / self.r2_ohms as f32;
        pin_millivolts as f32 / 1000.0 * ratio * self.correction
    }
}

/// Oversampled supply-voltage reading.
pub struct VoltageMonitor {
    sampler: Box<dyn VoltageSampler>,
    divider: VoltageDivider,
    downlink: Downlink,
}

impl VoltageMonitor {
    pub fn new(sampler: Box<dyn VoltageSampler>, divider: VoltageDivider, downlink: Downlink) -> Self {
        Self {
            sampler,
            divider,
            downlink,
        }
    }

    /// Average five samples. If none succeeds the failure is reported with
    /// the last driver error code and [`INVALID_VOLTAGE`] is returned.
    pub async fn read_volts(&mut self) -> f32 {
        let mut sum: u64 = 0;
        let mut good: u32 = 0;
        let mut last_error = 0;

        for i in 0..VOLTAGE_SAMPLES {
            match self.sampler.sample() {
                Ok(raw) => {
                    sum += u64::from(raw);
                    good += 1;
                }
                Err(code) => last_error = code,
            }
            if i + 1 < VOLTAGE_SAMPLES {
                sleep(VOLTAGE_SAMPLE_GAP).await;
            }
        }

        if good == 0 {
            warn!(code = last_error, "all voltage samples failed");
            self.downlink
                .report(StatusCode::AdcSampleFail, last_error.into())
                .await;
            return INVALID_VOLTAGE;
        }

        let average = (sum / u64::from(good)) as u32;
        self.divider.supply_volts(self.sampler.raw_to_millivolts(average))
    }
}

pub async fn read_temperature(sensor: &mut dyn TemperatureSensor) -> f32 {
    sleep(TEMPERATURE_SETTLE).await;
    let mut sum = 0.0;
    for i in 0..TEMPERATURE_SAMPLES {
        sum += sensor.read_celsius();
        if i + 1 < TEMPERATURE_SAMPLES {
            sleep(TEMPERATURE_SAMPLE_GAP).await;
        }
    }
    sum / TEMPERATURE_SAMPLES as f32
}

/// Poll the receiver until it reports a valid location or `limit` passes.
pub async fn await_first_fix(gps: &mut dyn GpsReceiver, limit: Duration, poll: Duration) -> bool {
    let deadline = Instant::now() + limit;
    loop {
        gps.poll();
        if gps.fix().location_valid {
            return true;
        }
        if Instant::now() + poll > deadline {
            return false;
        }
        sleep(poll).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemetryTiming {
    pub period: Duration,
    pub gps_attempts: u8,
    pub gps_retry: Duration,
}

impl Default for TelemetryTiming {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(20),
            gps_attempts: 3,
            gps_retry: Duration::from_secs(1),
        }
    }
}

impl TelemetryTiming {
    pub fn from_settings(settings: &PayloadSettings) -> Self {
        Self {
            period: ms(settings.telemetry_period_ms),
            gps_attempts: settings.gps_update_attempts,
            gps_retry: ms(settings.gps_retry_ms),
        }
    }
}

pub struct TelemetryProducer {
    builder: FrameBuilder,
    gps: Box<dyn GpsReceiver>,
    temperature: Box<dyn TemperatureSensor>,
    voltage: VoltageMonitor,
    downlink: Downlink,
    timing: TelemetryTiming,
}

impl TelemetryProducer {
    pub fn new(
        builder: FrameBuilder,
        gps: Box<dyn GpsReceiver>,
        temperature: Box<dyn TemperatureSensor>,
        voltage: VoltageMonitor,
        downlink: Downlink,
        timing: TelemetryTiming,
    ) -> Self {
        Self {
            builder,
            gps,
            temperature,
            voltage,
            downlink,
            timing,
        }
    }

    async fn refresh_fix(&mut self) -> FixValidity {
        let attempts = self.timing.gps_attempts;
        for attempt in 1..=attempts {
            self.gps.poll();
            if self.gps.take_location_update() {
                return FixValidity::Fresh;
            }
            if attempt < attempts {
                sleep(self.timing.gps_retry).await;
            }
        }
        debug!("no location update this cycle, reporting stale fix");
        FixValidity::Stale
    }

    /// Build one frame and queue it ahead of image traffic. The frame is
    /// dropped if the queue stays full.
    pub async fn cycle(&mut self) -> Result<TelemetryLine, QueueError> {
        let validity = self.refresh_fix().await;
        let temperature = read_temperature(self.temperature.as_mut()).await;
        let voltage = self.voltage.read_volts().await;

        let frame = self.builder.build(self.gps.fix(), temperature, voltage, validity);
        let line = self.builder.render(&frame);
        self.downlink.send_text(&line).await?;
        info!(counter = frame.counter, "telemetry {}", line);
        Ok(line)
    }

    pub async fn run(mut self, watchdog: WatchdogHandle) {
        let mut ticker = interval(self.timing.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            watchdog.feed();
            if let Err(e) = self.cycle().await {
                warn!("telemetry frame dropped: {}", e);
            }
        }
    }
}
