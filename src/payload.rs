//! Boot sequence and task orchestration.
//!
//! [`Payload::run`] performs one boot of the payload: it starts the link
//! multiplexer so boot progress reaches the ground, brings up the camera
//! and positioning receiver, checks boot health, then starts the remaining
//! tasks under the watchdog. It returns when a restart is requested; the
//! caller decides whether to boot again.

use crate::alert::Annunciator;
use crate::camera::{CalibrationPolicy, Camera, CameraBringup, CameraResource};
use crate::command::{CommandInterpreter, CommandTiming};
use crate::datalink::{inbound_queues, LinkMultiplexer, LinkTiming};
use crate::downlink::{Downlink, EnqueuePolicy, TxQueue};
use crate::error::PayloadError;
use crate::hal::{Alert, GpsReceiver, TemperatureSensor, Transport, VoltageSampler};
use crate::imaging::{ImageCodec, ImageProducer, ImageTiming};
use crate::relay::{RelayForwarder, RelayTiming};
use crate::settings::{ms, PayloadSettings};
use crate::state::{StateStore, StatusField};
use crate::status::StatusCode;
use crate::supervisor::{RestartLine, RestartReason, Watchdog, WatchdogHandle};
use crate::telemetry::{await_first_fix, FrameBuilder, TelemetryProducer, TelemetryTiming, VoltageDivider, VoltageMonitor};
use std::thread;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// The collaborators one boot runs against.
pub struct Hardware {
    pub radio: Box<dyn Transport>,
    pub camera: Box<dyn Camera>,
    pub codec: Box<dyn ImageCodec>,
    pub gps: Box<dyn GpsReceiver>,
    pub voltage: Box<dyn VoltageSampler>,
    pub temperature: Box<dyn TemperatureSensor>,
    pub alert: Box<dyn Alert>,
}

/// Where the image pipeline runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageExecution {
    /// Its own OS thread and runtime, so capture and encoding never stall
    /// the link group.
    DedicatedThread,
    /// A task on the caller's runtime.
    SameRuntime,
}

type TaskResult = (&'static str, Result<(), PayloadError>);

pub struct Payload {
    settings: PayloadSettings,
    state: StateStore,
    restart: RestartLine,
    image_execution: ImageExecution,
}

impl Payload {
    pub fn new(settings: PayloadSettings) -> Self {
        Self {
            settings,
            state: StateStore::new(),
            restart: RestartLine::new(),
            image_execution: ImageExecution::DedicatedThread,
        }
    }

    pub fn with_image_execution(mut self, execution: ImageExecution) -> Self {
        self.image_execution = execution;
        self
    }

    pub fn settings(&self) -> &PayloadSettings {
        &self.settings
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    pub fn restart_line(&self) -> &RestartLine {
        &self.restart
    }

    /// Boot once and run until a restart is requested. Each boot starts
    /// from a fresh `Payload`, as a device reset starts from defaults.
    ///
    /// Returns the restart reason. An error means the payload could not be
    /// wired up or a task ended without asking for a restart.
    pub async fn run(self, hardware: Hardware) -> Result<RestartReason, PayloadError> {
        self.settings.validate()?;
        let settings = &self.settings;
        let Hardware {
            radio,
            camera,
            codec,
            mut gps,
            voltage,
            temperature,
            alert,
        } = hardware;

        let tx_queue = TxQueue::new(EnqueuePolicy::from_settings(settings));
        let downlink = Downlink::new(tx_queue.clone());
        let annunciator = Annunciator::new(alert, self.state.clone());
        let watchdog = Watchdog::new(ms(settings.watchdog_timeout_ms));
        let camera = CameraResource::new(camera);
        let bringup = CameraBringup::new(
            downlink.clone(),
            annunciator.clone(),
            CalibrationPolicy::from_settings(settings),
        );
        let ((command_tx, command_rx), (relay_tx, relay_rx)) = inbound_queues();

        let mut tasks: JoinSet<TaskResult> = JoinSet::new();

        let link = LinkMultiplexer::new(
            radio,
            tx_queue.clone(),
            self.state.clone(),
            command_tx,
            relay_tx,
            LinkTiming::from_settings(settings),
        );
        let link_watchdog = watchdog.register("link")?;
        tasks.spawn(async move {
            link.run(link_watchdog).await;
            ("link", Ok(()))
        });

        // Boot
        downlink.report_bare(StatusCode::SysBooting).await;
        info!(callsign = %settings.callsign, debug_mode = settings.debug_mode, "booting");

        {
            let mut driver = camera.lock().await;
            let config = self.state.get_config();
            // A failed setup leaves the driver down, so calibration fails
            // too and latches the boot check.
            let _ = bringup.setup(&mut **driver, &config).await;
            let _ = bringup.calibrate(&mut **driver).await;
        }
        debug!("voltage sampler ready");
        self.init_positioning(gps.as_mut(), &downlink, &annunciator).await;

        if !annunciator.is_healthy() {
            error!("boot check failed");
            downlink.report_bare(StatusCode::SysInitFail).await;
            annunciator.hold(ms(settings.boot_fail_alert_ms)).await;
            self.restart.request(RestartReason::BootCheckFailed);
            tx_queue.close();
            return Ok(RestartReason::BootCheckFailed);
        }
        annunciator.signal_ready().await;
        if settings.debug_mode {
            downlink.report_bare(StatusCode::SysDevModeEnabled).await;
        }
        downlink.report_bare(StatusCode::SysInitOk).await;
        sleep(ms(settings.boot_settle_ms)).await;

        // Tasks
        let interpreter = CommandInterpreter::new(
            self.state.clone(),
            downlink.clone(),
            camera.clone(),
            bringup,
            self.restart.clone(),
            CommandTiming::from_settings(settings),
        );
        let command_watchdog = watchdog.register("command")?;
        tasks.spawn(async move { ("command", interpreter.run(command_rx, command_watchdog).await) });

        let telemetry = TelemetryProducer::new(
            FrameBuilder::new(&settings.callsign, settings.debug_mode),
            gps,
            temperature,
            VoltageMonitor::new(voltage, VoltageDivider::from_settings(settings), downlink.clone()),
            downlink.clone(),
            TelemetryTiming::from_settings(settings),
        );
        let telemetry_watchdog = watchdog.register("telemetry")?;
        tasks.spawn(async move {
            telemetry.run(telemetry_watchdog).await;
            ("telemetry", Ok(()))
        });

        let images = ImageProducer::new(
            self.state.clone(),
            camera,
            codec,
            downlink.clone(),
            annunciator,
            &settings.callsign,
            ImageTiming::from_settings(settings),
        );
        let image_watchdog = watchdog.register("image")?;
        let _image_context = match self.image_execution {
            ImageExecution::DedicatedThread => Some(ImageContext::spawn(images, image_watchdog)?),
            ImageExecution::SameRuntime => {
                tasks.spawn(async move {
                    images.run(image_watchdog).await;
                    ("image", Ok(()))
                });
                None
            }
        };

        let relay = RelayForwarder::new(self.state.clone(), downlink, RelayTiming::from_settings(settings));
        let relay_watchdog = watchdog.register("relay")?;
        tasks.spawn(async move {
            relay.run(relay_rx, relay_watchdog).await;
            ("relay", Ok(()))
        });

        let supervisor = watchdog.clone();
        let restart = self.restart.clone();
        let poll = ms(settings.watchdog_poll_ms);
        tasks.spawn(async move {
            let reason = supervisor.supervise(restart, poll).await;
            ("supervisor", Err(PayloadError::Restart(reason)))
        });

        self.state.set_status_field(StatusField::BuzzerEnabled, false);
        info!(tasks = watchdog.supervised(), "payload running");

        let outcome = self.await_restart(&mut tasks).await;
        // Producers still waiting for a slot give up instead of outliving the boot.
        tx_queue.close();
        tasks.shutdown().await;
        outcome
    }

    async fn init_positioning(&self, gps: &mut dyn GpsReceiver, downlink: &Downlink, annunciator: &Annunciator) {
        downlink.report_bare(StatusCode::GpsInitStart).await;
        if self.settings.debug_mode {
            downlink.report_bare(StatusCode::GpsInitOk).await;
            return;
        }

        let limit = ms(self.settings.gps_init_timeout_ms);
        if await_first_fix(gps, limit, ms(self.settings.gps_init_poll_ms)).await {
            info!("positioning fix acquired");
            downlink.report_bare(StatusCode::GpsInitOk).await;
        } else {
            warn!("no positioning fix within {:?}", limit);
            downlink.report(StatusCode::GpsInitFail, "Timeout".into()).await;
            annunciator.mark_failed();
        }
    }

    async fn await_restart(&self, tasks: &mut JoinSet<TaskResult>) -> Result<RestartReason, PayloadError> {
        loop {
            tokio::select! {
                reason = self.restart.wait() => return Ok(reason),
                joined = tasks.join_next() => match joined {
                    Some(Ok((_, Err(PayloadError::Restart(reason))))) => return Ok(reason),
                    Some(Ok((task, Err(e)))) => {
                        error!(task, "task failed: {}", e);
                        return Err(e);
                    }
                    Some(Ok((task, Ok(())))) => return Err(PayloadError::TaskEnded(task)),
                    Some(Err(e)) => {
                        error!("task aborted: {}", e);
                        return Err(PayloadError::TaskEnded("unknown"));
                    }
                    None => return Err(PayloadError::TaskEnded("all")),
                },
            }
        }
    }
}

/// The image pipeline's thread. Dropping it stops the pipeline.
struct ImageContext {
    stop: Option<oneshot::Sender<()>>,
}

impl ImageContext {
    fn spawn(producer: ImageProducer, watchdog: WatchdogHandle) -> Result<Self, PayloadError> {
        let (stop, stopped) = oneshot::channel::<()>();
        thread::Builder::new().name("image".into()).spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(runtime) => runtime,
                Err(e) => {
                    // The watchdog notices the silent task and restarts.
                    error!("image runtime failed to start: {}", e);
                    return;
                }
            };
            runtime.block_on(async move {
                tokio::select! {
                    _ = producer.run(watchdog) => {}
                    _ = stopped => debug!("image pipeline stopped"),
                }
            });
        })?;
        Ok(Self { stop: Some(stop) })
    }
}

impl Drop for ImageContext {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}
