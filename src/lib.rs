//! # habtracker
//!
//! Flight software for a high-altitude balloon payload. Four producers share
//! one half-duplex radio link (telemetry, image packets, relayed third-party
//! traffic and command acknowledgements) while the same link carries ground
//! commands up to the payload.
//!
//! ## Features
//!
//! - **Transmit arbitration**: one bounded queue, priority insertion for text
//!   frames, bounded retries so no producer ever blocks indefinitely
//! - **Link multiplexing**: a single task owns the radio, interleaving one
//!   transmit with inbound line demultiplexing per iteration
//! - **Ground commands**: `GET`/`CTL`/`SET` with status-coded ACK/NACK replies
//!   and camera reconfiguration with automatic rollback
//! - **Image downlink**: capture, pull-based packet encoding and drained-queue
//!   hand-off, on its own execution context
//! - **Relay**: rate-limited forwarding of third-party traffic
//! - **Liveness supervision**: a watchdog that restarts the payload when any
//!   task stops making progress
//!
//! ## Quick Start
//!
//! ```no_run
//! use habtracker::payload::{Hardware, Payload};
//! use habtracker::settings::PayloadSettings;
//! use habtracker::sim::{ChunkCodec, SimAlert, SimCamera, SimGps, SimRadio, SimTemperature, SimVoltage};
//!
//! # async fn boot() -> Result<(), habtracker::PayloadError> {
//! let (radio, _ground) = SimRadio::new();
//! let (camera, _) = SimCamera::new();
//! let (gps, _) = SimGps::new();
//! let (alert, _) = SimAlert::new();
//! let hardware = Hardware {
//!     radio: Box::new(radio),
//!     camera: Box::new(camera),
//!     codec: Box::new(ChunkCodec::new()),
//!     gps: Box::new(gps),
//!     voltage: Box::new(SimVoltage::new(430)),
//!     temperature: Box::new(SimTemperature::new(20.0)),
//!     alert: Box::new(alert),
//! };
//!
//! let reason = Payload::new(PayloadSettings::default()).run(hardware).await?;
//! println!("restart requested: {}", reason);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`state`] - Shared configuration and status store, transmission permit
//! - [`downlink`] - Transmit arbitration queue and status reporting
//! - [`datalink`] - Link multiplexer and inbound line demultiplexer
//! - [`command`] - Ground command interpreter
//! - [`telemetry`] - Telemetry frames and sensor oversampling
//! - [`imaging`] - Image capture, packet stream and image producer
//! - [`relay`] - Relay forwarder and its rate window
//! - [`supervisor`] - Watchdog and restart line
//! - [`payload`] - Boot sequence and task orchestration
//! - [`hal`], [`camera`], [`alert`] - Hardware contracts
//! - [`sim`] - In-memory hardware

#![deny(warnings)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::new_without_default)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

pub mod alert;
pub mod camera;
pub mod command;
pub mod datalink;
pub mod downlink;
pub mod error;
pub mod hal;
pub mod imaging;
pub mod payload;
pub mod relay;
pub mod settings;
pub mod sim;
pub mod state;
pub mod status;
pub mod supervisor;
pub mod telemetry;

// Re-export main public types for convenience
pub use error::PayloadError;
pub use payload::{Hardware, Payload};
pub use settings::PayloadSettings;
pub use state::{Configuration, StateStore, Status};
pub use status::StatusCode;
