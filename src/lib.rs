//! # NB-IoT Water Meter Terminal Simulator
//!
//! Simulation core of a battery-powered water meter terminal: an accelerated
//! virtual clock, the meter's regulatory alarm timers, the modem's
//! read/report/retry state machine and the binary uplink packet.
//!
//! ## Quick Start
//!
//! ```rust
//! use nbmeter::{SimulationConfig, SimulationContext, SimulationInput};
//! use nbmeter::clock::SpeedLevel;
//! use std::time::Duration;
//!
//! let config = SimulationConfig {
//!     start_time_ms: Some(1_767_225_600_000),
//!     ..SimulationConfig::default()
//! };
//! let mut sim = SimulationContext::new(&config).unwrap();
//! sim.submit(SimulationInput::SetSpeed(SpeedLevel::Max)).unwrap();
//!
//! // One real second at MAX speed is a virtual day.
//! let report = sim.tick_with(Duration::from_secs(1));
//! assert_eq!(report.dt_ms, 86_400_000);
//! ```
//!
//! ## Architecture
//!
//! - [`clock`] - Virtual clock and speed levels
//! - [`device`] - Meter model, alarm timers and modem state machine
//! - [`packet`] - Uplink packet encoder/decoder
//! - [`events`] - Log events, packet records and event sinks
//! - [`protocol`] - JSON control protocol used by the simulator server
//! - [`simulation`] - The driver that owns and ticks everything
//! - [`config`] - Simulation configuration

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

extern crate alloc;

pub mod clock;
pub mod config;
pub mod device;
pub mod events;
pub mod packet;
pub mod protocol;
pub mod simulation;

// Re-export main public types for convenience
pub use clock::{SpeedLevel, VirtualClock};
pub use config::{ConfigError, SimulationConfig};
pub use device::{MeterModel, ModemController, ModemMode};
pub use events::{EventCategory, EventSink, LogEvent, PacketRecord};
pub use packet::{DecodedPacket, PacketError, UplinkPacket};
pub use simulation::{SimulationContext, SimulationInput, SimulationSnapshot, TickReport};
