//! # SensorLink: host-side driver for BLE sensor/actuator boards
//!
//! Drives a wireless sensor board over a byte-frame command/notification
//! protocol: sensors and on-board data processors are described as a graph
//! of data descriptors, wired together through fluent routes, and
//! provisioned over sequential firmware handshakes with timeout rollback.
//!
//! ## Architecture
//!
//! - **Codec**: fixed-layout little-endian payload encode/decode with
//!   scaled-float conversion
//! - **Descriptors**: arena of signal descriptors addressed by stable ids,
//!   tracking derivation, vector splits and live state
//! - **Provisioning**: one generic handshake engine per firmware module,
//!   pure and clock-injected, rolling the whole batch back on timeout
//! - **Routes**: a builder callback stages processors, consumers and
//!   reactions; the board drains them processors → loggers → events and
//!   resolves a promise with the route handle
//! - **Transport**: everything below the frame boundary lives behind the
//!   [`transport::Transport`] trait; [`mock::MockBoard`] simulates the
//!   firmware for tests
//!
//! ## Example
//!
//! ```ignore
//! use sensorlink::{Board, LinkConfig, Layout, SignalClass};
//!
//! let mut board = Board::new(transport, LinkConfig::default());
//! board.discover_core_modules();
//!
//! let accel = board.register_sensor(
//!     0x03, 0x04, Layout::vector(2, 3, true), 16384.0,
//!     SignalClass::Sensor, Some(enable),
//! );
//!
//! // Stream the x axis, log a smoothed z axis
//! let pending = board.add_route(accel, |c| {
//!     c.split()?
//!         .index(0)?
//!         .stream()?
//!         .index(2)?
//!         .average(8)?
//!         .log()?
//!         .end()
//!         .map(|_| ())
//! });
//!
//! // Pump notifications from the BLE stack
//! board.on_notification(&frame);
//! board.process_timeouts();
//! ```

pub mod board;
pub mod codec;
pub mod config;
pub mod descriptor;
pub mod dispatch;
pub mod error;
pub mod mock;
pub mod pending;
pub mod protocol;
pub mod provision;
pub mod route;
pub mod transport;

pub use board::{Board, BoardSnapshot, Clock, ManualClock, ModuleInfo, SystemClock};
pub use codec::{Layout, Value};
pub use config::LinkConfig;
pub use descriptor::{DataDescriptor, DescId, Enable, SignalClass};
pub use error::{LinkError, Result};
pub use pending::Pending;
pub use provision::{
    CommandRecorder, Comparison, ComparatorMode, DifferentialMode, MathOp, PassthroughMode,
    ProcessorConfig, ProcessorKind, PulseOutput, ThresholdMode,
};
pub use route::{
    Consumer, ConsumerKind, Observer, ObserverId, Route, RouteComponent, RouteId, Subscriber,
    TimerId, TimerTask,
};
pub use transport::Transport;
