//! Route construction and lifetime management
//!
//! A route ties one producer signal to its derived on-board processors and
//! terminal consumers (stream, log, react). Callers describe the pipeline
//! with a fluent builder callback; the callback only stages requests; every
//! derived descriptor is computed deterministically up front, so the wire
//! shape of the whole pipeline is known before any firmware round trip.
//! The board then drains the staged specs through the provisioning engines
//! in a fixed order (processors → loggers → events) and assembles the
//! immutable [`Route`] handle on success.

pub mod builder;
pub mod registry;
pub mod route;
pub(crate) mod state;

pub use builder::RouteComponent;
pub use registry::RouteRegistry;
pub use route::{Consumer, ConsumerKind, Observer, ObserverId, Route, RouteId, Subscriber, TimerId, TimerTask};
