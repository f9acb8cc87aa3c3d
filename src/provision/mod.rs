//! Provisioning state machines for firmware-side objects
//!
//! Creating an on-board object (data processor, event entry, log trigger,
//! timer) is a request/response handshake: send the creation command, wait
//! for the firmware to answer with the allocated numeric id, with a short
//! timeout per round trip. One route-builder invocation generates a *batch*
//! of such requests per module, provisioned as an atomic unit: any timeout
//! rolls back every id already allocated in the batch.
//!
//! The engine itself ([`engine::ProvisionEngine`]) is a pure transition
//! function over explicit events (`Ack`/`TimedOut`): it decides which
//! frames to send but performs no I/O and owns no timers, so the rollback
//! logic is unit-testable with a fake clock.

pub mod engine;
pub mod event;
pub mod logger;
pub mod processor;

pub use engine::{CompletedItem, EngineEvent, EngineStep, FramePatch, ProvisionEngine, ProvisionItem};
pub use event::CommandRecorder;
pub use processor::{
    ActiveProcessor, Comparison, ComparatorMode, DifferentialMode, MathOp, PassthroughMode,
    ProcessorConfig, ProcessorKind, PulseOutput, ThresholdMode,
};
