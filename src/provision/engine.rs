//! Generic batch-provisioning engine
//!
//! Drains an ordered queue of creation requests one at a time. Each step
//! emits the request's command frames, then waits for the firmware to
//! acknowledge with the allocated id(s). Timeouts fail the whole batch and
//! produce removal frames for everything allocated so far, in reverse
//! creation order, so the firmware ends the batch with zero residue.
//!
//! The engine is event-driven and pure: callers feed it [`EngineEvent`]s and
//! transmit whatever frames the returned [`EngineStep`] carries. Deadlines
//! are computed from a caller-supplied `now`, never from wall-clock reads.

use crate::error::LinkError;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Byte substitution applied when an item starts, wiring in an id allocated
/// earlier in the same batch (e.g. a fuser referencing buffer processors).
#[derive(Debug, Clone)]
pub struct FramePatch {
    /// Index of the frame within the item
    pub frame: usize,
    /// Byte offset within that frame
    pub byte: usize,
    /// Tag of the earlier item whose first allocated id is written here
    pub source_tag: usize,
}

/// One pending firmware-object creation request
#[derive(Debug, Clone)]
pub struct ProvisionItem {
    /// Command frames sent back-to-back when the item starts
    pub frames: Vec<Vec<u8>>,
    /// Number of allocation acknowledgements expected; multiplies the timeout
    pub ids_required: usize,
    /// Caller-defined tag identifying the item in the completed list
    pub tag: usize,
    /// Same-batch id substitutions applied before sending
    pub patches: Vec<FramePatch>,
}

/// A successfully provisioned item and its firmware-assigned ids
#[derive(Debug, Clone)]
pub struct CompletedItem {
    pub tag: usize,
    pub ids: Vec<u8>,
}

/// Input events consumed by the engine
#[derive(Debug, Clone, Copy)]
pub enum EngineEvent {
    /// Firmware acknowledged with an allocated id
    Ack(u8),
    /// The armed deadline passed without an acknowledgement
    TimedOut,
}

/// Outcome of one engine transition
#[derive(Debug)]
pub enum EngineStep {
    /// Transmit these frames (possibly none) and keep waiting for acks
    Continue { send: Vec<Vec<u8>> },
    /// Batch finished; items in creation order
    Done { completed: Vec<CompletedItem> },
    /// Batch failed; transmit the removal frames, then surface the error
    Failed {
        rollback: Vec<Vec<u8>>,
        error: LinkError,
    },
}

#[derive(Debug)]
struct InFlight {
    item: ProvisionItem,
    ids: Vec<u8>,
    deadline: Instant,
}

#[derive(Debug)]
enum State {
    Idle,
    Draining {
        queue: VecDeque<ProvisionItem>,
        current: InFlight,
        completed: Vec<CompletedItem>,
    },
}

/// Sequential handshake engine for one firmware module
#[derive(Debug)]
pub struct ProvisionEngine {
    module: u8,
    create_register: u8,
    remove_register: u8,
    name: &'static str,
    state: State,
}

impl ProvisionEngine {
    pub fn new(module: u8, create_register: u8, remove_register: u8, name: &'static str) -> Self {
        Self {
            module,
            create_register,
            remove_register,
            name,
            state: State::Idle,
        }
    }

    pub fn module(&self) -> u8 {
        self.module
    }

    pub fn create_register(&self) -> u8 {
        self.create_register
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::Idle)
    }

    /// Deadline of the in-flight request, if any
    pub fn deadline(&self) -> Option<Instant> {
        match &self.state {
            State::Idle => None,
            State::Draining { current, .. } => Some(current.deadline),
        }
    }

    /// Begin draining a batch. An empty batch completes immediately.
    /// Only one batch may be in flight per engine.
    pub fn start(&mut self, items: Vec<ProvisionItem>, now: Instant, timeout: Duration) -> EngineStep {
        debug_assert!(self.is_idle(), "{} engine already draining a batch", self.name);
        tracing::debug!(module = self.module, items = items.len(), "starting provisioning batch");
        self.advance(items.into(), Vec::new(), now, timeout)
    }

    /// Feed one event into the engine
    pub fn handle(&mut self, event: EngineEvent, now: Instant, timeout: Duration) -> EngineStep {
        let state = std::mem::replace(&mut self.state, State::Idle);
        let State::Draining {
            queue,
            mut current,
            mut completed,
        } = state
        else {
            // Spurious event after the batch resolved; nothing to do
            return EngineStep::Continue { send: Vec::new() };
        };

        match event {
            EngineEvent::Ack(id) => {
                current.ids.push(id);
                tracing::debug!(
                    module = self.module,
                    id,
                    got = current.ids.len(),
                    need = current.item.ids_required,
                    "provisioning ack"
                );
                if current.ids.len() >= current.item.ids_required {
                    completed.push(CompletedItem {
                        tag: current.item.tag,
                        ids: current.ids,
                    });
                    self.advance(queue, completed, now, timeout)
                } else {
                    self.state = State::Draining {
                        queue,
                        current,
                        completed,
                    };
                    EngineStep::Continue { send: Vec::new() }
                }
            }
            EngineEvent::TimedOut => {
                let mut allocated: Vec<u8> = completed
                    .iter()
                    .flat_map(|c| c.ids.iter().copied())
                    .collect();
                allocated.extend(current.ids.iter().copied());
                tracing::warn!(
                    module = self.module,
                    rolled_back = allocated.len(),
                    "provisioning timed out, rolling back batch"
                );
                let rollback = allocated
                    .into_iter()
                    .rev()
                    .map(|id| vec![self.module, self.remove_register, id])
                    .collect();
                EngineStep::Failed {
                    rollback,
                    error: LinkError::Timeout(format!(
                        "{} creation not acknowledged by firmware",
                        self.name
                    )),
                }
            }
        }
    }

    fn advance(
        &mut self,
        mut queue: VecDeque<ProvisionItem>,
        completed: Vec<CompletedItem>,
        now: Instant,
        timeout: Duration,
    ) -> EngineStep {
        match queue.pop_front() {
            None => EngineStep::Done { completed },
            Some(mut item) => {
                for patch in &item.patches {
                    if let Some(src) = completed.iter().find(|c| c.tag == patch.source_tag) {
                        if let Some(&id) = src.ids.first() {
                            item.frames[patch.frame][patch.byte] = id;
                        }
                    }
                }
                let send = item.frames.clone();
                let deadline = now + timeout * item.ids_required.max(1) as u32;
                self.state = State::Draining {
                    queue,
                    current: InFlight {
                        item,
                        ids: Vec::new(),
                        deadline,
                    },
                    completed,
                };
                EngineStep::Continue { send }
            }
        }
    }
}
