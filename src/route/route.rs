//! Provisioned route handles and consumers
//!
//! A [`Route`] is the immutable record of one successful construction: the
//! firmware ids it owns, the consumers in builder call order, and the names
//! it registered. Decoded samples flow to subscribers over crossbeam
//! channels; a consumer without a live subscriber drops its samples.

use crate::codec::Value;
use crate::descriptor::DescId;
use crate::error::{LinkError, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::collections::VecDeque;

/// Monotonically increasing route handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteId(pub(crate) u32);

/// Handle to a standalone observer reaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(pub(crate) u32);

/// Handle to a provisioned on-board timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub(crate) u32);

/// Receiving half handed to subscribers; samples arrive in decode order
pub type Subscriber = Receiver<Value>;

/// What a consumer does with its signal's data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerKind {
    /// Live notifications while subscribed
    Stream,
    /// On-board log entries, merged per download
    Log,
}

/// Per-log-id reassembly buffer for signals spanning several log entries
#[derive(Debug)]
struct LogSlot {
    id: u8,
    chunks: VecDeque<Vec<u8>>,
}

/// One terminal endpoint of a route, at its builder call position
#[derive(Debug)]
pub struct Consumer {
    desc: DescId,
    kind: ConsumerKind,
    sender: Option<Sender<Value>>,
    slots: Vec<LogSlot>,
}

impl Consumer {
    pub(crate) fn new(desc: DescId, kind: ConsumerKind) -> Self {
        Self {
            desc,
            kind,
            sender: None,
            slots: Vec::new(),
        }
    }

    pub fn descriptor(&self) -> DescId {
        self.desc
    }

    pub fn kind(&self) -> ConsumerKind {
        self.kind
    }

    /// Log ids owned by this consumer, in chunk order
    pub(crate) fn set_log_ids(&mut self, ids: &[u8]) {
        self.slots = ids
            .iter()
            .map(|&id| LogSlot {
                id,
                chunks: VecDeque::new(),
            })
            .collect();
    }

    pub(crate) fn log_ids(&self) -> Vec<u8> {
        self.slots.iter().map(|s| s.id).collect()
    }

    pub(crate) fn owns_log_id(&self, id: u8) -> bool {
        self.slots.iter().any(|s| s.id == id)
    }

    /// Open a fresh subscriber channel, replacing any previous one
    pub(crate) fn attach(&mut self) -> Subscriber {
        let (tx, rx) = unbounded();
        self.sender = Some(tx);
        rx
    }

    pub(crate) fn detach(&mut self) {
        self.sender = None;
    }

    pub fn is_subscribed(&self) -> bool {
        self.sender.is_some()
    }

    /// Deliver one decoded value; detaches if the subscriber hung up
    pub(crate) fn deliver(&mut self, value: Value) {
        if let Some(tx) = &self.sender {
            if tx.send(value).is_err() {
                self.sender = None;
            }
        }
    }

    /// Accept one downloaded log chunk. Returns the merged row bytes once
    /// every slot has a chunk for the row; a starved slot never forces a
    /// partial flush.
    pub(crate) fn accept_log_chunk(&mut self, log_id: u8, bytes: &[u8]) -> Option<Vec<u8>> {
        let slot = self.slots.iter_mut().find(|s| s.id == log_id)?;
        slot.chunks.push_back(bytes.to_vec());

        if self.slots.iter().any(|s| s.chunks.is_empty()) {
            return None;
        }
        let mut row = Vec::new();
        for slot in &mut self.slots {
            row.extend(slot.chunks.pop_front().unwrap());
        }
        Some(row)
    }

    /// Deepest per-slot backlog, for download diagnostics
    pub fn pending_chunk_depth(&self) -> usize {
        self.slots.iter().map(|s| s.chunks.len()).max().unwrap_or(0)
    }
}

/// A successfully provisioned route
#[derive(Debug)]
pub struct Route {
    id: RouteId,
    consumers: Vec<Consumer>,
    /// Firmware processor ids in creation order
    pub(crate) processors: Vec<u8>,
    /// Firmware event ids in creation order
    pub(crate) events: Vec<u8>,
    /// Names this route registered board-wide
    pub(crate) names: Vec<String>,
    valid: bool,
}

impl Route {
    pub(crate) fn new(
        id: RouteId,
        consumers: Vec<Consumer>,
        processors: Vec<u8>,
        events: Vec<u8>,
        names: Vec<String>,
    ) -> Self {
        Self {
            id,
            consumers,
            processors,
            events,
            names,
            valid: true,
        }
    }

    pub fn id(&self) -> RouteId {
        self.id
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Flip the valid flag off; returns whether this call did the flip.
    /// Removal is idempotent through this.
    pub(crate) fn invalidate(&mut self) -> bool {
        std::mem::replace(&mut self.valid, false)
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    pub fn consumer(&self, position: usize) -> Result<&Consumer> {
        self.consumers.get(position).ok_or_else(|| {
            LinkError::InvalidRoute(format!(
                "route has {} consumers, position {position} does not exist",
                self.consumers.len()
            ))
        })
    }

    pub(crate) fn consumer_mut(&mut self, position: usize) -> Result<&mut Consumer> {
        let count = self.consumers.len();
        self.consumers.get_mut(position).ok_or_else(|| {
            LinkError::InvalidRoute(format!(
                "route has {count} consumers, position {position} does not exist"
            ))
        })
    }

    pub(crate) fn consumers_mut(&mut self) -> impl Iterator<Item = &mut Consumer> {
        self.consumers.iter_mut()
    }

    pub fn consumers(&self) -> impl Iterator<Item = &Consumer> {
        self.consumers.iter()
    }

    /// Log ids across every logged consumer, in consumer order
    pub(crate) fn logger_ids(&self) -> Vec<u8> {
        self.consumers.iter().flat_map(|c| c.log_ids()).collect()
    }
}

/// A standalone always-silent reaction, provisioned outside any route
#[derive(Debug)]
pub struct Observer {
    id: ObserverId,
    /// Firmware event ids in creation order
    pub(crate) events: Vec<u8>,
    valid: bool,
}

impl Observer {
    pub(crate) fn new(id: ObserverId, events: Vec<u8>) -> Self {
        Self {
            id,
            events,
            valid: true,
        }
    }

    pub fn id(&self) -> ObserverId {
        self.id
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub(crate) fn invalidate(&mut self) -> bool {
        std::mem::replace(&mut self.valid, false)
    }
}

/// A provisioned on-board timer
#[derive(Debug)]
pub struct TimerTask {
    id: TimerId,
    /// Firmware-assigned timer instance
    pub(crate) firmware_id: u8,
    /// Descriptor of the timer's fire signal, usable as a reaction trigger
    pub(crate) desc: DescId,
    pub period_ms: u32,
    pub repetitions: u16,
    valid: bool,
}

impl TimerTask {
    pub(crate) fn new(
        id: TimerId,
        firmware_id: u8,
        desc: DescId,
        period_ms: u32,
        repetitions: u16,
    ) -> Self {
        Self {
            id,
            firmware_id,
            desc,
            period_ms,
            repetitions,
            valid: true,
        }
    }

    pub fn id(&self) -> TimerId {
        self.id
    }

    /// Signal fired on each tick; pass to `add_observer` to react to it
    pub fn trigger(&self) -> DescId {
        self.desc
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub(crate) fn invalidate(&mut self) -> bool {
        std::mem::replace(&mut self.valid, false)
    }
}
