//! Command/notification dispatcher
//!
//! Routes inbound notification frames to whoever is waiting for them:
//! persistent data subscriptions keyed by `(module, register, instance)`,
//! one-shot register acknowledgements armed by the provisioning engines, and
//! pending module-info reads. Unmatched frames are dropped; the firmware
//! races host-side teardown, so late frames are expected, not exceptional.
//!
//! The dispatcher is a pure routing table: it classifies frames and counts
//! subscriber references but performs no I/O and owns no callbacks.

use crate::protocol::{READ_INFO, REGISTER_MASK};
use std::collections::{HashMap, HashSet};

/// Key addressing a notification stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerKey {
    pub module: u8,
    /// Register id with flag bits stripped
    pub register: u8,
    /// `None` matches any instance ("module, register, any")
    pub instance: Option<u8>,
}

impl HandlerKey {
    pub fn new(module: u8, register: u8, instance: Option<u8>) -> Self {
        Self {
            module,
            register: register & REGISTER_MASK,
            instance,
        }
    }
}

/// Classification of an inbound notification frame
#[derive(Debug, PartialEq, Eq)]
pub enum Inbound<'a> {
    /// Streamed or logged data for a persistent subscription
    Data { key: HandlerKey, payload: &'a [u8] },
    /// One-shot register acknowledgement for a provisioning handshake
    Ack {
        module: u8,
        register: u8,
        payload: &'a [u8],
    },
    /// Response to a pending module-info read
    ModuleInfo { module: u8, payload: &'a [u8] },
    /// No handler matched; silently dropped
    Dropped,
}

/// Routing table for inbound notifications
#[derive(Debug, Default)]
pub struct Dispatcher {
    /// Armed one-shot acknowledgement expectations; last write wins
    one_shots: HashSet<(u8, u8)>,
    /// Persistent subscription reference counts
    persistent: HashMap<HandlerKey, usize>,
    /// Modules with an outstanding info read
    module_reads: HashSet<u8>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a one-shot acknowledgement handler for `(module, register)`.
    /// Re-arming an armed key is allowed; the expectation is a set entry.
    pub fn arm_one_shot(&mut self, module: u8, register: u8) {
        self.one_shots.insert((module, register & REGISTER_MASK));
    }

    /// Disarm a one-shot expectation without consuming it
    pub fn disarm_one_shot(&mut self, module: u8, register: u8) {
        self.one_shots.remove(&(module, register & REGISTER_MASK));
    }

    /// Add a persistent subscription reference. Returns the new count, so a
    /// caller seeing 1 knows it is the first subscriber and should enable the
    /// firmware-side notify bit.
    pub fn add_persistent(&mut self, key: HandlerKey) -> usize {
        let count = self.persistent.entry(key).or_insert(0);
        *count += 1;
        *count
    }

    /// Drop a persistent subscription reference. Returns the remaining count;
    /// a caller seeing 0 is the last subscriber and should silence the
    /// firmware-side register.
    pub fn remove_persistent(&mut self, key: HandlerKey) -> usize {
        match self.persistent.get_mut(&key) {
            Some(count) if *count > 1 => {
                *count -= 1;
                *count
            }
            Some(_) => {
                self.persistent.remove(&key);
                0
            }
            None => 0,
        }
    }

    /// Current reference count for a subscription key
    pub fn count_handlers(&self, key: &HandlerKey) -> usize {
        self.persistent.get(key).copied().unwrap_or(0)
    }

    /// Record an outstanding module-info read for `module`
    pub fn expect_module_info(&mut self, module: u8) {
        self.module_reads.insert(module);
    }

    /// Classify an inbound frame, consuming any matching one-shot or
    /// module-info expectation.
    ///
    /// Dispatch order: exact `(module, register, instance)` persistent match
    /// first; then the `(module, register)` one-shot handler; then the
    /// any-instance persistent match; then a pending module-info read when
    /// byte 1 carries the read-info marker; otherwise dropped.
    pub fn classify<'a>(&mut self, frame: &'a [u8]) -> Inbound<'a> {
        if frame.len() < 2 {
            tracing::debug!(len = frame.len(), "dropping runt notification frame");
            return Inbound::Dropped;
        }
        let module = frame[0];
        let register = frame[1] & REGISTER_MASK;

        if frame.len() >= 3 {
            let exact = HandlerKey::new(module, register, Some(frame[2]));
            if self.persistent.contains_key(&exact) {
                return Inbound::Data {
                    key: exact,
                    payload: &frame[3..],
                };
            }
        }

        if self.one_shots.remove(&(module, register)) {
            return Inbound::Ack {
                module,
                register,
                payload: &frame[2..],
            };
        }

        let any = HandlerKey::new(module, register, None);
        if self.persistent.contains_key(&any) {
            return Inbound::Data {
                key: any,
                payload: &frame[2..],
            };
        }

        if frame[1] == READ_INFO && self.module_reads.remove(&module) {
            return Inbound::ModuleInfo {
                module,
                payload: &frame[2..],
            };
        }

        tracing::debug!(module, register, "no handler for notification, dropping");
        Inbound::Dropped
    }
}
