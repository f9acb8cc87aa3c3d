//! Mock board for testing without real hardware
//!
//! Simulates the firmware side of the command/notification protocol: object
//! creation commands allocate numeric ids and queue acknowledgement frames,
//! removal commands free them, and module-info reads answer from a
//! configurable table. Tests drive the acks into the board explicitly, so
//! timing (including "the ack never arrives") is fully controlled.
//!
//! # Example
//!
//! ```ignore
//! let (transport, handle) = MockBoard::new();
//! let mut board = Board::new(Box::new(transport), LinkConfig::default());
//! let pending = board.add_route(desc, |c| c.stream().map(|_| ()));
//! for frame in handle.take_notifications() {
//!     board.on_notification(&frame);
//! }
//! ```

use crate::protocol::{self, READ_INFO, REGISTER_MASK};
use crate::transport::Transport;
use crate::error::Result;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct MockState {
    sent: Vec<Vec<u8>>,
    outbox: VecDeque<Vec<u8>>,
    processors: BTreeSet<u8>,
    events: BTreeSet<u8>,
    loggers: BTreeSet<u8>,
    timers: BTreeSet<u8>,
    next_processor: u8,
    next_event: u8,
    next_logger: u8,
    next_timer: u8,
    module_info: HashMap<u8, Vec<u8>>,
    suppressed: HashSet<(u8, u8)>,
    disconnected: bool,
}

/// Transport implementation backed by the simulated firmware
pub struct MockBoard {
    state: Arc<Mutex<MockState>>,
}

/// Test-side handle observing and steering the simulated firmware
#[derive(Clone)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockBoard {
    /// Create a mock transport and its test handle
    pub fn new() -> (Self, MockHandle) {
        let mut state = MockState::default();
        // Module info payload is [implementation, revision, extra...]
        state.module_info.insert(protocol::modules::DATA_PROCESSOR, vec![0, 2]);
        state.module_info.insert(protocol::modules::EVENT, vec![0, 0]);
        state.module_info.insert(protocol::modules::LOGGING, vec![0, 2, 0x08]);
        state.module_info.insert(protocol::modules::TIMER, vec![0, 0]);

        let state = Arc::new(Mutex::new(state));
        (
            Self {
                state: state.clone(),
            },
            MockHandle { state },
        )
    }
}

impl Transport for MockBoard {
    fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.sent.push(frame.to_vec());
        if frame.len() < 2 {
            return Ok(());
        }
        let module = frame[0];
        let register = frame[1];

        if register == READ_INFO {
            if let Some(info) = state.module_info.get(&module).cloned() {
                let mut resp = vec![module, READ_INFO];
                resp.extend(info);
                state.outbox.push_back(resp);
            }
            return Ok(());
        }

        // Suppressed creates vanish on the wire: no allocation, no ack
        if state.suppressed.contains(&(module, register & REGISTER_MASK)) {
            return Ok(());
        }

        let ack = |state: &mut MockState, module: u8, register: u8, id: u8| {
            state.outbox.push_back(vec![module, register, id]);
        };

        match (module, register & REGISTER_MASK) {
            (protocol::modules::DATA_PROCESSOR, protocol::data_processor::ADD) => {
                let id = state.next_processor;
                state.next_processor += 1;
                state.processors.insert(id);
                ack(&mut state, module, protocol::data_processor::ADD, id);
            }
            (protocol::modules::DATA_PROCESSOR, protocol::data_processor::REMOVE) => {
                if let Some(&id) = frame.get(2) {
                    state.processors.remove(&id);
                }
            }
            (protocol::modules::EVENT, protocol::event::ENTRY) => {
                let id = state.next_event;
                state.next_event += 1;
                state.events.insert(id);
                ack(&mut state, module, protocol::event::ENTRY, id);
            }
            (protocol::modules::EVENT, protocol::event::REMOVE) => {
                if let Some(&id) = frame.get(2) {
                    state.events.remove(&id);
                }
            }
            (protocol::modules::LOGGING, protocol::logging::TRIGGER) => {
                let id = state.next_logger;
                state.next_logger += 1;
                state.loggers.insert(id);
                ack(&mut state, module, protocol::logging::TRIGGER, id);
            }
            (protocol::modules::LOGGING, protocol::logging::REMOVE) => {
                if let Some(&id) = frame.get(2) {
                    state.loggers.remove(&id);
                }
            }
            (protocol::modules::TIMER, protocol::timer::ENTRY) => {
                let id = state.next_timer;
                state.next_timer += 1;
                state.timers.insert(id);
                ack(&mut state, module, protocol::timer::ENTRY, id);
            }
            (protocol::modules::TIMER, protocol::timer::REMOVE) => {
                if let Some(&id) = frame.get(2) {
                    state.timers.remove(&id);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn read_characteristic(&mut self, _id: u16) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn service_exists(&self, _id: u16) -> bool {
        !self.state.lock().unwrap().disconnected
    }

    fn disconnect(&mut self) {
        self.state.lock().unwrap().disconnected = true;
    }
}

impl MockHandle {
    /// Drain queued firmware notifications (acks, module info responses)
    pub fn take_notifications(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().outbox.drain(..).collect()
    }

    /// All frames the host has sent so far, in order
    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().sent.clone()
    }

    /// Forget previously recorded frames
    pub fn clear_sent(&self) {
        self.state.lock().unwrap().sent.clear();
    }

    /// Ids of processors currently allocated on the simulated firmware
    pub fn allocated_processors(&self) -> Vec<u8> {
        self.state.lock().unwrap().processors.iter().copied().collect()
    }

    /// Ids of event entries currently allocated
    pub fn allocated_events(&self) -> Vec<u8> {
        self.state.lock().unwrap().events.iter().copied().collect()
    }

    /// Ids of log triggers currently allocated
    pub fn allocated_loggers(&self) -> Vec<u8> {
        self.state.lock().unwrap().loggers.iter().copied().collect()
    }

    /// Ids of timers currently allocated
    pub fn allocated_timers(&self) -> Vec<u8> {
        self.state.lock().unwrap().timers.iter().copied().collect()
    }

    /// Silently drop commands on `(module, register)`, simulating frames
    /// lost on the wire: nothing is allocated and no ack comes back
    pub fn suppress(&self, module: u8, register: u8) {
        self.state.lock().unwrap().suppressed.insert((module, register));
    }

    /// Stop dropping commands on `(module, register)`
    pub fn restore(&self, module: u8, register: u8) {
        self.state.lock().unwrap().suppressed.remove(&(module, register));
    }

    /// Override a module's info payload: `[implementation, revision, extra...]`
    pub fn set_module_info(&self, module: u8, info: Vec<u8>) {
        self.state.lock().unwrap().module_info.insert(module, info);
    }

    /// Queue an arbitrary notification frame, e.g. simulated sensor data
    pub fn emit(&self, frame: Vec<u8>) {
        self.state.lock().unwrap().outbox.push_back(frame);
    }

    /// Whether the host called disconnect on the transport
    pub fn is_disconnected(&self) -> bool {
        self.state.lock().unwrap().disconnected
    }
}
