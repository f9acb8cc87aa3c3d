//! Test builders for boards and sensor descriptors

use sensorlink::mock::{MockBoard, MockHandle};
use sensorlink::{Board, DescId, Enable, Layout, LinkConfig, ManualClock, SignalClass};
use std::sync::Arc;

/// Builder for a board wired to the simulated firmware
pub struct BoardBuilder {
    config: LinkConfig,
    dp_revision: Option<u8>,
    logging_revision: Option<u8>,
    discover: bool,
}

impl BoardBuilder {
    pub fn new() -> Self {
        Self {
            config: LinkConfig::default(),
            dp_revision: None,
            logging_revision: None,
            discover: true,
        }
    }

    pub fn config(mut self, config: LinkConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the data processor module revision the mock reports
    pub fn dp_revision(mut self, revision: u8) -> Self {
        self.dp_revision = Some(revision);
        self
    }

    /// Override the logging module revision the mock reports
    pub fn logging_revision(mut self, revision: u8) -> Self {
        self.logging_revision = Some(revision);
        self
    }

    /// Skip the module discovery round; revision gates then read as zero
    pub fn without_discovery(mut self) -> Self {
        self.discover = false;
        self
    }

    pub fn build(self) -> (Board, MockHandle, Arc<ManualClock>) {
        let (transport, handle) = MockBoard::new();
        if let Some(rev) = self.dp_revision {
            handle.set_module_info(0x09, vec![0, rev]);
        }
        if let Some(rev) = self.logging_revision {
            handle.set_module_info(0x0B, vec![0, rev, 0x08]);
        }
        let clock = ManualClock::new();
        let mut board = Board::with_clock(Box::new(transport), self.config, clock.clone());
        if self.discover {
            board.discover_core_modules();
            super::pump(&mut board, &handle);
            handle.clear_sent();
        }
        (board, handle, clock)
    }
}

impl Default for BoardBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Three-axis accelerometer: 2-byte signed lanes at 1/16384 g
pub fn accel_sensor(board: &mut Board) -> DescId {
    board.register_sensor(
        0x03,
        0x04,
        Layout::vector(2, 3, true),
        16384.0,
        SignalClass::Sensor,
        Some(Enable {
            register: 0x02,
            per_instance: false,
        }),
    )
}

/// Scalar temperature channel: 2-byte signed at 1/8 degree
pub fn temp_sensor(board: &mut Board) -> DescId {
    board.register_sensor(
        0x05,
        0x03,
        Layout::scalar(2, true),
        8.0,
        SignalClass::Sensor,
        Some(Enable {
            register: 0x01,
            per_instance: false,
        }),
    )
}

/// Quaternion output of the sensor-fusion module: 4-byte signed lanes
pub fn quaternion_sensor(board: &mut Board) -> DescId {
    board.register_sensor(
        0x19,
        0x04,
        Layout::vector(4, 4, true),
        1_073_741_824.0,
        SignalClass::Fused,
        Some(Enable {
            register: 0x02,
            per_instance: false,
        }),
    )
}
