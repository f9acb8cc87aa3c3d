//! Wire protocol constants and frame helpers
//!
//! Command frames are `[module, register, ...payload]` or
//! `[module, register, instance, ...payload]` for per-instance registers.
//! Register ids carry two flag bits: the high bit (0x80) marks read
//! framing, the second-high bit (0x40) marks a register as actively
//! notifying ("live").

/// Read framing bit on a register id
pub const READ_BIT: u8 = 0x80;

/// Live (actively notifying) bit on a register id
pub const LIVE_BIT: u8 = 0x40;

/// Mask stripping both flag bits from a register id
pub const REGISTER_MASK: u8 = 0x3F;

/// Sentinel instance id meaning "no instance"
pub const NO_INSTANCE: u8 = 0xFF;

/// Module info read marker: `[module, 0x80]` elicits `[module, 0x80, impl, rev, ...]`
pub const READ_INFO: u8 = 0x80;

/// Module ids used by the core machinery
pub mod modules {
    pub const DATA_PROCESSOR: u8 = 0x09;
    pub const EVENT: u8 = 0x0A;
    pub const LOGGING: u8 = 0x0B;
    pub const TIMER: u8 = 0x0C;
}

/// Data processor module registers
pub mod data_processor {
    pub const ADD: u8 = 0x02;
    pub const NOTIFY: u8 = 0x03;
    pub const STATE: u8 = 0x04;
    pub const PARAMETER: u8 = 0x05;
    pub const REMOVE: u8 = 0x06;
    pub const NOTIFY_ENABLE: u8 = 0x07;
}

/// Event module registers
pub mod event {
    pub const ENTRY: u8 = 0x02;
    pub const CMD_PARAMETERS: u8 = 0x03;
    pub const REMOVE: u8 = 0x04;
}

/// Logging module registers
pub mod logging {
    pub const ENABLE: u8 = 0x01;
    pub const TRIGGER: u8 = 0x02;
    pub const REMOVE: u8 = 0x03;
    pub const READOUT_NOTIFY: u8 = 0x07;
}

/// Timer module registers
pub mod timer {
    pub const ENTRY: u8 = 0x02;
    pub const START: u8 = 0x03;
    pub const STOP: u8 = 0x04;
    pub const REMOVE: u8 = 0x05;
}

/// Build a `[module, register, ...payload]` frame
pub fn command(module: u8, register: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(2 + payload.len());
    frame.push(module);
    frame.push(register);
    frame.extend_from_slice(payload);
    frame
}

/// Build a `[module, register, instance, ...payload]` frame
pub fn instance_command(module: u8, register: u8, instance: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(3 + payload.len());
    frame.push(module);
    frame.push(register);
    frame.push(instance);
    frame.extend_from_slice(payload);
    frame
}

/// Pack a source byte-offset and length into the single reference byte used
/// by processor create and log trigger commands: `offset | (len - 1) << 5`
pub fn source_ref(offset: u8, len: u8) -> u8 {
    debug_assert!(len >= 1 && len <= 8);
    (offset & 0x1F) | ((len - 1) << 5)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_layout() {
        let frame = command(modules::DATA_PROCESSOR, data_processor::ADD, &[1, 2]);
        assert_eq!(frame, vec![0x09, 0x02, 1, 2]);
    }

    #[test]
    fn test_instance_command_layout() {
        let frame = instance_command(modules::DATA_PROCESSOR, data_processor::PARAMETER, 3, &[7]);
        assert_eq!(frame, vec![0x09, 0x05, 3, 7]);
    }

    #[test]
    fn test_source_ref_packing() {
        assert_eq!(source_ref(0, 1), 0x00);
        assert_eq!(source_ref(0, 4), 0x60);
        assert_eq!(source_ref(2, 2), 0x22);
    }
}
