//! Event (on-board reaction) creation
//!
//! A reaction is a program of command frames the firmware replays when a
//! trigger signal fires. The host captures the program by running the
//! caller's reaction callback against an explicit [`CommandRecorder`] sink;
//! commands recorded there are never transmitted. Passing the sink as a
//! capability makes nested recording structurally impossible: an inner
//! callback simply has no sink unless one is handed to it.
//!
//! Each recorded command becomes one firmware event entry (entry command +
//! parameter command, one allocated id).

use crate::descriptor::{DescId, DescriptorArena};
use crate::error::{LinkError, Result};
use crate::protocol::{self, NO_INSTANCE};
use crate::provision::engine::ProvisionItem;

/// Recording sink handed to reaction callbacks
#[derive(Debug)]
pub struct CommandRecorder {
    frames: Vec<Vec<u8>>,
    max_commands: usize,
    max_frame_len: usize,
}

impl CommandRecorder {
    pub(crate) fn new(max_commands: usize, max_frame_len: usize) -> Self {
        Self {
            frames: Vec::new(),
            max_commands,
            max_frame_len,
        }
    }

    /// Capture one command frame into the reaction program
    pub fn record(&mut self, frame: Vec<u8>) -> Result<()> {
        if frame.len() < 2 {
            return Err(LinkError::InvalidRoute(
                "recorded command needs at least the 2 header bytes".to_string(),
            ));
        }
        if frame.len() > self.max_frame_len {
            return Err(LinkError::InvalidRoute(format!(
                "recorded command is {} bytes, frame limit is {}",
                frame.len(),
                self.max_frame_len
            )));
        }
        if self.frames.len() >= self.max_commands {
            return Err(LinkError::InvalidRoute(format!(
                "reaction exceeds the {}-command recording limit",
                self.max_commands
            )));
        }
        self.frames.push(frame);
        Ok(())
    }

    /// Convenience: record `[module, register, ...payload]`
    pub fn record_command(&mut self, module: u8, register: u8, payload: &[u8]) -> Result<()> {
        self.record(protocol::command(module, register, payload))
    }

    /// Number of commands captured so far
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub(crate) fn into_frames(self) -> Vec<Vec<u8>> {
        self.frames
    }
}

/// Build the creation requests for one reaction: one item per recorded
/// command, tagged `base_tag`, `base_tag + 1`, ...
pub fn create_items(
    arena: &DescriptorArena,
    trigger: DescId,
    commands: &[Vec<u8>],
    base_tag: usize,
) -> Vec<ProvisionItem> {
    let trig = arena.get(trigger);
    commands
        .iter()
        .enumerate()
        .map(|(i, cmd)| {
            let entry = protocol::command(
                protocol::modules::EVENT,
                protocol::event::ENTRY,
                &[
                    trig.module,
                    trig.register,
                    trig.instance.unwrap_or(NO_INSTANCE),
                    cmd[0],
                    cmd[1],
                    (cmd.len() - 2) as u8,
                ],
            );
            let parameters = protocol::command(
                protocol::modules::EVENT,
                protocol::event::CMD_PARAMETERS,
                &cmd[2..],
            );
            ProvisionItem {
                frames: vec![entry, parameters],
                ids_required: 1,
                tag: base_tag + i,
                patches: Vec::new(),
            }
        })
        .collect()
}

/// Removal frame for a provisioned event entry
pub fn remove_frame(id: u8) -> Vec<u8> {
    vec![protocol::modules::EVENT, protocol::event::REMOVE, id]
}
