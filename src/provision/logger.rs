//! Log trigger creation
//!
//! Logging a signal whose payload exceeds one log entry's capacity takes
//! several trigger ids, requested back-to-back: one trigger per chunk of the
//! payload. The engine multiplies its timeout by the id count accordingly.
//! Downloaded entries later arrive per-id and are re-merged by the logged
//! consumer.

use crate::descriptor::{DescId, DescriptorArena};
use crate::protocol;
use crate::provision::engine::ProvisionItem;

/// Number of trigger ids a signal of `payload_len` bytes needs
pub fn ids_for_len(payload_len: usize, chunk_len: usize) -> usize {
    payload_len.div_ceil(chunk_len).max(1)
}

/// Build the creation request logging one signal
pub fn create_item(
    arena: &DescriptorArena,
    source: DescId,
    chunk_len: usize,
    tag: usize,
) -> ProvisionItem {
    let src = arena.get(source);
    let len = src.payload_len();
    let ids = ids_for_len(len, chunk_len);

    let frames = (0..ids)
        .map(|i| {
            let chunk_offset = src.layout.offset as usize + i * chunk_len;
            let chunk = chunk_len.min(len - i * chunk_len).max(1);
            protocol::command(
                protocol::modules::LOGGING,
                protocol::logging::TRIGGER,
                &[
                    src.module,
                    src.register,
                    src.instance.unwrap_or(protocol::NO_INSTANCE),
                    protocol::source_ref(chunk_offset as u8, chunk as u8),
                ],
            )
        })
        .collect();

    ProvisionItem {
        frames,
        ids_required: ids,
        tag,
        patches: Vec::new(),
    }
}

/// Removal frame for a provisioned log trigger
pub fn remove_frame(id: u8) -> Vec<u8> {
    vec![protocol::modules::LOGGING, protocol::logging::REMOVE, id]
}
