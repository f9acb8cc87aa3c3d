//! Staging area accumulated while a builder callback runs
//!
//! Strictly transient: the build state is drained into the provisioning
//! phases once the callback returns and is never persisted.

use crate::descriptor::DescId;
use crate::provision::engine::FramePatch;
use crate::provision::processor::ProcessorConfig;
use crate::route::route::ConsumerKind;

/// A pending request to create one firmware-side data processor
#[derive(Debug, Clone)]
pub(crate) struct StagedProcessor {
    pub source: DescId,
    pub config: ProcessorConfig,
    /// Descriptor of the produced signal; instance promoted on ack
    pub produced: DescId,
    /// Same-batch id substitutions (fuser references)
    pub patches: Vec<FramePatch>,
}

/// A subscribed producer, in `.stream()`/`.log()` call order
#[derive(Debug, Clone)]
pub(crate) struct StagedConsumer {
    pub desc: DescId,
    pub kind: ConsumerKind,
}

/// A recorded reaction program awaiting event provisioning
#[derive(Debug, Clone)]
pub(crate) struct StagedReaction {
    pub trigger: DescId,
    pub commands: Vec<Vec<u8>>,
}

/// A named feedback binding: when the named producer fires, the firmware
/// rewrites the destination processor's parameters from its value
#[derive(Debug, Clone)]
pub(crate) struct StagedFeedback {
    pub name: String,
    /// Index into [`BuildState::processors`]
    pub dest_processor: usize,
    pub config: ProcessorConfig,
}

/// Branch bookkeeping frame; `index`/`to` look the origin up instead of
/// popping, so branch addressing cannot be reordered by consumption
#[derive(Debug, Clone, Copy)]
pub(crate) enum BranchFrame {
    Split { origin: DescId },
    Multicast { origin: DescId },
}

/// Everything one builder callback stages before provisioning starts
#[derive(Debug, Default)]
pub(crate) struct BuildState {
    pub processors: Vec<StagedProcessor>,
    pub consumers: Vec<StagedConsumer>,
    pub reactions: Vec<StagedReaction>,
    pub feedback: Vec<StagedFeedback>,
    /// Names registered in this route, in registration order
    pub names: Vec<(String, DescId)>,
    pub branches: Vec<BranchFrame>,
}

impl BuildState {
    pub fn has_name(&self, name: &str) -> bool {
        self.names.iter().any(|(n, _)| n == name)
    }

    pub fn lookup_name(&self, name: &str) -> Option<DescId> {
        self.names
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, d)| *d)
    }

    /// Index of the staged processor producing `desc`, if any
    pub fn producer_of(&self, desc: DescId) -> Option<usize> {
        self.processors.iter().position(|p| p.produced == desc)
    }
}
