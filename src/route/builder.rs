//! Fluent route construction API
//!
//! A [`RouteComponent`] is the cursor handed to `add_route` builder
//! callbacks. Every operation validates synchronously and stages specs into
//! the build state; nothing here talks to the firmware. Validation failures
//! are terminal and name the offending operation.

use crate::codec::Layout;
use crate::config::LinkConfig;
use crate::descriptor::{DescId, DescriptorArena, Enable, SignalClass};
use crate::error::{LinkError, Result};
use crate::protocol;
use crate::provision::engine::FramePatch;
use crate::provision::event::CommandRecorder;
use crate::provision::processor::{
    min_revision, ComparatorMode, Comparison, DifferentialMode, MathOp, PassthroughMode,
    ProcessorConfig, ProcessorKind, PulseOutput, ThresholdMode,
};
use crate::route::route::ConsumerKind;
use crate::route::state::{
    BranchFrame, BuildState, StagedConsumer, StagedFeedback, StagedProcessor, StagedReaction,
};
use std::collections::HashMap;

/// Maximum payload width the scalar-only processors accept
const SCALAR_MAX: usize = 4;

/// Cursor over the signal being built, passed to builder callbacks
#[derive(Debug)]
pub struct RouteComponent<'a> {
    arena: &'a mut DescriptorArena,
    state: &'a mut BuildState,
    /// Board-scope named producers registered by earlier routes
    board_names: &'a HashMap<String, DescId>,
    config: &'a LinkConfig,
    cursor: DescId,
    dp_revision: u8,
    logging_revision: u8,
}

impl<'a> RouteComponent<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        arena: &'a mut DescriptorArena,
        state: &'a mut BuildState,
        board_names: &'a HashMap<String, DescId>,
        config: &'a LinkConfig,
        cursor: DescId,
        dp_revision: u8,
        logging_revision: u8,
    ) -> Self {
        Self {
            arena,
            state,
            board_names,
            config,
            cursor,
            dp_revision,
            logging_revision,
        }
    }

    /// Descriptor currently under the cursor
    pub fn descriptor(&self) -> DescId {
        self.cursor
    }

    // ----- terminal consumers -------------------------------------------

    /// Stream the current signal's live notifications to the host
    pub fn stream(&mut self) -> Result<&mut Self> {
        self.require_not_null("stream")?;
        self.state.consumers.push(StagedConsumer {
            desc: self.cursor,
            kind: ConsumerKind::Stream,
        });
        Ok(self)
    }

    /// Log the current signal to on-board memory for later download
    pub fn log(&mut self) -> Result<&mut Self> {
        self.require_not_null("log")?;
        self.state.consumers.push(StagedConsumer {
            desc: self.cursor,
            kind: ConsumerKind::Log,
        });
        Ok(self)
    }

    /// Record a reaction program replayed by the firmware whenever the
    /// current signal fires. The recorder is the only way to capture
    /// commands; nesting another recording inside is impossible by
    /// construction.
    pub fn react<F>(&mut self, record: F) -> Result<&mut Self>
    where
        F: FnOnce(&mut CommandRecorder) -> Result<()>,
    {
        self.require_not_null("react")?;
        let mut recorder =
            CommandRecorder::new(self.config.max_event_commands, self.config.max_frame_len);
        record(&mut recorder)?;
        if recorder.is_empty() {
            return Err(LinkError::InvalidRoute(
                "react() recorded no commands".to_string(),
            ));
        }
        self.state.reactions.push(StagedReaction {
            trigger: self.cursor,
            commands: recorder.into_frames(),
        });
        Ok(self)
    }

    // ----- comparison / math --------------------------------------------

    /// Comparator passing matching values through
    pub fn filter(&mut self, op: Comparison, references: &[f32]) -> Result<&mut Self> {
        self.filter_with_mode(op, ComparatorMode::Absolute, references)
    }

    /// Comparator with an explicit multi-value output mode
    pub fn filter_with_mode(
        &mut self,
        op: Comparison,
        mode: ComparatorMode,
        references: &[f32],
    ) -> Result<&mut Self> {
        self.require_scalar("filter")?;
        self.require_not_fused("filter")?;
        let cur = self.arena.get(self.cursor);
        let scale = cur.scale;
        let input_len = cur.payload_len() as u8;
        let signed = cur.layout.signed;
        let refs = references
            .iter()
            .map(|r| (r * scale).round() as i32)
            .collect();
        let (out_layout, out_scale) = match mode {
            ComparatorMode::Absolute | ComparatorMode::Reference => {
                (cur.layout.clone(), scale)
            }
            ComparatorMode::Zone | ComparatorMode::Binary => (Layout::scalar(1, false), 1.0),
        };
        let config = ProcessorConfig::Comparator {
            op,
            mode,
            references: refs,
            input_len,
            signed,
        };
        self.stage_processor(config, out_layout, out_scale, Vec::new());
        Ok(self)
    }

    /// Comparator whose reference is fed back from a named producer
    pub fn filter_ref(&mut self, op: Comparison, name: &str) -> Result<&mut Self> {
        self.require_scalar("filter")?;
        self.require_not_fused("filter")?;
        self.require_name_registered("filter", name)?;
        let cur = self.arena.get(self.cursor);
        let config = ProcessorConfig::Comparator {
            op,
            mode: ComparatorMode::Absolute,
            references: vec![0],
            input_len: cur.payload_len() as u8,
            signed: cur.layout.signed,
        };
        let out_layout = cur.layout.clone();
        let out_scale = cur.scale;
        let index = self.stage_processor(config.clone(), out_layout, out_scale, Vec::new());
        self.state.feedback.push(StagedFeedback {
            name: name.to_string(),
            dest_processor: index,
            config,
        });
        Ok(self)
    }

    /// Two-operand arithmetic on the current scalar signal
    pub fn map(&mut self, op: MathOp, rhs: f32) -> Result<&mut Self> {
        self.require_scalar("map")?;
        self.require_not_fused("map")?;
        let cur = self.arena.get(self.cursor);
        let scale = cur.scale;
        // Additive operands are in engineering units; multiplicative ones
        // are dimensionless and pass through unscaled
        let operand = match op {
            MathOp::Add | MathOp::Subtract | MathOp::Modulus | MathOp::Constant => {
                (rhs * scale).round() as i32
            }
            _ => rhs.round() as i32,
        };
        let signed = cur.layout.signed
            || matches!(op, MathOp::Subtract | MathOp::Add | MathOp::Constant);
        let config = ProcessorConfig::Math {
            op,
            operand,
            input_len: cur.payload_len() as u8,
            signed: cur.layout.signed,
        };
        // Math widens its output to 4 bytes
        self.stage_processor(config, Layout::scalar(4, signed), scale, Vec::new());
        Ok(self)
    }

    /// Math processor whose operand is fed back from a named producer
    pub fn map_ref(&mut self, op: MathOp, name: &str) -> Result<&mut Self> {
        self.require_scalar("map")?;
        self.require_not_fused("map")?;
        self.require_name_registered("map", name)?;
        let cur = self.arena.get(self.cursor);
        let config = ProcessorConfig::Math {
            op,
            operand: 0,
            input_len: cur.payload_len() as u8,
            signed: cur.layout.signed,
        };
        let scale = cur.scale;
        let signed = cur.layout.signed;
        let index =
            self.stage_processor(config.clone(), Layout::scalar(4, signed), scale, Vec::new());
        self.state.feedback.push(StagedFeedback {
            name: name.to_string(),
            dest_processor: index,
            config,
        });
        Ok(self)
    }

    // ----- accumulation / rate ------------------------------------------

    /// Running average over the last `samples` values
    pub fn average(&mut self, samples: u8) -> Result<&mut Self> {
        self.require_not_null("average")?;
        self.require_len_at_most("average", 8)?;
        let cur = self.arena.get(self.cursor);
        let config = ProcessorConfig::Averager {
            input_len: cur.payload_len().min(SCALAR_MAX) as u8,
            samples,
        };
        let layout = cur.layout.clone();
        let scale = cur.scale;
        self.stage_processor(config, layout, scale, Vec::new());
        Ok(self)
    }

    /// Alias for [`Self::average`]; the firmware implements a box low-pass
    pub fn low_pass(&mut self, samples: u8) -> Result<&mut Self> {
        self.average(samples)
    }

    /// Running sum of the signal
    pub fn accumulate(&mut self) -> Result<&mut Self> {
        self.require_scalar("accumulate")?;
        let cur = self.arena.get(self.cursor);
        let config = ProcessorConfig::Accumulator {
            input_len: cur.payload_len() as u8,
            output_len: 4,
        };
        let scale = cur.scale;
        let signed = cur.layout.signed;
        self.stage_processor(config, Layout::scalar(4, signed), scale, Vec::new());
        Ok(self)
    }

    /// Count how many times the signal has fired
    pub fn count(&mut self) -> Result<&mut Self> {
        self.require_not_null("count")?;
        let config = ProcessorConfig::Counter { output_len: 4 };
        self.stage_processor(config, Layout::scalar(4, false), 1.0, Vec::new());
        Ok(self)
    }

    /// Rate-limit the signal to at most one value per `period_ms`
    pub fn limit(&mut self, period_ms: u32) -> Result<&mut Self> {
        self.require_not_null("limit")?;
        self.require_not_fused("limit")?;
        self.require_len_at_most("limit", 8)?;
        let cur = self.arena.get(self.cursor);
        let config = ProcessorConfig::Time {
            input_len: cur.payload_len() as u8,
            period_ms,
        };
        let layout = cur.layout.clone();
        let scale = cur.scale;
        self.stage_processor(config, layout, scale, Vec::new());
        Ok(self)
    }

    /// Delay the signal by `count` samples
    pub fn delay(&mut self, count: u8) -> Result<&mut Self> {
        self.require_scalar("delay")?;
        let cur = self.arena.get(self.cursor);
        let config = ProcessorConfig::Delay {
            input_len: cur.payload_len() as u8,
            count,
        };
        let layout = cur.layout.clone();
        let scale = cur.scale;
        self.stage_processor(config, layout, scale, Vec::new());
        Ok(self)
    }

    // ----- detectors -----------------------------------------------------

    /// Pulse detector over a threshold with a minimum width
    pub fn find_pulse(
        &mut self,
        threshold: f32,
        width: u16,
        output: PulseOutput,
    ) -> Result<&mut Self> {
        self.require_scalar("find_pulse")?;
        self.require_not_fused("find_pulse")?;
        let cur = self.arena.get(self.cursor);
        let scale = cur.scale;
        let config = ProcessorConfig::Pulse {
            input_len: cur.payload_len() as u8,
            threshold: (threshold * scale).round() as i32,
            width,
            output,
        };
        let (out_layout, out_scale) = match output {
            PulseOutput::Width => (Layout::scalar(2, false), 1.0),
            PulseOutput::Area => (Layout::scalar(4, cur.layout.signed), scale),
            PulseOutput::Peak => (cur.layout.clone(), scale),
            PulseOutput::OnDetect => (Layout::scalar(1, false), 1.0),
        };
        self.stage_processor(config, out_layout, out_scale, Vec::new());
        Ok(self)
    }

    /// Boundary-crossing detector with hysteresis
    pub fn threshold(
        &mut self,
        mode: ThresholdMode,
        boundary: f32,
        hysteresis: f32,
    ) -> Result<&mut Self> {
        self.require_scalar("threshold")?;
        self.require_not_fused("threshold")?;
        let cur = self.arena.get(self.cursor);
        let scale = cur.scale;
        let config = ProcessorConfig::Threshold {
            input_len: cur.payload_len() as u8,
            signed: cur.layout.signed,
            mode,
            boundary: (boundary * scale).round() as i32,
            hysteresis: (hysteresis * scale).round() as u16,
        };
        let (out_layout, out_scale) = match mode {
            ThresholdMode::Absolute => (cur.layout.clone(), scale),
            ThresholdMode::Binary => (Layout::scalar(1, true), 1.0),
        };
        self.stage_processor(config, out_layout, out_scale, Vec::new());
        Ok(self)
    }

    /// Change-magnitude detector
    pub fn differential(&mut self, mode: DifferentialMode, magnitude: f32) -> Result<&mut Self> {
        self.require_scalar("differential")?;
        self.require_not_fused("differential")?;
        let cur = self.arena.get(self.cursor);
        let scale = cur.scale;
        let config = ProcessorConfig::Differential {
            input_len: cur.payload_len() as u8,
            signed: cur.layout.signed,
            mode,
            magnitude: (magnitude * scale).round() as u32,
        };
        let (out_layout, out_scale) = match mode {
            DifferentialMode::Binary => (Layout::scalar(1, true), 1.0),
            _ => (cur.layout.clone(), scale),
        };
        self.stage_processor(config, out_layout, out_scale, Vec::new());
        Ok(self)
    }

    // ----- structural ----------------------------------------------------

    /// Conditional gate; see [`PassthroughMode`]
    pub fn gate(&mut self, mode: PassthroughMode, count: u16) -> Result<&mut Self> {
        self.require_not_null("gate")?;
        let cur = self.arena.get(self.cursor);
        let layout = cur.layout.clone();
        let scale = cur.scale;
        self.stage_processor(
            ProcessorConfig::Passthrough { mode, count },
            layout,
            scale,
            Vec::new(),
        );
        Ok(self)
    }

    /// Capture the signal into a silent on-board buffer, readable on demand
    /// and usable as a fuser input
    pub fn buffer(&mut self) -> Result<&mut Self> {
        self.require_not_null("buffer")?;
        let cur = self.arena.get(self.cursor);
        let config = ProcessorConfig::Buffer {
            input_len: cur.payload_len().min(16) as u8,
        };
        let mut layout = cur.layout.clone();
        layout.offset = 0;
        let scale = cur.scale;
        let index = self.state.processors.len();
        let produced = self.arena.derive(
            self.cursor,
            protocol::modules::DATA_PROCESSOR,
            protocol::data_processor::STATE,
            layout,
            scale,
            None,
        );
        self.state.processors.push(StagedProcessor {
            source: self.cursor,
            config,
            produced,
            patches: Vec::new(),
        });
        debug_assert_eq!(index, self.state.processors.len() - 1);
        self.cursor = produced;
        Ok(self)
    }

    /// Pack `count` consecutive values into one notification
    pub fn pack(&mut self, count: u8) -> Result<&mut Self> {
        self.require_not_null("pack")?;
        if count == 0 || count > 8 {
            return Err(LinkError::InvalidRoute(
                "pack() count must be between 1 and 8".to_string(),
            ));
        }
        let cur = self.arena.get(self.cursor);
        let packed = cur.payload_len() * count as usize;
        if packed > 12 {
            return Err(LinkError::InvalidRoute(format!(
                "pack() would produce a {packed}-byte payload, limit is 12"
            )));
        }
        let config = ProcessorConfig::Packer {
            input_len: cur.payload_len() as u8,
            count,
        };
        let layout = Layout {
            sizes: cur.layout.sizes.clone(),
            replicas: cur.layout.replicas * count,
            offset: 0,
            signed: cur.layout.signed,
        };
        let scale = cur.scale;
        self.stage_processor(config, layout, scale, Vec::new());
        Ok(self)
    }

    /// Prefix each value with the on-board tick counter
    pub fn account(&mut self) -> Result<&mut Self> {
        self.require_not_null("account")?;
        if self.logging_revision < min_revision::ACCOUNTER {
            return Err(LinkError::Unsupported(format!(
                "account() needs logging module revision {} (board reports {})",
                min_revision::ACCOUNTER,
                self.logging_revision
            )));
        }
        let cur = self.arena.get(self.cursor);
        if cur.layout.replicas > 1 {
            return Err(LinkError::InvalidRoute(
                "account() requires a single-replica signal".to_string(),
            ));
        }
        let config = ProcessorConfig::Accounter { count_len: 4 };
        let mut sizes = vec![4];
        sizes.extend(cur.layout.sizes.iter().copied());
        let layout = Layout {
            sizes,
            replicas: 1,
            offset: 0,
            signed: cur.layout.signed,
        };
        let scale = cur.scale;
        self.stage_processor(config, layout, scale, Vec::new());
        Ok(self)
    }

    /// Combine the current signal with previously buffered named signals
    /// into one fused notification
    pub fn fuse(&mut self, buffer_names: &[&str]) -> Result<&mut Self> {
        self.require_not_null("fuse")?;
        if self.dp_revision < min_revision::FUSER {
            return Err(LinkError::Unsupported(format!(
                "fuse() needs data processor revision {} (board reports {})",
                min_revision::FUSER,
                self.dp_revision
            )));
        }
        if buffer_names.is_empty() {
            return Err(LinkError::InvalidRoute(
                "fuse() needs at least one buffer name".to_string(),
            ));
        }

        let mut patches = Vec::with_capacity(buffer_names.len());
        for (i, name) in buffer_names.iter().enumerate() {
            let desc = self.state.lookup_name(name).ok_or_else(|| {
                LinkError::InvalidRoute(format!(
                    "fuse() references \"{name}\", which is not named in this route"
                ))
            })?;
            let producer = self.state.producer_of(desc).ok_or_else(|| {
                LinkError::InvalidRoute(format!(
                    "fuse() reference \"{name}\" is not a processor output"
                ))
            })?;
            if self.state.processors[producer].config.kind() != ProcessorKind::Buffer {
                return Err(LinkError::InvalidRoute(format!(
                    "fuse() reference \"{name}\" is not a buffer"
                )));
            }
            // Processor create frame: header(2) + source(3) + ref(1) +
            // type(1) + count(1), placeholders follow
            patches.push(FramePatch {
                frame: 0,
                byte: 8 + i,
                source_tag: producer,
            });
        }

        let cur = self.arena.get(self.cursor);
        let mut sizes = vec![cur.payload_len() as u8];
        for name in buffer_names {
            let desc = self.state.lookup_name(name).expect("validated above");
            sizes.push(self.arena.get(desc).payload_len() as u8);
        }
        let config = ProcessorConfig::Fuser {
            references: buffer_names.len() as u8,
        };
        let layout = Layout {
            sizes,
            replicas: 1,
            offset: 0,
            signed: cur.layout.signed,
        };
        let scale = cur.scale;
        self.stage_processor(config, layout, scale, patches);
        Ok(self)
    }

    /// Open a split over the current vector signal's lanes
    pub fn split(&mut self) -> Result<&mut Self> {
        self.arena.split(self.cursor)?;
        self.state.branches.push(BranchFrame::Split {
            origin: self.cursor,
        });
        Ok(self)
    }

    /// Move the cursor to lane `i` of the innermost open split
    pub fn index(&mut self, i: usize) -> Result<&mut Self> {
        let origin = match self.state.branches.last() {
            Some(BranchFrame::Split { origin }) => *origin,
            _ => {
                return Err(LinkError::InvalidRoute(
                    "index() without a preceding split()".to_string(),
                ))
            }
        };
        let children = &self.arena.get(origin).children;
        let child = children.get(i).copied().ok_or_else(|| {
            LinkError::InvalidRoute(format!(
                "index({i}) out of range, split has {} lanes",
                children.len()
            ))
        })?;
        self.cursor = child;
        Ok(self)
    }

    /// Open a multicast from the current signal
    pub fn multicast(&mut self) -> Result<&mut Self> {
        self.require_not_null("multicast")?;
        self.state.branches.push(BranchFrame::Multicast {
            origin: self.cursor,
        });
        Ok(self)
    }

    /// Move the cursor back to the innermost open multicast's origin
    pub fn to(&mut self) -> Result<&mut Self> {
        let origin = match self.state.branches.last() {
            Some(BranchFrame::Multicast { origin }) => *origin,
            _ => {
                return Err(LinkError::InvalidRoute(
                    "to() without a preceding multicast()".to_string(),
                ))
            }
        };
        self.cursor = origin;
        Ok(self)
    }

    /// Close the innermost open split or multicast
    pub fn end(&mut self) -> Result<&mut Self> {
        if self.state.branches.pop().is_none() {
            return Err(LinkError::InvalidRoute(
                "end() without an open split() or multicast()".to_string(),
            ));
        }
        Ok(self)
    }

    /// Register the current signal under `name` for feedback references
    /// and fuser inputs
    pub fn name(&mut self, name: &str) -> Result<&mut Self> {
        if self.state.has_name(name) || self.board_names.contains_key(name) {
            return Err(LinkError::InvalidRoute(format!(
                "name \"{name}\" is already registered"
            )));
        }
        self.state.names.push((name.to_string(), self.cursor));
        Ok(self)
    }

    // ----- validation helpers -------------------------------------------

    fn require_not_null(&self, op: &str) -> Result<()> {
        if self.arena.get(self.cursor).payload_len() == 0 {
            return Err(LinkError::InvalidRoute(format!(
                "{op}() on a signal with no payload bytes"
            )));
        }
        Ok(())
    }

    fn require_scalar(&self, op: &str) -> Result<()> {
        self.require_not_null(op)?;
        let len = self.arena.get(self.cursor).payload_len();
        if len > SCALAR_MAX {
            return Err(LinkError::InvalidRoute(format!(
                "{op}() supports at most {SCALAR_MAX}-byte payloads, signal has {len}"
            )));
        }
        Ok(())
    }

    fn require_len_at_most(&self, op: &str, max: usize) -> Result<()> {
        let len = self.arena.get(self.cursor).payload_len();
        if len > max {
            return Err(LinkError::InvalidRoute(format!(
                "{op}() supports at most {max}-byte payloads, signal has {len}"
            )));
        }
        Ok(())
    }

    fn require_not_fused(&self, op: &str) -> Result<()> {
        if self.arena.get(self.cursor).class == SignalClass::Fused {
            return Err(LinkError::InvalidRoute(format!(
                "{op}() cannot operate on sensor-fusion signals"
            )));
        }
        Ok(())
    }

    fn require_name_registered(&self, op: &str, name: &str) -> Result<()> {
        if !self.state.has_name(name) && !self.board_names.contains_key(name) {
            return Err(LinkError::InvalidRoute(format!(
                "{op}() feedback reference to unregistered name \"{name}\""
            )));
        }
        Ok(())
    }

    /// Stage a processor creating a derived signal; moves the cursor to the
    /// produced descriptor and returns the staged index.
    fn stage_processor(
        &mut self,
        config: ProcessorConfig,
        mut out_layout: Layout,
        out_scale: f32,
        patches: Vec<FramePatch>,
    ) -> usize {
        // Processor notifications carry their own payload from byte zero,
        // whatever offset the input lane had in its frame
        out_layout.offset = 0;
        let produced = self.arena.derive(
            self.cursor,
            protocol::modules::DATA_PROCESSOR,
            protocol::data_processor::NOTIFY,
            out_layout,
            out_scale,
            Some(Enable {
                register: protocol::data_processor::NOTIFY_ENABLE,
                per_instance: true,
            }),
        );
        let index = self.state.processors.len();
        self.state.processors.push(StagedProcessor {
            source: self.cursor,
            config,
            produced,
            patches,
        });
        self.cursor = produced;
        index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Layout;
    use crate::descriptor::SignalClass;

    struct Fixture {
        arena: DescriptorArena,
        state: BuildState,
        board_names: HashMap<String, DescId>,
        config: LinkConfig,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                arena: DescriptorArena::new(),
                state: BuildState::default(),
                board_names: HashMap::new(),
                config: LinkConfig::default(),
            }
        }

        fn scalar(&mut self) -> DescId {
            self.arena.sensor(
                0x05,
                0x03,
                Layout::scalar(2, false),
                1.0,
                SignalClass::Sensor,
                None,
            )
        }

        fn vector(&mut self) -> DescId {
            self.arena.sensor(
                0x03,
                0x04,
                Layout::vector(2, 3, true),
                16384.0,
                SignalClass::Sensor,
                None,
            )
        }

        fn fused(&mut self) -> DescId {
            self.arena.sensor(
                0x19,
                0x04,
                Layout::vector(4, 4, true),
                1073741824.0,
                SignalClass::Fused,
                None,
            )
        }

        fn component(&mut self, cursor: DescId) -> RouteComponent<'_> {
            RouteComponent::new(
                &mut self.arena,
                &mut self.state,
                &self.board_names,
                &self.config,
                cursor,
                3,
                2,
            )
        }
    }

    #[test]
    fn test_filter_stages_processor_and_moves_cursor() {
        let mut fx = Fixture::new();
        let src = fx.scalar();
        let mut c = fx.component(src);
        c.filter(Comparison::Gt, &[10.0]).unwrap().stream().unwrap();

        assert_eq!(fx.state.processors.len(), 1);
        assert_eq!(fx.state.consumers.len(), 1);
        let staged = &fx.state.processors[0];
        assert_eq!(staged.source, src);
        assert_eq!(fx.state.consumers[0].desc, staged.produced);
        let produced = fx.arena.get(staged.produced);
        assert_eq!(produced.module, 0x09);
        assert_eq!(produced.instance, None);
        assert_eq!(produced.parent, Some(src));
    }

    #[test]
    fn test_scalar_ops_reject_wide_payloads() {
        let mut fx = Fixture::new();
        let src = fx.vector();
        let mut c = fx.component(src);
        let err = c.filter(Comparison::Gt, &[1.0]).unwrap_err();
        assert!(matches!(err, LinkError::InvalidRoute(_)));
        assert!(c.delay(4).is_err());
        assert!(c.map(MathOp::Add, 1.0).is_err());
        assert!(c.find_pulse(1.0, 4, PulseOutput::Peak).is_err());
    }

    #[test]
    fn test_fused_signals_reject_restricted_ops() {
        let mut fx = Fixture::new();
        let src = fx.fused();
        let mut c = fx.component(src);
        assert!(c.limit(100).is_err());
        // Splitting a fused vector, then filtering a lane, is still fused
        c.split().unwrap().index(0).unwrap();
        assert!(c.filter(Comparison::Gt, &[0.5]).is_err());
        // Non-restricted ops are fine
        c.average(4).unwrap().stream().unwrap();
    }

    #[test]
    fn test_index_requires_matching_branch() {
        let mut fx = Fixture::new();
        let src = fx.vector();
        let mut c = fx.component(src);
        assert!(c.index(0).is_err());
        assert!(c.to().is_err());

        c.multicast().unwrap();
        // Innermost frame is a multicast, so index() must fail
        assert!(c.index(0).is_err());
        c.to().unwrap();
        c.end().unwrap();

        c.split().unwrap();
        assert!(c.to().is_err());
        c.index(2).unwrap().stream().unwrap();
        assert!(c.index(3).is_err());
    }

    #[test]
    fn test_split_lane_streaming_uses_lane_descriptor() {
        let mut fx = Fixture::new();
        let src = fx.vector();
        let mut c = fx.component(src);
        c.split()
            .unwrap()
            .index(1)
            .unwrap()
            .stream()
            .unwrap();
        let lane = fx.state.consumers[0].desc;
        assert_eq!(fx.arena.get(lane).layout.offset, 2);
        assert_eq!(fx.arena.get(lane).payload_len(), 2);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut fx = Fixture::new();
        let src = fx.scalar();
        {
            let mut c = fx.component(src);
            c.name("x").unwrap();
            assert!(c.name("x").is_err());
        }

        let src2 = fx.scalar();
        fx.board_names.insert("held".to_string(), src2);
        let mut c = fx.component(src2);
        assert!(c.name("held").is_err());
    }

    #[test]
    fn test_feedback_requires_registered_name() {
        let mut fx = Fixture::new();
        let src = fx.scalar();
        let mut c = fx.component(src);
        assert!(c.filter_ref(Comparison::Gt, "missing").is_err());

        c.name("thresh").unwrap();
        c.filter_ref(Comparison::Gt, "thresh").unwrap();
        assert_eq!(fx.state.feedback.len(), 1);
        assert_eq!(fx.state.feedback[0].dest_processor, 0);
    }

    #[test]
    fn test_react_captures_commands() {
        let mut fx = Fixture::new();
        let src = fx.scalar();
        let mut c = fx.component(src);
        c.react(|rec| {
            rec.record_command(0x08, 0x01, &[0x05])?;
            rec.record_command(0x08, 0x02, &[])
        })
        .unwrap();
        assert_eq!(fx.state.reactions.len(), 1);
        assert_eq!(fx.state.reactions[0].commands.len(), 2);

        // An empty recording is a validation error
        let mut c = fx.component(src);
        assert!(c.react(|_| Ok(())).is_err());
    }

    #[test]
    fn test_fuse_patches_buffer_ids() {
        let mut fx = Fixture::new();
        let scalar = fx.scalar();
        let vector = fx.vector();
        {
            let mut c = fx.component(scalar);
            c.buffer().unwrap().name("temp").unwrap();
        }
        {
            let mut c = fx.component(vector);
            c.fuse(&["temp"]).unwrap().stream().unwrap();
        }
        // buffer + fuser staged
        assert_eq!(fx.state.processors.len(), 2);
        let fuser = &fx.state.processors[1];
        assert_eq!(fuser.patches.len(), 1);
        assert_eq!(fuser.patches[0].source_tag, 0);
        // fused payload = vector (6) + buffered scalar (2)
        assert_eq!(fx.arena.get(fuser.produced).payload_len(), 8);
    }

    #[test]
    fn test_fuse_rejects_non_buffer_names() {
        let mut fx = Fixture::new();
        let src = fx.scalar();
        let mut c = fx.component(src);
        c.name("raw").unwrap();
        assert!(c.fuse(&["raw"]).is_err());
        assert!(c.fuse(&[]).is_err());
    }

    #[test]
    fn test_account_gated_by_logging_revision() {
        let mut fx = Fixture::new();
        let src = fx.scalar();
        let mut c = RouteComponent::new(
            &mut fx.arena,
            &mut fx.state,
            &fx.board_names,
            &fx.config,
            src,
            3,
            1,
        );
        assert!(matches!(c.account(), Err(LinkError::Unsupported(_))));

        let mut c = fx.component(src);
        c.account().unwrap();
        // Output layout gains a 4-byte tick prefix
        let produced = fx.state.processors.last().unwrap().produced;
        assert_eq!(fx.arena.get(produced).payload_len(), 6);
    }

    #[test]
    fn test_pack_multiplies_replicas() {
        let mut fx = Fixture::new();
        let src = fx.scalar();
        {
            let mut c = fx.component(src);
            c.pack(4).unwrap();
        }
        let produced = fx.state.processors[0].produced;
        assert_eq!(fx.arena.get(produced).payload_len(), 8);
        // pack() leaves the cursor on the produced descriptor
        let mut c = fx.component(produced);
        assert!(c.pack(8).is_err());
    }
}
