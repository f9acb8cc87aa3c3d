//! Data processor creation and editing
//!
//! A data processor is a firmware-side stateful transform addressed by a
//! firmware-assigned id. The set of processor kinds is closed, fixed by the
//! wire protocol, so configurations form a tagged union with exhaustive
//! matching instead of runtime type inspection.
//!
//! Firmware-revision gating is centralised in [`min_revision`]; the
//! multi-value comparator silently degrades to the legacy single-value wire
//! format on data processor module revisions below the threshold.

use crate::descriptor::{DescId, DescriptorArena};
use crate::error::{LinkError, Result};
use crate::protocol::{self, NO_INSTANCE};
use crate::provision::engine::{FramePatch, ProvisionItem};
use serde::{Deserialize, Serialize};

/// Minimum data-processor module revisions for gated features, re-derived
/// from the protocol rather than copied per call site.
pub mod min_revision {
    /// Multi-value comparator wire format
    pub const MULTI_COMPARATOR: u8 = 2;
    /// Accounter (timestamp-prefixing) processor
    pub const ACCOUNTER: u8 = 2;
    /// Fuser processor combining buffered signals
    pub const FUSER: u8 = 3;
}

/// Comparison operations for the comparator processor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
}

impl Comparison {
    fn wire(self) -> u8 {
        match self {
            Comparison::Eq => 0,
            Comparison::Neq => 1,
            Comparison::Lt => 2,
            Comparison::Lte => 3,
            Comparison::Gt => 4,
            Comparison::Gte => 5,
        }
    }
}

/// Output mode of the multi-value comparator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComparatorMode {
    /// Pass the input value through on match
    Absolute,
    /// Output the matched reference value
    Reference,
    /// Output the zero-based index of the matched reference
    Zone,
    /// Output 1/0 for match/no-match
    Binary,
}

impl ComparatorMode {
    fn wire(self) -> u8 {
        match self {
            ComparatorMode::Absolute => 0,
            ComparatorMode::Reference => 1,
            ComparatorMode::Zone => 2,
            ComparatorMode::Binary => 3,
        }
    }
}

/// Arithmetic operations for the math processor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MathOp {
    Add,
    Multiply,
    Divide,
    Modulus,
    Exponent,
    Sqrt,
    LeftShift,
    RightShift,
    Subtract,
    Abs,
    Constant,
}

impl MathOp {
    fn wire(self) -> u8 {
        match self {
            MathOp::Add => 1,
            MathOp::Multiply => 2,
            MathOp::Divide => 3,
            MathOp::Modulus => 4,
            MathOp::Exponent => 5,
            MathOp::Sqrt => 6,
            MathOp::LeftShift => 7,
            MathOp::RightShift => 8,
            MathOp::Subtract => 9,
            MathOp::Abs => 10,
            MathOp::Constant => 11,
        }
    }
}

/// Output selection of the pulse detector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PulseOutput {
    Width,
    Area,
    Peak,
    OnDetect,
}

impl PulseOutput {
    fn wire(self) -> u8 {
        match self {
            PulseOutput::Width => 0,
            PulseOutput::Area => 1,
            PulseOutput::Peak => 2,
            PulseOutput::OnDetect => 3,
        }
    }
}

/// Output mode of the threshold detector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThresholdMode {
    Absolute,
    Binary,
}

/// Output mode of the differential processor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DifferentialMode {
    Absolute,
    Differential,
    Binary,
}

/// Pass mode of the passthrough gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PassthroughMode {
    All,
    Conditional,
    Count,
}

impl PassthroughMode {
    fn wire(self) -> u8 {
        match self {
            PassthroughMode::All => 0,
            PassthroughMode::Conditional => 1,
            PassthroughMode::Count => 2,
        }
    }
}

/// The closed set of processor kinds defined by the wire protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessorKind {
    Passthrough,
    Accumulator,
    Averager,
    Differential,
    Counter,
    Comparator,
    Time,
    Math,
    Delay,
    Pulse,
    Threshold,
    Buffer,
    Packer,
    Accounter,
    Fuser,
}

impl ProcessorKind {
    /// Wire type id carried as the first config byte
    pub fn type_id(self) -> u8 {
        match self {
            ProcessorKind::Passthrough => 0x01,
            ProcessorKind::Accumulator => 0x02,
            ProcessorKind::Averager => 0x03,
            ProcessorKind::Differential => 0x04,
            ProcessorKind::Counter => 0x05,
            ProcessorKind::Comparator => 0x06,
            ProcessorKind::Time => 0x08,
            ProcessorKind::Math => 0x09,
            ProcessorKind::Delay => 0x0A,
            ProcessorKind::Pulse => 0x0B,
            ProcessorKind::Threshold => 0x0D,
            ProcessorKind::Buffer => 0x0F,
            ProcessorKind::Packer => 0x10,
            ProcessorKind::Accounter => 0x11,
            ProcessorKind::Fuser => 0x1B,
        }
    }
}

/// Configuration of one data processor: a closed tagged union over the
/// protocol's processor kinds
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessorConfig {
    Passthrough {
        mode: PassthroughMode,
        count: u16,
    },
    Accumulator {
        input_len: u8,
        output_len: u8,
    },
    Averager {
        input_len: u8,
        samples: u8,
    },
    Differential {
        input_len: u8,
        signed: bool,
        mode: DifferentialMode,
        magnitude: u32,
    },
    Counter {
        output_len: u8,
    },
    Comparator {
        op: Comparison,
        mode: ComparatorMode,
        references: Vec<i32>,
        input_len: u8,
        signed: bool,
    },
    Time {
        input_len: u8,
        period_ms: u32,
    },
    Math {
        op: MathOp,
        operand: i32,
        input_len: u8,
        signed: bool,
    },
    Delay {
        input_len: u8,
        count: u8,
    },
    Pulse {
        input_len: u8,
        threshold: i32,
        width: u16,
        output: PulseOutput,
    },
    Threshold {
        input_len: u8,
        signed: bool,
        mode: ThresholdMode,
        boundary: i32,
        hysteresis: u16,
    },
    Buffer {
        input_len: u8,
    },
    Packer {
        input_len: u8,
        count: u8,
    },
    Accounter {
        count_len: u8,
    },
    /// References buffer processors by same-batch placeholder; ids are
    /// patched in by the provisioning engine once the buffers exist
    Fuser {
        references: u8,
    },
}

impl ProcessorConfig {
    pub fn kind(&self) -> ProcessorKind {
        match self {
            ProcessorConfig::Passthrough { .. } => ProcessorKind::Passthrough,
            ProcessorConfig::Accumulator { .. } => ProcessorKind::Accumulator,
            ProcessorConfig::Averager { .. } => ProcessorKind::Averager,
            ProcessorConfig::Differential { .. } => ProcessorKind::Differential,
            ProcessorConfig::Counter { .. } => ProcessorKind::Counter,
            ProcessorConfig::Comparator { .. } => ProcessorKind::Comparator,
            ProcessorConfig::Time { .. } => ProcessorKind::Time,
            ProcessorConfig::Math { .. } => ProcessorKind::Math,
            ProcessorConfig::Delay { .. } => ProcessorKind::Delay,
            ProcessorConfig::Pulse { .. } => ProcessorKind::Pulse,
            ProcessorConfig::Threshold { .. } => ProcessorKind::Threshold,
            ProcessorConfig::Buffer { .. } => ProcessorKind::Buffer,
            ProcessorConfig::Packer { .. } => ProcessorKind::Packer,
            ProcessorConfig::Accounter { .. } => ProcessorKind::Accounter,
            ProcessorConfig::Fuser { .. } => ProcessorKind::Fuser,
        }
    }

    /// Encode the config bytes, first byte being the wire type id.
    ///
    /// `dp_revision` is the data-processor module revision reported by the
    /// board; the comparator falls back to the legacy single-value format
    /// below [`min_revision::MULTI_COMPARATOR`].
    pub fn encode(&self, dp_revision: u8) -> Vec<u8> {
        let mut out = vec![self.kind().type_id()];
        match self {
            ProcessorConfig::Passthrough { mode, count } => {
                out.push(mode.wire());
                out.extend(count.to_le_bytes());
            }
            ProcessorConfig::Accumulator {
                input_len,
                output_len,
            } => {
                out.push(((output_len - 1) & 0x3) | (((input_len - 1) & 0x3) << 2));
            }
            ProcessorConfig::Averager { input_len, samples } => {
                out.push(((input_len - 1) & 0x3) | (((input_len - 1) & 0x3) << 2));
                out.push(*samples);
            }
            ProcessorConfig::Differential {
                input_len,
                signed,
                mode,
                magnitude,
            } => {
                let mode_bits = match mode {
                    DifferentialMode::Absolute => 0u8,
                    DifferentialMode::Differential => 1,
                    DifferentialMode::Binary => 2,
                };
                out.push(((input_len - 1) & 0x3) | ((*signed as u8) << 2) | (mode_bits << 3));
                out.extend(magnitude.to_le_bytes());
            }
            ProcessorConfig::Counter { output_len } => {
                out.push((output_len - 1) & 0x3);
            }
            ProcessorConfig::Comparator {
                op,
                mode,
                references,
                input_len,
                signed,
            } => {
                if dp_revision >= min_revision::MULTI_COMPARATOR {
                    out.push(
                        (*signed as u8) | (((input_len - 1) & 0x3) << 1) | (op.wire() << 3),
                    );
                    out.push(mode.wire());
                    for reference in references {
                        out.extend(&reference.to_le_bytes()[..*input_len as usize]);
                    }
                } else {
                    // Legacy single-value format: first reference only,
                    // always 4 bytes wide
                    out.push(*signed as u8);
                    out.push(op.wire());
                    out.push(0x00);
                    let reference = references.first().copied().unwrap_or(0);
                    out.extend(reference.to_le_bytes());
                }
            }
            ProcessorConfig::Time {
                input_len,
                period_ms,
            } => {
                out.push((input_len - 1) & 0x7);
                out.extend(period_ms.to_le_bytes());
            }
            ProcessorConfig::Math {
                op,
                operand,
                input_len,
                signed,
            } => {
                // Math always widens its output to 4 bytes
                out.push(((input_len - 1) & 0x3) | (0x3 << 2) | ((*signed as u8) << 4));
                out.push(op.wire());
                out.extend(operand.to_le_bytes());
            }
            ProcessorConfig::Delay { input_len, count } => {
                out.push((input_len - 1) & 0x3);
                out.push(*count);
            }
            ProcessorConfig::Pulse {
                input_len,
                threshold,
                width,
                output,
            } => {
                out.push((input_len - 1) & 0x3);
                out.push(output.wire());
                out.extend(threshold.to_le_bytes());
                out.extend(width.to_le_bytes());
            }
            ProcessorConfig::Threshold {
                input_len,
                signed,
                mode,
                boundary,
                hysteresis,
            } => {
                let mode_bits = match mode {
                    ThresholdMode::Absolute => 0u8,
                    ThresholdMode::Binary => 1,
                };
                out.push(((input_len - 1) & 0x3) | ((*signed as u8) << 2) | (mode_bits << 3));
                out.extend(boundary.to_le_bytes());
                out.extend(hysteresis.to_le_bytes());
            }
            ProcessorConfig::Buffer { input_len } => {
                out.push((input_len - 1) & 0x1F);
            }
            ProcessorConfig::Packer { input_len, count } => {
                out.push((input_len - 1) & 0x1F);
                out.push((count - 1) & 0x7);
            }
            ProcessorConfig::Accounter { count_len } => {
                out.push(((count_len - 1) & 0x3) | (0x1 << 4));
            }
            ProcessorConfig::Fuser { references } => {
                out.push(*references & 0x1F);
                // One placeholder byte per referenced buffer; patched by the
                // engine with the allocated ids
                out.extend(std::iter::repeat(0u8).take(*references as usize));
            }
        }
        out
    }
}

/// Build the creation request for one staged processor
pub fn create_item(
    arena: &DescriptorArena,
    source: DescId,
    config: &ProcessorConfig,
    dp_revision: u8,
    tag: usize,
    patches: Vec<FramePatch>,
) -> ProvisionItem {
    let src = arena.get(source);
    let len = src.payload_len().clamp(1, 8) as u8;
    let mut payload = vec![
        src.module,
        src.register,
        src.instance.unwrap_or(NO_INSTANCE),
        protocol::source_ref(src.layout.offset, len),
    ];
    payload.extend(config.encode(dp_revision));
    ProvisionItem {
        frames: vec![protocol::command(
            protocol::modules::DATA_PROCESSOR,
            protocol::data_processor::ADD,
            &payload,
        )],
        ids_required: 1,
        tag,
        patches,
    }
}

/// Removal frame for a provisioned processor
pub fn remove_frame(id: u8) -> Vec<u8> {
    vec![
        protocol::modules::DATA_PROCESSOR,
        protocol::data_processor::REMOVE,
        id,
    ]
}

/// A processor confirmed by the firmware, kept for the connection's lifetime
#[derive(Debug, Clone)]
pub struct ActiveProcessor {
    /// Firmware-assigned id
    pub id: u8,
    /// Descriptor of the produced signal
    pub produced: DescId,
    /// Last configuration pushed to the firmware
    pub config: ProcessorConfig,
}

impl ActiveProcessor {
    /// Build the parameter-update frame re-configuring this processor.
    /// The new config must be of the same kind; the kinds are a closed set,
    /// so this is the only runtime check needed.
    pub fn set_parameters(
        &mut self,
        config: ProcessorConfig,
        dp_revision: u8,
    ) -> Result<Vec<u8>> {
        if config.kind() != self.config.kind() {
            return Err(LinkError::InvalidRoute(format!(
                "cannot edit a {:?} processor with a {:?} config",
                self.config.kind(),
                config.kind()
            )));
        }
        let payload = config.encode(dp_revision);
        self.config = config;
        Ok(protocol::instance_command(
            protocol::modules::DATA_PROCESSOR,
            protocol::data_processor::PARAMETER,
            self.id,
            &payload,
        ))
    }
}
