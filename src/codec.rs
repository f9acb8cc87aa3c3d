//! Wire codec for fixed-layout sensor payloads
//!
//! Turns typed values into little-endian byte buffers and back, driven by a
//! small [`Layout`] descriptor (per-field byte sizes, replica count, byte
//! offset, signedness). Floating values travel as scaled integers; the scale
//! factor is supplied by the descriptor that owns the signal, not by the
//! codec itself.
//!
//! The codec is pure and stateless. A buffer shorter than its layout is a
//! contract violation (mismatched register expectations), surfaced as a
//! [`LinkError::Codec`] that callers must treat as fatal.

use crate::error::{LinkError, Result};
use serde::{Deserialize, Serialize};

/// Byte layout of one signal's payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layout {
    /// Byte size of each field within one replica
    pub sizes: Vec<u8>,
    /// Number of replicas (vector lanes); 1 for scalars
    pub replicas: u8,
    /// Byte offset of the payload within the notification frame body
    pub offset: u8,
    /// Whether integer fields are sign-extended
    pub signed: bool,
}

impl Layout {
    /// Scalar layout: a single field of `size` bytes
    pub fn scalar(size: u8, signed: bool) -> Self {
        Self {
            sizes: vec![size],
            replicas: 1,
            offset: 0,
            signed,
        }
    }

    /// Vector layout: `lanes` replicas of a single `lane_size`-byte field
    pub fn vector(lane_size: u8, lanes: u8, signed: bool) -> Self {
        Self {
            sizes: vec![lane_size],
            replicas: lanes,
            offset: 0,
            signed,
        }
    }

    /// Total payload length in bytes covered by this layout
    pub fn payload_len(&self) -> usize {
        self.sizes.iter().map(|&s| s as usize).sum::<usize>() * self.replicas as usize
    }

    /// Width of a single replica in bytes
    pub fn replica_len(&self) -> usize {
        self.sizes.iter().map(|&s| s as usize).sum()
    }

    /// Whether this layout describes a multi-lane vector
    pub fn is_vector(&self) -> bool {
        self.replicas > 1
    }
}

/// A decoded sensor or processor value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Unscaled unsigned integer
    Unsigned(u32),
    /// Unscaled signed integer
    Signed(i32),
    /// Scaled floating value
    Float(f32),
    /// Multi-lane scaled floating vector
    Vector(Vec<f32>),
    /// Opaque multi-field payload, forwarded unaltered
    Bytes(Vec<u8>),
}

impl Value {
    /// The value as an f32, if it is numeric
    pub fn as_f32(&self) -> Option<f32> {
        match self {
            Value::Unsigned(v) => Some(*v as f32),
            Value::Signed(v) => Some(*v as f32),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// The value as a lane slice, if it is a vector
    pub fn as_lanes(&self) -> Option<&[f32]> {
        match self {
            Value::Vector(lanes) => Some(lanes),
            _ => None,
        }
    }
}

/// Decode a little-endian integer of 1-4 bytes.
///
/// 3-byte widths are extended to 4 bytes before the standard decode: the
/// high byte is padded with 0xFF when signed and bit 23 is set, else 0x00.
pub fn decode_int(bytes: &[u8], signed: bool) -> Result<i64> {
    let width = bytes.len();
    if width == 0 || width > 4 {
        return Err(LinkError::Codec(format!(
            "unsupported integer width: {width}"
        )));
    }

    let mut buf = [0u8; 4];
    buf[..width].copy_from_slice(bytes);
    if width == 3 && signed && (bytes[2] & 0x80) != 0 {
        buf[3] = 0xFF;
    }

    if signed {
        let raw = i32::from_le_bytes(buf);
        // Narrow widths below 3 bytes sign-extend from their own top bit
        let value = match width {
            1 => buf[0] as i8 as i64,
            2 => i16::from_le_bytes([buf[0], buf[1]]) as i64,
            _ => raw as i64,
        };
        Ok(value)
    } else {
        Ok(u32::from_le_bytes(buf) as i64)
    }
}

/// Encode a little-endian integer into `width` bytes (1-4)
pub fn encode_int(value: i64, width: usize) -> Result<Vec<u8>> {
    if width == 0 || width > 4 {
        return Err(LinkError::Codec(format!(
            "unsupported integer width: {width}"
        )));
    }
    let bytes = (value as u32).to_le_bytes();
    Ok(bytes[..width].to_vec())
}

/// Decode a payload buffer against a layout and scale factor.
///
/// - Vectors (replicas > 1) decode to one scaled f32 per lane.
/// - Scalars with a non-unit scale decode to [`Value::Float`].
/// - Scalars with unit scale decode to [`Value::Signed`]/[`Value::Unsigned`].
/// - Multi-field layouts are forwarded as [`Value::Bytes`] for leaf decoders.
pub fn decode(bytes: &[u8], layout: &Layout, scale: f32) -> Result<Value> {
    let start = layout.offset as usize;
    let needed = start + layout.payload_len();
    if bytes.len() < needed {
        return Err(LinkError::Codec(format!(
            "buffer too short: have {} bytes, layout requires {}",
            bytes.len(),
            needed
        )));
    }
    let payload = &bytes[start..needed];

    if layout.sizes.len() > 1 {
        return Ok(Value::Bytes(payload.to_vec()));
    }

    let lane_width = layout.replica_len();
    if layout.is_vector() {
        let mut lanes = Vec::with_capacity(layout.replicas as usize);
        for lane in payload.chunks_exact(lane_width) {
            let raw = decode_int(lane, layout.signed)?;
            lanes.push(raw as f32 / scale);
        }
        return Ok(Value::Vector(lanes));
    }

    let raw = decode_int(payload, layout.signed)?;
    if scale != 1.0 {
        Ok(Value::Float(raw as f32 / scale))
    } else if layout.signed {
        Ok(Value::Signed(raw as i32))
    } else {
        Ok(Value::Unsigned(raw as u32))
    }
}

/// Encode a value against a layout and scale factor.
///
/// The inverse of [`decode`]; floating values are scaled and rounded to the
/// nearest integer before packing.
pub fn encode(value: &Value, layout: &Layout, scale: f32) -> Result<Vec<u8>> {
    let lane_width = layout.replica_len();
    match value {
        Value::Bytes(bytes) => {
            if bytes.len() != layout.payload_len() {
                return Err(LinkError::Codec(format!(
                    "byte payload length {} does not match layout length {}",
                    bytes.len(),
                    layout.payload_len()
                )));
            }
            Ok(bytes.clone())
        }
        Value::Vector(lanes) => {
            if lanes.len() != layout.replicas as usize {
                return Err(LinkError::Codec(format!(
                    "vector has {} lanes, layout expects {}",
                    lanes.len(),
                    layout.replicas
                )));
            }
            let mut out = Vec::with_capacity(layout.payload_len());
            for lane in lanes {
                let raw = (lane * scale).round() as i64;
                out.extend(encode_int(raw, lane_width)?);
            }
            Ok(out)
        }
        Value::Float(v) => encode_int((v * scale).round() as i64, lane_width),
        Value::Signed(v) => encode_int(*v as i64, lane_width),
        Value::Unsigned(v) => encode_int(*v as i64, lane_width),
    }
}
