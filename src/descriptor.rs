//! Data descriptor graph
//!
//! Every firmware signal (a sensor channel, a processor output, a split
//! vector lane) is described by a [`DataDescriptor`] node. Nodes live in a
//! single [`DescriptorArena`] owned by the board and are addressed by stable
//! [`DescId`] handles everywhere else (routes, processors, consumers), which
//! keeps the "derived from" and "splits into" edges free of shared-ownership
//! cycles and makes the whole graph serializable as one blob.
//!
//! Descriptor identity is immutable once built, with two exceptions:
//! the live bit on the register id, flipped only by [`DescriptorArena::mark_live`]
//! and [`DescriptorArena::mark_silent`], and the one-time instance-id
//! promotion performed when the firmware confirms an allocation.

use crate::codec::Layout;
use crate::error::{LinkError, Result};
use crate::protocol::{LIVE_BIT, REGISTER_MASK};
use serde::{Deserialize, Serialize};

/// Stable handle to a descriptor in the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DescId(u32);

impl DescId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Classification of a signal's origin, used for operator gating
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalClass {
    /// Raw sensor channel
    Sensor,
    /// Output of an on-board data processor
    Derived,
    /// Sensor-fusion output; most scalar operators reject these
    Fused,
}

/// How a descriptor's notifications are switched on and off
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enable {
    /// Register that carries the enable command
    pub register: u8,
    /// Whether the enable command addresses a specific instance
    pub per_instance: bool,
}

/// One node in the descriptor graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataDescriptor {
    /// Owning module id
    pub module: u8,
    /// Register id; carries the live bit, masked out for dispatch matching
    pub register: u8,
    /// Firmware-assigned instance, `None` until provisioning promotes it
    pub instance: Option<u8>,
    /// Byte layout of the payload
    pub layout: Layout,
    /// Scale factor mapping raw integers to engineering units
    pub scale: f32,
    /// Signal origin classification
    pub class: SignalClass,
    /// Enable-register info, if the signal can notify
    pub enable: Option<Enable>,
    /// The descriptor this signal was derived from
    pub parent: Option<DescId>,
    /// Per-lane child descriptors for vector splitting
    pub children: Vec<DescId>,
}

impl DataDescriptor {
    /// Register id with flag bits stripped, as used for dispatch matching
    pub fn base_register(&self) -> u8 {
        self.register & REGISTER_MASK
    }

    /// Whether the descriptor is actively notifying
    pub fn is_live(&self) -> bool {
        self.register & LIVE_BIT != 0
    }

    /// Payload length in bytes
    pub fn payload_len(&self) -> usize {
        self.layout.payload_len()
    }
}

/// Arena holding every descriptor for one board connection
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct DescriptorArena {
    nodes: Vec<DataDescriptor>,
}

impl DescriptorArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a root sensor descriptor
    pub fn sensor(
        &mut self,
        module: u8,
        register: u8,
        layout: Layout,
        scale: f32,
        class: SignalClass,
        enable: Option<Enable>,
    ) -> DescId {
        self.insert(DataDescriptor {
            module,
            register,
            instance: None,
            layout,
            scale,
            class,
            enable,
            parent: None,
            children: Vec::new(),
        })
    }

    /// Derive a new signal from `parent`; the child inherits the parent's
    /// class so fusion gating follows derived signals.
    pub fn derive(
        &mut self,
        parent: DescId,
        module: u8,
        register: u8,
        layout: Layout,
        scale: f32,
        enable: Option<Enable>,
    ) -> DescId {
        let class = match self.get(parent).class {
            SignalClass::Fused => SignalClass::Fused,
            _ => SignalClass::Derived,
        };
        self.insert(DataDescriptor {
            module,
            register,
            instance: None,
            layout,
            scale,
            class,
            enable,
            parent: Some(parent),
            children: Vec::new(),
        })
    }

    /// Split a vector descriptor into per-lane children, creating them on
    /// first use. Errors on non-vector layouts.
    pub fn split(&mut self, parent: DescId) -> Result<Vec<DescId>> {
        let node = self.get(parent).clone();
        if !node.layout.is_vector() {
            return Err(LinkError::InvalidRoute(
                "split() requires a multi-lane vector signal".to_string(),
            ));
        }
        if !node.children.is_empty() {
            return Ok(node.children);
        }

        let lane_size = node.layout.replica_len() as u8;
        let mut children = Vec::with_capacity(node.layout.replicas as usize);
        for lane in 0..node.layout.replicas {
            let layout = Layout {
                sizes: node.layout.sizes.clone(),
                replicas: 1,
                offset: node.layout.offset + lane * lane_size,
                signed: node.layout.signed,
            };
            let child = self.insert(DataDescriptor {
                module: node.module,
                register: node.register,
                instance: node.instance,
                layout,
                scale: node.scale,
                class: node.class,
                enable: node.enable,
                parent: Some(parent),
                children: Vec::new(),
            });
            children.push(child);
        }
        self.nodes[parent.index()].children = children.clone();
        Ok(children)
    }

    pub fn get(&self, id: DescId) -> &DataDescriptor {
        &self.nodes[id.index()]
    }

    /// Flip the live bit on; idempotent.
    pub fn mark_live(&mut self, id: DescId) {
        self.nodes[id.index()].register |= LIVE_BIT;
    }

    /// Flip the live bit off; idempotent.
    pub fn mark_silent(&mut self, id: DescId) {
        self.nodes[id.index()].register &= !LIVE_BIT;
    }

    /// Drop every live bit, for restoring a snapshot taken mid-stream
    pub fn mark_all_silent(&mut self) {
        for node in &mut self.nodes {
            node.register &= !LIVE_BIT;
        }
    }

    /// Promote a descriptor's instance id after the firmware confirms the
    /// allocation. The promotion is one-time; re-promoting to a different id
    /// is a contract violation.
    pub fn promote_instance(&mut self, id: DescId, instance: u8) -> Result<()> {
        let node = &mut self.nodes[id.index()];
        match node.instance {
            None => {
                node.instance = Some(instance);
                Ok(())
            }
            Some(existing) if existing == instance => Ok(()),
            Some(existing) => Err(LinkError::Codec(format!(
                "descriptor already bound to instance {existing}, cannot rebind to {instance}"
            ))),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn insert(&mut self, node: DataDescriptor) -> DescId {
        let id = DescId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Layout;

    fn arena_with_vector() -> (DescriptorArena, DescId) {
        let mut arena = DescriptorArena::new();
        let id = arena.sensor(
            0x03,
            0x04,
            Layout::vector(2, 3, true),
            16384.0,
            SignalClass::Sensor,
            Some(Enable {
                register: 0x02,
                per_instance: false,
            }),
        );
        (arena, id)
    }

    #[test]
    fn test_live_bit_toggling() {
        let (mut arena, id) = arena_with_vector();
        assert!(!arena.get(id).is_live());
        arena.mark_live(id);
        assert!(arena.get(id).is_live());
        assert_eq!(arena.get(id).base_register(), 0x04);
        arena.mark_silent(id);
        assert!(!arena.get(id).is_live());
    }

    #[test]
    fn test_split_creates_offset_lanes() {
        let (mut arena, id) = arena_with_vector();
        let children = arena.split(id).unwrap();
        assert_eq!(children.len(), 3);
        assert_eq!(arena.get(children[0]).layout.offset, 0);
        assert_eq!(arena.get(children[1]).layout.offset, 2);
        assert_eq!(arena.get(children[2]).layout.offset, 4);
        assert_eq!(arena.get(children[1]).payload_len(), 2);
        assert_eq!(arena.get(children[1]).parent, Some(id));

        // Second split returns the same children
        let again = arena.split(id).unwrap();
        assert_eq!(again, children);
    }

    #[test]
    fn test_split_scalar_rejected() {
        let mut arena = DescriptorArena::new();
        let id = arena.sensor(
            0x05,
            0x01,
            Layout::scalar(2, false),
            1.0,
            SignalClass::Sensor,
            None,
        );
        assert!(arena.split(id).is_err());
    }

    #[test]
    fn test_instance_promotion_is_one_time() {
        let (mut arena, id) = arena_with_vector();
        assert_eq!(arena.get(id).instance, None);
        arena.promote_instance(id, 3).unwrap();
        assert_eq!(arena.get(id).instance, Some(3));
        // Same id again is fine, a different one is not
        arena.promote_instance(id, 3).unwrap();
        assert!(arena.promote_instance(id, 4).is_err());
    }

    #[test]
    fn test_derived_class_propagates_fusion() {
        let mut arena = DescriptorArena::new();
        let fused = arena.sensor(
            0x19,
            0x04,
            Layout::vector(4, 4, true),
            1073741824.0,
            SignalClass::Fused,
            None,
        );
        let derived = arena.derive(fused, 0x09, 0x03, Layout::scalar(4, true), 1.0, None);
        assert_eq!(arena.get(derived).class, SignalClass::Fused);
    }
}
