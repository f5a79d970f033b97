//! Resource registry: stable identities for backend objects.
//!
//! Render states never hold backend handles. Producers register a handle once and pass the
//! returned identity around; the registry resolves it at record time. Identities are
//! generational, so a removed entry can never be confused with one registered later in the
//! same slot.

use std::collections::HashMap;

use cadence_rhi::ResourceId;
use slotmap::{Key, SlotMap};

slotmap::new_key_type! {
    /// Render target or framebuffer.
    pub struct TargetId;
    /// Linked shader program / pipeline.
    pub struct ProgramId;
    /// Vertex/index buffer binding.
    pub struct GeometryId;
    /// Sampled image.
    pub struct ImageId;
}

/// Stable 64-bit encoding of an identity, used by the hasher and for ordering.
pub(crate) fn key_bits<K: Key>(key: K) -> u64 {
    key.data().as_ffi()
}

/// One arena of a single resource kind with a reverse index for live-state lookups.
#[derive(Debug)]
struct Table<K: Key> {
    kind: &'static str,
    entries: SlotMap<K, ResourceId>,
    reverse: HashMap<ResourceId, K>,
}

impl<K: Key> Table<K> {
    fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: SlotMap::with_key(),
            reverse: HashMap::new(),
        }
    }

    fn register(&mut self, handle: ResourceId) -> K {
        if let Some(&existing) = self.reverse.get(&handle) {
            return existing;
        }
        let key = self.entries.insert(handle);
        self.reverse.insert(handle, key);
        log::debug!("registry: {} {:#x} -> handle {}", self.kind, key_bits(key), handle);
        key
    }

    fn remove(&mut self, key: K) -> Option<ResourceId> {
        let handle = self.entries.remove(key)?;
        self.reverse.remove(&handle);
        Some(handle)
    }

    fn resolve(&self, key: K) -> Option<ResourceId> {
        self.entries.get(key).copied()
    }

    fn identify(&self, handle: ResourceId) -> Option<K> {
        self.reverse.get(&handle).copied()
    }
}

/// Maps identities to backend handles and back.
#[derive(Debug)]
pub struct ResourceRegistry {
    targets: Table<TargetId>,
    programs: Table<ProgramId>,
    geometry: Table<GeometryId>,
    images: Table<ImageId>,
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! table_ops {
    ($field:ident, $key:ty, $register:ident, $remove:ident, $resolve:ident, $identify:ident) => {
        /// Register a backend handle. Registering the same handle twice returns the same identity.
        pub fn $register(&mut self, handle: ResourceId) -> $key {
            self.$field.register(handle)
        }

        /// Remove an identity. Later lookups with it fail.
        pub fn $remove(&mut self, id: $key) -> Option<ResourceId> {
            self.$field.remove(id)
        }

        pub fn $resolve(&self, id: $key) -> Option<ResourceId> {
            self.$field.resolve(id)
        }

        pub fn $identify(&self, handle: ResourceId) -> Option<$key> {
            self.$field.identify(handle)
        }
    };
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self {
            targets: Table::new("target"),
            programs: Table::new("program"),
            geometry: Table::new("geometry"),
            images: Table::new("image"),
        }
    }

    table_ops!(targets, TargetId, register_target, remove_target, target, identify_target);
    table_ops!(programs, ProgramId, register_program, remove_program, program, identify_program);
    table_ops!(geometry, GeometryId, register_geometry, remove_geometry, geometry, identify_geometry);
    table_ops!(images, ImageId, register_image, remove_image, image, identify_image);

    pub fn len(&self) -> usize {
        self.targets.entries.len()
            + self.programs.entries.len()
            + self.geometry.entries.len()
            + self.images.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
