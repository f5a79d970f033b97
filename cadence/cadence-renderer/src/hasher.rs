//! Canonical fingerprint of bindable state.
//!
//! [`fingerprint`] hashes a [`RenderState`] value, [`fingerprint_live`] hashes whatever a command
//! buffer reports as bound. Both go through [`StateSampler`] and one encoding routine, so the two
//! agree whenever they describe the same bindings. Every field is written as a presence tag
//! followed by the identity bits, and exactly [`MAX_IMAGE_SLOTS`] image slots are always
//! written.

use cadence_rhi::{BindPoint, CommandBuffer, ResourceId};

use crate::registry::{key_bits, ResourceRegistry};
use crate::state::{RenderState, MAX_IMAGE_SLOTS};

const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

const TAG_EMPTY: u8 = 0;
const TAG_BOUND: u8 = 1;
const TAG_UNREGISTERED: u8 = 2;

/// What one bind point holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    Empty,
    /// A registered identity, as its stable key encoding.
    Bound(u64),
    /// A backend handle with no registry entry.
    Unregistered(ResourceId),
}

/// Read access to one set of bindings.
pub trait StateSampler {
    fn target(&self) -> Binding;
    fn program(&self) -> Binding;
    fn geometry(&self) -> Binding;
    /// `slot` is always below [`MAX_IMAGE_SLOTS`].
    fn image(&self, slot: usize) -> Binding;
}

impl StateSampler for RenderState {
    fn target(&self) -> Binding {
        self.target.map_or(Binding::Empty, |t| Binding::Bound(key_bits(t)))
    }

    fn program(&self) -> Binding {
        Binding::Bound(key_bits(self.program))
    }

    fn geometry(&self) -> Binding {
        Binding::Bound(key_bits(self.geometry))
    }

    fn image(&self, slot: usize) -> Binding {
        self.images[slot].map_or(Binding::Empty, |i| Binding::Bound(key_bits(i)))
    }
}

/// Bindings as a command buffer currently reports them, translated back through the registry.
pub struct LiveState<'a> {
    pub buffer: &'a dyn CommandBuffer,
    pub registry: &'a ResourceRegistry,
}

impl LiveState<'_> {
    fn sample<K: slotmap::Key>(&self, point: BindPoint, identify: impl Fn(ResourceId) -> Option<K>) -> Binding {
        match self.buffer.bound(point) {
            None => Binding::Empty,
            Some(handle) => match identify(handle) {
                Some(key) => Binding::Bound(key_bits(key)),
                None => Binding::Unregistered(handle),
            },
        }
    }
}

impl StateSampler for LiveState<'_> {
    fn target(&self) -> Binding {
        self.sample(BindPoint::RenderTarget, |h| self.registry.identify_target(h))
    }

    fn program(&self) -> Binding {
        self.sample(BindPoint::Program, |h| self.registry.identify_program(h))
    }

    fn geometry(&self) -> Binding {
        self.sample(BindPoint::Geometry, |h| self.registry.identify_geometry(h))
    }

    fn image(&self, slot: usize) -> Binding {
        self.sample(BindPoint::Image(slot as u32), |h| self.registry.identify_image(h))
    }
}

pub fn fingerprint(state: &RenderState) -> u64 {
    fingerprint_with(state)
}

pub fn fingerprint_live(live: &LiveState<'_>) -> u64 {
    fingerprint_with(live)
}

/// The shared core. Anything implementing [`StateSampler`] hashes through here.
pub fn fingerprint_with<S: StateSampler + ?Sized>(sampler: &S) -> u64 {
    let mut h = Fnv1a64::new();
    write_binding(&mut h, sampler.target());
    write_binding(&mut h, sampler.program());
    write_binding(&mut h, sampler.geometry());
    for slot in 0..MAX_IMAGE_SLOTS {
        write_binding(&mut h, sampler.image(slot));
    }
    h.finish()
}

fn write_binding(h: &mut Fnv1a64, binding: Binding) {
    match binding {
        Binding::Empty => h.write_u8(TAG_EMPTY),
        Binding::Bound(bits) => {
            h.write_u8(TAG_BOUND);
            h.write_u64(bits);
        }
        Binding::Unregistered(handle) => {
            h.write_u8(TAG_UNREGISTERED);
            h.write_u64(handle);
        }
    }
}

#[derive(Clone, Copy)]
struct Fnv1a64(u64);

impl Fnv1a64 {
    fn new() -> Self {
        Self(FNV_OFFSET)
    }

    fn write_u8(&mut self, v: u8) {
        self.write_bytes(&[v]);
    }

    fn write_u64(&mut self, v: u64) {
        self.write_bytes(&v.to_le_bytes());
    }

    fn write_bytes(&mut self, bytes: &[u8]) {
        let mut h = self.0;
        for &b in bytes {
            h ^= b as u64;
            h = h.wrapping_mul(FNV_PRIME);
        }
        self.0 = h;
    }

    fn finish(self) -> u64 {
        self.0
    }
}
