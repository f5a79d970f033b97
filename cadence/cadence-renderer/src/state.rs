//! Render state model: what a draw needs bound, and the request that carries it.

use crate::registry::{key_bits, GeometryId, ImageId, ProgramId, TargetId};

/// Number of image slots every state and every sampler covers.
pub const MAX_IMAGE_SLOTS: usize = 8;

/// Bindable GPU state of one draw. Compared field by field, null slots included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderState {
    /// `None` draws to the presentable image of the frame.
    pub target: Option<TargetId>,
    pub program: ProgramId,
    pub geometry: GeometryId,
    pub images: [Option<ImageId>; MAX_IMAGE_SLOTS],
}

impl RenderState {
    pub fn new(program: ProgramId, geometry: GeometryId) -> Self {
        Self {
            target: None,
            program,
            geometry,
            images: [None; MAX_IMAGE_SLOTS],
        }
    }

    pub fn with_target(mut self, target: TargetId) -> Self {
        self.target = Some(target);
        self
    }

    /// Bind `image` at `slot`. Slots past `MAX_IMAGE_SLOTS` are ignored.
    pub fn with_image(mut self, slot: usize, image: ImageId) -> Self {
        if let Some(s) = self.images.get_mut(slot) {
            *s = Some(image);
        }
        self
    }

    /// Ordering key: target, program, geometry, then image set.
    pub(crate) fn sort_key(&self) -> (u64, u64, u64, [u64; MAX_IMAGE_SLOTS]) {
        let mut images = [0u64; MAX_IMAGE_SLOTS];
        for (out, slot) in images.iter_mut().zip(self.images.iter()) {
            *out = slot.map_or(0, key_bits);
        }
        (
            self.target.map_or(0, key_bits),
            key_bits(self.program),
            key_bits(self.geometry),
            images,
        )
    }
}

/// Draw parameters of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawCall {
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    Indexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    },
}

impl DrawCall {
    pub fn vertices(vertex_count: u32) -> Self {
        DrawCall::Draw {
            vertex_count,
            instance_count: 1,
            first_vertex: 0,
            first_instance: 0,
        }
    }

    pub fn indexed(index_count: u32) -> Self {
        DrawCall::Indexed {
            index_count,
            instance_count: 1,
            first_index: 0,
            vertex_offset: 0,
            first_instance: 0,
        }
    }
}

/// Closed set of request kinds. Declaration order is submission order within a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum RenderClass {
    /// Depth-tested, order independent; freely reordered by state.
    #[default]
    Opaque,
    /// Blended back to front; keeps submission order.
    Transparent,
    /// Overlay; keeps submission order and draws last.
    Ui,
}

impl RenderClass {
    /// Whether requests of this class may be reordered to group equal states.
    pub fn reorderable(self) -> bool {
        matches!(self, RenderClass::Opaque)
    }
}

/// One draw handed to the frame core by scene or UI traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderRequest {
    pub state: RenderState,
    pub draw: DrawCall,
    pub class: RenderClass,
}

impl RenderRequest {
    pub fn opaque(state: RenderState, draw: DrawCall) -> Self {
        Self {
            state,
            draw,
            class: RenderClass::Opaque,
        }
    }

    pub fn with_class(mut self, class: RenderClass) -> Self {
        self.class = class;
        self
    }
}
