use glam::{Quat, Vec3};

use crate::{
    backend::{AggregateKind, PhysicsBackend, ShapeDescriptor, ShapeHandle, ShapeKind, SlotHandle},
    HothamResult,
};

/// One collision shape living in the engine: a primitive, a Null placeholder or an aggregate.
///
/// Deliberately not `Clone`: whoever holds a `GeometryShape` owns the engine shape, and
/// [`GeometryShape::destroy`] consumes it so it can only be freed once.
#[derive(Debug, PartialEq)]
pub struct GeometryShape {
    handle: ShapeHandle,
    kind: ShapeKind,
    position: Vec3,
    rotation: Quat,
    scale: Vec3,
    trigger: bool,
    layer: u32,
    slot: Option<SlotHandle>,
}

impl GeometryShape {
    /// Create a primitive from a descriptor
    pub fn new(backend: &mut dyn PhysicsBackend, descriptor: &ShapeDescriptor) -> HothamResult<Self> {
        let handle = backend.create_shape(descriptor)?;
        Ok(Self {
            handle,
            kind: ShapeKind::from(&descriptor.geometry),
            position: descriptor.position,
            rotation: descriptor.rotation,
            scale: descriptor.scale,
            trigger: descriptor.trigger,
            layer: descriptor.layer,
            slot: None,
        })
    }

    /// Create the empty placeholder bound to bodies without any colliders
    pub fn null(backend: &mut dyn PhysicsBackend) -> HothamResult<Self> {
        Self::new(backend, &ShapeDescriptor::default())
    }

    /// Create an empty Compound or Scene aggregate
    pub fn aggregate(backend: &mut dyn PhysicsBackend, kind: AggregateKind) -> HothamResult<Self> {
        let handle = backend.create_aggregate(kind)?;
        Ok(Self {
            handle,
            kind: kind.into(),
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
            trigger: false,
            layer: 0,
            slot: None,
        })
    }

    /// The engine handle
    pub fn handle(&self) -> ShapeHandle {
        self.handle
    }

    /// What kind of shape this is
    pub fn kind(&self) -> ShapeKind {
        self.kind
    }

    /// Offset from the owning body
    pub fn position(&self) -> Vec3 {
        self.position
    }

    /// Rotation relative to the owning body
    pub fn rotation(&self) -> Quat {
        self.rotation
    }

    /// Scale baked into the primitive
    pub fn scale(&self) -> Vec3 {
        self.scale
    }

    /// Is this a trigger?
    pub fn is_trigger(&self) -> bool {
        self.trigger
    }

    /// Collision layer
    pub fn layer(&self) -> u32 {
        self.layer
    }

    /// The slot this shape occupies in its aggregate, if it's a member of one
    pub fn slot(&self) -> Option<SlotHandle> {
        self.slot
    }

    pub(crate) fn set_slot(&mut self, slot: Option<SlotHandle>) {
        self.slot = slot;
    }

    /// Free the engine shape
    pub fn destroy(self, backend: &mut dyn PhysicsBackend) {
        backend.destroy_shape(self.handle);
    }
}
