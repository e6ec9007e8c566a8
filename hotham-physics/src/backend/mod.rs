//! The seam between Hotham and the physics engine that actually simulates things.
//!
//! Everything above this module talks to the engine through [`PhysicsBackend`] using opaque
//! handles. [`RapierBackend`] is the implementation that ships with the crate.

mod rapier_backend;

use std::path::Path;

use glam::{Quat, Vec3, Vec4};
use serde::Serialize;

pub use rapier_backend::RapierBackend;

use crate::{
    components::{physics::Geometry, BodyType},
    HothamResult,
};

macro_rules! opaque_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        impl $name {
            /// Wrap a raw value issued by a backend
            pub fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            /// The raw value, only meaningful to the backend that issued it
            pub fn raw(&self) -> u64 {
                self.0
            }
        }
    };
}

opaque_handle!(
    /// A collision shape owned by the engine: a primitive, a Null shape or an aggregate
    ShapeHandle
);
opaque_handle!(
    /// Identifies one member inside an aggregate. Invalid once the member is removed or the aggregate destroyed.
    SlotHandle
);
opaque_handle!(
    /// A rigid body owned by the engine
    BodyHandle
);
opaque_handle!(
    /// A joint owned by the engine
    JointHandle
);

/// What kind of shape an engine handle refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[allow(missing_docs)]
pub enum ShapeKind {
    Null,
    Sphere,
    Box,
    Capsule,
    Cylinder,
    Cone,
    ChamferCylinder,
    ConvexHull,
    TriMesh,
    HeightField,
    Compound,
    Scene,
}

impl ShapeKind {
    /// Is this a Compound or Scene aggregate?
    pub fn is_aggregate(&self) -> bool {
        matches!(self, ShapeKind::Compound | ShapeKind::Scene)
    }
}

impl From<&Geometry> for ShapeKind {
    fn from(geometry: &Geometry) -> Self {
        match geometry {
            Geometry::Null => ShapeKind::Null,
            Geometry::Sphere { .. } => ShapeKind::Sphere,
            Geometry::Box { .. } => ShapeKind::Box,
            Geometry::Capsule { .. } => ShapeKind::Capsule,
            Geometry::Cylinder { .. } => ShapeKind::Cylinder,
            Geometry::Cone { .. } => ShapeKind::Cone,
            Geometry::ChamferCylinder { .. } => ShapeKind::ChamferCylinder,
            Geometry::ConvexHull { .. } => ShapeKind::ConvexHull,
            Geometry::TriMesh { .. } => ShapeKind::TriMesh,
            Geometry::HeightField { .. } => ShapeKind::HeightField,
        }
    }
}

/// The two flavours of aggregate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateKind {
    /// A dynamic aggregate usable by movable bodies
    Compound,
    /// A static-only aggregate for immovable world geometry
    Scene,
}

impl From<AggregateKind> for ShapeKind {
    fn from(kind: AggregateKind) -> Self {
        match kind {
            AggregateKind::Compound => ShapeKind::Compound,
            AggregateKind::Scene => ShapeKind::Scene,
        }
    }
}

/// Everything the engine needs to build one collision primitive
#[derive(Debug, Clone)]
pub struct ShapeDescriptor {
    /// The primitive itself
    pub geometry: Geometry,
    /// Offset from the owning body
    pub position: Vec3,
    /// Rotation relative to the owning body
    pub rotation: Quat,
    /// Scale applied to the geometry's dimensions
    pub scale: Vec3,
    /// Triggers report overlaps but generate no contact response
    pub trigger: bool,
    /// Material id, resolved against the engine's material table
    pub material: u32,
    /// Collision layer, 0..32
    pub layer: u32,
}

impl Default for ShapeDescriptor {
    fn default() -> Self {
        Self {
            geometry: Geometry::Null,
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
            trigger: false,
            material: 0,
            layer: 0,
        }
    }
}

/// Mass parameters for a body. `None` means "derive it from the body's shape".
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MassSpec {
    /// Total mass
    pub mass: f32,
    /// Local center of mass
    pub center_of_mass: Option<Vec3>,
    /// Principal angular inertia
    pub inertia: Option<Vec3>,
}

impl Default for MassSpec {
    fn default() -> Self {
        Self {
            mass: 1.,
            center_of_mass: None,
            inertia: None,
        }
    }
}

/// Everything the engine needs to build a rigid body
#[derive(Debug, Clone)]
pub struct BodyDescriptor {
    /// Selects the engine constructor
    pub body_type: BodyType,
    /// The shape bound to the body
    pub root: ShapeHandle,
    /// Initial position in world space
    pub position: Vec3,
    /// Initial rotation in world space
    pub rotation: Quat,
    /// Mass parameters, ignored for non-dynamic bodies
    pub mass: MassSpec,
    /// Linear damping
    pub linear_damping: f32,
    /// Angular damping
    pub angular_damping: f32,
    /// Initial linear velocity
    pub linear_velocity: Vec3,
    /// Initial angular velocity
    pub angular_velocity: Vec3,
    /// A disabled body exists but takes no part in the simulation
    pub enabled: bool,
    /// Opaque value handed back during contact enumeration and ray casts
    pub user_data: u64,
}

/// A snapshot of a body's engine-side state
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BodyState {
    /// World space position
    pub position: Vec3,
    /// World space rotation
    pub rotation: Quat,
    /// Linear velocity
    pub linear_velocity: Vec3,
    /// Angular velocity
    pub angular_velocity: Vec3,
    /// Total mass
    pub mass: f32,
    /// Local center of mass
    pub center_of_mass: Vec3,
    /// Principal angular inertia
    pub inertia: Vec3,
    /// Linear damping
    pub linear_damping: f32,
    /// Angular damping
    pub angular_damping: f32,
    /// Is the engine currently ignoring this body until something wakes it?
    pub sleeping: bool,
    /// Is the body taking part in the simulation at all?
    pub enabled: bool,
}

impl Default for BodyState {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            linear_velocity: Vec3::ZERO,
            angular_velocity: Vec3::ZERO,
            mass: 0.,
            center_of_mass: Vec3::ZERO,
            inertia: Vec3::ZERO,
            linear_damping: 0.,
            angular_damping: 0.,
            sleeping: false,
            enabled: true,
        }
    }
}

/// One point of contact between two bodies
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ContactPoint {
    /// World space position of the contact
    pub position: Vec3,
    /// Contact normal, pointing from the first body of the joint to the second
    pub normal: Vec3,
    /// Signed distance between the shapes; negative when penetrating
    pub distance: f32,
    /// Impulse applied by the solver along the normal during the last step
    pub impulse: f32,
}

/// A contact joint: two bodies touching, plus the points where they touch.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ContactJoint {
    /// User data of the two bodies attached to this joint
    pub user_data: [u64; 2],
    /// Contact points. Empty for trigger overlaps.
    pub points: Vec<ContactPoint>,
}

/// The nearest hit reported by [`PhysicsBackend::ray_cast`]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BackendRayHit {
    /// User data of the body that owns the hit shape
    pub user_data: u64,
    /// World space hit position
    pub position: Vec3,
    /// Surface normal at the hit
    pub normal: Vec3,
    /// Distance from the ray origin
    pub distance: f32,
    /// Raw id of the primitive that was hit
    pub collision_id: u64,
}

/// Counters describing what the engine currently holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BackendStats {
    /// Live shapes of every kind, aggregates included
    pub shapes: usize,
    /// Live bodies
    pub bodies: usize,
    /// Engine colliders attached to bodies
    pub colliders: usize,
    /// Live joints
    pub joints: usize,
}

/// The degrees of freedom a joint leaves free, expressed in its pivot frame.
/// The frame's x axis is the joint's pin.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum JointKind {
    /// Free rotation about the pivot
    BallAndSocket,
    /// Rotation about the pin, optionally limited to `[min, max]` radians
    Hinge {
        /// Angle limits in radians
        limits: Option<[f32; 2]>,
    },
    /// Translation along the pin, optionally limited to `[min, max]` meters
    Slider {
        /// Distance limits in meters
        limits: Option<[f32; 2]>,
    },
    /// Translation along and rotation about the pin. Limits apply to the translation.
    Corkscrew {
        /// Distance limits in meters
        limits: Option<[f32; 2]>,
    },
    /// Rotation about the pin and about the frame's z axis
    DoubleHinge,
}

/// Everything the engine needs to connect two bodies
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JointDescriptor {
    /// Which degrees of freedom stay free
    pub kind: JointKind,
    /// Joint origin, relative to the child body
    pub pivot: Vec3,
    /// Joint axis, relative to the child body
    pub pin: Vec3,
    /// Can the two connected bodies still collide with each other?
    pub collisions_enabled: bool,
}

impl JointDescriptor {
    fn new(kind: JointKind, pivot: Vec3, pin: Vec3) -> Self {
        Self {
            kind,
            pivot,
            pin,
            collisions_enabled: false,
        }
    }

    /// Free rotation about `pivot`
    pub fn ball_and_socket(pivot: Vec3) -> Self {
        Self::new(JointKind::BallAndSocket, pivot, Vec3::X)
    }

    /// Rotation about `pin`, through `pivot`
    pub fn hinge(pivot: Vec3, pin: Vec3) -> Self {
        Self::new(JointKind::Hinge { limits: None }, pivot, pin)
    }

    /// Translation along `pin`
    pub fn slider(pivot: Vec3, pin: Vec3) -> Self {
        Self::new(JointKind::Slider { limits: None }, pivot, pin)
    }

    /// Translation along and rotation about `pin`
    pub fn corkscrew(pivot: Vec3, pin: Vec3) -> Self {
        Self::new(JointKind::Corkscrew { limits: None }, pivot, pin)
    }

    /// Rotation about `pin` and about a second axis perpendicular to it
    pub fn double_hinge(pivot: Vec3, pin: Vec3) -> Self {
        Self::new(JointKind::DoubleHinge, pivot, pin)
    }

    /// Limit the joint's free axis to `[min, max]`. Ignored by joints without limits.
    pub fn with_limits(self, min: f32, max: f32) -> Self {
        let limits = Some([min, max]);
        let kind = match self.kind {
            JointKind::Hinge { .. } => JointKind::Hinge { limits },
            JointKind::Slider { .. } => JointKind::Slider { limits },
            JointKind::Corkscrew { .. } => JointKind::Corkscrew { limits },
            kind => kind,
        };
        Self { kind, ..self }
    }

    /// Let the connected bodies collide with each other
    pub fn with_collisions(self, collisions_enabled: bool) -> Self {
        Self {
            collisions_enabled,
            ..self
        }
    }

    /// The joint's limits, if it has any
    pub fn limits(&self) -> Option<[f32; 2]> {
        match self.kind {
            JointKind::Hinge { limits }
            | JointKind::Slider { limits }
            | JointKind::Corkscrew { limits } => limits,
            JointKind::BallAndSocket | JointKind::DoubleHinge => None,
        }
    }
}

/// Callbacks the engine invokes synchronously from inside [`PhysicsBackend::advance`].
///
/// `pre_solve` always runs before `post_solve`, on the calling thread, once per advance.
pub trait StepHooks {
    /// Gather forces and dispatch contact notifications
    fn pre_solve(&mut self, backend: &mut dyn PhysicsBackend, timestep: f32);
    /// Pull updated poses back out of the engine
    fn post_solve(&mut self, backend: &mut dyn PhysicsBackend);
}

/// The primitive operations Hotham needs from a rigid body engine.
///
/// Shapes and bodies are referred to by opaque handles. Destroying something that is already gone
/// is a no-op. Setters on a stale body handle return [`crate::HothamError::InvalidHandle`].
pub trait PhysicsBackend: Send {
    /// Build a collision primitive. Degenerate geometry is [`crate::HothamError::InvalidShape`].
    fn create_shape(&mut self, descriptor: &ShapeDescriptor) -> HothamResult<ShapeHandle>;
    /// Build an empty aggregate
    fn create_aggregate(&mut self, kind: AggregateKind) -> HothamResult<ShapeHandle>;
    /// Free a shape. Destroying an aggregate detaches its members without destroying them.
    fn destroy_shape(&mut self, shape: ShapeHandle);
    /// `None` if the handle is stale
    fn shape_kind(&self, shape: ShapeHandle) -> Option<ShapeKind>;

    /// Open an update bracket. Member edits inside the bracket are applied at [`PhysicsBackend::end_update`].
    fn begin_update(&mut self, aggregate: ShapeHandle) -> HothamResult<()>;
    /// Close an update bracket, rebuilding whatever body the aggregate is bound to
    fn end_update(&mut self, aggregate: ShapeHandle) -> HothamResult<()>;
    /// Insert a primitive into an aggregate
    fn add_member(&mut self, aggregate: ShapeHandle, member: ShapeHandle)
        -> HothamResult<SlotHandle>;
    /// Remove one member from an aggregate. The member shape stays alive.
    fn remove_member(&mut self, aggregate: ShapeHandle, slot: SlotHandle) -> HothamResult<()>;
    /// Number of members in an aggregate, `None` if the handle is not a live aggregate
    fn member_count(&self, aggregate: ShapeHandle) -> Option<usize>;

    /// Build a rigid body bound to `descriptor.root`
    fn create_body(&mut self, descriptor: &BodyDescriptor) -> HothamResult<BodyHandle>;
    /// Free a body. Its shapes are left alone.
    fn destroy_body(&mut self, body: BodyHandle);
    /// Bind a different root shape to a body. Colliders and mass properties are rebuilt.
    fn set_body_shape(&mut self, body: BodyHandle, root: ShapeHandle) -> HothamResult<()>;
    /// The root shape currently bound to a body
    fn body_shape(&self, body: BodyHandle) -> Option<ShapeHandle>;
    /// `None` if the handle is stale
    fn body_state(&self, body: BodyHandle) -> Option<BodyState>;

    /// Teleport a body
    fn set_position(&mut self, body: BodyHandle, position: Vec3) -> HothamResult<()>;
    /// Teleport a body
    fn set_rotation(&mut self, body: BodyHandle, rotation: Quat) -> HothamResult<()>;
    /// Overwrite the linear velocity
    fn set_linear_velocity(&mut self, body: BodyHandle, velocity: Vec3) -> HothamResult<()>;
    /// Overwrite the angular velocity
    fn set_angular_velocity(&mut self, body: BodyHandle, velocity: Vec3) -> HothamResult<()>;
    /// Replace the mass parameters and recompute mass properties
    fn set_mass_properties(&mut self, body: BodyHandle, mass: MassSpec) -> HothamResult<()>;
    /// Replace linear and angular damping
    fn set_damping(&mut self, body: BodyHandle, linear: f32, angular: f32) -> HothamResult<()>;
    /// Put a body to sleep, or wake it up
    fn set_sleeping(&mut self, body: BodyHandle, sleeping: bool) -> HothamResult<()>;
    /// Remove a body from, or restore it to, the simulation
    fn set_enabled(&mut self, body: BodyHandle, enabled: bool) -> HothamResult<()>;
    /// Add a force for the current step
    fn add_force(&mut self, body: BodyHandle, force: Vec3) -> HothamResult<()>;
    /// Add a torque for the current step
    fn add_torque(&mut self, body: BodyHandle, torque: Vec3) -> HothamResult<()>;
    /// Replace the opaque value attached to the body
    fn set_user_data(&mut self, body: BodyHandle, user_data: u64) -> HothamResult<()>;
    /// The opaque value attached to the body
    fn user_data(&self, body: BodyHandle) -> Option<u64>;

    /// Connect `child` to `other`, or to the world when `other` is `None`. The joint's pivot frame
    /// is taken relative to the child's current pose.
    fn create_joint(
        &mut self,
        child: BodyHandle,
        other: Option<BodyHandle>,
        joint: &JointDescriptor,
    ) -> HothamResult<JointHandle>;
    /// Free a joint. Destroying either body frees its joints too.
    fn destroy_joint(&mut self, joint: JointHandle);

    /// Buoyancy force and torque on `body` from a fluid of `fluid_density` filling everything below
    /// `plane`. The plane is `(normal, d)` with points `p` below it where `normal.dot(p) + d < 0`.
    /// `None` if the handle is stale.
    fn buoyancy(&self, body: BodyHandle, plane: Vec4, fluid_density: f32) -> Option<(Vec3, Vec3)>;

    /// Advance the simulation by `timestep`, invoking `hooks` along the way
    fn advance(&mut self, timestep: f32, hooks: &mut dyn StepHooks);
    /// Every contact joint currently touching `body`
    fn contact_joints(&self, body: BodyHandle) -> Vec<ContactJoint>;
    /// Nearest hit within `max_distance` of `origin` along `direction`, which need not be
    /// normalized. `max_distance` may be infinite. A `layer_mask` of 0 hits every layer.
    fn ray_cast(
        &self,
        origin: Vec3,
        direction: Vec3,
        max_distance: f32,
        layer_mask: u32,
    ) -> Option<BackendRayHit>;
    /// Write the engine's view of the world to disk
    fn save_scene(&self, path: &Path) -> HothamResult<()>;
    /// Counters, mostly useful for tests and diagnostics
    fn stats(&self) -> BackendStats;
}
