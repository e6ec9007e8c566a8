use glam::{Quat, Vec3};

/// The primitive a [`Collider`] describes. Dimensions are in local (unscaled) units.
#[derive(Debug, Clone, PartialEq)]
pub enum Geometry {
    /// No geometry at all. Useful as a placeholder, but can't be added to a body.
    Null,
    /// A sphere
    Sphere {
        /// Radius of the sphere
        radius: f32,
    },
    /// A box
    Box {
        /// Full extents along each axis
        size: Vec3,
    },
    /// A capsule aligned with the Y axis
    Capsule {
        /// Radius of the hemispherical caps
        radius: f32,
        /// Height of the cylindrical section
        height: f32,
    },
    /// A cylinder aligned with the Y axis
    Cylinder {
        /// Radius of the cylinder
        radius: f32,
        /// Full height
        height: f32,
    },
    /// A cone aligned with the Y axis
    Cone {
        /// Radius of the base
        radius: f32,
        /// Full height
        height: f32,
    },
    /// A cylinder with rounded edges, aligned with the Y axis. Wheels, mostly.
    ChamferCylinder {
        /// Radius of the cylinder
        radius: f32,
        /// Full height, which is also the diameter of the rounded edge
        height: f32,
    },
    /// The convex hull of a point cloud
    ConvexHull {
        /// Points to wrap. At least four, not all coplanar.
        points: Vec<Vec3>,
    },
    /// A static triangle mesh
    TriMesh {
        /// Mesh vertices
        vertices: Vec<Vec3>,
        /// Triangles, as indices into `vertices`
        indices: Vec<[u32; 3]>,
    },
    /// A regular grid of heights in the XZ plane
    HeightField {
        /// Number of rows (along Z)
        rows: usize,
        /// Number of columns (along X)
        columns: usize,
        /// Row-major samples, `rows * columns` of them
        heights: Vec<f32>,
        /// Size of the whole field
        size: Vec3,
    },
}

/// A component that describes one collision primitive.
///
/// Colliders belong to the closest [`super::RigidBody`] found by walking up the entity's
/// [`crate::components::Parent`] chain, including the entity itself. The pose of the primitive
/// relative to that body is the product of the [`crate::components::LocalTransform`]s in between,
/// followed by `position` and `rotation` here.
#[derive(Debug, Clone, PartialEq)]
pub struct Collider {
    /// What shape is this collider?
    pub geometry: Geometry,
    /// Offset from the entity
    pub position: Vec3,
    /// Rotation relative to the entity
    pub rotation: Quat,
    /// Scale applied to the geometry's dimensions
    pub scale: Vec3,
    /// Should `scale` be multiplied by the entity's accumulated transform scale?
    pub inherit_transform_scale: bool,
    /// Is this a trigger? Triggers report overlaps but don't push anything around.
    pub trigger: bool,
    /// Which [`crate::contexts::PhysicsMaterial`] to use. 0 is the default material. How two
    /// materials behave together can be overridden with a [`crate::contexts::MaterialInteraction`].
    pub material: u32,
    /// Which collision layer this collider lives on, 0..32
    pub layer: u32,
}

impl Default for Collider {
    fn default() -> Self {
        Self {
            geometry: Geometry::Null,
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
            inherit_transform_scale: true,
            trigger: false,
            material: 0,
            layer: 0,
        }
    }
}

impl Collider {
    /// Create a new collider
    pub fn new(geometry: Geometry) -> Collider {
        Collider {
            geometry,
            ..Default::default()
        }
    }

    /// Create a new trigger collider
    pub fn trigger(geometry: Geometry) -> Collider {
        Collider {
            geometry,
            trigger: true,
            ..Default::default()
        }
    }

    /// Convenience constructor for a sphere
    pub fn sphere(radius: f32) -> Collider {
        Collider::new(Geometry::Sphere { radius })
    }

    /// Convenience constructor for a box with the given full extents
    pub fn cuboid(size: Vec3) -> Collider {
        Collider::new(Geometry::Box { size })
    }

    /// Move the collider away from its entity
    pub fn with_offset(self, position: Vec3, rotation: Quat) -> Collider {
        Collider {
            position,
            rotation,
            ..self
        }
    }

    /// Put the collider on a collision layer
    pub fn with_layer(self, layer: u32) -> Collider {
        Collider { layer, ..self }
    }

    /// Use a material from [`crate::contexts::PhysicsConfig::materials`]
    pub fn with_material(self, material: u32) -> Collider {
        Collider { material, ..self }
    }
}
