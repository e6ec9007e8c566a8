use std::{collections::HashMap, fs, num::NonZeroUsize, path::Path};

use generational_arena::{Arena, Index};
use glam::{Quat, Vec3, Vec4};
use log::{debug, trace};
use rapier3d::{
    dynamics::{
        CCDSolver, GenericJointBuilder, ImpulseJointHandle, ImpulseJointSet,
        IntegrationParameters, IslandManager, JointAxesMask, JointAxis, MultibodyJointSet,
        RigidBody, RigidBodyBuilder, RigidBodyHandle, RigidBodySet,
    },
    geometry::{
        ActiveCollisionTypes, BroadPhaseMultiSap, ColliderBuilder, ColliderHandle, ColliderSet,
        Group, InteractionGroups, NarrowPhase, Ray, SharedShape, SolverFlags,
    },
    na::{DMatrix, Isometry3, Point3, Vector3},
    parry::{mass_properties::MassProperties, query::PointQuery, shape::TriMesh},
    pipeline::{
        ActiveHooks, ContactModificationContext, PairFilterContext, PhysicsHooks,
        PhysicsPipeline, QueryFilter, QueryPipeline,
    },
};
use serde::Serialize;

use super::{
    AggregateKind, BackendRayHit, BackendStats, BodyDescriptor, BodyHandle, BodyState,
    ContactJoint, ContactPoint, JointDescriptor, JointHandle, JointKind, MassSpec,
    PhysicsBackend, ShapeDescriptor, ShapeHandle, ShapeKind, SlotHandle, StepHooks,
};
use crate::{
    components::{BodyType, Geometry},
    contexts::{MaterialInteraction, PhysicsConfig, PhysicsMaterial},
    util::{
        decompose_isometry, glam_vec_from_na, is_positive_finite, isometry_from_parts,
        na_rotation_from_glam, na_vector_from_glam,
    },
    HothamError, HothamResult,
};

/// A [`PhysicsBackend`] built on [`rapier3d`].
///
/// Primitives become rapier shapes. Binding a root shape to a body attaches one rapier collider
/// per primitive: a plain shape contributes one, an aggregate one per member and a Null shape none.
/// Aggregate edits made inside an update bracket are applied in one rebuild when the bracket closes.
/// Joints become rapier impulse joints. Joints to the world hang off a shared fixed anchor body.
pub struct RapierBackend {
    pipeline: PhysicsPipeline,
    gravity: Vector3<f32>,
    integration_parameters: IntegrationParameters,
    islands: IslandManager,
    broad_phase: BroadPhaseMultiSap,
    narrow_phase: NarrowPhase,
    rigid_bodies: RigidBodySet,
    colliders: ColliderSet,
    impulse_joints: ImpulseJointSet,
    multibody_joints: MultibodyJointSet,
    ccd_solver: CCDSolver,
    query_pipeline: QueryPipeline,
    shapes: Arena<ShapeEntry>,
    bodies: Arena<BodyEntry>,
    joints: Arena<JointEntry>,
    anchor: Option<RigidBodyHandle>,
    materials: MaterialTable,
}

struct ShapeEntry {
    kind: ShapeKind,
    /// `None` for Null shapes and aggregates
    shape: Option<SharedShape>,
    pose: Isometry3<f32>,
    trigger: bool,
    material: u32,
    layer: u32,
    /// The aggregate this primitive is a member of
    parent: Option<Index>,
    /// Aggregates only
    members: Arena<Index>,
    updating: bool,
    dirty: bool,
    bound_to: Option<Index>,
}

impl ShapeEntry {
    fn new(kind: ShapeKind) -> Self {
        Self {
            kind,
            shape: None,
            pose: Isometry3::identity(),
            trigger: false,
            material: 0,
            layer: 0,
            parent: None,
            members: Arena::new(),
            updating: false,
            dirty: false,
            bound_to: None,
        }
    }
}

struct BodyEntry {
    handle: RigidBodyHandle,
    body_type: BodyType,
    root: Option<Index>,
    colliders: Vec<ColliderHandle>,
    mass: MassSpec,
}

struct JointEntry {
    handle: ImpulseJointHandle,
    child: Index,
    other: Option<Index>,
}

/// Below this sliding speed, in m/s, a contact uses static friction
const STATIC_FRICTION_SPEED: f32 = 0.05;

/// Samples per axis when measuring how much of a collider is submerged
const BUOYANCY_SAMPLES: usize = 10;

/// Surface properties for every pair of material ids. Rapier consults it while building contacts.
struct MaterialTable {
    default: PhysicsMaterial,
    materials: HashMap<u32, PhysicsMaterial>,
    interactions: HashMap<(u32, u32), MaterialInteraction>,
}

impl MaterialTable {
    fn new(config: &PhysicsConfig) -> Self {
        let interactions = config
            .material_interactions
            .iter()
            .map(|i| {
                let [a, b] = i.materials;
                ((a.min(b), a.max(b)), *i)
            })
            .collect();
        Self {
            default: config.default_material,
            materials: config.materials.clone(),
            interactions,
        }
    }

    fn material(&self, id: u32) -> PhysicsMaterial {
        if id == 0 {
            return self.default;
        }
        self.materials.get(&id).copied().unwrap_or(self.default)
    }

    fn interaction(&self, a: u32, b: u32) -> MaterialInteraction {
        match self.interactions.get(&(a.min(b), a.max(b))) {
            Some(interaction) => *interaction,
            None => MaterialInteraction::between([a, b], self.material(a), self.material(b)),
        }
    }

    fn between(
        &self,
        colliders: &ColliderSet,
        collider1: ColliderHandle,
        collider2: ColliderHandle,
    ) -> MaterialInteraction {
        let material = |handle| {
            colliders
                .get(handle)
                .map(|c| (c.user_data >> 64) as u32)
                .unwrap_or_default()
        };
        self.interaction(material(collider1), material(collider2))
    }
}

impl PhysicsHooks for MaterialTable {
    fn filter_contact_pair(&self, context: &PairFilterContext) -> Option<SolverFlags> {
        self.between(context.colliders, context.collider1, context.collider2)
            .collision_enabled
            .then_some(SolverFlags::COMPUTE_IMPULSES)
    }

    fn filter_intersection_pair(&self, context: &PairFilterContext) -> bool {
        self.between(context.colliders, context.collider1, context.collider2)
            .collision_enabled
    }

    fn modify_solver_contacts(&self, context: &mut ContactModificationContext) {
        let interaction = self.between(context.colliders, context.collider1, context.collider2);
        let bodies = context.bodies;
        let body1 = context.rigid_body1.and_then(|h| bodies.get(h));
        let body2 = context.rigid_body2.and_then(|h| bodies.get(h));
        let velocity_at = |body: Option<&RigidBody>, point: &Point3<f32>| {
            body.map(|b| b.velocity_at_point(point))
                .unwrap_or_else(Vector3::zeros)
        };
        let normal = *context.normal;

        for contact in context.solver_contacts.iter_mut() {
            let relative = velocity_at(body1, &contact.point) - velocity_at(body2, &contact.point);
            let sliding = relative - normal * relative.dot(&normal);
            contact.friction = if sliding.norm() < STATIC_FRICTION_SPEED {
                interaction.static_friction
            } else {
                interaction.kinetic_friction
            };
            contact.restitution = interaction.restitution;
        }
    }
}

#[derive(Serialize)]
struct SceneSnapshot {
    gravity: Vec3,
    bodies: Vec<BodySnapshot>,
}

#[derive(Serialize)]
struct BodySnapshot {
    user_data: u64,
    body_type: BodyType,
    root: Option<ShapeKind>,
    colliders: usize,
    state: BodyState,
}

fn pack(index: Index) -> u64 {
    let (index, generation) = index.into_raw_parts();
    (generation << 32) | index as u64
}

fn unpack(raw: u64) -> Index {
    Index::from_raw_parts((raw & 0xffff_ffff) as usize, raw >> 32)
}

impl Default for RapierBackend {
    fn default() -> Self {
        Self::new(&PhysicsConfig::default())
    }
}

impl RapierBackend {
    /// Create an empty world using the gravity and solver settings in `config`
    pub fn new(config: &PhysicsConfig) -> Self {
        let mut integration_parameters = IntegrationParameters {
            dt: config.timestep,
            ..Default::default()
        };
        if let Some(iterations) = NonZeroUsize::new(config.solver_iterations) {
            integration_parameters.num_solver_iterations = iterations;
        }

        Self {
            pipeline: PhysicsPipeline::new(),
            gravity: na_vector_from_glam(config.gravity),
            integration_parameters,
            islands: IslandManager::new(),
            broad_phase: BroadPhaseMultiSap::new(),
            narrow_phase: NarrowPhase::new(),
            rigid_bodies: RigidBodySet::new(),
            colliders: ColliderSet::new(),
            impulse_joints: ImpulseJointSet::new(),
            multibody_joints: MultibodyJointSet::new(),
            ccd_solver: CCDSolver::new(),
            query_pipeline: QueryPipeline::new(),
            shapes: Arena::new(),
            bodies: Arena::new(),
            joints: Arena::new(),
            anchor: None,
            materials: MaterialTable::new(config),
        }
    }

    /// The fixed body that joints to the world are attached to
    fn anchor(&mut self) -> RigidBodyHandle {
        if let Some(anchor) = self.anchor.filter(|a| self.rigid_bodies.contains(*a)) {
            return anchor;
        }
        let anchor = self.rigid_bodies.insert(RigidBodyBuilder::fixed().build());
        self.anchor = Some(anchor);
        anchor
    }

    fn aggregate_mut(&mut self, aggregate: ShapeHandle) -> HothamResult<&mut ShapeEntry> {
        let entry = self
            .shapes
            .get_mut(unpack(aggregate.raw()))
            .ok_or(HothamError::InvalidHandle)?;
        if !entry.kind.is_aggregate() {
            return Err(HothamError::structural(format!(
                "{:?} shape is not an aggregate",
                entry.kind
            )));
        }
        Ok(entry)
    }

    fn rigid_body_mut(
        &mut self,
        body: BodyHandle,
    ) -> HothamResult<&mut rapier3d::dynamics::RigidBody> {
        let entry = self
            .bodies
            .get(unpack(body.raw()))
            .ok_or(HothamError::InvalidHandle)?;
        self.rigid_bodies
            .get_mut(entry.handle)
            .ok_or(HothamError::InvalidHandle)
    }

    /// Can `root` be bound to `body`? Members of an aggregate and shapes bound elsewhere can't.
    fn check_bindable(&self, root: Index, body: Option<Index>) -> HothamResult<()> {
        let entry = self.shapes.get(root).ok_or(HothamError::InvalidHandle)?;
        if entry.parent.is_some() {
            return Err(HothamError::structural(
                "a shape inside an aggregate can't be bound to a body",
            ));
        }
        match entry.bound_to {
            Some(other) if Some(other) != body => Err(HothamError::structural(
                "shape is already bound to another body",
            )),
            _ => Ok(()),
        }
    }

    /// An aggregate changed: rebuild its body now, or when the open bracket closes.
    fn touch(&mut self, aggregate: Index) {
        let Some(entry) = self.shapes.get_mut(aggregate) else {
            return;
        };
        if entry.updating {
            entry.dirty = true;
        } else if let Some(body) = entry.bound_to {
            self.rebuild(body);
        }
    }

    fn primitives(&self, root: Index) -> Vec<Index> {
        match self.shapes.get(root) {
            Some(entry) if entry.kind.is_aggregate() => {
                entry.members.iter().map(|(_, member)| *member).collect()
            }
            Some(entry) if entry.shape.is_some() => vec![root],
            _ => Vec::new(),
        }
    }

    /// Replace every collider attached to `body` with fresh ones built from its root shape.
    fn rebuild(&mut self, body: Index) {
        let Some(entry) = self.bodies.get_mut(body) else {
            return;
        };
        let handle = entry.handle;
        let root = entry.root;
        for collider in entry.colliders.drain(..) {
            self.colliders
                .remove(collider, &mut self.islands, &mut self.rigid_bodies, true);
        }

        let mut colliders = Vec::new();
        for primitive in root.map(|r| self.primitives(r)).unwrap_or_default() {
            let Some(shape_entry) = self.shapes.get(primitive) else {
                continue;
            };
            let Some(shape) = shape_entry.shape.clone() else {
                continue;
            };
            let active_collision_types = if shape_entry.trigger {
                ActiveCollisionTypes::all()
            } else {
                ActiveCollisionTypes::default()
            };
            let material = self.materials.material(shape_entry.material);
            let collider = ColliderBuilder::new(shape)
                .position(shape_entry.pose)
                .sensor(shape_entry.trigger)
                .friction(material.kinetic_friction)
                .restitution(material.restitution)
                .active_hooks(
                    ActiveHooks::FILTER_CONTACT_PAIRS
                        | ActiveHooks::FILTER_INTERSECTION_PAIR
                        | ActiveHooks::MODIFY_SOLVER_CONTACTS,
                )
                .density(0.)
                .collision_groups(InteractionGroups::new(
                    Group::from_bits_truncate(1 << shape_entry.layer),
                    Group::ALL,
                ))
                .active_collision_types(active_collision_types)
                // Primitive in the low half, material id in the high half
                .user_data(pack(primitive) as u128 | (shape_entry.material as u128) << 64)
                .build();
            colliders.push(self.colliders.insert_with_parent(
                collider,
                handle,
                &mut self.rigid_bodies,
            ));
        }
        trace!("[HOTHAM_PHYSICS] Rebuilt body with {} colliders", colliders.len());

        if let Some(entry) = self.bodies.get_mut(body) {
            entry.colliders = colliders;
        }
        self.update_mass(body);
    }

    fn update_mass(&mut self, body: Index) {
        let Some(entry) = self.bodies.get(body) else {
            return;
        };
        if entry.body_type != BodyType::Dynamic {
            return;
        }
        let handle = entry.handle;
        let mass_properties = self.mass_properties(entry.root, entry.mass);
        if let Some(rigid_body) = self.rigid_bodies.get_mut(handle) {
            rigid_body.set_additional_mass_properties(mass_properties, true);
            rigid_body.recompute_mass_properties_from_colliders(&self.colliders);
        }
    }

    /// Scale the unit-density mass properties of the body's shape up to the requested mass,
    /// then apply any explicit overrides.
    fn mass_properties(&self, root: Option<Index>, spec: MassSpec) -> MassProperties {
        let unit = root
            .map(|r| self.primitives(r))
            .unwrap_or_default()
            .into_iter()
            .filter_map(|primitive| self.shapes.get(primitive))
            .filter_map(|entry| {
                entry
                    .shape
                    .as_ref()
                    .map(|shape| shape.mass_properties(1.).transform_by(&entry.pose))
            })
            .fold(MassProperties::default(), |acc, props| acc + props);

        let center_of_mass = spec
            .center_of_mass
            .map(|c| Point3::new(c.x, c.y, c.z))
            .unwrap_or(unit.local_com);

        match spec.inertia {
            Some(inertia) => {
                MassProperties::new(center_of_mass, spec.mass, na_vector_from_glam(inertia))
            }
            None => {
                let unit_mass = unit.mass();
                let principal_inertia = if unit_mass > 0. {
                    unit.principal_inertia() * (spec.mass / unit_mass)
                } else {
                    Vector3::repeat(spec.mass)
                };
                MassProperties::with_principal_inertia_frame(
                    center_of_mass,
                    spec.mass,
                    principal_inertia,
                    unit.principal_inertia_local_frame,
                )
            }
        }
    }

    fn body_user_data(&self, handle: RigidBodyHandle) -> Option<u64> {
        self.rigid_bodies
            .get(handle)
            .map(|rigid_body| rigid_body.user_data as u64)
    }
}

fn check_positive(value: f32, what: &str) -> HothamResult<f32> {
    if value.is_finite() && value > 0. {
        Ok(value)
    } else {
        Err(HothamError::invalid_shape(format!(
            "{what} must be positive and finite, got {value}"
        )))
    }
}

fn check_joint(joint: &JointDescriptor) -> HothamResult<()> {
    if !joint.pivot.is_finite() {
        return Err(HothamError::invalid_joint(format!(
            "pivot must be finite, got {}",
            joint.pivot
        )));
    }
    if !joint.pin.is_finite() || joint.pin.length_squared() < 1e-12 {
        return Err(HothamError::invalid_joint(format!(
            "pin must be a finite, non-zero direction, got {}",
            joint.pin
        )));
    }
    if let Some([min, max]) = joint.limits() {
        if !(min.is_finite() && max.is_finite() && min <= max) {
            return Err(HothamError::invalid_joint(format!(
                "limits must be finite with min <= max, got [{min}, {max}]"
            )));
        }
    }
    Ok(())
}

/// The axes a joint locks, in its pivot frame
fn locked_axes(kind: JointKind) -> JointAxesMask {
    match kind {
        JointKind::BallAndSocket => JointAxesMask::LOCKED_SPHERICAL_AXES,
        JointKind::Hinge { .. } => JointAxesMask::LOCKED_REVOLUTE_AXES,
        JointKind::Slider { .. } => JointAxesMask::LOCKED_PRISMATIC_AXES,
        JointKind::Corkscrew { .. } => {
            JointAxesMask::LIN_Y | JointAxesMask::LIN_Z | JointAxesMask::ANG_Y | JointAxesMask::ANG_Z
        }
        JointKind::DoubleHinge => JointAxesMask::LIN_AXES | JointAxesMask::ANG_Y,
    }
}

fn to_point(v: Vec3) -> Point3<f32> {
    Point3::new(v.x, v.y, v.z)
}

/// `true` if every point lies on one plane (or line, or point)
fn is_flat(points: &[Point3<f32>]) -> bool {
    let Some(origin) = points.first() else {
        return true;
    };
    let epsilon = 1e-6;
    let Some(axis) = points.iter().map(|p| p - origin).find(|d| d.norm() > epsilon) else {
        return true;
    };
    let Some(normal) = points
        .iter()
        .map(|p| axis.cross(&(p - origin)))
        .find(|n| n.norm() > epsilon)
    else {
        return true;
    };
    let normal = normal.normalize();
    points
        .iter()
        .all(|p| normal.dot(&(p - origin)).abs() <= epsilon)
}

/// Turn a [`Geometry`] into a rapier shape, scaled. Null geometry has no shape.
fn build_shape(geometry: &Geometry, scale: Vec3) -> HothamResult<Option<SharedShape>> {
    if !is_positive_finite(scale) {
        return Err(HothamError::invalid_shape(format!(
            "scale must be positive and finite, got {scale}"
        )));
    }
    let radial_scale = scale.x.max(scale.z);

    let shape = match geometry {
        Geometry::Null => return Ok(None),
        Geometry::Sphere { radius } => {
            SharedShape::ball(check_positive(radius * scale.max_element(), "sphere radius")?)
        }
        Geometry::Box { size } => {
            let half_extents = *size * scale * 0.5;
            if !is_positive_finite(half_extents) {
                return Err(HothamError::invalid_shape(format!(
                    "box size must be positive and finite, got {size}"
                )));
            }
            SharedShape::cuboid(half_extents.x, half_extents.y, half_extents.z)
        }
        Geometry::Capsule { radius, height } => {
            let radius = check_positive(radius * radial_scale, "capsule radius")?;
            let height = height * scale.y;
            if !height.is_finite() || height < 0. {
                return Err(HothamError::invalid_shape(format!(
                    "capsule height must be finite and non-negative, got {height}"
                )));
            }
            SharedShape::capsule_y(height * 0.5, radius)
        }
        Geometry::Cylinder { radius, height } => SharedShape::cylinder(
            check_positive(height * scale.y, "cylinder height")? * 0.5,
            check_positive(radius * radial_scale, "cylinder radius")?,
        ),
        Geometry::Cone { radius, height } => SharedShape::cone(
            check_positive(height * scale.y, "cone height")? * 0.5,
            check_positive(radius * radial_scale, "cone radius")?,
        ),
        Geometry::ChamferCylinder { radius, height } => {
            let height = check_positive(height * scale.y, "chamfer cylinder height")?;
            let border = height * 0.25;
            let radius = check_positive(
                radius * radial_scale - border,
                "chamfer cylinder radius beyond the rounded edge",
            )?;
            SharedShape::round_cylinder(height * 0.25, radius, border)
        }
        Geometry::ConvexHull { points } => {
            let points: Vec<_> = points.iter().map(|p| to_point(*p * scale)).collect();
            if points.len() < 4 {
                return Err(HothamError::invalid_shape(format!(
                    "a convex hull needs at least 4 points, got {}",
                    points.len()
                )));
            }
            if points.iter().any(|p| !p.coords.iter().all(|c| c.is_finite())) || is_flat(&points)
            {
                return Err(HothamError::invalid_shape(
                    "convex hull points are flat or not finite",
                ));
            }
            SharedShape::convex_hull(&points)
                .ok_or_else(|| HothamError::invalid_shape("unable to compute convex hull"))?
        }
        Geometry::TriMesh { vertices, indices } => {
            if indices.is_empty() {
                return Err(HothamError::invalid_shape("triangle mesh has no triangles"));
            }
            if indices
                .iter()
                .flatten()
                .any(|i| *i as usize >= vertices.len())
            {
                return Err(HothamError::invalid_shape(
                    "triangle mesh index out of range",
                ));
            }
            let vertices = vertices.iter().map(|v| to_point(*v * scale)).collect();
            let trimesh = TriMesh::new(vertices, indices.clone()).map_err(|e| {
                HothamError::invalid_shape(format!("failed to create triangle mesh: {e:?}"))
            })?;
            SharedShape::new(trimesh)
        }
        Geometry::HeightField {
            rows,
            columns,
            heights,
            size,
        } => {
            if *rows < 2 || *columns < 2 {
                return Err(HothamError::invalid_shape(format!(
                    "height field must be at least 2x2, got {rows}x{columns}"
                )));
            }
            if heights.len() != rows * columns {
                return Err(HothamError::invalid_shape(format!(
                    "height field expected {} samples, got {}",
                    rows * columns,
                    heights.len()
                )));
            }
            if heights.iter().any(|h| !h.is_finite()) {
                return Err(HothamError::invalid_shape("height field sample is not finite"));
            }
            let size = *size * scale;
            if !is_positive_finite(size) {
                return Err(HothamError::invalid_shape(format!(
                    "height field size must be positive and finite, got {size}"
                )));
            }
            SharedShape::heightfield(
                DMatrix::from_row_slice(*rows, *columns, heights),
                na_vector_from_glam(size),
            )
        }
    };

    Ok(Some(shape))
}

impl PhysicsBackend for RapierBackend {
    fn create_shape(&mut self, descriptor: &ShapeDescriptor) -> HothamResult<ShapeHandle> {
        if descriptor.layer >= 32 {
            return Err(HothamError::invalid_shape(format!(
                "collision layer must be below 32, got {}",
                descriptor.layer
            )));
        }
        if !descriptor.position.is_finite() || !descriptor.rotation.is_finite() {
            return Err(HothamError::invalid_shape("shape pose is not finite"));
        }

        let shape = build_shape(&descriptor.geometry, descriptor.scale)?;
        let mut entry = ShapeEntry::new(ShapeKind::from(&descriptor.geometry));
        entry.shape = shape;
        entry.pose = isometry_from_parts(descriptor.position, descriptor.rotation);
        entry.trigger = descriptor.trigger;
        entry.material = descriptor.material;
        entry.layer = descriptor.layer;

        Ok(ShapeHandle::from_raw(pack(self.shapes.insert(entry))))
    }

    fn create_aggregate(&mut self, kind: AggregateKind) -> HothamResult<ShapeHandle> {
        let index = self.shapes.insert(ShapeEntry::new(kind.into()));
        Ok(ShapeHandle::from_raw(pack(index)))
    }

    fn destroy_shape(&mut self, shape: ShapeHandle) {
        let index = unpack(shape.raw());
        let Some(entry) = self.shapes.remove(index) else {
            return;
        };

        if let Some(aggregate) = entry.parent {
            if let Some(parent) = self.shapes.get_mut(aggregate) {
                parent.members.retain(|_, member| *member != index);
            }
            self.touch(aggregate);
        }

        for (_, member) in entry.members.iter() {
            if let Some(member) = self.shapes.get_mut(*member) {
                member.parent = None;
            }
        }

        if let Some(body) = entry.bound_to {
            if let Some(body_entry) = self.bodies.get_mut(body) {
                body_entry.root = None;
            }
            self.rebuild(body);
        }
    }

    fn shape_kind(&self, shape: ShapeHandle) -> Option<ShapeKind> {
        self.shapes.get(unpack(shape.raw())).map(|entry| entry.kind)
    }

    fn begin_update(&mut self, aggregate: ShapeHandle) -> HothamResult<()> {
        let entry = self.aggregate_mut(aggregate)?;
        if entry.updating {
            return Err(HothamError::bracket("update already in progress"));
        }
        entry.updating = true;
        Ok(())
    }

    fn end_update(&mut self, aggregate: ShapeHandle) -> HothamResult<()> {
        let entry = self.aggregate_mut(aggregate)?;
        if !entry.updating {
            return Err(HothamError::bracket("no update in progress"));
        }
        entry.updating = false;
        let dirty = std::mem::take(&mut entry.dirty);
        let bound_to = entry.bound_to;
        if let (true, Some(body)) = (dirty, bound_to) {
            self.rebuild(body);
        }
        Ok(())
    }

    fn add_member(
        &mut self,
        aggregate: ShapeHandle,
        member: ShapeHandle,
    ) -> HothamResult<SlotHandle> {
        let aggregate_index = unpack(aggregate.raw());
        let member_index = unpack(member.raw());
        self.aggregate_mut(aggregate)?;

        let member_entry = self
            .shapes
            .get_mut(member_index)
            .ok_or(HothamError::InvalidHandle)?;
        match member_entry.kind {
            ShapeKind::Null => {
                return Err(HothamError::invalid_shape(
                    "a Null shape can't be an aggregate member",
                ))
            }
            kind if kind.is_aggregate() => {
                return Err(HothamError::structural("aggregates can't be nested"))
            }
            _ => {}
        }
        if member_entry.parent.is_some() {
            return Err(HothamError::structural(
                "shape is already a member of an aggregate",
            ));
        }
        member_entry.parent = Some(aggregate_index);

        let slot = self.aggregate_mut(aggregate)?.members.insert(member_index);
        self.touch(aggregate_index);
        Ok(SlotHandle::from_raw(pack(slot)))
    }

    fn remove_member(&mut self, aggregate: ShapeHandle, slot: SlotHandle) -> HothamResult<()> {
        let member = self
            .aggregate_mut(aggregate)?
            .members
            .remove(unpack(slot.raw()))
            .ok_or(HothamError::InvalidHandle)?;
        if let Some(member) = self.shapes.get_mut(member) {
            member.parent = None;
        }
        self.touch(unpack(aggregate.raw()));
        Ok(())
    }

    fn member_count(&self, aggregate: ShapeHandle) -> Option<usize> {
        self.shapes
            .get(unpack(aggregate.raw()))
            .filter(|entry| entry.kind.is_aggregate())
            .map(|entry| entry.members.len())
    }

    fn create_body(&mut self, descriptor: &BodyDescriptor) -> HothamResult<BodyHandle> {
        let root = unpack(descriptor.root.raw());
        self.check_bindable(root, None)?;

        let builder = match descriptor.body_type {
            BodyType::Dynamic => RigidBodyBuilder::dynamic(),
            BodyType::Kinematic => RigidBodyBuilder::kinematic_position_based(),
            BodyType::Static => RigidBodyBuilder::fixed(),
        };
        let rigid_body = builder
            .position(isometry_from_parts(descriptor.position, descriptor.rotation))
            .linvel(na_vector_from_glam(descriptor.linear_velocity))
            .angvel(na_vector_from_glam(descriptor.angular_velocity))
            .linear_damping(descriptor.linear_damping)
            .angular_damping(descriptor.angular_damping)
            .enabled(descriptor.enabled)
            .user_data(descriptor.user_data as u128)
            .build();
        let handle = self.rigid_bodies.insert(rigid_body);

        let index = self.bodies.insert(BodyEntry {
            handle,
            body_type: descriptor.body_type,
            root: Some(root),
            colliders: Vec::new(),
            mass: descriptor.mass,
        });
        if let Some(shape) = self.shapes.get_mut(root) {
            shape.bound_to = Some(index);
        }
        self.rebuild(index);

        debug!(
            "[HOTHAM_PHYSICS] Created {:?} body {}",
            descriptor.body_type, descriptor.user_data
        );
        Ok(BodyHandle::from_raw(pack(index)))
    }

    fn destroy_body(&mut self, body: BodyHandle) {
        let index = unpack(body.raw());
        let Some(entry) = self.bodies.remove(index) else {
            return;
        };
        // Rapier drops the body's joints along with it
        self.joints
            .retain(|_, joint| joint.child != index && joint.other != Some(index));
        if let Some(shape) = entry.root.and_then(|root| self.shapes.get_mut(root)) {
            shape.bound_to = None;
        }
        self.rigid_bodies.remove(
            entry.handle,
            &mut self.islands,
            &mut self.colliders,
            &mut self.impulse_joints,
            &mut self.multibody_joints,
            true,
        );
    }

    fn set_body_shape(&mut self, body: BodyHandle, root: ShapeHandle) -> HothamResult<()> {
        let body_index = unpack(body.raw());
        let root_index = unpack(root.raw());
        let old_root = self
            .bodies
            .get(body_index)
            .ok_or(HothamError::InvalidHandle)?
            .root;
        self.check_bindable(root_index, Some(body_index))?;

        if let Some(old) = old_root.and_then(|old| self.shapes.get_mut(old)) {
            old.bound_to = None;
        }
        if let Some(shape) = self.shapes.get_mut(root_index) {
            shape.bound_to = Some(body_index);
        }
        if let Some(entry) = self.bodies.get_mut(body_index) {
            entry.root = Some(root_index);
        }
        self.rebuild(body_index);
        Ok(())
    }

    fn body_shape(&self, body: BodyHandle) -> Option<ShapeHandle> {
        self.bodies
            .get(unpack(body.raw()))
            .and_then(|entry| entry.root)
            .map(|root| ShapeHandle::from_raw(pack(root)))
    }

    fn body_state(&self, body: BodyHandle) -> Option<BodyState> {
        let entry = self.bodies.get(unpack(body.raw()))?;
        let rigid_body = self.rigid_bodies.get(entry.handle)?;
        let (rotation, position) = decompose_isometry(rigid_body.position());
        let local_mass_properties = &rigid_body.mass_properties().local_mprops;
        let center_of_mass = local_mass_properties.local_com;
        Some(BodyState {
            position,
            rotation,
            linear_velocity: glam_vec_from_na(rigid_body.linvel()),
            angular_velocity: glam_vec_from_na(rigid_body.angvel()),
            mass: rigid_body.mass(),
            center_of_mass: glam_vec_from_na(&center_of_mass.coords),
            inertia: glam_vec_from_na(&local_mass_properties.principal_inertia()),
            linear_damping: rigid_body.linear_damping(),
            angular_damping: rigid_body.angular_damping(),
            sleeping: rigid_body.is_sleeping(),
            enabled: rigid_body.is_enabled(),
        })
    }

    fn set_position(&mut self, body: BodyHandle, position: Vec3) -> HothamResult<()> {
        self.rigid_body_mut(body)?
            .set_translation(na_vector_from_glam(position), true);
        Ok(())
    }

    fn set_rotation(&mut self, body: BodyHandle, rotation: Quat) -> HothamResult<()> {
        self.rigid_body_mut(body)?
            .set_rotation(na_rotation_from_glam(rotation), true);
        Ok(())
    }

    fn set_linear_velocity(&mut self, body: BodyHandle, velocity: Vec3) -> HothamResult<()> {
        self.rigid_body_mut(body)?
            .set_linvel(na_vector_from_glam(velocity), true);
        Ok(())
    }

    fn set_angular_velocity(&mut self, body: BodyHandle, velocity: Vec3) -> HothamResult<()> {
        self.rigid_body_mut(body)?
            .set_angvel(na_vector_from_glam(velocity), true);
        Ok(())
    }

    fn set_mass_properties(&mut self, body: BodyHandle, mass: MassSpec) -> HothamResult<()> {
        let index = unpack(body.raw());
        self.bodies
            .get_mut(index)
            .ok_or(HothamError::InvalidHandle)?
            .mass = mass;
        self.update_mass(index);
        Ok(())
    }

    fn set_damping(&mut self, body: BodyHandle, linear: f32, angular: f32) -> HothamResult<()> {
        let rigid_body = self.rigid_body_mut(body)?;
        rigid_body.set_linear_damping(linear);
        rigid_body.set_angular_damping(angular);
        Ok(())
    }

    fn set_sleeping(&mut self, body: BodyHandle, sleeping: bool) -> HothamResult<()> {
        let rigid_body = self.rigid_body_mut(body)?;
        if sleeping {
            rigid_body.sleep();
        } else {
            rigid_body.wake_up(true);
        }
        Ok(())
    }

    fn set_enabled(&mut self, body: BodyHandle, enabled: bool) -> HothamResult<()> {
        self.rigid_body_mut(body)?.set_enabled(enabled);
        Ok(())
    }

    fn add_force(&mut self, body: BodyHandle, force: Vec3) -> HothamResult<()> {
        self.rigid_body_mut(body)?
            .add_force(na_vector_from_glam(force), true);
        Ok(())
    }

    fn add_torque(&mut self, body: BodyHandle, torque: Vec3) -> HothamResult<()> {
        self.rigid_body_mut(body)?
            .add_torque(na_vector_from_glam(torque), true);
        Ok(())
    }

    fn set_user_data(&mut self, body: BodyHandle, user_data: u64) -> HothamResult<()> {
        self.rigid_body_mut(body)?.user_data = user_data as u128;
        Ok(())
    }

    fn user_data(&self, body: BodyHandle) -> Option<u64> {
        let entry = self.bodies.get(unpack(body.raw()))?;
        self.body_user_data(entry.handle)
    }

    fn create_joint(
        &mut self,
        child: BodyHandle,
        other: Option<BodyHandle>,
        joint: &JointDescriptor,
    ) -> HothamResult<JointHandle> {
        check_joint(joint)?;
        let child_index = unpack(child.raw());
        let other_index = other.map(|o| unpack(o.raw()));
        if other_index == Some(child_index) {
            return Err(HothamError::structural("a body can't be jointed to itself"));
        }

        let child_handle = self
            .bodies
            .get(child_index)
            .ok_or(HothamError::InvalidHandle)?
            .handle;
        let other_handle = match other_index {
            Some(index) => {
                self.bodies
                    .get(index)
                    .ok_or(HothamError::InvalidHandle)?
                    .handle
            }
            None => self.anchor(),
        };
        let pose_of = |handle| {
            self.rigid_bodies
                .get(handle)
                .map(|b| *b.position())
                .ok_or(HothamError::InvalidHandle)
        };
        let child_pose = pose_of(child_handle)?;
        let other_pose = pose_of(other_handle)?;

        // The pivot frame is given relative to the child, and expressed again relative to the
        // other body so both agree on where it is right now.
        let child_frame = isometry_from_parts(
            joint.pivot,
            Quat::from_rotation_arc(Vec3::X, joint.pin.normalize()),
        );
        let other_frame = other_pose.inv_mul(&(child_pose * child_frame));

        let mut builder = GenericJointBuilder::new(locked_axes(joint.kind))
            .local_frame1(other_frame)
            .local_frame2(child_frame)
            .contacts_enabled(joint.collisions_enabled);
        if let Some(limits) = joint.limits() {
            let axis = match joint.kind {
                JointKind::Hinge { .. } => JointAxis::AngX,
                _ => JointAxis::LinX,
            };
            builder = builder.limits(axis, limits);
        }
        let handle = self
            .impulse_joints
            .insert(other_handle, child_handle, builder.build(), true);

        let index = self.joints.insert(JointEntry {
            handle,
            child: child_index,
            other: other_index,
        });
        debug!("[HOTHAM_PHYSICS] Created {:?} joint", joint.kind);
        Ok(JointHandle::from_raw(pack(index)))
    }

    fn destroy_joint(&mut self, joint: JointHandle) {
        if let Some(entry) = self.joints.remove(unpack(joint.raw())) {
            self.impulse_joints.remove(entry.handle, true);
        }
    }

    fn buoyancy(&self, body: BodyHandle, plane: Vec4, fluid_density: f32) -> Option<(Vec3, Vec3)> {
        let entry = self.bodies.get(unpack(body.raw()))?;
        let rigid_body = self.rigid_bodies.get(entry.handle)?;
        let normal = plane.truncate();

        // Sample each collider's bounding box on a grid, keeping the cells inside the shape and
        // below the surface
        let mut volume = 0.;
        let mut moment = Vec3::ZERO;
        for collider in entry.colliders.iter().filter_map(|c| self.colliders.get(*c)) {
            if collider.is_sensor() {
                continue;
            }
            // Collider poses only catch up with teleports during the next step
            let pose = rigid_body.position()
                * collider
                    .position_wrt_parent()
                    .copied()
                    .unwrap_or_else(Isometry3::identity);
            let shape = collider.shape();
            let aabb = shape.compute_local_aabb();
            let cell = glam_vec_from_na(&aabb.extents()) / BUOYANCY_SAMPLES as f32;
            let cell_volume = cell.x * cell.y * cell.z;
            for i in 0..BUOYANCY_SAMPLES {
                for j in 0..BUOYANCY_SAMPLES {
                    for k in 0..BUOYANCY_SAMPLES {
                        let offset = cell * (Vec3::new(i as f32, j as f32, k as f32) + 0.5);
                        let local = aabb.mins + na_vector_from_glam(offset);
                        if !shape.contains_local_point(&local) {
                            continue;
                        }
                        let point = glam_vec_from_na(&(pose * local).coords);
                        if normal.dot(point) + plane.w < 0. {
                            volume += cell_volume;
                            moment += point * cell_volume;
                        }
                    }
                }
            }
        }

        if volume <= 0. {
            return Some((Vec3::ZERO, Vec3::ZERO));
        }
        let centre = moment / volume;
        let force = -glam_vec_from_na(&self.gravity) * fluid_density * volume;
        let local_com = rigid_body.mass_properties().local_mprops.local_com;
        let center_of_mass = glam_vec_from_na(&(rigid_body.position() * local_com).coords);
        Some((force, (centre - center_of_mass).cross(force)))
    }

    fn advance(&mut self, timestep: f32, hooks: &mut dyn StepHooks) {
        hooks.pre_solve(self, timestep);

        self.integration_parameters.dt = timestep;
        self.pipeline.step(
            &self.gravity,
            &self.integration_parameters,
            &mut self.islands,
            &mut self.broad_phase,
            &mut self.narrow_phase,
            &mut self.rigid_bodies,
            &mut self.colliders,
            &mut self.impulse_joints,
            &mut self.multibody_joints,
            &mut self.ccd_solver,
            Some(&mut self.query_pipeline),
            &self.materials,
            &(),
        );

        // Forces only last for the step they were applied in.
        for (_, rigid_body) in self.rigid_bodies.iter_mut() {
            rigid_body.reset_forces(false);
            rigid_body.reset_torques(false);
        }

        hooks.post_solve(self);
    }

    fn contact_joints(&self, body: BodyHandle) -> Vec<ContactJoint> {
        let Some(entry) = self.bodies.get(unpack(body.raw())) else {
            return Vec::new();
        };
        let Some(own_user_data) = self.body_user_data(entry.handle) else {
            return Vec::new();
        };

        let mut joints: Vec<(RigidBodyHandle, ContactJoint)> = Vec::new();
        let joint_for = |other: RigidBodyHandle,
                         joints: &mut Vec<(RigidBodyHandle, ContactJoint)>|
         -> usize {
            if let Some(i) = joints.iter().position(|(handle, _)| *handle == other) {
                return i;
            }
            let other_user_data = self.body_user_data(other).unwrap_or_default();
            joints.push((
                other,
                ContactJoint {
                    user_data: [own_user_data, other_user_data],
                    points: Vec::new(),
                },
            ));
            joints.len() - 1
        };

        for &collider in &entry.colliders {
            for pair in self.narrow_phase.contact_pairs_with(collider) {
                if !pair.has_any_active_contact {
                    continue;
                }
                let (other, flip) = if pair.collider1 == collider {
                    (pair.collider2, false)
                } else {
                    (pair.collider1, true)
                };
                let Some(other_body) = self.colliders.get(other).and_then(|c| c.parent()) else {
                    continue;
                };
                if other_body == entry.handle {
                    continue;
                }
                let Some(collider1) = self.colliders.get(pair.collider1) else {
                    continue;
                };

                let i = joint_for(other_body, &mut joints);
                for manifold in &pair.manifolds {
                    let normal = glam_vec_from_na(&manifold.data.normal);
                    let normal = if flip { -normal } else { normal };
                    for point in &manifold.points {
                        let position = collider1.position() * point.local_p1;
                        joints[i].1.points.push(ContactPoint {
                            position: glam_vec_from_na(&position.coords),
                            normal,
                            distance: point.dist,
                            impulse: point.data.impulse,
                        });
                    }
                }
            }

            for (collider1, collider2, intersecting) in
                self.narrow_phase.intersection_pairs_with(collider)
            {
                if !intersecting {
                    continue;
                }
                let other = if collider1 == collider {
                    collider2
                } else {
                    collider1
                };
                let Some(other_body) = self.colliders.get(other).and_then(|c| c.parent()) else {
                    continue;
                };
                if other_body != entry.handle {
                    joint_for(other_body, &mut joints);
                }
            }
        }

        joints.into_iter().map(|(_, joint)| joint).collect()
    }

    fn ray_cast(
        &self,
        origin: Vec3,
        direction: Vec3,
        max_distance: f32,
        layer_mask: u32,
    ) -> Option<BackendRayHit> {
        let direction = direction.try_normalize()?;
        if !origin.is_finite() || !(max_distance > 0.) {
            return None;
        }

        let ray = Ray::new(to_point(origin), na_vector_from_glam(direction));
        let mut filter = QueryFilter::default().exclude_sensors();
        if layer_mask != 0 {
            filter = filter.groups(InteractionGroups::new(
                Group::ALL,
                Group::from_bits_truncate(layer_mask),
            ));
        }

        let (collider_handle, intersection) = self.query_pipeline.cast_ray_and_get_normal(
            &self.rigid_bodies,
            &self.colliders,
            &ray,
            max_distance.min(f32::MAX),
            true,
            filter,
        )?;
        let collider = self.colliders.get(collider_handle)?;
        let user_data = collider
            .parent()
            .and_then(|body| self.body_user_data(body))?;

        Some(BackendRayHit {
            user_data,
            position: origin + direction * intersection.time_of_impact,
            normal: glam_vec_from_na(&intersection.normal),
            distance: intersection.time_of_impact,
            collision_id: collider.user_data as u64,
        })
    }

    fn save_scene(&self, path: &Path) -> HothamResult<()> {
        let bodies = self
            .bodies
            .iter()
            .map(|(index, entry)| BodySnapshot {
                user_data: self.body_user_data(entry.handle).unwrap_or_default(),
                body_type: entry.body_type,
                root: entry
                    .root
                    .and_then(|root| self.shapes.get(root))
                    .map(|shape| shape.kind),
                colliders: entry.colliders.len(),
                state: self
                    .body_state(BodyHandle::from_raw(pack(index)))
                    .unwrap_or_default(),
            })
            .collect();
        let snapshot = SceneSnapshot {
            gravity: glam_vec_from_na(&self.gravity),
            bodies,
        };
        fs::write(path, serde_json::to_vec_pretty(&snapshot)?)?;
        Ok(())
    }

    fn stats(&self) -> BackendStats {
        BackendStats {
            shapes: self.shapes.len(),
            bodies: self.bodies.len(),
            colliders: self.colliders.len(),
            joints: self.joints.len(),
        }
    }
}
