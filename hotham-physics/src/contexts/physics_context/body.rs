use std::collections::HashMap;

use generational_arena::Index;
use glam::{Quat, Vec3};
use hecs::{Entity, World};
use log::{debug, warn};

use super::{
    colliders::{self, ChildIndex},
    PhysicsContext,
};
use crate::{
    backend::{BodyDescriptor, BodyHandle, BodyState, MassSpec, PhysicsBackend, ShapeHandle},
    components::{BodyType, RigidBody},
    observers::Observer,
    shapes::{GeometryShape, ShapeComposer},
    util::decompose_isometry,
    HothamError, HothamResult,
};

/// User data given to an engine body whose record has been released
const RELEASED_USER_DATA: u64 = u64::MAX;

/// Stable identifier for a rigid body registered with a [`PhysicsContext`].
///
/// This is also the user data attached to the engine body, so ids survive the round trip through
/// contact enumeration and ray casts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BodyId(pub(crate) Index);

impl BodyId {
    /// Pack the id into a `u64`
    pub fn to_bits(self) -> u64 {
        let (index, generation) = self.0.into_raw_parts();
        (generation << 32) | index as u64
    }

    /// Unpack an id created by [`BodyId::to_bits`]
    pub fn from_bits(bits: u64) -> Self {
        Self(Index::from_raw_parts(
            (bits & 0xFFFF_FFFF) as usize,
            bits >> 32,
        ))
    }

    pub(crate) fn index(self) -> Index {
        self.0
    }
}

/// Everything the context knows about one rigid body, whether or not it exists in the engine yet.
pub(crate) struct BodyRecord {
    pub(crate) entity: Entity,
    pub(crate) body_type: BodyType,
    pub(crate) mass: MassSpec,
    pub(crate) linear_damping: f32,
    pub(crate) angular_damping: f32,
    pub(crate) handle: Option<BodyHandle>,
    pub(crate) composer: Option<ShapeComposer>,
    pub(crate) colliders: HashMap<Entity, ShapeHandle>,
    pub(crate) cached: BodyState,
    /// Teleports requested before the body existed, used instead of the entity's pose
    pub(crate) pending_position: Option<Vec3>,
    pub(crate) pending_rotation: Option<Quat>,
    pub(crate) last_pose: Option<(Vec3, Quat)>,
    pub(crate) force: Vec3,
    pub(crate) torque: Vec3,
    pub(crate) observers: Vec<Observer>,
    pub(crate) enabled: bool,
}

impl BodyRecord {
    fn new(entity: Entity, rigid_body: &RigidBody) -> Self {
        let mut record = Self {
            entity,
            body_type: rigid_body.body_type,
            mass: rigid_body.mass_spec(),
            linear_damping: rigid_body.linear_damping,
            angular_damping: rigid_body.angular_damping,
            handle: None,
            composer: None,
            colliders: Default::default(),
            cached: Default::default(),
            pending_position: None,
            pending_rotation: None,
            last_pose: None,
            force: Vec3::ZERO,
            torque: Vec3::ZERO,
            observers: Vec::new(),
            enabled: true,
        };
        record.cached = record.defaults();
        record
    }

    /// What the accessors report while the body isn't in the engine
    fn defaults(&self) -> BodyState {
        BodyState {
            mass: self.mass.mass,
            center_of_mass: self.mass.center_of_mass.unwrap_or_default(),
            inertia: self.mass.inertia.unwrap_or_default(),
            linear_damping: self.linear_damping,
            angular_damping: self.angular_damping,
            enabled: self.enabled,
            ..Default::default()
        }
    }

    pub(crate) fn is_initialized(&self) -> bool {
        self.handle.is_some()
    }
}

impl PhysicsContext {
    /// Register `entity`, which must have a [`RigidBody`] component. Registering the same entity
    /// twice returns the same id.
    ///
    /// Nothing is created in the engine until [`PhysicsContext::init_rigid_body`] or
    /// [`PhysicsContext::get_body`] is called, or the next step picks the body up.
    pub fn add_body(&mut self, world: &World, entity: Entity) -> HothamResult<BodyId> {
        if self.backend.is_none() {
            return Err(HothamError::EngineUnavailable);
        }
        if let Some(id) = self.entities.get(&entity) {
            return Ok(*id);
        }

        let rigid_body = world.get::<&RigidBody>(entity)?;
        let id = BodyId(self.bodies.insert(BodyRecord::new(entity, &rigid_body)));
        self.entities.insert(entity, id);
        self.registered.push(id);
        Ok(id)
    }

    /// Register `entity` and create its body in the engine straight away
    pub fn create_body(&mut self, world: &World, entity: Entity) -> HothamResult<BodyId> {
        let id = self.add_body(world, entity)?;
        self.init_rigid_body(world, id)?;
        Ok(id)
    }

    /// Create the body in the engine, composing its root shape from every collider it owns.
    /// Does nothing if the body already exists.
    pub fn init_rigid_body(&mut self, world: &World, id: BodyId) -> HothamResult<()> {
        if self.backend.is_none() {
            return Err(HothamError::EngineUnavailable);
        }
        if self.is_initialized(id) {
            return Ok(());
        }
        self.init_with_children(world, &ChildIndex::new(world), id)
    }

    /// Create every registered body that isn't in the engine yet, sharing one walk of the world
    /// between them. A body that can't be created is logged and disabled so it isn't retried
    /// every step. Returns how many bodies were created.
    pub fn init_pending_bodies(&mut self, world: &World) -> HothamResult<usize> {
        if self.backend.is_none() {
            return Err(HothamError::EngineUnavailable);
        }
        let pending: Vec<BodyId> = self
            .registered
            .iter()
            .copied()
            .filter(|id| !self.is_initialized(*id))
            .collect();
        if pending.is_empty() {
            return Ok(0);
        }

        let children = ChildIndex::new(world);
        let mut created = 0;
        for id in pending {
            match self.init_with_children(world, &children, id) {
                Ok(()) => created += 1,
                Err(HothamError::EngineUnavailable) => return Err(HothamError::EngineUnavailable),
                Err(e) => {
                    warn!(
                        "[HOTHAM_PHYSICS] Unable to create body {:?}, disabling it: {:?}",
                        id, e
                    );
                    self.set_registered(id, false)?;
                }
            }
        }
        Ok(created)
    }

    fn init_with_children(
        &mut self,
        world: &World,
        children: &ChildIndex,
        id: BodyId,
    ) -> HothamResult<()> {
        let backend = self
            .backend
            .as_deref_mut()
            .ok_or(HothamError::EngineUnavailable)?;
        let record = self
            .bodies
            .get_mut(id.index())
            .ok_or(HothamError::UnknownBody)?;
        if record.is_initialized() {
            return Ok(());
        }

        let mut shapes = Vec::new();
        let mut collider_shapes = HashMap::new();
        for collider_entity in colliders::discover_colliders(world, children, record.entity) {
            let shape = colliders::collider_descriptor(world, collider_entity, record.entity)
                .and_then(|descriptor| GeometryShape::new(backend, &descriptor));
            match shape {
                Ok(shape) => {
                    collider_shapes.insert(collider_entity, shape.handle());
                    shapes.push(shape);
                }
                Err(e) => {
                    for shape in shapes {
                        shape.destroy(backend);
                    }
                    return Err(e);
                }
            }
        }

        let scene = record.body_type == BodyType::Static;
        let mut composer = ShapeComposer::build(backend, scene, shapes)?;
        let Some(root) = composer.root() else {
            composer.destroy(backend);
            return Err(HothamError::structural("composer has no root"));
        };

        let (rotation, position) = decompose_isometry(&colliders::global_pose(world, record.entity));
        let descriptor = BodyDescriptor {
            body_type: record.body_type,
            root,
            position: record.pending_position.unwrap_or(position),
            rotation: record.pending_rotation.unwrap_or(rotation),
            mass: record.mass,
            linear_damping: record.linear_damping,
            angular_damping: record.angular_damping,
            linear_velocity: record.cached.linear_velocity,
            angular_velocity: record.cached.angular_velocity,
            enabled: record.enabled,
            user_data: id.to_bits(),
        };
        let handle = match backend.create_body(&descriptor) {
            Ok(handle) => handle,
            Err(e) => {
                composer.destroy(backend);
                return Err(e);
            }
        };

        debug!(
            "[HOTHAM_PHYSICS] Initialised body {:?} for entity {:?} with {:?} root",
            id,
            record.entity,
            composer.root_kind()
        );

        for collider_entity in collider_shapes.keys() {
            self.collider_owners.insert(*collider_entity, id);
        }
        record.handle = Some(handle);
        record.composer = Some(composer);
        record.colliders = collider_shapes;
        record.pending_position = None;
        record.pending_rotation = None;
        // The entity's own pose, so a kinematic body only follows its transform once it moves
        record.last_pose = Some((position, rotation));
        Ok(())
    }

    /// Remove the body from the engine, then free its shapes. Calling this again, or on a body
    /// that was never created, does nothing.
    ///
    /// The record stays registered, so accessors return defaults and the body can be created
    /// again later.
    pub fn destroy_rigid_body(&mut self, id: BodyId) {
        if !self.bodies.contains(id.index()) {
            return;
        }
        self.remove_joints_of(id);
        let Some(record) = self.bodies.get_mut(id.index()) else {
            return;
        };
        let handle = record.handle.take();
        let composer = record.composer.take();
        for (collider_entity, _) in record.colliders.drain() {
            self.collider_owners.remove(&collider_entity);
        }
        record.pending_position = None;
        record.pending_rotation = None;
        record.last_pose = None;
        record.force = Vec3::ZERO;
        record.torque = Vec3::ZERO;
        record.cached = record.defaults();

        match self.backend.as_deref_mut() {
            Some(backend) => {
                if let Some(handle) = handle {
                    if let Err(e) = backend.set_user_data(handle, RELEASED_USER_DATA) {
                        warn!("[HOTHAM_PHYSICS] Unable to release body {:?}: {:?}", id, e);
                    }
                    backend.destroy_body(handle);
                }
                if let Some(mut composer) = composer {
                    composer.destroy(backend);
                }
            }
            None => {
                if let Some(mut composer) = composer {
                    composer.abandon();
                }
            }
        }
    }

    /// Destroy the body and forget about it entirely
    pub fn remove_body(&mut self, id: BodyId) {
        self.destroy_rigid_body(id);
        if let Some(record) = self.bodies.remove(id.index()) {
            self.entities.remove(&record.entity);
        }
        self.registered.retain(|r| *r != id);
    }

    /// The body's engine handle, creating the body first if need be
    pub fn get_body(&mut self, world: &World, id: BodyId) -> HothamResult<BodyHandle> {
        if self.backend.is_none() {
            return Err(HothamError::EngineUnavailable);
        }
        let record = self.bodies.get(id.index()).ok_or(HothamError::UnknownBody)?;
        if let Some(handle) = record.handle {
            return Ok(handle);
        }

        self.init_rigid_body(world, id)?;
        self.bodies
            .get(id.index())
            .and_then(|r| r.handle)
            .ok_or(HothamError::UnknownBody)
    }

    /// Does the body exist in the engine?
    pub fn is_initialized(&self, id: BodyId) -> bool {
        self.bodies
            .get(id.index())
            .map(BodyRecord::is_initialized)
            .unwrap_or(false)
    }

    /// The body's state as the engine sees it, or cached defaults if it isn't in the engine
    pub fn body_state(&self, id: BodyId) -> BodyState {
        let Some(record) = self.bodies.get(id.index()) else {
            return Default::default();
        };
        match (record.handle, self.backend.as_deref()) {
            (Some(handle), Some(backend)) => backend.body_state(handle).unwrap_or(record.cached),
            _ => record.cached,
        }
    }

    /// World space position
    pub fn position(&self, id: BodyId) -> Vec3 {
        self.body_state(id).position
    }

    /// World space rotation
    pub fn rotation(&self, id: BodyId) -> Quat {
        self.body_state(id).rotation
    }

    /// Linear velocity
    pub fn linear_velocity(&self, id: BodyId) -> Vec3 {
        self.body_state(id).linear_velocity
    }

    /// Angular velocity
    pub fn angular_velocity(&self, id: BodyId) -> Vec3 {
        self.body_state(id).angular_velocity
    }

    /// Total mass
    pub fn mass(&self, id: BodyId) -> f32 {
        self.body_state(id).mass
    }

    /// Local center of mass
    pub fn center_of_mass(&self, id: BodyId) -> Vec3 {
        self.body_state(id).center_of_mass
    }

    /// Principal angular inertia
    pub fn inertia(&self, id: BodyId) -> Vec3 {
        self.body_state(id).inertia
    }

    /// Linear and angular damping
    pub fn damping(&self, id: BodyId) -> (f32, f32) {
        let state = self.body_state(id);
        (state.linear_damping, state.angular_damping)
    }

    /// Is the engine ignoring this body until something wakes it?
    pub fn is_sleeping(&self, id: BodyId) -> bool {
        self.body_state(id).sleeping
    }

    /// Teleport the body. If it isn't in the engine yet, it will be created here rather than at
    /// its entity's pose.
    pub fn set_position(&mut self, id: BodyId, position: Vec3) -> HothamResult<()> {
        self.write_through(
            id,
            |record| {
                record.cached.position = position;
                if !record.is_initialized() {
                    record.pending_position = Some(position);
                }
            },
            |backend, handle| backend.set_position(handle, position),
        )
    }

    /// Teleport the body. If it isn't in the engine yet, it will be created with this rotation
    /// rather than its entity's.
    pub fn set_rotation(&mut self, id: BodyId, rotation: Quat) -> HothamResult<()> {
        self.write_through(
            id,
            |record| {
                record.cached.rotation = rotation;
                if !record.is_initialized() {
                    record.pending_rotation = Some(rotation);
                }
            },
            |backend, handle| backend.set_rotation(handle, rotation),
        )
    }

    /// Overwrite the linear velocity
    pub fn set_linear_velocity(&mut self, id: BodyId, velocity: Vec3) -> HothamResult<()> {
        self.write_through(
            id,
            |record| record.cached.linear_velocity = velocity,
            |backend, handle| backend.set_linear_velocity(handle, velocity),
        )
    }

    /// Overwrite the angular velocity
    pub fn set_angular_velocity(&mut self, id: BodyId, velocity: Vec3) -> HothamResult<()> {
        self.write_through(
            id,
            |record| record.cached.angular_velocity = velocity,
            |backend, handle| backend.set_angular_velocity(handle, velocity),
        )
    }

    /// Change the total mass, keeping the center of mass and inertia settings
    pub fn set_mass(&mut self, id: BodyId, mass: f32) -> HothamResult<()> {
        self.set_mass_spec(id, |spec| spec.mass = mass)
    }

    /// Pin the center of mass instead of deriving it from the colliders
    pub fn set_center_of_mass(&mut self, id: BodyId, center_of_mass: Vec3) -> HothamResult<()> {
        self.set_mass_spec(id, |spec| spec.center_of_mass = Some(center_of_mass))
    }

    /// Pin the principal inertia instead of deriving it from the colliders
    pub fn set_inertia(&mut self, id: BodyId, inertia: Vec3) -> HothamResult<()> {
        self.set_mass_spec(id, |spec| spec.inertia = Some(inertia))
    }

    fn set_mass_spec(
        &mut self,
        id: BodyId,
        change: impl FnOnce(&mut MassSpec),
    ) -> HothamResult<()> {
        let record = self
            .bodies
            .get_mut(id.index())
            .ok_or(HothamError::UnknownBody)?;
        change(&mut record.mass);
        record.cached.mass = record.mass.mass;
        if let Some(center_of_mass) = record.mass.center_of_mass {
            record.cached.center_of_mass = center_of_mass;
        }
        if let Some(inertia) = record.mass.inertia {
            record.cached.inertia = inertia;
        }

        let mass = record.mass;
        match (record.handle, self.backend.as_deref_mut()) {
            (Some(handle), Some(backend)) => backend.set_mass_properties(handle, mass),
            _ => Ok(()),
        }
    }

    /// Replace linear and angular damping
    pub fn set_damping(&mut self, id: BodyId, linear: f32, angular: f32) -> HothamResult<()> {
        self.write_through(
            id,
            |record| {
                record.linear_damping = linear;
                record.angular_damping = angular;
                record.cached.linear_damping = linear;
                record.cached.angular_damping = angular;
            },
            |backend, handle| backend.set_damping(handle, linear, angular),
        )
    }

    /// Put the body to sleep, or wake it up
    pub fn set_sleeping(&mut self, id: BodyId, sleeping: bool) -> HothamResult<()> {
        self.write_through(
            id,
            |record| record.cached.sleeping = sleeping,
            |backend, handle| backend.set_sleeping(handle, sleeping),
        )
    }

    /// Accumulate a force, applied at the start of the next step
    pub fn add_force(&mut self, id: BodyId, force: Vec3) -> HothamResult<()> {
        let record = self
            .bodies
            .get_mut(id.index())
            .ok_or(HothamError::UnknownBody)?;
        record.force += force;
        Ok(())
    }

    /// Accumulate a torque, applied at the start of the next step
    pub fn add_torque(&mut self, id: BodyId, torque: Vec3) -> HothamResult<()> {
        let record = self
            .bodies
            .get_mut(id.index())
            .ok_or(HothamError::UnknownBody)?;
        record.torque += torque;
        Ok(())
    }

    /// Put the body back into the simulation loop. Does nothing if it's already there.
    pub fn enable_body(&mut self, id: BodyId) -> HothamResult<()> {
        self.set_registered(id, true)
    }

    /// Take the body out of the simulation loop and freeze it in the engine. Does nothing if
    /// it's already disabled.
    pub fn disable_body(&mut self, id: BodyId) -> HothamResult<()> {
        self.set_registered(id, false)
    }

    /// Is the body taking part in the simulation loop?
    pub fn is_enabled(&self, id: BodyId) -> bool {
        self.bodies
            .get(id.index())
            .map(|r| r.enabled)
            .unwrap_or(false)
    }

    fn set_registered(&mut self, id: BodyId, enabled: bool) -> HothamResult<()> {
        let record = self
            .bodies
            .get_mut(id.index())
            .ok_or(HothamError::UnknownBody)?;
        if record.enabled == enabled {
            return Ok(());
        }
        record.enabled = enabled;
        record.cached.enabled = enabled;

        if enabled {
            self.registered.push(id);
        } else {
            self.registered.retain(|r| *r != id);
        }

        match (record.handle, self.backend.as_deref_mut()) {
            (Some(handle), Some(backend)) => backend.set_enabled(handle, enabled),
            _ => Ok(()),
        }
    }

    /// Attach some callbacks to the body
    pub fn add_observer(&mut self, id: BodyId, observer: Observer) -> HothamResult<()> {
        let record = self
            .bodies
            .get_mut(id.index())
            .ok_or(HothamError::UnknownBody)?;
        record.observers.push(observer);
        Ok(())
    }

    /// The body's observers, to switch callbacks on or off
    pub fn observers_mut(&mut self, id: BodyId) -> impl Iterator<Item = &mut Observer> {
        self.bodies
            .get_mut(id.index())
            .into_iter()
            .flat_map(|r| r.observers.iter_mut())
    }

    fn write_through(
        &mut self,
        id: BodyId,
        cache: impl FnOnce(&mut BodyRecord),
        engine: impl FnOnce(&mut dyn PhysicsBackend, BodyHandle) -> HothamResult<()>,
    ) -> HothamResult<()> {
        let record = self
            .bodies
            .get_mut(id.index())
            .ok_or(HothamError::UnknownBody)?;
        cache(record);
        match (record.handle, self.backend.as_deref_mut()) {
            (Some(handle), Some(backend)) => engine(backend, handle),
            _ => Ok(()),
        }
    }
}
