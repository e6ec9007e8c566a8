mod body;
mod colliders;
mod config;
mod joints;

use std::{collections::HashMap, path::PathBuf};

use generational_arena::Arena;
use glam::{Vec3, Vec4};
use hecs::{Entity, World};
use log::{info, warn};

pub use body::BodyId;
pub(crate) use body::BodyRecord;
pub(crate) use colliders::global_pose;
pub use config::{MaterialInteraction, PhysicsConfig, PhysicsMaterial};
pub use joints::JointId;
pub(crate) use joints::JointRecord;

use crate::{
    backend::{BackendStats, PhysicsBackend, RapierBackend},
    shapes::ShapeComposer,
    HothamError, HothamResult,
};

/// Owns the physics engine and every rigid body registered with it.
///
/// Bodies are stored in an arena and referred to by [`BodyId`]. The id is also what the engine
/// hands back during contact enumeration and ray casts, so resolving "which body is this?" is a
/// single arena lookup.
pub struct PhysicsContext {
    pub(crate) backend: Option<Box<dyn PhysicsBackend>>,
    pub(crate) bodies: Arena<BodyRecord>,
    pub(crate) entities: HashMap<Entity, BodyId>,
    pub(crate) registered: Vec<BodyId>,
    /// Which body each collider entity was added to
    pub(crate) collider_owners: HashMap<Entity, BodyId>,
    pub(crate) joints: Arena<JointRecord>,
    pub(crate) config: PhysicsConfig,
    pub(crate) pending_snapshot: Option<PathBuf>,
}

/// The nearest body hit by [`PhysicsContext::raycast`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RayHit {
    /// The body that was hit
    pub body: BodyId,
    /// The entity that body belongs to
    pub entity: Entity,
    /// World space hit position
    pub position: Vec3,
    /// Surface normal at the hit
    pub normal: Vec3,
    /// Distance travelled along the ray
    pub distance: f32,
    /// Identifies which primitive of the body was hit
    pub collision_id: u64,
}

impl Default for PhysicsContext {
    fn default() -> Self {
        Self::new(Default::default())
    }
}

impl PhysicsContext {
    /// Create a context backed by rapier
    pub fn new(config: PhysicsConfig) -> Self {
        let backend = RapierBackend::new(&config);
        Self::with_backend(config, Box::new(backend))
    }

    /// Create a context around any engine
    pub fn with_backend(config: PhysicsConfig, backend: Box<dyn PhysicsBackend>) -> Self {
        Self {
            backend: Some(backend),
            bodies: Arena::new(),
            entities: Default::default(),
            registered: Default::default(),
            collider_owners: Default::default(),
            joints: Arena::new(),
            config,
            pending_snapshot: None,
        }
    }

    /// The settings this context was created with
    pub fn config(&self) -> &PhysicsConfig {
        &self.config
    }

    /// Is the engine still around?
    pub fn is_available(&self) -> bool {
        self.backend.is_some()
    }

    /// The engine, if it hasn't been shut down
    pub fn backend(&self) -> Option<&dyn PhysicsBackend> {
        self.backend.as_deref()
    }

    /// What the engine currently holds. All zeroes after [`PhysicsContext::shutdown`].
    pub fn stats(&self) -> BackendStats {
        self.backend
            .as_deref()
            .map(|b| b.stats())
            .unwrap_or_default()
    }

    /// The body registered for `entity`, if any
    pub fn body_for_entity(&self, entity: Entity) -> Option<BodyId> {
        self.entities.get(&entity).copied()
    }

    /// The composer holding a realized body's collision shapes
    pub fn composer(&self, id: BodyId) -> Option<&ShapeComposer> {
        self.bodies.get(id.index())?.composer.as_ref()
    }

    /// Advance the simulation by one fixed timestep. See [`crate::systems::physics_system`].
    pub fn step(&mut self, world: &mut World) -> HothamResult<()> {
        crate::systems::physics_system(world, self)
    }

    /// Ask for the engine's view of the world to be written to `path` just before the next step.
    /// The request fires once.
    pub fn request_scene_snapshot(&mut self, path: impl Into<PathBuf>) {
        self.pending_snapshot = Some(path.into());
    }

    /// Find the nearest body along a ray. A `layer_mask` of 0 hits every layer. `distance` may be
    /// [`f32::INFINITY`] to search without a limit.
    ///
    /// Sees the world as it was at the end of the last step.
    pub fn raycast(
        &self,
        origin: Vec3,
        direction: Vec3,
        distance: f32,
        layer_mask: u32,
    ) -> HothamResult<Option<RayHit>> {
        let backend = self
            .backend
            .as_deref()
            .ok_or(HothamError::EngineUnavailable)?;

        let Some(hit) = backend.ray_cast(origin, direction, distance, layer_mask) else {
            return Ok(None);
        };

        let body = BodyId::from_bits(hit.user_data);
        let Some(record) = self.bodies.get(body.index()) else {
            warn!(
                "[HOTHAM_PHYSICS] Ray hit a body with unknown user data {}, ignoring",
                hit.user_data
            );
            return Ok(None);
        };

        Ok(Some(RayHit {
            body,
            entity: record.entity,
            position: hit.position,
            normal: hit.normal,
            distance: hit.distance,
            collision_id: hit.collision_id,
        }))
    }

    /// Buoyancy force and torque on a body from a fluid of `fluid_density` filling everything
    /// below `plane`, where `plane` is a unit normal pointing out of the fluid plus an offset `d`
    /// such that `normal.dot(p) + d` is negative under the surface. Returns zeroes for a body that
    /// isn't in the engine. The result is meant to be handed to [`PhysicsContext::add_force`] and
    /// [`PhysicsContext::add_torque`], or applied from an observer.
    pub fn buoyancy(&self, id: BodyId, plane: Vec4, fluid_density: f32) -> HothamResult<(Vec3, Vec3)> {
        let backend = self
            .backend
            .as_deref()
            .ok_or(HothamError::EngineUnavailable)?;
        let record = self.bodies.get(id.index()).ok_or(HothamError::UnknownBody)?;
        Ok(record
            .handle
            .and_then(|handle| backend.buoyancy(handle, plane, fluid_density))
            .unwrap_or_default())
    }

    /// Destroy every body and drop the engine.
    ///
    /// Body records stay registered, so accessors keep returning defaults, but anything that
    /// needs the engine fails with [`HothamError::EngineUnavailable`] from here on.
    pub fn shutdown(&mut self) {
        if self.backend.is_none() {
            return;
        }

        let ids: Vec<BodyId> = self.bodies.iter().map(|(i, _)| BodyId(i)).collect();
        for id in ids {
            self.destroy_rigid_body(id);
        }

        self.backend = None;
        self.pending_snapshot = None;
        info!("[HOTHAM_PHYSICS] Physics engine shut down");
    }
}
