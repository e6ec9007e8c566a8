use std::collections::{HashMap, HashSet};

use glam::Vec3;
use hecs::{Component, Entity, World};
use log::debug;
use rapier3d::na::Isometry3;

use super::{BodyId, PhysicsContext};
use crate::{
    backend::{ShapeDescriptor, ShapeHandle},
    components::{Collider, LocalTransform, Parent, RigidBody},
    shapes::GeometryShape,
    util::{decompose_isometry, isometry_from_parts},
    HothamError, HothamResult,
};

fn has<T: Component>(world: &World, entity: Entity) -> bool {
    world
        .entity(entity)
        .map(|e| e.has::<T>())
        .unwrap_or(false)
}

fn parent_of(world: &World, entity: Entity) -> Option<Entity> {
    world.get::<&Parent>(entity).ok().map(|p| p.0)
}

fn local_pose(world: &World, entity: Entity) -> Isometry3<f32> {
    world
        .get::<&LocalTransform>(entity)
        .map(|t| t.position())
        .unwrap_or_else(|_| Isometry3::identity())
}

/// The entity's pose in world space, walking up its [`Parent`]s
pub(crate) fn global_pose(world: &World, entity: Entity) -> Isometry3<f32> {
    let mut pose = local_pose(world, entity);
    let mut current = entity;
    // Bounded, in case someone builds a cycle
    for _ in 0..world.len() {
        let Some(parent) = parent_of(world, current) else {
            break;
        };
        pose = local_pose(world, parent) * pose;
        current = parent;
    }
    pose
}

fn global_scale(world: &World, entity: Entity) -> Vec3 {
    let scale_of = |e| {
        world
            .get::<&LocalTransform>(e)
            .map(|t| t.glam_scale())
            .unwrap_or(Vec3::ONE)
    };
    let mut scale = scale_of(entity);
    let mut current = entity;
    for _ in 0..world.len() {
        let Some(parent) = parent_of(world, current) else {
            break;
        };
        scale *= scale_of(parent);
        current = parent;
    }
    scale
}

/// Where `entity` sits relative to `body`: the product of every [`LocalTransform`] between them,
/// excluding the body's own.
fn relative_pose(world: &World, entity: Entity, body: Entity) -> HothamResult<Isometry3<f32>> {
    if entity == body {
        return Ok(Isometry3::identity());
    }

    let mut pose = local_pose(world, entity);
    let mut current = entity;
    for _ in 0..world.len() {
        match parent_of(world, current) {
            Some(parent) if parent == body => return Ok(pose),
            Some(parent) => {
                pose = local_pose(world, parent) * pose;
                current = parent;
            }
            None => break,
        }
    }

    Err(HothamError::structural(format!(
        "{:?} is not beneath rigid body {:?}",
        entity, body
    )))
}

/// The closest entity with a [`RigidBody`], starting at `entity` itself
fn owning_body(world: &World, entity: Entity) -> Option<Entity> {
    let mut current = entity;
    for _ in 0..=world.len() {
        if has::<RigidBody>(world, current) {
            return Some(current);
        }
        current = parent_of(world, current)?;
    }
    None
}

/// Every entity's children, according to their [`Parent`]s. Building one means a pass over the
/// whole world, so share it between bodies created together.
pub(crate) struct ChildIndex(HashMap<Entity, Vec<Entity>>);

impl ChildIndex {
    pub(crate) fn new(world: &World) -> Self {
        let mut children: HashMap<Entity, Vec<Entity>> = HashMap::new();
        for (entity, parent) in world.query::<&Parent>().iter() {
            children.entry(parent.0).or_default().push(entity);
        }
        for children in children.values_mut() {
            children.sort_by_key(|e| e.to_bits());
        }
        Self(children)
    }

    fn children(&self, entity: Entity) -> &[Entity] {
        self.0.get(&entity).map(Vec::as_slice).unwrap_or_default()
    }
}

/// Every entity with a [`Collider`] owned by `body`: the body itself and its descendants,
/// stopping at descendants that are rigid bodies themselves.
pub(crate) fn discover_colliders(world: &World, children: &ChildIndex, body: Entity) -> Vec<Entity> {
    let mut found = Vec::new();
    let mut visited = HashSet::new();
    let mut stack = vec![body];
    while let Some(entity) = stack.pop() {
        if !visited.insert(entity) {
            continue;
        }
        if has::<Collider>(world, entity) {
            found.push(entity);
        }
        stack.extend(
            children
                .children(entity)
                .iter()
                .rev()
                .filter(|child| !has::<RigidBody>(world, **child)),
        );
    }
    found
}

/// Turn a [`Collider`] component into something the engine can build
pub(crate) fn collider_descriptor(
    world: &World,
    collider_entity: Entity,
    body: Entity,
) -> HothamResult<ShapeDescriptor> {
    let collider = world.get::<&Collider>(collider_entity)?;
    let offset = isometry_from_parts(collider.position, collider.rotation);
    let pose = relative_pose(world, collider_entity, body)? * offset;
    let (rotation, position) = decompose_isometry(&pose);

    let scale = if collider.inherit_transform_scale {
        collider.scale * global_scale(world, collider_entity)
    } else {
        collider.scale
    };

    Ok(ShapeDescriptor {
        geometry: collider.geometry.clone(),
        position,
        rotation,
        scale,
        trigger: collider.trigger,
        material: collider.material,
        layer: collider.layer,
    })
}

impl PhysicsContext {
    /// Add a collider to a body that already exists in the engine.
    ///
    /// The owning body is the closest entity with a [`RigidBody`] above `collider_entity`
    /// (or the entity itself). If that body hasn't been created yet this does nothing: the
    /// collider will be found when it is.
    pub fn add_collider(&mut self, world: &World, collider_entity: Entity) -> HothamResult<()> {
        let backend = self
            .backend
            .as_deref_mut()
            .ok_or(HothamError::EngineUnavailable)?;
        let owner = owning_body(world, collider_entity).ok_or_else(|| {
            HothamError::structural(format!("{:?} has no rigid body above it", collider_entity))
        })?;
        let id = *self.entities.get(&owner).ok_or(HothamError::UnknownBody)?;
        let record = self
            .bodies
            .get_mut(id.index())
            .ok_or(HothamError::UnknownBody)?;
        let Some(composer) = record.composer.as_mut() else {
            return Ok(());
        };
        if record.colliders.contains_key(&collider_entity) {
            return Err(HothamError::structural(format!(
                "{:?} has already been added",
                collider_entity
            )));
        }

        let descriptor = collider_descriptor(world, collider_entity, owner)?;
        let shape = GeometryShape::new(backend, &descriptor)?;
        let shape = composer.add_collider(backend, record.handle, shape)?;
        record.colliders.insert(collider_entity, shape);
        self.collider_owners.insert(collider_entity, id);

        debug!(
            "[HOTHAM_PHYSICS] Added collider {:?} to body {:?}, root is now {:?}",
            collider_entity,
            id,
            composer.root_kind()
        );
        Ok(())
    }

    /// Remove a collider from whichever body it was added to. Does nothing if it isn't part of
    /// any body.
    pub fn remove_collider(&mut self, collider_entity: Entity) -> HothamResult<()> {
        let backend = self
            .backend
            .as_deref_mut()
            .ok_or(HothamError::EngineUnavailable)?;
        let Some(id) = self.collider_owners.get(&collider_entity).copied() else {
            return Ok(());
        };
        let Some(record) = self.bodies.get_mut(id.index()) else {
            self.collider_owners.remove(&collider_entity);
            return Ok(());
        };

        if let (Some(composer), Some(shape)) = (
            record.composer.as_mut(),
            record.colliders.get(&collider_entity).copied(),
        ) {
            composer.remove_collider(backend, record.handle, shape)?;
            debug!(
                "[HOTHAM_PHYSICS] Removed collider {:?}, root is now {:?}",
                collider_entity,
                composer.root_kind()
            );
        }
        record.colliders.remove(&collider_entity);
        self.collider_owners.remove(&collider_entity);
        Ok(())
    }

    /// Remove one shape from a body's composer by handle
    pub fn remove_shape(&mut self, id: BodyId, shape: ShapeHandle) -> HothamResult<()> {
        let backend = self
            .backend
            .as_deref_mut()
            .ok_or(HothamError::EngineUnavailable)?;
        let record = self
            .bodies
            .get_mut(id.index())
            .ok_or(HothamError::UnknownBody)?;
        let composer = record
            .composer
            .as_mut()
            .ok_or_else(|| HothamError::structural("body has not been created yet"))?;

        composer.remove_collider(backend, record.handle, shape)?;
        let owners = &mut self.collider_owners;
        record.colliders.retain(|entity, s| {
            let keep = *s != shape;
            if !keep {
                owners.remove(entity);
            }
            keep
        });
        Ok(())
    }

    /// Move a collider to the body that owns it now, after its [`Parent`] changed. Also
    /// picks up changes to the [`Collider`] component itself.
    pub fn reparent_collider(&mut self, world: &World, collider_entity: Entity) -> HothamResult<()> {
        self.remove_collider(collider_entity)?;
        self.add_collider(world, collider_entity)
    }
}
