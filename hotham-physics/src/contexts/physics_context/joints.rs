use generational_arena::Index;
use hecs::World;
use log::debug;

use super::{BodyId, PhysicsContext};
use crate::{
    backend::{JointDescriptor, JointHandle},
    HothamError, HothamResult,
};

/// Stable identifier for a joint created with [`PhysicsContext::add_joint`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JointId(pub(crate) Index);

pub(crate) struct JointRecord {
    pub(crate) child: BodyId,
    pub(crate) other: Option<BodyId>,
    pub(crate) handle: JointHandle,
}

impl JointRecord {
    fn involves(&self, id: BodyId) -> bool {
        self.child == id || self.other == Some(id)
    }
}

impl PhysicsContext {
    /// Connect `child` to `other`, or to the world when `other` is `None`. Either body is created
    /// first if need be.
    ///
    /// The joint's pivot and pin are relative to the child, and the connection is made with both
    /// bodies where they are right now. Destroying either body removes the joint.
    pub fn add_joint(
        &mut self,
        world: &World,
        child: BodyId,
        other: Option<BodyId>,
        joint: JointDescriptor,
    ) -> HothamResult<JointId> {
        if other == Some(child) {
            return Err(HothamError::structural("a body can't be jointed to itself"));
        }
        let child_handle = self.get_body(world, child)?;
        let other_handle = match other {
            Some(other) => Some(self.get_body(world, other)?),
            None => None,
        };
        let backend = self
            .backend
            .as_deref_mut()
            .ok_or(HothamError::EngineUnavailable)?;
        let handle = backend.create_joint(child_handle, other_handle, &joint)?;

        let id = JointId(self.joints.insert(JointRecord {
            child,
            other,
            handle,
        }));
        debug!(
            "[HOTHAM_PHYSICS] Joined body {:?} to {:?} with a {:?} joint",
            child, other, joint.kind
        );
        Ok(id)
    }

    /// Remove a joint. Does nothing if it's already gone.
    pub fn remove_joint(&mut self, id: JointId) {
        let Some(record) = self.joints.remove(id.0) else {
            return;
        };
        if let Some(backend) = self.backend.as_deref_mut() {
            backend.destroy_joint(record.handle);
        }
    }

    /// The child and other body of a joint, if it still exists
    pub fn joint_bodies(&self, id: JointId) -> Option<(BodyId, Option<BodyId>)> {
        self.joints.get(id.0).map(|r| (r.child, r.other))
    }

    /// Every joint attached to the body
    pub fn joints_of(&self, id: BodyId) -> Vec<JointId> {
        self.joints
            .iter()
            .filter(|(_, r)| r.involves(id))
            .map(|(index, _)| JointId(index))
            .collect()
    }

    pub(crate) fn remove_joints_of(&mut self, id: BodyId) {
        for joint in self.joints_of(id) {
            self.remove_joint(joint);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::{Collider, LocalTransform, RigidBody};
    use approx::assert_relative_eq;
    use glam::{Quat, Vec3};
    use hecs::Entity;

    fn spawn_ball(world: &mut World, position: Vec3) -> Entity {
        world.spawn((
            LocalTransform::from_translation_rotation(position, Quat::IDENTITY),
            RigidBody::default(),
            Collider::sphere(0.1),
        ))
    }

    #[test]
    pub fn test_pendulum() {
        let mut world = World::new();
        let mut physics_context = PhysicsContext::default();
        let bob = spawn_ball(&mut world, Vec3::new(1., 0., 0.));
        let bob_id = physics_context.add_body(&world, bob).unwrap();

        // Hung off the world at the origin, before the body has even been created
        let joint = physics_context
            .add_joint(&world, bob_id, None, JointDescriptor::ball_and_socket(Vec3::NEG_X))
            .unwrap();
        assert!(physics_context.is_initialized(bob_id));
        assert_eq!(physics_context.joint_bodies(joint), Some((bob_id, None)));

        for _ in 0..36 {
            physics_context.step(&mut world).unwrap();
        }
        let position = physics_context.position(bob_id);
        assert_relative_eq!(position.length(), 1., epsilon = 0.05);
        assert!(position.y < -0.5);
    }

    #[test]
    pub fn test_hinge_between_bodies() {
        let mut world = World::new();
        let mut physics_context = PhysicsContext::default();
        let post = world.spawn((
            LocalTransform::default(),
            RigidBody::fixed(),
            Collider::cuboid(Vec3::splat(0.2)),
        ));
        let door = spawn_ball(&mut world, Vec3::new(1., 0., 0.));
        let post_id = physics_context.create_body(&world, post).unwrap();
        let door_id = physics_context.create_body(&world, door).unwrap();

        // A door on a vertical hinge doesn't sag, but it does swing when pushed
        physics_context
            .add_joint(
                &world,
                door_id,
                Some(post_id),
                JointDescriptor::hinge(Vec3::NEG_X, Vec3::Y).with_limits(-1., 1.),
            )
            .unwrap();
        physics_context
            .set_linear_velocity(door_id, Vec3::new(0., 0., 1.))
            .unwrap();
        for _ in 0..36 {
            physics_context.step(&mut world).unwrap();
        }
        let position = physics_context.position(door_id);
        assert_relative_eq!(position.y, 0., epsilon = 0.05);
        assert_relative_eq!(position.length(), 1., epsilon = 0.05);
        assert!(position.z > 0.1);
    }

    #[test]
    pub fn test_joints_go_with_their_bodies() {
        let mut world = World::new();
        let mut physics_context = PhysicsContext::default();
        let a = spawn_ball(&mut world, Vec3::ZERO);
        let b = spawn_ball(&mut world, Vec3::X);
        let a_id = physics_context.create_body(&world, a).unwrap();
        let b_id = physics_context.create_body(&world, b).unwrap();

        let between = physics_context
            .add_joint(&world, b_id, Some(a_id), JointDescriptor::ball_and_socket(Vec3::NEG_X))
            .unwrap();
        let to_world = physics_context
            .add_joint(&world, a_id, None, JointDescriptor::slider(Vec3::ZERO, Vec3::Y))
            .unwrap();
        assert_eq!(physics_context.stats().joints, 2);
        assert_eq!(physics_context.joints_of(a_id).len(), 2);
        assert_eq!(physics_context.joints_of(b_id), vec![between]);

        physics_context.remove_joint(to_world);
        physics_context.remove_joint(to_world);
        assert_eq!(physics_context.stats().joints, 1);

        // Destroying the other body takes the joint with it
        physics_context.destroy_rigid_body(a_id);
        assert_eq!(physics_context.stats().joints, 0);
        assert!(physics_context.joint_bodies(between).is_none());
        assert!(physics_context.joints_of(b_id).is_empty());
    }

    #[test]
    pub fn test_invalid_joints() {
        let mut world = World::new();
        let mut physics_context = PhysicsContext::default();
        let a = spawn_ball(&mut world, Vec3::ZERO);
        let a_id = physics_context.create_body(&world, a).unwrap();

        assert!(matches!(
            physics_context.add_joint(&world, a_id, Some(a_id), JointDescriptor::ball_and_socket(Vec3::ZERO)),
            Err(HothamError::StructuralMisuse { .. })
        ));
        assert!(matches!(
            physics_context.add_joint(&world, a_id, None, JointDescriptor::hinge(Vec3::ZERO, Vec3::ZERO)),
            Err(HothamError::InvalidJoint { .. })
        ));
        assert!(physics_context.joints.is_empty());

        physics_context.shutdown();
        assert!(matches!(
            physics_context.add_joint(&world, a_id, None, JointDescriptor::ball_and_socket(Vec3::ZERO)),
            Err(HothamError::EngineUnavailable)
        ));
    }
}
