use generational_arena::Arena;
use hecs::World;
use log::warn;

use crate::{
    backend::PhysicsBackend,
    components::BodyType,
    contexts::{
        physics_context::{global_pose, BodyRecord},
        BodyId,
    },
    util::decompose_isometry,
};

/// Kinematic bodies are controlled by the game. Walks through each of them and, if its entity
/// has been moved since the last step, teleports the body to match.
pub(crate) fn update_rigid_body_transforms_system_inner(
    world: &World,
    backend: &mut dyn PhysicsBackend,
    bodies: &mut Arena<BodyRecord>,
    order: &[BodyId],
) {
    for id in order {
        let Some(record) = bodies.get_mut(id.index()) else {
            continue;
        };
        if record.body_type != BodyType::Kinematic {
            continue;
        }
        let Some(handle) = record.handle else {
            continue;
        };

        let (rotation, position) = decompose_isometry(&global_pose(world, record.entity));
        if record.last_pose == Some((position, rotation)) {
            continue;
        }

        let result = backend
            .set_position(handle, position)
            .and_then(|_| backend.set_rotation(handle, rotation));
        if let Err(e) = result {
            warn!("[HOTHAM_PHYSICS] Unable to move kinematic body {:?}: {:?}", id, e);
            continue;
        }
        record.last_pose = Some((position, rotation));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        components::{Collider, LocalTransform, RigidBody},
        contexts::PhysicsContext,
    };
    use approx::assert_relative_eq;
    use glam::{Quat, Vec3};

    #[test]
    pub fn test_update_rigid_body_transforms_system() {
        let mut world = World::default();
        let mut physics_context = PhysicsContext::default();

        let platform = world.spawn((
            LocalTransform::default(),
            RigidBody::kinematic(),
            Collider::cuboid(Vec3::ONE),
        ));
        let falling = world.spawn((
            LocalTransform::from_translation_rotation(Vec3::new(0., 5., 0.), Quat::IDENTITY),
            RigidBody::default(),
        ));
        let platform_id = physics_context.create_body(&world, platform).unwrap();
        let falling_id = physics_context.create_body(&world, falling).unwrap();

        let rotation = Quat::from_rotation_y(0.5);
        *world.get::<&mut LocalTransform>(platform).unwrap() =
            LocalTransform::from_translation_rotation(Vec3::new(3., 0., 0.), rotation);

        // Dynamic bodies are left to the engine
        *world.get::<&mut LocalTransform>(falling).unwrap() = LocalTransform::default();

        let order = physics_context.registered.clone();
        let backend = physics_context.backend.as_deref_mut().unwrap();
        update_rigid_body_transforms_system_inner(
            &world,
            backend,
            &mut physics_context.bodies,
            &order,
        );

        assert_relative_eq!(physics_context.position(platform_id), Vec3::new(3., 0., 0.));
        assert_relative_eq!(physics_context.rotation(platform_id), rotation, epsilon = 1e-6);
        assert_relative_eq!(physics_context.position(falling_id), Vec3::new(0., 5., 0.));

        // A full step keeps the game's pose
        physics_context.step(&mut world).unwrap();
        let (translation, _) = world.get::<&LocalTransform>(platform).unwrap().to_glam();
        assert_relative_eq!(translation, Vec3::new(3., 0., 0.), epsilon = 1e-5);
    }
}
