use generational_arena::Arena;
use log::warn;

use crate::{
    backend::PhysicsBackend,
    contexts::{physics_context::BodyRecord, BodyId},
    observers::{Collision, ObserverContext, ObserverFlags},
};

/// Collision system
/// Each of the body's observers in turn hears about every contact joint touching the body and
/// then gets its chance to apply forces, before the next observer runs.
pub(crate) fn collision_system_inner(
    backend: &mut dyn PhysicsBackend,
    bodies: &mut Arena<BodyRecord>,
    id: BodyId,
    timestep: f32,
) {
    let Some(record) = bodies.get_mut(id.index()) else {
        return;
    };
    let Some(handle) = record.handle else {
        return;
    };
    if record.observers.is_empty() {
        return;
    }
    let entity = record.entity;

    // Taken out while they run so the other body's record can be looked up
    let mut observers = std::mem::take(&mut record.observers);

    let mut touching = Vec::new();
    if observers.iter().any(|o| o.wants(ObserverFlags::COLLISION)) {
        for joint in backend.contact_joints(handle) {
            let other = BodyId::from_bits(joint.user_data[1]);
            let Some(other_entity) = bodies
                .get(other.index())
                .filter(|r| r.is_initialized())
                .map(|r| r.entity)
            else {
                warn!(
                    "[HOTHAM_PHYSICS] Body {:?} is touching something with unknown user data {}, skipping",
                    id, joint.user_data[1]
                );
                continue;
            };
            let collision = Collision {
                other,
                other_entity,
            };
            touching.push((collision, joint.points));
        }
    }

    for observer in observers.iter_mut() {
        let mut context = ObserverContext {
            id,
            entity,
            handle,
            backend: &mut *backend,
        };

        if observer.wants(ObserverFlags::COLLISION) {
            let contacts = observer.wants(ObserverFlags::CONTACT);
            for (collision, points) in &touching {
                observer.callbacks.on_collision(&mut context, collision);
                if contacts {
                    for point in points {
                        observer.callbacks.on_contact(&mut context, collision, point);
                    }
                }
                observer.callbacks.on_post_collision(&mut context, collision);
            }
        }

        if observer.wants(ObserverFlags::APPLY_FORCES) {
            observer.callbacks.on_apply_forces(&mut context, timestep);
        }
    }

    if let Some(record) = bodies.get_mut(id.index()) {
        // Anything registered while the callbacks ran goes after the existing observers
        observers.append(&mut record.observers);
        record.observers = observers;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::{
        components::{Collider, LocalTransform, RigidBody},
        contexts::PhysicsContext,
        backend::ContactPoint,
        observers::{BodyObserver, Observer},
    };
    use glam::{Quat, Vec3};
    use hecs::{Entity, World};

    struct Touches(Arc<Mutex<Vec<Entity>>>);

    impl BodyObserver for Touches {
        fn on_collision(&mut self, body: &mut ObserverContext<'_>, collision: &Collision) {
            assert_ne!(body.entity(), collision.other_entity);
            self.0.lock().unwrap().push(collision.other_entity);
        }
    }

    struct Named(&'static str, Arc<Mutex<Vec<String>>>);

    impl Named {
        fn log(&self, event: &str) {
            let mut events = self.1.lock().unwrap();
            let event = format!("{}:{}", self.0, event);
            // Several contact points per step are collapsed into one entry
            if events.last() != Some(&event) {
                events.push(event);
            }
        }
    }

    impl BodyObserver for Named {
        fn on_collision(&mut self, _: &mut ObserverContext<'_>, _: &Collision) {
            self.log("collision");
        }

        fn on_contact(&mut self, _: &mut ObserverContext<'_>, _: &Collision, _: &ContactPoint) {
            self.log("contact");
        }

        fn on_post_collision(&mut self, _: &mut ObserverContext<'_>, _: &Collision) {
            self.log("post");
        }

        fn on_apply_forces(&mut self, _: &mut ObserverContext<'_>, _: f32) {
            self.log("forces");
        }
    }

    /// A ball resting on a floor, so it has exactly one contact joint every step
    fn resting_ball(world: &mut World, physics_context: &mut PhysicsContext) -> BodyId {
        let floor = world.spawn((
            LocalTransform::from_translation_rotation(Vec3::new(0., -0.5, 0.), Quat::IDENTITY),
            RigidBody::fixed(),
            Collider::cuboid(Vec3::new(10., 1., 10.)),
        ));
        let ball = world.spawn((
            LocalTransform::from_translation_rotation(Vec3::new(0., 0.49, 0.), Quat::IDENTITY),
            RigidBody::default(),
            Collider::sphere(0.5),
        ));
        physics_context.create_body(world, floor).unwrap();
        let id = physics_context.create_body(world, ball).unwrap();
        physics_context.step(world).unwrap();
        id
    }

    #[test]
    pub fn test_observers_run_one_after_another() {
        let mut world = World::new();
        let mut physics_context = PhysicsContext::default();
        let ball_id = resting_ball(&mut world, &mut physics_context);

        let events = Arc::new(Mutex::new(Vec::new()));
        physics_context
            .add_observer(ball_id, Observer::new(Named("a", events.clone())))
            .unwrap();
        physics_context
            .add_observer(ball_id, Observer::new(Named("b", events.clone())))
            .unwrap();
        physics_context.step(&mut world).unwrap();

        // Each observer finishes with its forces before the next one hears about anything
        assert_eq!(
            *events.lock().unwrap(),
            [
                "a:collision",
                "a:post",
                "a:forces",
                "b:collision",
                "b:post",
                "b:forces"
            ]
        );

        // Contact points arrive between collision and post collision, for the observer that asked
        events.lock().unwrap().clear();
        for observer in physics_context.observers_mut(ball_id) {
            observer.set_enabled(ObserverFlags::all(), false);
        }
        physics_context
            .add_observer(
                ball_id,
                Observer::new(Named("c", events.clone()))
                    .with_flags(ObserverFlags::COLLISION | ObserverFlags::CONTACT),
            )
            .unwrap();
        physics_context.step(&mut world).unwrap();
        assert_eq!(
            *events.lock().unwrap(),
            ["c:collision", "c:contact", "c:post"]
        );
    }

    #[test]
    pub fn test_contacts_need_collisions() {
        let mut world = World::new();
        let mut physics_context = PhysicsContext::default();
        let ball_id = resting_ball(&mut world, &mut physics_context);

        let events = Arc::new(Mutex::new(Vec::new()));
        physics_context
            .add_observer(
                ball_id,
                Observer::new(Named("a", events.clone())).with_flags(ObserverFlags::CONTACT),
            )
            .unwrap();
        physics_context.step(&mut world).unwrap();
        assert!(events.lock().unwrap().is_empty());
    }

    #[test]
    pub fn test_collision() {
        let mut world = World::new();
        let mut physics_context = PhysicsContext::default();

        // Two overlapping boxes, one of them a trigger
        let a = world.spawn((
            LocalTransform::from_translation_rotation(Vec3::new(0.5, 0., 0.), Quat::IDENTITY),
            RigidBody::kinematic(),
            Collider::cuboid(Vec3::splat(2.)),
        ));
        let b = world.spawn((
            LocalTransform::default(),
            RigidBody::kinematic(),
            Collider {
                trigger: true,
                ..Collider::cuboid(Vec3::splat(2.))
            },
        ));
        let a_id = physics_context.create_body(&world, a).unwrap();
        let b_id = physics_context.create_body(&world, b).unwrap();

        let seen_by_a = Arc::new(Mutex::new(Vec::new()));
        let seen_by_b = Arc::new(Mutex::new(Vec::new()));
        physics_context
            .add_observer(a_id, Observer::new(Touches(seen_by_a.clone())))
            .unwrap();
        physics_context
            .add_observer(b_id, Observer::new(Touches(seen_by_b.clone())))
            .unwrap();

        physics_context.step(&mut world).unwrap();
        physics_context.step(&mut world).unwrap();

        assert!(seen_by_a.lock().unwrap().contains(&b));
        assert!(seen_by_b.lock().unwrap().contains(&a));

        // Once b is gone, a stops hearing about it
        physics_context.destroy_rigid_body(b_id);
        seen_by_a.lock().unwrap().clear();
        physics_context.step(&mut world).unwrap();
        physics_context.step(&mut world).unwrap();
        assert!(seen_by_a.lock().unwrap().is_empty());
    }
}
