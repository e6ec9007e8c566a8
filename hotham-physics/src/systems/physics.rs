use generational_arena::Arena;
use glam::Vec3;
use hecs::World;
use log::{info, warn};

use super::{
    collision::collision_system_inner,
    update_local_transform_with_rigid_body::update_local_transform_with_rigid_body_system_inner,
    update_rigid_body_transforms::update_rigid_body_transforms_system_inner,
};
use crate::{
    backend::{PhysicsBackend, StepHooks},
    contexts::{physics_context::BodyRecord, BodyId, PhysicsContext},
    HothamError, HothamResult,
};

/// Advance the physics simulation by one fixed timestep.
///
/// In order:
/// 1. Bodies registered with [`PhysicsContext::add_body`] but not created yet are created. One
///    that can't be created is logged and disabled.
/// 2. Kinematic bodies whose transform was moved by the game are teleported to match
/// 3. A pending scene snapshot is written out
/// 4. The engine steps. Before it solves, each enabled body has its accumulated forces applied,
///    then its observers are told about contacts and asked for forces. After it solves, each
///    body that is awake has its [`crate::components::LocalTransform`] updated.
pub fn physics_system(world: &mut World, physics_context: &mut PhysicsContext) -> HothamResult<()> {
    physics_system_inner(world, physics_context)
}

pub(crate) fn physics_system_inner(
    world: &World,
    physics_context: &mut PhysicsContext,
) -> HothamResult<()> {
    physics_context.init_pending_bodies(world)?;

    let PhysicsContext {
        backend,
        bodies,
        registered,
        config,
        pending_snapshot,
        ..
    } = physics_context;
    let backend = backend
        .as_deref_mut()
        .ok_or(HothamError::EngineUnavailable)?;

    // Walk a copy, so observers can't pull the list out from under us
    let order = registered.clone();

    update_rigid_body_transforms_system_inner(world, backend, bodies, &order);

    if let Some(path) = pending_snapshot.take() {
        match backend.save_scene(&path) {
            Ok(()) => info!("[HOTHAM_PHYSICS] Saved scene snapshot to {}", path.display()),
            Err(e) => warn!(
                "[HOTHAM_PHYSICS] Unable to save scene snapshot to {}: {:?}",
                path.display(),
                e
            ),
        }
    }

    let mut step = PhysicsStep {
        world,
        bodies,
        order: &order,
    };
    backend.advance(config.timestep, &mut step);
    Ok(())
}

/// The hooks handed to the engine for one step
struct PhysicsStep<'a> {
    world: &'a World,
    bodies: &'a mut Arena<BodyRecord>,
    order: &'a [BodyId],
}

impl StepHooks for PhysicsStep<'_> {
    fn pre_solve(&mut self, backend: &mut dyn PhysicsBackend, timestep: f32) {
        for &id in self.order {
            apply_forces(backend, self.bodies, id);
            collision_system_inner(backend, self.bodies, id, timestep);
        }
    }

    fn post_solve(&mut self, backend: &mut dyn PhysicsBackend) {
        update_local_transform_with_rigid_body_system_inner(
            self.world,
            backend,
            self.bodies,
            self.order,
        );
    }
}

/// Hand the body's accumulated force and torque to the engine, then clear them
fn apply_forces(backend: &mut dyn PhysicsBackend, bodies: &mut Arena<BodyRecord>, id: BodyId) {
    let Some(record) = bodies.get_mut(id.index()) else {
        return;
    };
    let Some(handle) = record.handle else {
        return;
    };

    let force = std::mem::take(&mut record.force);
    let torque = std::mem::take(&mut record.torque);
    if force != Vec3::ZERO {
        if let Err(e) = backend.add_force(handle, force) {
            warn!("[HOTHAM_PHYSICS] Unable to apply force to {:?}: {:?}", id, e);
        }
    }
    if torque != Vec3::ZERO {
        if let Err(e) = backend.add_torque(handle, torque) {
            warn!("[HOTHAM_PHYSICS] Unable to apply torque to {:?}: {:?}", id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::{
        backend::ContactPoint,
        components::{Collider, LocalTransform, RigidBody},
        contexts::PhysicsConfig,
        observers::{BodyObserver, Collision, Observer, ObserverContext, ObserverFlags},
    };
    use approx::assert_relative_eq;
    use hecs::Entity;

    #[derive(Clone, Default)]
    struct Log(Arc<Mutex<Vec<String>>>);

    impl Log {
        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }

        fn push(&self, event: String) {
            self.0.lock().unwrap().push(event);
        }
    }

    struct Recorder {
        log: Log,
        push: Vec3,
    }

    impl BodyObserver for Recorder {
        fn on_collision(&mut self, _body: &mut ObserverContext<'_>, collision: &Collision) {
            self.log.push(format!("collision {:?}", collision.other_entity));
        }

        fn on_contact(
            &mut self,
            _body: &mut ObserverContext<'_>,
            _collision: &Collision,
            contact: &ContactPoint,
        ) {
            assert!(contact.normal.is_finite());
            self.log.push("contact".to_string());
        }

        fn on_post_collision(&mut self, _body: &mut ObserverContext<'_>, _collision: &Collision) {
            self.log.push("post_collision".to_string());
        }

        fn on_apply_forces(&mut self, body: &mut ObserverContext<'_>, _timestep: f32) {
            body.add_force(self.push).unwrap();
            self.log.push("apply_forces".to_string());
        }
    }

    fn spawn(world: &mut World, position: Vec3, rigid_body: RigidBody, collider: Collider) -> Entity {
        world.spawn((
            LocalTransform::from_translation_rotation(position, glam::Quat::IDENTITY),
            rigid_body,
            collider,
        ))
    }

    fn weightless() -> PhysicsContext {
        PhysicsContext::new(PhysicsConfig {
            gravity: Vec3::ZERO,
            ..Default::default()
        })
    }

    #[test]
    pub fn test_step_order() {
        let mut world = World::new();
        let mut physics_context = PhysicsContext::default();
        let ground = spawn(
            &mut world,
            Vec3::new(0., -0.5, 0.),
            RigidBody::fixed(),
            Collider::cuboid(Vec3::new(10., 1., 10.)),
        );
        let ball = spawn(
            &mut world,
            Vec3::new(0., 2., 0.),
            RigidBody::default(),
            Collider::sphere(0.5),
        );
        let ground_id = physics_context.create_body(&world, ground).unwrap();
        let ball_id = physics_context.create_body(&world, ball).unwrap();

        let log = Log::default();
        let seen = Arc::new(Mutex::new(None));
        struct Other(Arc<Mutex<Option<BodyId>>>);
        impl BodyObserver for Other {
            fn on_collision(&mut self, _body: &mut ObserverContext<'_>, collision: &Collision) {
                *self.0.lock().unwrap() = Some(collision.other);
            }
        }

        physics_context
            .add_observer(
                ball_id,
                Observer::new(Recorder {
                    log: log.clone(),
                    push: Vec3::ZERO,
                })
                .with_flags(ObserverFlags::all()),
            )
            .unwrap();
        physics_context
            .add_observer(ball_id, Observer::new(Other(seen.clone())))
            .unwrap();

        for _ in 0..144 {
            physics_context.step(&mut world).unwrap();
        }

        // The ball has landed, and its transform followed it down
        let y = world.get::<&LocalTransform>(ball).unwrap().translation.y;
        assert!(y < 1.0);
        assert!(y > 0.3);
        assert_eq!(*seen.lock().unwrap(), Some(ground_id));

        log.take();
        physics_context.step(&mut world).unwrap();
        let events = log.take();
        assert_eq!(events[0], format!("collision {:?}", ground));
        assert!(events.len() > 3);
        assert!(events[1..events.len() - 2].iter().all(|e| e == "contact"));
        assert_eq!(events[events.len() - 2], "post_collision");
        assert_eq!(events[events.len() - 1], "apply_forces");

        // Contact callbacks can be switched off independently
        for observer in physics_context.observers_mut(ball_id) {
            observer.set_enabled(ObserverFlags::CONTACT, false);
        }
        physics_context.step(&mut world).unwrap();
        assert_eq!(
            log.take(),
            vec![
                format!("collision {:?}", ground),
                "post_collision".to_string(),
                "apply_forces".to_string()
            ]
        );
    }

    #[test]
    pub fn test_forces() {
        let mut world = World::new();
        let mut physics_context = weightless();
        let entity = spawn(
            &mut world,
            Vec3::ZERO,
            RigidBody {
                linear_damping: 0.,
                ..Default::default()
            },
            Collider::sphere(0.5),
        );
        let id = physics_context.create_body(&world, entity).unwrap();
        let timestep = physics_context.config().timestep;

        // One second's worth of force, squeezed into one step
        physics_context
            .add_force(id, Vec3::new(0.5, 0., 0.) / timestep)
            .unwrap();
        physics_context
            .add_force(id, Vec3::new(0.5, 0., 0.) / timestep)
            .unwrap();
        physics_context.step(&mut world).unwrap();
        assert_relative_eq!(
            physics_context.linear_velocity(id),
            Vec3::new(1., 0., 0.),
            epsilon = 1e-3
        );

        // Accumulators are cleared, so the body just coasts
        physics_context.step(&mut world).unwrap();
        assert_relative_eq!(
            physics_context.linear_velocity(id),
            Vec3::new(1., 0., 0.),
            epsilon = 1e-3
        );

        // Observers can push too
        let log = Log::default();
        physics_context
            .add_observer(
                id,
                Observer::new(Recorder {
                    log: log.clone(),
                    push: Vec3::new(0., 1., 0.) / timestep,
                })
                .with_flags(ObserverFlags::APPLY_FORCES),
            )
            .unwrap();
        physics_context.step(&mut world).unwrap();
        physics_context.step(&mut world).unwrap();
        assert_relative_eq!(
            physics_context.linear_velocity(id),
            Vec3::new(1., 2., 0.),
            epsilon = 1e-3
        );
        assert_eq!(log.take(), vec!["apply_forces", "apply_forces"]);

        // Forces added before a body exists are applied in the step that creates it
        let later = spawn(&mut world, Vec3::X * 10., RigidBody::default(), Collider::sphere(0.5));
        let later_id = physics_context.add_body(&world, later).unwrap();
        physics_context.add_force(later_id, Vec3::Y / timestep).unwrap();
        physics_context.step(&mut world).unwrap();
        assert!(physics_context.is_initialized(later_id));
        assert_relative_eq!(
            physics_context.linear_velocity(later_id),
            Vec3::Y,
            epsilon = 1e-3
        );
        assert_relative_eq!(physics_context.bodies[later_id.index()].force, Vec3::ZERO);
    }

    struct Float;

    impl BodyObserver for Float {
        fn on_apply_forces(&mut self, body: &mut ObserverContext<'_>, _timestep: f32) {
            let (force, torque) = body.buoyancy(glam::Vec4::new(0., 1., 0., 0.), 2.);
            body.add_force(force).unwrap();
            body.add_torque(torque).unwrap();
        }
    }

    #[test]
    pub fn test_buoyant_body_floats() {
        let mut world = World::new();
        let mut physics_context = PhysicsContext::default();
        // 1kg in a fluid of 2kg per cubic meter: it should settle half under
        let entity = spawn(
            &mut world,
            Vec3::new(0., 1., 0.),
            RigidBody {
                linear_damping: 2.,
                ..Default::default()
            },
            Collider::cuboid(Vec3::ONE),
        );
        let id = physics_context.create_body(&world, entity).unwrap();
        physics_context
            .add_observer(id, Observer::new(Float).with_flags(ObserverFlags::APPLY_FORCES))
            .unwrap();

        for _ in 0..(72 * 5) {
            physics_context.step(&mut world).unwrap();
        }
        assert_relative_eq!(physics_context.position(id).y, 0., epsilon = 0.1);
    }

    #[test]
    pub fn test_sleeping_bodies_are_left_alone() {
        let mut world = World::new();
        let mut physics_context = weightless();
        let sleeper = spawn(&mut world, Vec3::ZERO, RigidBody::default(), Collider::sphere(0.5));
        let waker = spawn(
            &mut world,
            Vec3::new(5., 0., 0.),
            RigidBody::default(),
            Collider::sphere(0.5),
        );
        let sleeper_id = physics_context.create_body(&world, sleeper).unwrap();
        physics_context.create_body(&world, waker).unwrap();
        physics_context.set_sleeping(sleeper_id, true).unwrap();
        assert!(physics_context.is_sleeping(sleeper_id));

        // Scribble over both transforms; only the body that's awake gets corrected
        let far_away = Vec3::new(100., 100., 100.);
        for entity in [sleeper, waker] {
            world.get::<&mut LocalTransform>(entity).unwrap().translation =
                rapier3d::na::Vector3::new(100., 100., 100.);
        }
        physics_context.step(&mut world).unwrap();

        let (sleeper_position, _) = world.get::<&LocalTransform>(sleeper).unwrap().to_glam();
        let (waker_position, _) = world.get::<&LocalTransform>(waker).unwrap().to_glam();
        assert_relative_eq!(sleeper_position, far_away);
        assert_relative_eq!(waker_position, Vec3::new(5., 0., 0.), epsilon = 1e-4);
    }

    #[test]
    pub fn test_bodies_registered_later_join_the_next_step() {
        let mut world = World::new();
        let mut physics_context = PhysicsContext::default();
        let a = spawn(&mut world, Vec3::ZERO, RigidBody::default(), Collider::sphere(0.5));
        let b = spawn(&mut world, Vec3::X * 5., RigidBody::default(), Collider::sphere(0.5));
        physics_context.create_body(&world, a).unwrap();
        physics_context.step(&mut world).unwrap();

        // Registered but never created: the next step creates it
        let b_id = physics_context.add_body(&world, b).unwrap();
        assert!(!physics_context.is_initialized(b_id));
        physics_context.step(&mut world).unwrap();
        assert!(physics_context.is_initialized(b_id));
        assert!(world.get::<&LocalTransform>(b).unwrap().to_glam().0.y < 0.);

        // Disabled bodies wait until they're enabled again
        let c = spawn(&mut world, Vec3::X * 10., RigidBody::default(), Collider::sphere(0.5));
        let c_id = physics_context.add_body(&world, c).unwrap();
        physics_context.disable_body(c_id).unwrap();
        physics_context.step(&mut world).unwrap();
        assert!(!physics_context.is_initialized(c_id));
        physics_context.enable_body(c_id).unwrap();
        physics_context.step(&mut world).unwrap();
        assert!(physics_context.is_initialized(c_id));
    }

    #[test]
    pub fn test_registering_is_enough_to_fall() {
        let mut world = World::new();
        let mut physics_context = PhysicsContext::default();
        let ball = spawn(&mut world, Vec3::ZERO, RigidBody::default(), Collider::sphere(0.5));
        let id = physics_context.add_body(&world, ball).unwrap();

        for _ in 0..72 {
            physics_context.step(&mut world).unwrap();
        }
        assert!(physics_context.is_initialized(id));
        let (position, _) = world.get::<&LocalTransform>(ball).unwrap().to_glam();
        assert!(position.y < -3.);
    }

    #[test]
    pub fn test_bodies_that_cant_be_created_are_disabled() {
        let mut world = World::new();
        let mut physics_context = PhysicsContext::default();
        let good = spawn(&mut world, Vec3::ZERO, RigidBody::default(), Collider::sphere(0.5));
        let bad = spawn(&mut world, Vec3::X * 5., RigidBody::default(), Collider::sphere(0.));
        let good_id = physics_context.add_body(&world, good).unwrap();
        let bad_id = physics_context.add_body(&world, bad).unwrap();

        physics_context.step(&mut world).unwrap();
        assert!(physics_context.is_initialized(good_id));
        assert!(!physics_context.is_initialized(bad_id));
        assert!(!physics_context.is_enabled(bad_id));
        assert_eq!(physics_context.registered, vec![good_id]);
    }
}
