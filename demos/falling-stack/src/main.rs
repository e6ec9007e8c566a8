use anyhow::{Context, Result};
use hotham_physics::{
    backend::JointDescriptor,
    components::{Collider, Geometry, LocalTransform, Parent, RigidBody},
    contexts::{PhysicsConfig, PhysicsContext},
    glam::{Quat, Vec3},
    hecs::{Entity, World},
    observers::{BodyObserver, Collision, Observer, ObserverContext},
    systems::physics_system,
};
use log::info;

const SECONDS: usize = 4;

/// Logs the first time a body lands on something
struct Landing {
    name: &'static str,
    landed: bool,
}

impl BodyObserver for Landing {
    fn on_collision(&mut self, body: &mut ObserverContext<'_>, collision: &Collision) {
        if self.landed {
            return;
        }
        self.landed = true;
        let state = body.state();
        info!(
            "[HOTHAM_FALLING_STACK] {} landed on {:?} at {:?}, moving at {:?}",
            self.name, collision.other_entity, state.position, state.linear_velocity
        );
    }
}

pub fn main() -> Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => {
            let json = std::fs::read_to_string(&path)
                .with_context(|| format!("Unable to read config from {path}"))?;
            PhysicsConfig::from_json(&json)?
        }
        None => PhysicsConfig::default(),
    };
    let steps = (SECONDS as f32 / config.timestep) as usize;

    let mut world = World::new();
    let mut physics_context = PhysicsContext::new(config);

    add_ground(&mut world, &mut physics_context)?;
    let mut crates = Vec::new();
    for i in 0..3 {
        let position = Vec3::new(0., 1. + i as f32 * 1.5, 0.);
        crates.push(add_crate(&mut world, &mut physics_context, position)?);
    }
    let dumbbell = add_dumbbell(&mut world, &mut physics_context, Vec3::new(0.2, 6., 0.))?;
    let sign = add_sign(&mut world, &mut physics_context)?;

    for step in 0..steps {
        if step == steps - 1 {
            physics_context.request_scene_snapshot("falling_stack.json");
        }
        physics_system(&mut world, &mut physics_context)?;
    }

    for entity in crates.iter().chain([&dumbbell, &sign]) {
        let local_transform = world.get::<&LocalTransform>(*entity)?;
        let (translation, _) = local_transform.to_glam();
        info!(
            "[HOTHAM_FALLING_STACK] {:?} came to rest at {:?}",
            entity, translation
        );
    }

    if let Some(hit) = physics_context.raycast(Vec3::new(0., 20., 0.), Vec3::NEG_Y, 40., 0)? {
        info!(
            "[HOTHAM_FALLING_STACK] Looking straight down from the sky, the first thing you see is {:?}, {:.2}m away",
            hit.entity, hit.distance
        );
    }

    info!("[HOTHAM_FALLING_STACK] {:?}", physics_context.stats());
    physics_context.shutdown();
    Ok(())
}

/// A floor with a low wall on each side, all parts of a single static body
fn add_ground(world: &mut World, physics_context: &mut PhysicsContext) -> Result<Entity> {
    let ground = world.spawn((
        LocalTransform::from_translation_rotation(Vec3::new(0., -0.5, 0.), Quat::IDENTITY),
        RigidBody::fixed(),
        Collider::cuboid(Vec3::new(20., 1., 20.)),
    ));
    for x in [-10., 10.] {
        world.spawn((
            LocalTransform::from_translation_rotation(Vec3::new(x, 1., 0.), Quat::IDENTITY),
            Parent(ground),
            Collider::cuboid(Vec3::new(1., 2., 20.)),
        ));
    }
    physics_context.create_body(world, ground)?;
    Ok(ground)
}

fn add_crate(
    world: &mut World,
    physics_context: &mut PhysicsContext,
    position: Vec3,
) -> Result<Entity> {
    let entity = world.spawn((
        LocalTransform::from_translation_rotation(position, Quat::IDENTITY),
        RigidBody {
            mass: 10.,
            ..Default::default()
        },
        Collider::cuboid(Vec3::ONE),
    ));
    let id = physics_context.create_body(world, entity)?;
    physics_context.add_observer(
        id,
        Observer::new(Landing {
            name: "Crate",
            landed: false,
        }),
    )?;
    Ok(entity)
}

/// A sign swinging from a hook in the sky
fn add_sign(world: &mut World, physics_context: &mut PhysicsContext) -> Result<Entity> {
    let sign = world.spawn((
        LocalTransform::from_translation_rotation(Vec3::new(5., 5., 0.), Quat::IDENTITY),
        RigidBody::default(),
        Collider::cuboid(Vec3::new(1., 0.5, 0.1)),
    ));
    let id = physics_context.add_body(world, sign)?;
    physics_context.add_joint(
        world,
        id,
        None,
        JointDescriptor::hinge(Vec3::new(0., 1., 0.), Vec3::Z).with_limits(-1., 1.),
    )?;
    physics_context.set_angular_velocity(id, Vec3::new(0., 0., 2.))?;
    Ok(sign)
}

/// Starts out as a bare handle, then has a weight added to each end once it exists
fn add_dumbbell(
    world: &mut World,
    physics_context: &mut PhysicsContext,
    position: Vec3,
) -> Result<Entity> {
    let dumbbell = world.spawn((
        LocalTransform::from_translation_rotation(position, Quat::from_rotation_z(0.3)),
        RigidBody {
            mass: 5.,
            ..Default::default()
        },
        Collider::new(Geometry::Capsule {
            radius: 0.1,
            height: 1.,
        })
        .with_offset(Vec3::ZERO, Quat::from_rotation_z(std::f32::consts::FRAC_PI_2)),
    ));
    let id = physics_context.create_body(world, dumbbell)?;

    for x in [-0.6, 0.6] {
        let weight = world.spawn((
            LocalTransform::from_translation_rotation(Vec3::new(x, 0., 0.), Quat::IDENTITY),
            Parent(dumbbell),
            Collider::sphere(0.25),
        ));
        physics_context.add_collider(world, weight)?;
    }
    info!(
        "[HOTHAM_FALLING_STACK] Dumbbell root is now {:?}",
        physics_context.composer(id).map(|c| c.root_kind())
    );

    physics_context.add_observer(
        id,
        Observer::new(Landing {
            name: "Dumbbell",
            landed: false,
        }),
    )?;
    Ok(dumbbell)
}
