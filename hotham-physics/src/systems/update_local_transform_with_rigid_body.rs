use generational_arena::Arena;
use hecs::World;

use crate::{
    backend::PhysicsBackend,
    components::{LocalTransform, Parent},
    contexts::{
        physics_context::{global_pose, BodyRecord},
        BodyId,
    },
    util::isometry_from_parts,
};

/// Walks through each body that's awake and sets its entity's `LocalTransform` to wherever the
/// engine put it. Sleeping bodies haven't moved, so they're skipped.
pub(crate) fn update_local_transform_with_rigid_body_system_inner(
    world: &World,
    backend: &dyn PhysicsBackend,
    bodies: &mut Arena<BodyRecord>,
    order: &[BodyId],
) {
    for id in order {
        let Some(record) = bodies.get_mut(id.index()) else {
            continue;
        };
        let Some(state) = record.handle.and_then(|handle| backend.body_state(handle)) else {
            continue;
        };
        if state.sleeping {
            continue;
        }
        record.last_pose = Some((state.position, state.rotation));

        let global = isometry_from_parts(state.position, state.rotation);
        let position = match world.get::<&Parent>(record.entity).map(|p| p.0) {
            Ok(parent) => global_pose(world, parent).inverse() * global,
            Err(_) => global,
        };
        if let Ok(mut local_transform) = world.get::<&mut LocalTransform>(record.entity) {
            local_transform.update_from_isometry(&position);
        }
    }
}
