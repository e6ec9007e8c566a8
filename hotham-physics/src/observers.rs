//! Per-body callbacks invoked by [`crate::systems::physics_system`] while the engine steps.

use bitflags::bitflags;
use glam::{Vec3, Vec4};
use hecs::Entity;

use crate::{
    backend::{BodyHandle, BodyState, ContactPoint, PhysicsBackend},
    contexts::BodyId,
    HothamResult,
};

bitflags! {
    /// Which callbacks of an [`Observer`] are switched on
    pub struct ObserverFlags: u32 {
        /// `on_collision` and `on_post_collision`
        const COLLISION = 0b001;
        /// `on_contact`, once per contact point. Only takes effect together with `COLLISION`.
        const CONTACT = 0b010;
        /// `on_apply_forces`
        const APPLY_FORCES = 0b100;
    }
}

impl Default for ObserverFlags {
    fn default() -> Self {
        ObserverFlags::COLLISION | ObserverFlags::APPLY_FORCES
    }
}

/// The body on the other side of a contact
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Collision {
    /// The other body
    pub other: BodyId,
    /// The entity the other body belongs to
    pub other_entity: Entity,
}

/// The observed body, as seen from inside a callback
pub struct ObserverContext<'a> {
    pub(crate) id: BodyId,
    pub(crate) entity: Entity,
    pub(crate) handle: BodyHandle,
    pub(crate) backend: &'a mut dyn PhysicsBackend,
}

impl ObserverContext<'_> {
    /// The observed body
    pub fn body(&self) -> BodyId {
        self.id
    }

    /// The entity the observed body belongs to
    pub fn entity(&self) -> Entity {
        self.entity
    }

    /// The body's current engine state
    pub fn state(&self) -> BodyState {
        self.backend.body_state(self.handle).unwrap_or_default()
    }

    /// Push the body during this step
    pub fn add_force(&mut self, force: Vec3) -> HothamResult<()> {
        self.backend.add_force(self.handle, force)
    }

    /// Twist the body during this step
    pub fn add_torque(&mut self, torque: Vec3) -> HothamResult<()> {
        self.backend.add_torque(self.handle, torque)
    }

    /// Overwrite the body's linear velocity
    pub fn set_linear_velocity(&mut self, velocity: Vec3) -> HothamResult<()> {
        self.backend.set_linear_velocity(self.handle, velocity)
    }

    /// Buoyancy force and torque from a fluid below `plane`.
    /// See [`crate::contexts::PhysicsContext::buoyancy`].
    pub fn buoyancy(&self, plane: Vec4, fluid_density: f32) -> (Vec3, Vec3) {
        self.backend
            .buoyancy(self.handle, plane, fluid_density)
            .unwrap_or_default()
    }
}

/// Implement this to react to what happens to a body during a step. Every callback is optional.
///
/// A body's observers run one at a time, in the order they were added. For each contact joint
/// touching the body an observer gets `on_collision`, `on_contact` for each contact point, then
/// `on_post_collision`. Its `on_apply_forces` follows once every joint has been dispatched, before
/// the next observer hears about anything.
pub trait BodyObserver: Send {
    /// The body is touching `collision.other`
    fn on_collision(&mut self, _body: &mut ObserverContext<'_>, _collision: &Collision) {}

    /// One point of contact with `collision.other`
    fn on_contact(
        &mut self,
        _body: &mut ObserverContext<'_>,
        _collision: &Collision,
        _contact: &ContactPoint,
    ) {
    }

    /// Every contact point with `collision.other` has been reported
    fn on_post_collision(&mut self, _body: &mut ObserverContext<'_>, _collision: &Collision) {}

    /// Add forces or torques for this step
    fn on_apply_forces(&mut self, _body: &mut ObserverContext<'_>, _timestep: f32) {}
}

/// A registration of [`BodyObserver`] callbacks on one rigid body
pub struct Observer {
    /// Which callbacks are switched on
    pub flags: ObserverFlags,
    pub(crate) callbacks: Box<dyn BodyObserver>,
}

impl std::fmt::Debug for Observer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observer")
            .field("flags", &self.flags)
            .finish()
    }
}

impl Observer {
    /// Wrap some callbacks, with collision and force callbacks switched on
    pub fn new(callbacks: impl BodyObserver + 'static) -> Self {
        Self {
            flags: Default::default(),
            callbacks: Box::new(callbacks),
        }
    }

    /// Replace the enabled callbacks
    pub fn with_flags(self, flags: ObserverFlags) -> Self {
        Self { flags, ..self }
    }

    /// Switch callbacks on or off
    pub fn set_enabled(&mut self, flags: ObserverFlags, enabled: bool) {
        self.flags.set(flags, enabled);
    }

    pub(crate) fn wants(&self, flags: ObserverFlags) -> bool {
        self.flags.intersects(flags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nothing;
    impl BodyObserver for Nothing {}

    #[test]
    pub fn test_observer_flags() {
        let mut observer = Observer::new(Nothing);
        assert!(observer.wants(ObserverFlags::COLLISION));
        assert!(observer.wants(ObserverFlags::APPLY_FORCES));
        assert!(!observer.wants(ObserverFlags::CONTACT));

        observer.set_enabled(ObserverFlags::CONTACT, true);
        observer.set_enabled(ObserverFlags::APPLY_FORCES, false);
        assert_eq!(
            observer.flags,
            ObserverFlags::COLLISION | ObserverFlags::CONTACT
        );

        let observer = Observer::new(Nothing).with_flags(ObserverFlags::empty());
        assert!(!observer.wants(ObserverFlags::all()));
    }
}
