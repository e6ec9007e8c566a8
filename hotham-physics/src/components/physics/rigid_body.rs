use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::backend::MassSpec;

/// A component that turns an entity into a rigid body simulated by the physics engine.
///
/// The body gathers every [`super::Collider`] on the entity and on its descendants, stopping at
/// descendants that are rigid bodies themselves. Register the entity with
/// [`crate::contexts::PhysicsContext::add_body`] and the body will be created in the engine the first
/// time it is needed.
///
/// The `body_type` is fixed once the body exists in the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct RigidBody {
    /// How should the engine treat this body?
    pub body_type: BodyType,
    /// Total mass. Ignored by non-dynamic bodies.
    pub mass: f32,
    /// Local center of mass, used when `calculate_inertia` is false
    pub center_of_mass: Vec3,
    /// Principal angular inertia, used when `calculate_inertia` is false
    pub inertia: Vec3,
    /// Derive center of mass and inertia from the body's colliders
    pub calculate_inertia: bool,
    /// Linear damping
    pub linear_damping: f32,
    /// Angular damping
    pub angular_damping: f32,
}

/// How the engine simulates a body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BodyType {
    /// Moved by forces, gravity and contacts
    Dynamic,
    /// Moved by the game, pushes dynamic bodies around
    Kinematic,
    /// Never moves. Static bodies always use a Scene aggregate for their shape.
    Static,
}

impl Default for RigidBody {
    fn default() -> Self {
        Self {
            body_type: BodyType::Dynamic,
            mass: 1.,
            center_of_mass: Vec3::ZERO,
            inertia: Vec3::ONE,
            calculate_inertia: true,
            linear_damping: 0.1,
            angular_damping: 0.1,
        }
    }
}

impl RigidBody {
    /// A kinematic body
    pub fn kinematic() -> Self {
        Self {
            body_type: BodyType::Kinematic,
            ..Default::default()
        }
    }

    /// A static (scene) body
    pub fn fixed() -> Self {
        Self {
            body_type: BodyType::Static,
            mass: 0.,
            ..Default::default()
        }
    }

    /// Mass parameters as the engine wants them
    pub fn mass_spec(&self) -> MassSpec {
        if self.calculate_inertia {
            MassSpec {
                mass: self.mass,
                center_of_mass: None,
                inertia: None,
            }
        } else {
            MassSpec {
                mass: self.mass,
                center_of_mass: Some(self.center_of_mass),
                inertia: Some(self.inertia),
            }
        }
    }
}
