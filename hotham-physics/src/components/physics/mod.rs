/// Collision primitives
pub mod collider;
/// Rigid body settings
pub mod rigid_body;

pub use collider::{Collider, Geometry};
pub use rigid_body::{BodyType, RigidBody};
