/// Where an entity sits relative to its parent
pub mod local_transform;
/// Entity hierarchy
pub mod parent;
/// Rigid bodies and the colliders attached to them
pub mod physics;

pub use local_transform::LocalTransform;
pub use parent::Parent;
pub use physics::{BodyType, Collider, Geometry, RigidBody};
