use hecs::Entity;

/// Component added to indicate that an entity has a parent.
/// Used to find which rigid body a collider belongs to, and to place bodies relative to their parent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Parent(pub Entity);
