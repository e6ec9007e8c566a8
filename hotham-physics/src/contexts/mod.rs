#![allow(missing_docs)]
pub mod physics_context;

pub use physics_context::{
    BodyId, JointId, MaterialInteraction, PhysicsConfig, PhysicsContext, PhysicsMaterial, RayHit,
};
