#![allow(missing_docs)]
pub mod collision;
pub mod physics;
pub mod update_local_transform_with_rigid_body;
pub mod update_rigid_body_transforms;

pub use physics::physics_system;
