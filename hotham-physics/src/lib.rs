#![warn(missing_docs)]

//! G'day, and welcome to Hotham's physics integration! 👋
//!
//! This crate connects [`hecs`] entities to a rigid body engine. An entity with a
//! [`components::RigidBody`] becomes a body in the engine, and every [`components::Collider`] on
//! it or beneath it becomes part of that body's collision shape. Call
//! [`systems::physics_system`] once per frame to step the simulation and copy the results back
//! into each entity's [`components::LocalTransform`].
//!
//! # Getting started
//! ```
//! use hotham_physics::{
//!     components::{Collider, LocalTransform, RigidBody},
//!     contexts::PhysicsContext,
//!     hecs::World,
//!     systems::physics_system,
//! };
//!
//! let mut world = World::new();
//! let mut physics_context = PhysicsContext::default();
//! let ball = world.spawn((
//!     LocalTransform::default(),
//!     RigidBody::default(),
//!     Collider::sphere(0.5),
//! ));
//! // The body is created in the engine by the first step
//! physics_context.add_body(&world, ball).unwrap();
//!
//! for _ in 0..72 {
//!     physics_system(&mut world, &mut physics_context).unwrap();
//! }
//! assert!(world.get::<&LocalTransform>(ball).unwrap().translation.y < 0.);
//! ```
//!
//! # How shapes are put together
//! The engine only accepts a single root shape per body. A [`shapes::ShapeComposer`] keeps that
//! root as cheap as possible: an empty placeholder when there are no colliders, the collider
//! itself when there's one, and a compound aggregate when there are more. Static bodies always
//! use a scene aggregate.

pub use glam;
pub use hecs;
pub use hotham_error::HothamError;
pub use rapier3d;

/// The seam between Hotham and the rigid body engine
pub mod backend;
/// Components are data attached to entities that describe bodies and colliders
pub mod components;
/// The [`contexts::PhysicsContext`], which owns the engine and every body in it
pub mod contexts;
mod hotham_error;
/// Callbacks that let the game react to collisions and push bodies around
pub mod observers;
/// Composing many colliders into the single shape a body needs
pub mod shapes;
/// Systems are functions called each frame to update the simulation
pub mod systems;
/// Kitchen sink utility functions
pub mod util;

/// Hotham result type
pub type HothamResult<T> = std::result::Result<T, HothamError>;
