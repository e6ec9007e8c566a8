//! Collision shapes and how they are combined into the one root shape each body needs.

mod geometry_shape;
mod shape_composer;

pub use geometry_shape::GeometryShape;
pub use shape_composer::{RootKind, ShapeComposer};
