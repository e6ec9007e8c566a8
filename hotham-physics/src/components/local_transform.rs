use rapier3d::na::{Isometry3, UnitQuaternion, Vector3};

use crate::util::{decompose_isometry, glam_vec_from_na, isometry_from_parts};

/// The entity's position relative to its [`super::Parent`], or to the world if it has none.
///
/// Rigid bodies that are awake have this overwritten at the end of every physics step, so it
/// always reflects where the engine put them. Colliders use it to work out where they sit
/// relative to the body that owns them.
#[derive(Clone, PartialEq, Debug, Copy)]
pub struct LocalTransform {
    /// The translation of the entity
    pub translation: Vector3<f32>,
    /// The rotation of the entity
    pub rotation: UnitQuaternion<f32>,
    /// The non-uniform scale of the entity
    pub scale: Vector3<f32>,
}

impl Default for LocalTransform {
    fn default() -> Self {
        Self {
            translation: Vector3::zeros(),
            rotation: UnitQuaternion::identity(),
            scale: Vector3::new(1.0, 1.0, 1.0),
        }
    }
}

impl LocalTransform {
    /// Create a transform from glam parts, with unit scale
    pub fn from_translation_rotation(translation: glam::Vec3, rotation: glam::Quat) -> Self {
        let mut local_transform = LocalTransform::default();
        local_transform.update_from_isometry(&isometry_from_parts(translation, rotation));
        local_transform
    }

    /// Convenience function to convert the `LocalTransform` into a `nalgebra::Isometry3`
    pub fn position(&self) -> Isometry3<f32> {
        Isometry3 {
            rotation: self.rotation,
            translation: self.translation.into(),
        }
    }

    /// Update the translation and rotation from a [`nalgebra::Isometry3`](rapier3d::na::Isometry3)
    pub fn update_from_isometry(&mut self, isometry: &Isometry3<f32>) {
        self.translation = isometry.translation.vector;
        self.rotation = isometry.rotation;
    }

    /// The translation and rotation as glam types
    pub fn to_glam(&self) -> (glam::Vec3, glam::Quat) {
        let (rotation, translation) = decompose_isometry(&self.position());
        (translation, rotation)
    }

    /// The scale as a glam vector
    pub fn glam_scale(&self) -> glam::Vec3 {
        glam_vec_from_na(&self.scale)
    }
}
