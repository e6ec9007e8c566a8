use glam::{Quat, Vec3};
use rapier3d::na::{Isometry3, Quaternion, Translation3, UnitQuaternion, Vector3};

#[inline]
/// Build a [`rapier3d::na::Isometry3`] from a [`glam::Vec3`] translation and a [`glam::Quat`] rotation
pub fn isometry_from_parts(translation: Vec3, rotation: Quat) -> Isometry3<f32> {
    Isometry3::from_parts(
        Translation3::new(translation.x, translation.y, translation.z),
        na_rotation_from_glam(rotation),
    )
}

#[inline]
/// Decompose a [`rapier3d::na::Isometry3`] into its rotation and translation components
pub fn decompose_isometry(i: &Isometry3<f32>) -> (Quat, Vec3) {
    (
        glam_quat_from_na(&i.rotation),
        glam_vec_from_na(&i.translation.vector),
    )
}

#[inline]
/// Convert a [`glam::Vec3`] into a [`rapier3d::na::Vector3`]
pub fn na_vector_from_glam(v: Vec3) -> Vector3<f32> {
    [v.x, v.y, v.z].into()
}

#[inline]
/// Convert a [`rapier3d::na::Vector3`] into a [`glam::Vec3`]
pub fn glam_vec_from_na(v: &Vector3<f32>) -> Vec3 {
    Vec3::new(v.x, v.y, v.z)
}

#[inline]
/// Convert a [`glam::Quat`] into a [`rapier3d::na::UnitQuaternion`]
pub fn na_rotation_from_glam(q: Quat) -> UnitQuaternion<f32> {
    UnitQuaternion::new_normalize(Quaternion::new(q.w, q.x, q.y, q.z))
}

#[inline]
/// Convert a [`rapier3d::na::UnitQuaternion`] into a [`glam::Quat`]
pub fn glam_quat_from_na(q: &UnitQuaternion<f32>) -> Quat {
    Quat::from_xyzw(q.i, q.j, q.k, q.w)
}

#[inline]
/// `true` if every component of `v` is finite and strictly positive
pub(crate) fn is_positive_finite(v: Vec3) -> bool {
    v.is_finite() && v.min_element() > 0.
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    pub fn test_isometry_round_trip() {
        let rotation = Quat::from_euler(glam::EulerRot::XYZ, 0.1, 0.2, 0.3);
        let translation = Vec3::new(1.0, 2.0, 3.0);
        let isometry = isometry_from_parts(translation, rotation);
        let (r, t) = decompose_isometry(&isometry);
        assert_relative_eq!(t, translation);
        assert_relative_eq!(r, rotation, epsilon = 1e-6);
    }

    #[test]
    pub fn test_is_positive_finite() {
        assert!(is_positive_finite(Vec3::ONE));
        assert!(!is_positive_finite(Vec3::new(1.0, 0.0, 1.0)));
        assert!(!is_positive_finite(Vec3::new(1.0, f32::NAN, 1.0)));
    }
}
