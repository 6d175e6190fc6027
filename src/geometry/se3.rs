//! SE3: rigid-body transform (rotation + translation).
//!
//! Keyframe poses throughout the crate are stored as `T_cw` (world-to-camera):
//! `p_cam = T_cw * p_world`. The camera center in world coordinates is the
//! translation of the inverse transform.

use std::ops::Mul;

use nalgebra::{Matrix3, UnitQuaternion, Vector3};

/// Rigid-body transform: `p' = R * p + t`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    /// Identity transform.
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Construct from a rotation matrix and translation.
    pub fn from_rt(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        let rot = nalgebra::Rotation3::from_matrix_unchecked(rotation);
        Self {
            rotation: UnitQuaternion::from_rotation_matrix(&rot),
            translation,
        }
    }

    /// Inverse: `T^{-1} = [R^T | -R^T t]`.
    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        Self {
            rotation: rot_inv,
            translation: -(rot_inv * self.translation),
        }
    }

    /// Apply the transform to a point.
    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    /// Rotation as a 3x3 matrix.
    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    /// Camera center in world coordinates for a `T_cw` pose.
    pub fn camera_center(&self) -> Vector3<f64> {
        -(self.rotation.inverse() * self.translation)
    }
}

impl Mul for SE3 {
    type Output = SE3;

    /// Composition: `(self * rhs)(p) = self(rhs(p))`.
    fn mul(self, rhs: SE3) -> SE3 {
        SE3 {
            rotation: self.rotation * rhs.rotation,
            translation: self.rotation * rhs.translation + self.translation,
        }
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_identity_transform() {
        let p = Vector3::new(1.0, -2.0, 3.0);
        assert_relative_eq!(SE3::identity().transform_point(&p), p, epsilon = 1e-12);
    }

    #[test]
    fn test_inverse_roundtrip() {
        let t = SE3::new(
            UnitQuaternion::from_axis_angle(
                &nalgebra::Unit::new_normalize(Vector3::new(1.0, 2.0, 0.5)),
                0.8,
            ),
            Vector3::new(0.3, -1.0, 2.0),
        );

        let p = Vector3::new(4.0, 5.0, 6.0);
        let back = t.inverse().transform_point(&t.transform_point(&p));
        assert_relative_eq!(back, p, epsilon = 1e-10);
    }

    #[test]
    fn test_composition_matches_sequential_application() {
        let a = SE3::new(
            UnitQuaternion::from_axis_angle(
                &nalgebra::Unit::new_normalize(Vector3::new(0.0, 0.0, 1.0)),
                std::f64::consts::FRAC_PI_2,
            ),
            Vector3::new(1.0, 0.0, 0.0),
        );
        let b = SE3::new(UnitQuaternion::identity(), Vector3::new(0.0, 2.0, 0.0));

        let p = Vector3::new(1.0, 1.0, 1.0);
        assert_relative_eq!(
            (a * b).transform_point(&p),
            a.transform_point(&b.transform_point(&p)),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_camera_center() {
        // Camera at (0, 0, 5) looking along +z: T_cw translation is -R * C.
        let center = Vector3::new(0.0, 0.0, 5.0);
        let t_cw = SE3::new(UnitQuaternion::identity(), -center);
        assert_relative_eq!(t_cw.camera_center(), center, epsilon = 1e-12);
    }
}
