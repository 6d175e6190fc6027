//! Sim3: 7-DOF similarity transform (rotation + translation + positive scale).
//!
//! Loop closure estimates a similarity transform between the two sides of the
//! loop. In the stereo/RGB-D case depth is observable, so the scale is pinned
//! to 1.0 and Sim3 degenerates to SE3; in the monocular case the scale
//! absorbs accumulated scale drift.

use std::ops::Mul;

use nalgebra::{UnitQuaternion, Vector3};

use super::SE3;

/// Similarity transform: `p' = s * R * p + t`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sim3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
    pub scale: f64,
}

impl Sim3 {
    /// Identity: no rotation, no translation, scale 1.
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
            scale: 1.0,
        }
    }

    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>, scale: f64) -> Self {
        debug_assert!(scale > 0.0, "Sim3 scale must be positive");
        Self {
            rotation,
            translation,
            scale,
        }
    }

    /// Apply the transform to a point.
    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.scale * (self.rotation * p) + self.translation
    }

    /// Inverse: `S^{-1} = [(1/s) R^T | -(1/s) R^T t]`.
    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        let scale_inv = 1.0 / self.scale;
        Self {
            rotation: rot_inv,
            translation: -(rot_inv * self.translation) * scale_inv,
            scale: scale_inv,
        }
    }

    /// Collapse to a rigid transform by folding the scale into the
    /// translation: `[s R | t]` becomes `[R | t/s]`.
    ///
    /// This is how corrected keyframe poses are written back to the map,
    /// which stores SE3 only.
    pub fn to_rigid(&self) -> SE3 {
        SE3 {
            rotation: self.rotation,
            translation: self.translation / self.scale,
        }
    }

    /// Tangent-space coordinates `[ω (3), t (3), log s (1)]`.
    pub fn log(&self) -> [f64; 7] {
        let omega = self.rotation.scaled_axis();
        [
            omega.x,
            omega.y,
            omega.z,
            self.translation.x,
            self.translation.y,
            self.translation.z,
            self.scale.ln(),
        ]
    }

    /// Inverse of [`Sim3::log`].
    pub fn exp(tangent: &[f64; 7]) -> Self {
        Self {
            rotation: UnitQuaternion::from_scaled_axis(Vector3::new(
                tangent[0], tangent[1], tangent[2],
            )),
            translation: Vector3::new(tangent[3], tangent[4], tangent[5]),
            scale: tangent[6].exp(),
        }
    }
}

impl From<SE3> for Sim3 {
    /// Lift a rigid transform to a similarity transform with scale 1.
    fn from(se3: SE3) -> Self {
        Self {
            rotation: se3.rotation,
            translation: se3.translation,
            scale: 1.0,
        }
    }
}

impl Mul for Sim3 {
    type Output = Sim3;

    /// Composition: `(S1 * S2)(p) = S1(S2(p))`.
    fn mul(self, rhs: Sim3) -> Sim3 {
        Sim3 {
            rotation: self.rotation * rhs.rotation,
            translation: self.scale * (self.rotation * rhs.translation) + self.translation,
            scale: self.scale * rhs.scale,
        }
    }
}

impl Default for Sim3 {
    fn default() -> Self {
        Self::identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_transform_with_scale() {
        let s = Sim3::new(
            UnitQuaternion::identity(),
            Vector3::new(1.0, 0.0, 0.0),
            2.0,
        );
        // p' = 2 * (1,1,1) + (1,0,0)
        assert_relative_eq!(
            s.transform_point(&Vector3::new(1.0, 1.0, 1.0)),
            Vector3::new(3.0, 2.0, 2.0),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_inverse_roundtrip() {
        let s = Sim3::new(
            UnitQuaternion::from_axis_angle(
                &nalgebra::Unit::new_normalize(Vector3::new(0.0, 1.0, 0.2)),
                0.7,
            ),
            Vector3::new(1.0, 2.0, 3.0),
            1.8,
        );

        let p = Vector3::new(-2.0, 0.5, 4.0);
        let back = s.inverse().transform_point(&s.transform_point(&p));
        assert_relative_eq!(back, p, epsilon = 1e-10);

        let id = s * s.inverse();
        assert_relative_eq!(id.scale, 1.0, epsilon = 1e-10);
        assert_relative_eq!(id.translation.norm(), 0.0, epsilon = 1e-10);
    }

    #[test]
    fn test_composition_scales_multiply() {
        let a = Sim3::new(UnitQuaternion::identity(), Vector3::new(1.0, 0.0, 0.0), 2.0);
        let b = Sim3::new(UnitQuaternion::identity(), Vector3::new(0.0, 1.0, 0.0), 3.0);

        let c = a * b;
        assert_relative_eq!(c.scale, 6.0, epsilon = 1e-12);
        // t = a.s * a.R * b.t + a.t = 2*(0,1,0) + (1,0,0)
        assert_relative_eq!(c.translation, Vector3::new(1.0, 2.0, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn test_from_se3_has_unit_scale() {
        let se3 = SE3::new(UnitQuaternion::identity(), Vector3::new(4.0, 5.0, 6.0));
        let s = Sim3::from(se3);
        assert_eq!(s.scale, 1.0);
        assert_eq!(s.translation, se3.translation);
    }

    #[test]
    fn test_to_rigid_divides_translation_by_scale() {
        let s = Sim3::new(
            UnitQuaternion::identity(),
            Vector3::new(2.0, 4.0, -6.0),
            2.0,
        );
        let rigid = s.to_rigid();
        assert_relative_eq!(rigid.translation, Vector3::new(1.0, 2.0, -3.0), epsilon = 1e-12);
    }

    #[test]
    fn test_log_exp_roundtrip() {
        let s = Sim3::new(
            UnitQuaternion::from_axis_angle(
                &nalgebra::Unit::new_normalize(Vector3::new(1.0, 0.0, 1.0)),
                0.4,
            ),
            Vector3::new(0.1, -0.2, 0.3),
            1.5,
        );

        let back = Sim3::exp(&s.log());
        assert_relative_eq!(back.scale, s.scale, epsilon = 1e-12);
        assert_relative_eq!(back.translation, s.translation, epsilon = 1e-12);
        assert_relative_eq!(back.rotation.coords, s.rotation.coords, epsilon = 1e-12);
    }
}
