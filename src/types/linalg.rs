//! Vector helpers for the body-worn IMU frame.
//!
//! The sender is strapped with its Y axis along the body's vertical axis;
//! X and Z span the horizontal plane. `invert_y` flips the vertical sign
//! for units mounted upside down.

use nalgebra::Vector3;

pub type Vec3 = Vector3<f64>;

/// Signed vertical component, positive pointing up.
pub fn vertical(v: &Vec3, invert_y: bool) -> f64 {
    if invert_y {
        -v.y
    } else {
        v.y
    }
}

/// Magnitude of the horizontal (X/Z) components.
pub fn lateral_magnitude(v: &Vec3) -> f64 {
    v.x.hypot(v.z)
}

/// Angle between the vector and the vertical axis in degrees, 0 to 90.
/// Independent of which way the unit is mounted along Y.
pub fn tilt_from_vertical_deg(v: &Vec3) -> f64 {
    let norm = v.norm();
    if norm <= f64::EPSILON {
        return 0.0;
    }
    (v.y.abs() / norm).min(1.0).acos().to_degrees()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_upright_has_no_tilt() {
        assert_relative_eq!(tilt_from_vertical_deg(&Vec3::new(0.0, 1.0, 0.0)), 0.0);
    }

    #[test]
    fn test_lying_flat_is_ninety_degrees() {
        assert_relative_eq!(
            tilt_from_vertical_deg(&Vec3::new(0.0, 0.0, 1.0)),
            90.0,
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_invert_y_flips_vertical() {
        let v = Vec3::new(0.0, -1.0, 0.0);
        assert_relative_eq!(vertical(&v, true), 1.0);
        assert_relative_eq!(tilt_from_vertical_deg(&v), 0.0);
    }

    #[test]
    fn test_half_tilt() {
        assert_relative_eq!(
            tilt_from_vertical_deg(&Vec3::new(1.0, 1.0, 0.0)),
            45.0,
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_lateral_magnitude() {
        assert_relative_eq!(lateral_magnitude(&Vec3::new(3.0, 9.0, 4.0)), 5.0);
    }
}
