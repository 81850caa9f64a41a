//! Three-dimensional cartesian vector used for positions, directions and momenta.

use super::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign, Mul, Neg, Sub, SubAssign};

/// A cartesian 3-vector with the origin at the interaction point. Units are mm for
/// positions and GeV for momenta.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct CartesianVector {
    /// The x component.
    pub x: f64,
    /// The y component.
    pub y: f64,
    /// The z component, along the beam axis.
    pub z: f64,
}

impl CartesianVector {
    /// Constructor from the three components.
    #[must_use]
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Return the magnitude.
    #[must_use]
    pub fn magnitude(&self) -> f64 {
        self.magnitude_squared().sqrt()
    }

    /// Return the magnitude squared.
    #[must_use]
    pub fn magnitude_squared(&self) -> f64 {
        self.z.mul_add(self.z, self.x.mul_add(self.x, self.y * self.y))
    }

    /// Return the dot product with a second vector.
    #[must_use]
    pub fn dot(&self, rhs: &Self) -> f64 {
        self.z.mul_add(rhs.z, self.x.mul_add(rhs.x, self.y * rhs.y))
    }

    /// Return the cross product with a second vector.
    #[must_use]
    pub fn cross(&self, rhs: &Self) -> Self {
        Self {
            x: self.y.mul_add(rhs.z, -(self.z * rhs.y)),
            y: self.z.mul_add(rhs.x, -(self.x * rhs.z)),
            z: self.x.mul_add(rhs.y, -(self.y * rhs.x)),
        }
    }

    /// Return the perpendicular (transverse) distance from the z axis.
    #[must_use]
    pub fn perp(&self) -> f64 {
        self.x.hypot(self.y)
    }

    /// Return the cosine of the opening angle with respect to a second vector, clamped to
    /// `[-1, 1]`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] if either vector has zero magnitude.
    pub fn cos_opening_angle(&self, rhs: &Self) -> Result<f64> {
        let magnitudes_squared = self.magnitude_squared() * rhs.magnitude_squared();

        if magnitudes_squared <= 0.0 {
            return Err(Error::InvalidParameter(
                "opening angle undefined for zero-magnitude vector".to_owned(),
            ));
        }

        Ok((self.dot(rhs) / magnitudes_squared.sqrt()).clamp(-1.0, 1.0))
    }

    /// Return the opening angle, in radians, with respect to a second vector.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] if either vector has zero magnitude.
    pub fn opening_angle(&self, rhs: &Self) -> Result<f64> {
        Ok(self.cos_opening_angle(rhs)?.acos())
    }

    /// Return the spherical coordinates `(radius, phi, theta)`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] for the zero vector.
    pub fn spherical_coordinates(&self) -> Result<(f64, f64, f64)> {
        let magnitude = self.magnitude();

        if magnitude == 0.0 {
            return Err(Error::InvalidParameter(
                "spherical coordinates undefined for zero vector".to_owned(),
            ));
        }

        Ok((magnitude, self.y.atan2(self.x), (self.z / magnitude).acos()))
    }

    /// Return a unit vector in the direction of this vector.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] for the zero vector.
    pub fn unit_vector(&self) -> Result<Self> {
        let magnitude = self.magnitude();

        if magnitude == 0.0 {
            return Err(Error::InvalidParameter(
                "unit vector undefined for zero vector".to_owned(),
            ));
        }

        Ok(Self {
            x: self.x / magnitude,
            y: self.y / magnitude,
            z: self.z / magnitude,
        })
    }
}

impl Add for CartesianVector {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Sub for CartesianVector {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl Mul<f64> for CartesianVector {
    type Output = Self;

    fn mul(self, scalar: f64) -> Self {
        Self::new(self.x * scalar, self.y * scalar, self.z * scalar)
    }
}

impl Neg for CartesianVector {
    type Output = Self;

    fn neg(self) -> Self {
        Self::new(-self.x, -self.y, -self.z)
    }
}

impl AddAssign for CartesianVector {
    fn add_assign(&mut self, rhs: Self) {
        self.x += rhs.x;
        self.y += rhs.y;
        self.z += rhs.z;
    }
}

impl SubAssign for CartesianVector {
    fn sub_assign(&mut self, rhs: Self) {
        self.x -= rhs.x;
        self.y -= rhs.y;
        self.z -= rhs.z;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;

    #[test]
    fn arithmetic() {
        let a = CartesianVector::new(1.0, 2.0, 3.0);
        let b = CartesianVector::new(-1.0, 0.5, 2.0);

        assert_eq!(a + b, CartesianVector::new(0.0, 2.5, 5.0));
        assert_eq!(a - b, CartesianVector::new(2.0, 1.5, 1.0));
        assert_eq!(a * 2.0, CartesianVector::new(2.0, 4.0, 6.0));
        assert_eq!(-a, CartesianVector::new(-1.0, -2.0, -3.0));
        assert_approx_eq!(f64, a.dot(&b), 7.0);
    }

    #[test]
    fn cross_product_is_orthogonal() {
        let a = CartesianVector::new(1.0, 2.0, 3.0);
        let b = CartesianVector::new(4.0, -1.0, 0.5);
        let c = a.cross(&b);

        assert_approx_eq!(f64, a.dot(&c), 0.0, epsilon = 1e-12);
        assert_approx_eq!(f64, b.dot(&c), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn unit_vector_of_zero_vector_fails() {
        assert!(CartesianVector::default().unit_vector().is_err());
    }

    #[test]
    fn opening_angle() {
        let a = CartesianVector::new(1.0, 0.0, 0.0);
        let b = CartesianVector::new(0.0, 1.0, 0.0);

        assert_approx_eq!(
            f64,
            a.opening_angle(&b).unwrap(),
            std::f64::consts::FRAC_PI_2
        );
        assert_approx_eq!(f64, a.cos_opening_angle(&(a * 5.0)).unwrap(), 1.0);
    }

    #[test]
    fn spherical_coordinates() {
        let v = CartesianVector::new(0.0, 0.0, 2.0);
        let (radius, _, theta) = v.spherical_coordinates().unwrap();

        assert_approx_eq!(f64, radius, 2.0);
        assert_approx_eq!(f64, theta, 0.0);
    }
}
