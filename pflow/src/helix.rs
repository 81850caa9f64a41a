//! Helical track parameterisation and extrapolation in a solenoidal field.
//!
//! Distances are mm, momenta GeV, fields Tesla. The field is taken uniform along z
//! over the range of any single extrapolation; propagation across field changes is
//! done by re-fitting a new helix at the boundary.

use super::error::{Error, Result};
use super::vector::CartesianVector;
use std::f64::consts::TAU;

/// Conversion constant between momentum, field and curvature radius, GeV/(mm·T).
const FCT: f64 = 2.99792458e-4;

/// Fitted helix, defined by a reference point, the momentum there, the particle charge
/// and the magnetic field.
#[derive(Clone, Debug)]
pub struct Helix {
    reference_point: CartesianVector,
    momentum: CartesianVector,
    charge: i32,
    radius: f64,
    pt: f64,
    tan_lambda: f64,
    x_centre: f64,
    y_centre: f64,
    phi_ref: f64,
}

impl Helix {
    /// Build a helix from a point on the trajectory and the momentum there.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] for zero charge, a non-positive field
    /// magnitude or vanishing transverse momentum.
    pub fn new(
        reference_point: CartesianVector,
        momentum: CartesianVector,
        charge: i32,
        bfield: f64,
    ) -> Result<Self> {
        if charge == 0 {
            return Err(Error::InvalidParameter("helix requires non-zero charge".to_owned()));
        }

        if bfield <= 0.0 {
            return Err(Error::InvalidParameter(
                "helix requires a positive field magnitude".to_owned(),
            ));
        }

        let pt = momentum.x.hypot(momentum.y);

        if pt <= 0.0 {
            return Err(Error::InvalidParameter(
                "helix requires non-zero transverse momentum".to_owned(),
            ));
        }

        let radius = pt / (FCT * bfield);
        let phi_momentum = momentum.y.atan2(momentum.x);
        let phi_centre = f64::from(charge).mul_add(-std::f64::consts::FRAC_PI_2, phi_momentum);
        let x_centre = radius.mul_add(phi_centre.cos(), reference_point.x);
        let y_centre = radius.mul_add(phi_centre.sin(), reference_point.y);
        let phi_ref = (reference_point.y - y_centre).atan2(reference_point.x - x_centre);

        Ok(Self {
            reference_point,
            momentum,
            charge,
            radius,
            pt,
            tan_lambda: momentum.z / pt,
            x_centre,
            y_centre,
            phi_ref,
        })
    }

    /// The reference point used for the fit.
    #[must_use]
    pub const fn reference_point(&self) -> &CartesianVector {
        &self.reference_point
    }

    /// The momentum at the reference point.
    #[must_use]
    pub const fn momentum(&self) -> &CartesianVector {
        &self.momentum
    }

    /// The particle charge.
    #[must_use]
    pub const fn charge(&self) -> i32 {
        self.charge
    }

    /// The curvature radius, in mm.
    #[must_use]
    pub const fn radius(&self) -> f64 {
        self.radius
    }

    /// The dip tangent `pz / pt`.
    #[must_use]
    pub const fn tan_lambda(&self) -> f64 {
        self.tan_lambda
    }

    /// Forward angular travel from the reference azimuth to `phi`, in `[0, tau)`.
    fn forward_angle(&self, phi: f64) -> f64 {
        let delta = -f64::from(self.charge) * (phi - self.phi_ref);
        delta.rem_euclid(TAU)
    }

    /// The azimuth around the helix centre after travelling so that z reaches `z`.
    fn phi_at_z(&self, z: f64) -> f64 {
        f64::from(self.charge).mul_add(
            -((z - self.reference_point.z) / (self.radius * self.tan_lambda)),
            self.phi_ref,
        )
    }

    /// Position on the helix at the given z plane.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] when the trajectory never crosses the plane
    /// (vanishing longitudinal momentum).
    pub fn point_in_z(&self, z: f64) -> Result<CartesianVector> {
        if self.momentum.z == 0.0 {
            return Err(Error::InvalidParameter(
                "helix does not cross the requested z plane".to_owned(),
            ));
        }

        let phi = self.phi_at_z(z);

        Ok(CartesianVector::new(
            self.radius.mul_add(phi.cos(), self.x_centre),
            self.radius.mul_add(phi.sin(), self.y_centre),
            z,
        ))
    }

    /// First position, in the direction of travel, at which the helix reaches the
    /// given cylindrical polar radius.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] when the helix circle never reaches that
    /// radius.
    pub fn point_on_circle(&self, cylinder_radius: f64) -> Result<CartesianVector> {
        let centre_distance = self.x_centre.hypot(self.y_centre);

        if centre_distance == 0.0 {
            return Err(Error::InvalidParameter(
                "helix circle concentric with the z axis".to_owned(),
            ));
        }

        let along = (cylinder_radius.mul_add(cylinder_radius, centre_distance * centre_distance)
            - self.radius * self.radius)
            / (2.0 * centre_distance);
        let chord_squared = cylinder_radius.mul_add(cylinder_radius, -(along * along));

        if chord_squared < 0.0 {
            return Err(Error::InvalidParameter(format!(
                "helix does not reach cylinder radius {cylinder_radius}"
            )));
        }

        let chord = chord_squared.sqrt();
        let ex = self.x_centre / centre_distance;
        let ey = self.y_centre / centre_distance;

        let candidates = [
            (chord.mul_add(-ey, along * ex), chord.mul_add(ex, along * ey)),
            (chord.mul_add(ey, along * ex), chord.mul_add(-ex, along * ey)),
        ];

        let mut best: Option<(f64, CartesianVector)> = None;

        for (x, y) in candidates {
            let phi = (y - self.y_centre).atan2(x - self.x_centre);
            let travel = self.forward_angle(phi);
            let z = (travel * self.radius).mul_add(self.tan_lambda, self.reference_point.z);

            if best.as_ref().is_none_or(|(best_travel, _)| travel < *best_travel) {
                best = Some((travel, CartesianVector::new(x, y, z)));
            }
        }

        Ok(best.expect("two candidates evaluated").1)
    }

    /// Distance components between the helix and a point: transverse distance to the
    /// helix circle, longitudinal distance at the matching azimuth, and the combined
    /// 3-D distance in the z component, mirroring the layout callers index into.
    #[must_use]
    pub fn distance_to_point(&self, point: &CartesianVector) -> CartesianVector {
        let dx = point.x - self.x_centre;
        let dy = point.y - self.y_centre;
        let distance_xy = (dx.hypot(dy) - self.radius).abs();

        let phi = dy.atan2(dx);
        let travel = self.forward_angle(phi);
        let z_base = (travel * self.radius).mul_add(self.tan_lambda, self.reference_point.z);
        let z_period = TAU * self.radius * self.tan_lambda;

        let distance_z = if z_period.abs() > 0.0 {
            let turns = ((point.z - z_base) / z_period).round();
            (point.z - turns.mul_add(z_period, z_base)).abs()
        } else {
            (point.z - self.reference_point.z).abs()
        };

        CartesianVector::new(distance_xy, distance_z, distance_xy.hypot(distance_z))
    }

    /// Momentum of the trajectory at the azimuth matching the given point.
    #[must_use]
    pub fn extrapolated_momentum(&self, point: &CartesianVector) -> CartesianVector {
        let phi = (point.y - self.y_centre).atan2(point.x - self.x_centre);
        let charge = f64::from(self.charge);

        CartesianVector::new(
            charge * self.pt * phi.sin(),
            -charge * self.pt * phi.cos(),
            self.momentum.z,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;

    fn helix() -> Helix {
        Helix::new(
            CartesianVector::new(0.0, 0.0, 0.0),
            CartesianVector::new(1.0, 0.0, 0.5),
            1,
            4.0,
        )
        .unwrap()
    }

    #[test]
    fn neutral_particle_is_rejected() {
        assert!(Helix::new(
            CartesianVector::new(0.0, 0.0, 0.0),
            CartesianVector::new(1.0, 0.0, 0.0),
            0,
            4.0,
        )
        .is_err());
    }

    #[test]
    fn extrapolated_momentum_at_reference_matches_input() {
        let helix = helix();
        let momentum = helix.extrapolated_momentum(helix.reference_point());

        assert_approx_eq!(f64, momentum.x, 1.0, epsilon = 1e-9);
        assert_approx_eq!(f64, momentum.y, 0.0, epsilon = 1e-9);
        assert_approx_eq!(f64, momentum.z, 0.5);
    }

    #[test]
    fn point_in_z_stays_on_the_circle() {
        let helix = helix();
        let point = helix.point_in_z(100.0).unwrap();

        // distance from the helix centre must equal the curvature radius
        let distance = helix.distance_to_point(&point);
        assert_approx_eq!(f64, distance.x, 0.0, epsilon = 1e-6);
        assert_approx_eq!(f64, distance.z, 0.0, epsilon = 1e-6);
        assert_approx_eq!(f64, point.z, 100.0);
    }

    #[test]
    fn point_on_circle_has_requested_radius() {
        let helix = helix();
        let point = helix.point_on_circle(500.0).unwrap();

        assert_approx_eq!(f64, point.perp(), 500.0, epsilon = 1e-6);
        // a point on the trajectory is at zero distance from the helix
        assert_approx_eq!(f64, helix.distance_to_point(&point).z, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn unreachable_radius_is_an_error() {
        // 1 GeV pt in 4 T curls with radius ~833 mm around a centre ~833 mm from the
        // origin, so radii beyond ~1667 mm are unreachable
        assert!(helix().point_on_circle(5000.0).is_err());
    }

    #[test]
    fn distance_to_displaced_point() {
        let helix = helix();
        let on_helix = helix.point_in_z(40.0).unwrap();
        let displaced = on_helix + CartesianVector::new(0.0, 0.0, 7.0);

        let distance = helix.distance_to_point(&displaced);
        assert_approx_eq!(f64, distance.y, 7.0, epsilon = 1e-6);
    }
}
