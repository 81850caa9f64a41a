//! Least-squares line fits through cluster hits and the geometric helpers built on
//! them.
//!
//! Fits never fail by error for degenerate inputs; they return a result whose success
//! flag is false. Reading the fitted quantities of an unsuccessful fit is an error.

use super::arena::Arena;
use super::cluster::Cluster;
use super::error::{Error, Result};
use super::hit::CaloHit;
use super::vector::CartesianVector;

/// Outcome of a least-squares line fit.
#[derive(Clone, Copy, Debug, Default)]
pub struct ClusterFitResult {
    successful: bool,
    direction: CartesianVector,
    intercept: CartesianVector,
    chi2: f64,
    rms: f64,
    radial_direction_cosine: f64,
}

impl ClusterFitResult {
    /// An unsuccessful fit.
    #[must_use]
    pub fn unsuccessful() -> Self {
        Self::default()
    }

    pub(crate) const fn new(
        direction: CartesianVector,
        intercept: CartesianVector,
        chi2: f64,
        rms: f64,
        radial_direction_cosine: f64,
    ) -> Self {
        Self {
            successful: true,
            direction,
            intercept,
            chi2,
            rms,
            radial_direction_cosine,
        }
    }

    /// Whether the fit succeeded.
    #[must_use]
    pub const fn is_successful(&self) -> bool {
        self.successful
    }

    /// Unit direction of the fitted line, oriented outwards from the interaction
    /// point.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotInitialized`] for an unsuccessful fit.
    pub fn direction(&self) -> Result<CartesianVector> {
        if !self.successful {
            return Err(Error::NotInitialized("direction of unsuccessful fit"));
        }

        Ok(self.direction)
    }

    /// A point on the fitted line.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotInitialized`] for an unsuccessful fit.
    pub fn intercept(&self) -> Result<CartesianVector> {
        if !self.successful {
            return Err(Error::NotInitialized("intercept of unsuccessful fit"));
        }

        Ok(self.intercept)
    }

    /// Mean squared residual normalised by the cell sizes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotInitialized`] for an unsuccessful fit.
    pub fn chi2(&self) -> Result<f64> {
        if !self.successful {
            return Err(Error::NotInitialized("chi2 of unsuccessful fit"));
        }

        Ok(self.chi2)
    }

    /// Root-mean-square residual, in mm.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotInitialized`] for an unsuccessful fit.
    pub fn rms(&self) -> Result<f64> {
        if !self.successful {
            return Err(Error::NotInitialized("rms of unsuccessful fit"));
        }

        Ok(self.rms)
    }

    /// Cosine of the angle between the fit direction and the radial direction at the
    /// intercept.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotInitialized`] for an unsuccessful fit.
    pub fn radial_direction_cosine(&self) -> Result<f64> {
        if !self.successful {
            return Err(Error::NotInitialized("dcos_r of unsuccessful fit"));
        }

        Ok(self.radial_direction_cosine)
    }
}

/// A fit result tied to an object that may since have changed. Once a merge or delete
/// invalidates the payload, the relation turns defunct and any read fails loudly.
#[derive(Clone, Debug)]
pub enum FitRelation<T> {
    /// The payload is still valid.
    Valid(T),
    /// The underlying object changed; the payload must not be read.
    Defunct,
}

impl<T> FitRelation<T> {
    /// Borrow the payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotAllowed`] when the relation is defunct.
    pub fn get(&self) -> Result<&T> {
        match self {
            Self::Valid(payload) => Ok(payload),
            Self::Defunct => Err(Error::NotAllowed("read of defunct fit relation")),
        }
    }

    /// Mark the relation defunct.
    pub fn set_defunct(&mut self) {
        *self = Self::Defunct;
    }

    /// Whether the relation is defunct.
    #[must_use]
    pub const fn is_defunct(&self) -> bool {
        matches!(self, Self::Defunct)
    }
}

/// One input point of a line fit, with the cell size used to normalise residuals.
#[derive(Clone, Copy, Debug)]
pub struct FitPoint {
    /// Point position.
    pub position: CartesianVector,
    /// Characteristic cell size at the point, in mm.
    pub cell_size: f64,
}

/// Perpendicular distance between a point and the line through `line_point` along the
/// unit vector `line_direction`.
#[must_use]
pub fn perpendicular_distance(
    point: &CartesianVector,
    line_point: &CartesianVector,
    line_direction: &CartesianVector,
) -> f64 {
    (*point - *line_point).cross(line_direction).magnitude()
}

/// Least-squares straight-line fit through a set of points.
///
/// The fit projects the points onto an axis from the interaction point through their
/// barycentre and regresses the two transverse coordinates against the longitudinal
/// one. Fewer than two points, a vanishing barycentre or no longitudinal spread give
/// an unsuccessful result.
#[must_use]
pub fn fit_points(points: &[FitPoint]) -> ClusterFitResult {
    if points.len() < 2 {
        return ClusterFitResult::unsuccessful();
    }

    let n = points.len() as f64;
    let mut barycentre = CartesianVector::default();
    for point in points {
        barycentre += point.position;
    }
    barycentre = barycentre * (1.0 / n);

    let Ok(axis) = barycentre.unit_vector() else {
        return ClusterFitResult::unsuccessful();
    };

    // orthonormal basis transverse to the axis
    let helper = if axis.x.abs() < 0.99 {
        CartesianVector::new(1.0, 0.0, 0.0)
    } else {
        CartesianVector::new(0.0, 1.0, 0.0)
    };
    let Ok(u) = axis.cross(&helper).unit_vector() else {
        return ClusterFitResult::unsuccessful();
    };
    let v = axis.cross(&u);

    let mut sum_zeta = 0.0;
    let mut sum_zeta2 = 0.0;
    let mut sum_xi = 0.0;
    let mut sum_eta = 0.0;
    let mut sum_zeta_xi = 0.0;
    let mut sum_zeta_eta = 0.0;

    for point in points {
        let zeta = point.position.dot(&axis);
        let xi = point.position.dot(&u);
        let eta = point.position.dot(&v);

        sum_zeta += zeta;
        sum_zeta2 += zeta * zeta;
        sum_xi += xi;
        sum_eta += eta;
        sum_zeta_xi += zeta * xi;
        sum_zeta_eta += zeta * eta;
    }

    let denominator = sum_zeta.mul_add(-sum_zeta, n * sum_zeta2);

    if denominator.abs() < f64::EPSILON * n * sum_zeta2.abs() + f64::MIN_POSITIVE {
        return ClusterFitResult::unsuccessful();
    }

    let slope_xi = sum_zeta.mul_add(-sum_xi, n * sum_zeta_xi) / denominator;
    let slope_eta = sum_zeta.mul_add(-sum_eta, n * sum_zeta_eta) / denominator;
    let intercept_xi = (sum_xi - slope_xi * sum_zeta) / n;
    let intercept_eta = (sum_eta - slope_eta * sum_zeta) / n;

    let Ok(direction) = (axis + u * slope_xi + v * slope_eta).unit_vector() else {
        return ClusterFitResult::unsuccessful();
    };

    let mean_zeta = sum_zeta / n;
    let intercept = axis * mean_zeta
        + u * slope_xi.mul_add(mean_zeta, intercept_xi)
        + v * slope_eta.mul_add(mean_zeta, intercept_eta);

    let mut sum_residual2 = 0.0;
    let mut sum_normalised2 = 0.0;

    for point in points {
        let residual = perpendicular_distance(&point.position, &intercept, &direction);
        sum_residual2 += residual * residual;

        let cell_size = if point.cell_size > 0.0 { point.cell_size } else { 1.0 };
        sum_normalised2 += (residual / cell_size).powi(2);
    }

    let rms = (sum_residual2 / n).sqrt();
    let chi2 = sum_normalised2 / n;
    let radial_direction_cosine = intercept
        .unit_vector()
        .map_or(0.0, |radial| direction.dot(&radial));

    ClusterFitResult::new(direction, intercept, chi2, rms, radial_direction_cosine)
}

fn layer_fit_points(
    hits: &Arena<CaloHit>,
    cluster: &Cluster,
    start_layer: u32,
    end_layer: u32,
) -> Result<Vec<FitPoint>> {
    let mut points = Vec::new();

    for layer in cluster.ordered_hits().layers() {
        if (layer < start_layer) || (layer > end_layer) {
            continue;
        }

        let mut cell_size_sum = 0.0;
        let mut n_hits = 0usize;

        for id in cluster.ordered_hits().layer_hits(layer) {
            cell_size_sum += hits.get(id)?.cell_length_scale();
            n_hits += 1;
        }

        points.push(FitPoint {
            position: cluster.centroid(layer)?,
            cell_size: cell_size_sum / n_hits as f64,
        });
    }

    Ok(points)
}

/// Fit the energy-weighted layer centroids between `start_layer` and `end_layer`,
/// inclusive.
///
/// # Errors
///
/// Returns an error only for inconsistent cluster state; degenerate inputs give an
/// unsuccessful result instead.
pub fn fit_layers(
    hits: &Arena<CaloHit>,
    cluster: &Cluster,
    start_layer: u32,
    end_layer: u32,
) -> Result<ClusterFitResult> {
    Ok(fit_points(&layer_fit_points(hits, cluster, start_layer, end_layer)?))
}

fn occupied_layer_bounds(cluster: &Cluster, n_layers: usize, from_start: bool) -> Option<(u32, u32)> {
    let layers: Vec<u32> = cluster.ordered_hits().layers().collect();

    if layers.is_empty() || (n_layers == 0) {
        return None;
    }

    if from_start {
        let end = layers[n_layers.min(layers.len()) - 1];
        Some((layers[0], end))
    } else {
        let start = layers[layers.len() - n_layers.min(layers.len())];
        Some((start, layers[layers.len() - 1]))
    }
}

/// Fit the first `n_layers` occupied layers of the cluster.
///
/// # Errors
///
/// Returns an error only for inconsistent cluster state.
pub fn fit_start(
    hits: &Arena<CaloHit>,
    cluster: &Cluster,
    n_layers: usize,
) -> Result<ClusterFitResult> {
    match occupied_layer_bounds(cluster, n_layers, true) {
        Some((start, end)) if n_layers >= 2 => fit_layers(hits, cluster, start, end),
        _ => Ok(ClusterFitResult::unsuccessful()),
    }
}

/// Fit the last `n_layers` occupied layers of the cluster.
///
/// # Errors
///
/// Returns an error only for inconsistent cluster state.
pub fn fit_end(
    hits: &Arena<CaloHit>,
    cluster: &Cluster,
    n_layers: usize,
) -> Result<ClusterFitResult> {
    match occupied_layer_bounds(cluster, n_layers, false) {
        Some((start, end)) if n_layers >= 2 => fit_layers(hits, cluster, start, end),
        _ => Ok(ClusterFitResult::unsuccessful()),
    }
}

/// Fit every non-isolated hit position of the cluster.
///
/// # Errors
///
/// Returns an error only for inconsistent cluster state.
pub fn fit_all_hits(hits: &Arena<CaloHit>, cluster: &Cluster) -> Result<ClusterFitResult> {
    let mut points = Vec::with_capacity(cluster.n_calo_hits());

    for (_, id) in cluster.ordered_hits().hits() {
        let hit = hits.get(id)?;
        points.push(FitPoint {
            position: *hit.position(),
            cell_size: hit.cell_length_scale(),
        });
    }

    Ok(fit_points(&points))
}

/// Closest distance of approach between two fitted lines.
///
/// # Errors
///
/// Returns [`Error::NotInitialized`] when either fit is unsuccessful.
pub fn closest_distance_of_approach(
    lhs: &ClusterFitResult,
    rhs: &ClusterFitResult,
) -> Result<f64> {
    let direction_lhs = lhs.direction()?;
    let direction_rhs = rhs.direction()?;
    let offset = rhs.intercept()? - lhs.intercept()?;

    let normal = direction_lhs.cross(&direction_rhs);
    let normal_magnitude = normal.magnitude();

    if normal_magnitude < 1e-12 {
        // parallel lines
        return Ok(offset.cross(&direction_lhs).magnitude());
    }

    Ok((offset.dot(&normal) / normal_magnitude).abs())
}

/// Smallest perpendicular distance between the fitted line and the cluster hits in the
/// given layer range, or `None` when the range holds no hits.
///
/// # Errors
///
/// Returns [`Error::NotInitialized`] when the fit is unsuccessful.
pub fn distance_to_closest_hit(
    fit: &ClusterFitResult,
    hits: &Arena<CaloHit>,
    cluster: &Cluster,
    start_layer: u32,
    end_layer: u32,
) -> Result<Option<f64>> {
    let direction = fit.direction()?;
    let intercept = fit.intercept()?;
    let mut best: Option<f64> = None;

    for (layer, id) in cluster.ordered_hits().hits() {
        if (layer < start_layer) || (layer > end_layer) {
            continue;
        }

        let distance = perpendicular_distance(hits.get(id)?.position(), &intercept, &direction);

        if best.is_none_or(|current| distance < current) {
            best = Some(distance);
        }
    }

    Ok(best)
}

/// Smallest distance between any pair of hits drawn from the two clusters.
///
/// # Errors
///
/// Returns an error only for inconsistent cluster state.
pub fn closest_hit_distance(
    hits: &Arena<CaloHit>,
    lhs: &Cluster,
    rhs: &Cluster,
) -> Result<Option<f64>> {
    let mut best: Option<f64> = None;

    for (_, lhs_id) in lhs.ordered_hits().hits() {
        let lhs_position = *hits.get(lhs_id)?.position();

        for (_, rhs_id) in rhs.ordered_hits().hits() {
            let distance = (lhs_position - *hits.get(rhs_id)?.position()).magnitude();

            if best.is_none_or(|current| distance < current) {
                best = Some(distance);
            }
        }
    }

    Ok(best)
}

/// Smallest distance between hits of the two clusters within any single shared pseudo
/// layer.
///
/// # Errors
///
/// Returns an error only for inconsistent cluster state.
pub fn closest_intra_layer_distance(
    hits: &Arena<CaloHit>,
    lhs: &Cluster,
    rhs: &Cluster,
) -> Result<Option<f64>> {
    let mut best: Option<f64> = None;

    for layer in lhs.ordered_hits().layers() {
        if rhs.ordered_hits().n_hits_in_layer(layer) == 0 {
            continue;
        }

        for lhs_id in lhs.ordered_hits().layer_hits(layer) {
            let lhs_position = *hits.get(lhs_id)?.position();

            for rhs_id in rhs.ordered_hits().layer_hits(layer) {
                let distance = (lhs_position - *hits.get(rhs_id)?.position()).magnitude();

                if best.is_none_or(|current| distance < current) {
                    best = Some(distance);
                }
            }
        }
    }

    Ok(best)
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;

    fn points_along(
        origin: CartesianVector,
        direction: CartesianVector,
        n: usize,
        step: f64,
    ) -> Vec<FitPoint> {
        (0..n)
            .map(|i| FitPoint {
                position: origin + direction * (step * i as f64),
                cell_size: 10.0,
            })
            .collect()
    }

    #[test]
    fn collinear_points_fit_exactly() {
        let direction = CartesianVector::new(1.0, 0.0, 0.0);
        let points = points_along(CartesianVector::new(1500.0, 0.0, 0.0), direction, 10, 5.0);
        let fit = fit_points(&points);

        assert!(fit.is_successful());
        assert_approx_eq!(f64, fit.direction().unwrap().x, 1.0, epsilon = 1e-9);
        assert_approx_eq!(f64, fit.rms().unwrap(), 0.0, epsilon = 1e-9);
        assert_approx_eq!(f64, fit.chi2().unwrap(), 0.0, epsilon = 1e-9);
        assert_approx_eq!(f64, fit.radial_direction_cosine().unwrap(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn tilted_line_is_recovered() {
        let direction = CartesianVector::new(1.0, 0.2, 0.1).unit_vector().unwrap();
        let points = points_along(CartesianVector::new(1500.0, 0.0, 0.0), direction, 12, 7.0);
        let fit = fit_points(&points);

        assert!(fit.is_successful());
        assert!(fit.direction().unwrap().dot(&direction) > 0.999_999);
    }

    #[test]
    fn single_point_fails() {
        let fit = fit_points(&[FitPoint {
            position: CartesianVector::new(1500.0, 0.0, 0.0),
            cell_size: 10.0,
        }]);

        assert!(!fit.is_successful());
        assert!(fit.direction().is_err());
    }

    #[test]
    fn stacked_points_fail() {
        // two points in the same layer with no longitudinal spread
        let position = CartesianVector::new(1500.0, 30.0, 0.0);
        let fit = fit_points(&[
            FitPoint { position, cell_size: 10.0 },
            FitPoint { position, cell_size: 10.0 },
        ]);

        assert!(!fit.is_successful());
    }

    #[test]
    fn closest_approach_of_skew_lines() {
        let lhs = ClusterFitResult::new(
            CartesianVector::new(1.0, 0.0, 0.0),
            CartesianVector::new(0.0, 0.0, 0.0),
            0.0,
            0.0,
            1.0,
        );
        let rhs = ClusterFitResult::new(
            CartesianVector::new(0.0, 1.0, 0.0),
            CartesianVector::new(0.0, 0.0, 25.0),
            0.0,
            0.0,
            1.0,
        );

        assert_approx_eq!(f64, closest_distance_of_approach(&lhs, &rhs).unwrap(), 25.0);
    }

    #[test]
    fn closest_approach_of_parallel_lines() {
        let direction = CartesianVector::new(1.0, 0.0, 0.0);
        let lhs =
            ClusterFitResult::new(direction, CartesianVector::new(0.0, 0.0, 0.0), 0.0, 0.0, 1.0);
        let rhs =
            ClusterFitResult::new(direction, CartesianVector::new(50.0, 30.0, 0.0), 0.0, 0.0, 1.0);

        assert_approx_eq!(f64, closest_distance_of_approach(&lhs, &rhs).unwrap(), 30.0);
    }

    #[test]
    fn defunct_relation_cannot_be_read() {
        let mut relation = FitRelation::Valid(1.0_f64);
        assert!(relation.get().is_ok());

        relation.set_defunct();
        assert!(relation.is_defunct());
        assert!(matches!(relation.get(), Err(Error::NotAllowed(_))));
    }
}
