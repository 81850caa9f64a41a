//! Detector description: sub-detector parameters, dead-region gaps, hit granularities
//! and the pseudo-layer / B-field calculator strategies.
//!
//! A [`Detector`] is built once per engine instance and is immutable after
//! [`Detector::initialize`]; it is safe to share between engine instances.

use super::error::{Error, Result};
use super::hit::HitType;
use super::vector::CartesianVector;
use enum_dispatch::enum_dispatch;
use serde::{Deserialize, Serialize};
use std::f64::consts::TAU;

/// Cell granularity classes used to pick fine or coarse distance cuts.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize)]
pub enum Granularity {
    /// Fine sampling, e.g. silicon ECAL cells.
    Fine,
    /// Coarse sampling, e.g. scintillator HCAL cells.
    Coarse,
    /// Very coarse sampling, e.g. muon-yoke strips.
    VeryCoarse,
}

/// Map a hit type to its granularity class. The mapping is a fixed enumeration.
#[must_use]
pub const fn granularity(hit_type: HitType) -> Granularity {
    match hit_type {
        HitType::InnerDetector | HitType::Ecal => Granularity::Fine,
        HitType::Hcal => Granularity::Coarse,
        HitType::Muon => Granularity::VeryCoarse,
    }
}

/// Parameters of a single sampling layer.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LayerParameters {
    /// Perpendicular distance (barrel) or |z| distance (end cap) from the interaction
    /// point to the layer, in mm.
    pub closest_distance_to_ip: f64,
    /// Cumulative radiation lengths in front of the layer.
    pub n_radiation_lengths: f64,
    /// Cumulative interaction lengths in front of the layer.
    pub n_interaction_lengths: f64,
}

/// Read-only parameters of one sub-detector.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SubDetectorParameters {
    /// Inner cylindrical polar radius, in mm.
    pub inner_r: f64,
    /// Inner polygon phi0, in radians.
    pub inner_phi: f64,
    /// Order of the inner polygon symmetry; 0 or less than 3 means cylindrical.
    pub inner_symmetry: u32,
    /// Inner |z| coordinate, in mm.
    pub inner_z: f64,
    /// Outer cylindrical polar radius, in mm.
    pub outer_r: f64,
    /// Outer polygon phi0, in radians.
    pub outer_phi: f64,
    /// Order of the outer polygon symmetry.
    pub outer_symmetry: u32,
    /// Outer |z| coordinate, in mm.
    pub outer_z: f64,
    /// The sampling layers, ordered by increasing distance from the interaction point.
    pub layers: Vec<LayerParameters>,
}

impl SubDetectorParameters {
    /// Number of sampling layers.
    #[must_use]
    pub fn n_layers(&self) -> u32 {
        u32::try_from(self.layers.len()).expect("layer count overflow")
    }
}

/// Largest perpendicular distance from the z axis to any of the polygon faces at
/// `(x, y)`. For symmetry orders of two or less the plain cylindrical radius is
/// returned.
#[must_use]
pub fn maximum_radius(symmetry_order: u32, phi0: f64, x: f64, y: f64) -> f64 {
    if symmetry_order <= 2 {
        return x.hypot(y);
    }

    let mut max_radius = 0.0_f64;
    for i in 0..symmetry_order {
        let phi = phi0 + TAU * f64::from(i) / f64::from(symmetry_order);
        let radius = y.mul_add(phi.sin(), x * phi.cos());

        if radius > max_radius {
            max_radius = radius;
        }
    }

    max_radius
}

/// Predicate interface for dead-region gaps.
#[enum_dispatch]
pub trait GapRegion {
    /// Whether the position lies inside the gap, within `tolerance` mm.
    fn is_in_gap(&self, position: &CartesianVector, tolerance: f64) -> bool;
}

/// Rectangular box gap, spanned by three orthogonal side vectors from a vertex.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BoxGap {
    /// Corner of the box.
    pub vertex: CartesianVector,
    /// First side vector.
    pub side1: CartesianVector,
    /// Second side vector.
    pub side2: CartesianVector,
    /// Third side vector.
    pub side3: CartesianVector,
}

impl GapRegion for BoxGap {
    fn is_in_gap(&self, position: &CartesianVector, tolerance: f64) -> bool {
        let relative = *position - self.vertex;

        for side in [&self.side1, &self.side2, &self.side3] {
            let length = side.magnitude();

            if length == 0.0 {
                return false;
            }

            let projection = relative.dot(side) / length;

            if (projection < -tolerance) || (projection > length + tolerance) {
                return false;
            }
        }

        true
    }
}

/// Concentric polygonal annulus gap, e.g. the barrel/end-cap transition region.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ConcentricGap {
    /// Minimum z coordinate, in mm.
    pub min_z: f64,
    /// Maximum z coordinate, in mm.
    pub max_z: f64,
    /// Inner polygon radius, in mm.
    pub inner_r: f64,
    /// Inner polygon phi0, in radians.
    pub inner_phi: f64,
    /// Inner polygon symmetry order.
    pub inner_symmetry: u32,
    /// Outer polygon radius, in mm.
    pub outer_r: f64,
    /// Outer polygon phi0, in radians.
    pub outer_phi: f64,
    /// Outer polygon symmetry order.
    pub outer_symmetry: u32,
}

impl GapRegion for ConcentricGap {
    fn is_in_gap(&self, position: &CartesianVector, tolerance: f64) -> bool {
        if (position.z < self.min_z - tolerance) || (position.z > self.max_z + tolerance) {
            return false;
        }

        let inner = maximum_radius(self.inner_symmetry, self.inner_phi, position.x, position.y);
        let outer = maximum_radius(self.outer_symmetry, self.outer_phi, position.x, position.y);

        (inner > self.inner_r - tolerance) && (outer < self.outer_r + tolerance)
    }
}

/// Enum listing the supported detector-gap shapes.
#[enum_dispatch(GapRegion)]
#[derive(Clone, Debug, Deserialize, Serialize)]
pub enum GapEnum {
    /// Rectangular box gap.
    BoxGap,
    /// Concentric annulus gap.
    ConcentricGap,
}

/// Full geometry description handed to the engine by the calling harness.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct GeometryParameters {
    /// Main tracker inner radius, in mm.
    pub main_tracker_inner_r: f64,
    /// Main tracker outer radius, in mm.
    pub main_tracker_outer_r: f64,
    /// Main tracker half length in z, in mm.
    pub main_tracker_z_extent: f64,
    /// Coil inner radius, in mm.
    pub coil_inner_r: f64,
    /// Coil outer radius, in mm.
    pub coil_outer_r: f64,
    /// Coil half length in z, in mm.
    pub coil_z_extent: f64,
    /// ECAL barrel parameters.
    pub ecal_barrel: SubDetectorParameters,
    /// ECAL end-cap parameters.
    pub ecal_endcap: SubDetectorParameters,
    /// HCAL barrel parameters.
    pub hcal_barrel: SubDetectorParameters,
    /// HCAL end-cap parameters.
    pub hcal_endcap: SubDetectorParameters,
    /// Muon-yoke barrel parameters.
    pub muon_barrel: SubDetectorParameters,
    /// Muon-yoke end-cap parameters.
    pub muon_endcap: SubDetectorParameters,
    /// Dead-region gaps.
    pub gaps: Vec<GapEnum>,
    /// Tolerance applied to all gap queries, in mm.
    pub gap_tolerance: f64,
}

/// Strategy object assigning pseudo layers to positions. Initialised once from
/// geometry, immutable afterwards.
pub trait PseudoLayerCalculator: Send + Sync {
    /// One-time initialisation from the detector geometry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] when the geometry cannot support the
    /// calculator.
    fn initialize(&mut self, geometry: &GeometryParameters) -> Result<()>;

    /// The pseudo layer for a position.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotInitialized`] before [`Self::initialize`] ran.
    fn pseudo_layer(&self, position: &CartesianVector) -> Result<u32>;

    /// The pseudo layer assigned to the interaction point.
    fn pseudo_layer_at_ip(&self) -> u32 {
        0
    }
}

/// Strategy object looking up the magnetic field. Immutable after initialisation.
pub trait BFieldCalculator: Send + Sync {
    /// One-time initialisation from the detector geometry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] when the geometry cannot support the
    /// calculator.
    fn initialize(&mut self, geometry: &GeometryParameters) -> Result<()>;

    /// The magnetic field at a position, in Tesla. Positions beyond the coil see the
    /// (reversed) return field.
    fn bfield(&self, position: &CartesianVector) -> f64;
}

/// Default pseudo-layer calculator: layers follow the sampling-layer positions of the
/// barrel (radial) and end-cap (|z|) calorimeters; a position's layer is the deeper of
/// the two assignments, so the mapping stays monotone through the overlap region.
#[derive(Debug, Default)]
pub struct LayerPositionCalculator {
    barrel_positions: Vec<f64>,
    endcap_positions: Vec<f64>,
    barrel_symmetry: u32,
    barrel_phi: f64,
    initialized: bool,
}

impl LayerPositionCalculator {
    /// Create an uninitialised calculator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn find_layer(value: f64, positions: &[f64]) -> u32 {
        let n_below = positions.iter().take_while(|position| **position <= value).count();
        u32::try_from(n_below).expect("layer count overflow")
    }
}

impl PseudoLayerCalculator for LayerPositionCalculator {
    fn initialize(&mut self, geometry: &GeometryParameters) -> Result<()> {
        self.barrel_positions = geometry
            .ecal_barrel
            .layers
            .iter()
            .chain(&geometry.hcal_barrel.layers)
            .chain(&geometry.muon_barrel.layers)
            .map(|layer| layer.closest_distance_to_ip)
            .collect();
        self.endcap_positions = geometry
            .ecal_endcap
            .layers
            .iter()
            .chain(&geometry.hcal_endcap.layers)
            .chain(&geometry.muon_endcap.layers)
            .map(|layer| layer.closest_distance_to_ip)
            .collect();

        if self.barrel_positions.is_empty() && self.endcap_positions.is_empty() {
            return Err(Error::InvalidParameter(
                "geometry provides no sampling layers".to_owned(),
            ));
        }

        self.barrel_positions.sort_by(f64::total_cmp);
        self.endcap_positions.sort_by(f64::total_cmp);
        self.barrel_symmetry = geometry.ecal_barrel.inner_symmetry;
        self.barrel_phi = geometry.ecal_barrel.inner_phi;
        self.initialized = true;

        Ok(())
    }

    fn pseudo_layer(&self, position: &CartesianVector) -> Result<u32> {
        if !self.initialized {
            return Err(Error::NotInitialized("pseudo layer calculator"));
        }

        let radius = maximum_radius(self.barrel_symmetry, self.barrel_phi, position.x, position.y);
        let barrel_layer = Self::find_layer(radius, &self.barrel_positions);
        let endcap_layer = Self::find_layer(position.z.abs(), &self.endcap_positions);

        Ok(barrel_layer.max(endcap_layer))
    }
}

/// Default B-field calculator: a uniform solenoid value inside the coil and separate
/// values in the muon barrel and muon end cap.
#[derive(Debug)]
pub struct DefaultBFieldCalculator {
    /// Field inside the coil, in Tesla.
    pub inner_bfield: f64,
    /// Return field in the muon barrel, in Tesla.
    pub muon_barrel_bfield: f64,
    /// Return field in the muon end cap, in Tesla.
    pub muon_endcap_bfield: f64,
    coil_mid_r: f64,
    muon_endcap_inner_z: f64,
}

impl DefaultBFieldCalculator {
    /// Create a calculator with the given field values, in Tesla.
    #[must_use]
    pub const fn new(inner_bfield: f64, muon_barrel_bfield: f64, muon_endcap_bfield: f64) -> Self {
        Self {
            inner_bfield,
            muon_barrel_bfield,
            muon_endcap_bfield,
            coil_mid_r: f64::MAX,
            muon_endcap_inner_z: f64::MAX,
        }
    }
}

impl BFieldCalculator for DefaultBFieldCalculator {
    fn initialize(&mut self, geometry: &GeometryParameters) -> Result<()> {
        if geometry.coil_outer_r < geometry.coil_inner_r {
            return Err(Error::InvalidParameter(
                "coil outer radius smaller than inner radius".to_owned(),
            ));
        }

        self.coil_mid_r = 0.5 * (geometry.coil_inner_r + geometry.coil_outer_r);
        self.muon_endcap_inner_z = geometry.muon_endcap.inner_z;

        Ok(())
    }

    fn bfield(&self, position: &CartesianVector) -> f64 {
        if position.z.abs() >= self.muon_endcap_inner_z {
            return self.muon_endcap_bfield;
        }

        if position.perp() >= self.coil_mid_r {
            return self.muon_barrel_bfield;
        }

        self.inner_bfield
    }
}

/// The detector context threaded through all stages: geometry parameters plus the two
/// calculator strategies.
pub struct Detector {
    parameters: GeometryParameters,
    pseudo_layer_calculator: Box<dyn PseudoLayerCalculator>,
    bfield_calculator: Box<dyn BFieldCalculator>,
    initialized: bool,
}

impl Detector {
    /// Create a detector with the default calculator strategies. Call
    /// [`Self::initialize`] before use.
    #[must_use]
    pub fn new(parameters: GeometryParameters) -> Self {
        Self {
            parameters,
            pseudo_layer_calculator: Box::new(LayerPositionCalculator::new()),
            bfield_calculator: Box::new(DefaultBFieldCalculator::new(4.0, -1.5, 0.01)),
            initialized: false,
        }
    }

    /// Swap in a pseudo-layer calculator strategy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotAllowed`] once the detector is initialised.
    pub fn set_pseudo_layer_calculator(
        &mut self,
        calculator: Box<dyn PseudoLayerCalculator>,
    ) -> Result<()> {
        if self.initialized {
            return Err(Error::NotAllowed(
                "cannot swap pseudo layer calculator after initialisation",
            ));
        }

        self.pseudo_layer_calculator = calculator;
        Ok(())
    }

    /// Swap in a B-field calculator strategy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotAllowed`] once the detector is initialised.
    pub fn set_bfield_calculator(&mut self, calculator: Box<dyn BFieldCalculator>) -> Result<()> {
        if self.initialized {
            return Err(Error::NotAllowed(
                "cannot swap bfield calculator after initialisation",
            ));
        }

        self.bfield_calculator = calculator;
        Ok(())
    }

    /// One-time initialisation of the calculator strategies.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotAllowed`] on a second call, or any error surfaced by the
    /// calculators.
    pub fn initialize(&mut self) -> Result<()> {
        if self.initialized {
            return Err(Error::NotAllowed("detector already initialised"));
        }

        self.pseudo_layer_calculator.initialize(&self.parameters)?;
        self.bfield_calculator.initialize(&self.parameters)?;
        self.initialized = true;

        Ok(())
    }

    /// The pseudo layer for a position.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotInitialized`] before [`Self::initialize`] ran.
    pub fn pseudo_layer(&self, position: &CartesianVector) -> Result<u32> {
        if !self.initialized {
            return Err(Error::NotInitialized("detector"));
        }

        self.pseudo_layer_calculator.pseudo_layer(position)
    }

    /// The pseudo layer assigned to the interaction point.
    #[must_use]
    pub fn pseudo_layer_at_ip(&self) -> u32 {
        self.pseudo_layer_calculator.pseudo_layer_at_ip()
    }

    /// The magnetic field at a position, in Tesla.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotInitialized`] before [`Self::initialize`] ran.
    pub fn bfield(&self, position: &CartesianVector) -> Result<f64> {
        if !self.initialized {
            return Err(Error::NotInitialized("detector"));
        }

        Ok(self.bfield_calculator.bfield(position))
    }

    /// Whether the position lies in any registered dead-region gap.
    #[must_use]
    pub fn is_in_gap_region(&self, position: &CartesianVector) -> bool {
        self.parameters
            .gaps
            .iter()
            .any(|gap| gap.is_in_gap(position, self.parameters.gap_tolerance))
    }

    /// The full geometry parameters.
    #[must_use]
    pub const fn parameters(&self) -> &GeometryParameters {
        &self.parameters
    }

    /// ECAL barrel parameters.
    #[must_use]
    pub const fn ecal_barrel(&self) -> &SubDetectorParameters {
        &self.parameters.ecal_barrel
    }

    /// ECAL end-cap parameters.
    #[must_use]
    pub const fn ecal_endcap(&self) -> &SubDetectorParameters {
        &self.parameters.ecal_endcap
    }

    /// HCAL barrel parameters.
    #[must_use]
    pub const fn hcal_barrel(&self) -> &SubDetectorParameters {
        &self.parameters.hcal_barrel
    }

    /// HCAL end-cap parameters.
    #[must_use]
    pub const fn hcal_endcap(&self) -> &SubDetectorParameters {
        &self.parameters.hcal_endcap
    }

    /// Muon-yoke barrel parameters.
    #[must_use]
    pub const fn muon_barrel(&self) -> &SubDetectorParameters {
        &self.parameters.muon_barrel
    }

    /// Muon-yoke end-cap parameters.
    #[must_use]
    pub const fn muon_endcap(&self) -> &SubDetectorParameters {
        &self.parameters.muon_endcap
    }

    /// Mid radius of the coil, in mm.
    #[must_use]
    pub fn coil_mid_r(&self) -> f64 {
        0.5 * (self.parameters.coil_inner_r + self.parameters.coil_outer_r)
    }
}
