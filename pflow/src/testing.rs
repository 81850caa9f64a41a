//! Shared fixtures for the unit tests: a cylindrical toy detector and input payload
//! builders.

use super::geometry::{Detector, GeometryParameters, LayerParameters, SubDetectorParameters};
use super::hit::{CaloHitParameters, DetectorRegion, HitType};
use super::track::{TrackFlags, TrackParameters, TrackState};
use super::vector::CartesianVector;

/// Build a cylindrical sub-detector with equally spaced layers.
#[must_use]
pub fn sub_detector(inner: f64, spacing: f64, n_layers: usize) -> SubDetectorParameters {
    SubDetectorParameters {
        inner_r: inner,
        inner_phi: 0.0,
        inner_symmetry: 0,
        inner_z: inner,
        outer_r: spacing.mul_add(n_layers as f64, inner),
        outer_phi: 0.0,
        outer_symmetry: 0,
        outer_z: spacing.mul_add(n_layers as f64, inner),
        layers: (0..n_layers)
            .map(|i| LayerParameters {
                closest_distance_to_ip: spacing.mul_add(i as f64, inner),
                n_radiation_lengths: 0.8 * (i + 1) as f64,
                n_interaction_lengths: 0.1 * (i + 1) as f64,
            })
            .collect(),
    }
}

/// A barrel-centric cylindrical toy detector: ECAL at 1500 mm with 30 fine layers,
/// HCAL at 1700 mm with 40 coarse layers, muon yoke beyond the coil.
#[must_use]
pub fn toy_detector() -> Detector {
    let mut detector = Detector::new(GeometryParameters {
        main_tracker_inner_r: 300.0,
        main_tracker_outer_r: 1400.0,
        main_tracker_z_extent: 2000.0,
        coil_inner_r: 2500.0,
        coil_outer_r: 3000.0,
        coil_z_extent: 3000.0,
        ecal_barrel: sub_detector(1500.0, 5.0, 30),
        ecal_endcap: sub_detector(2300.0, 5.0, 30),
        hcal_barrel: sub_detector(1700.0, 25.0, 40),
        hcal_endcap: sub_detector(2500.0, 25.0, 40),
        muon_barrel: sub_detector(3100.0, 50.0, 10),
        muon_endcap: sub_detector(3500.0, 50.0, 10),
        gaps: Vec::new(),
        gap_tolerance: 0.0,
    });
    detector.initialize().expect("toy detector initialises");
    detector
}

/// An ECAL hit payload at the given position carrying equal electromagnetic and
/// input energy.
#[must_use]
pub fn ecal_hit(position: CartesianVector, energy: f64) -> CaloHitParameters {
    let direction = position.unit_vector().unwrap_or(CartesianVector::new(1.0, 0.0, 0.0));

    CaloHitParameters {
        position,
        expected_direction: direction,
        cell_normal: direction,
        cell_size_transverse: 10.0,
        cell_size_longitudinal: 25.0,
        n_radiation_lengths: 0.8,
        n_interaction_lengths: 0.1,
        input_energy: energy,
        electromagnetic_energy: energy,
        hadronic_energy: energy,
        density_weight: energy,
        is_possible_mip: false,
        is_isolated: false,
        hit_type: HitType::Ecal,
        region: DetectorRegion::Barrel,
        parent_address: 0,
    }
}

/// A charged-pion track payload with the given momentum at the calorimeter face,
/// flagged as reaching the calorimeter and fit well enough to form a PFO.
#[must_use]
pub fn pion_track(calorimeter_position: CartesianVector, momentum: CartesianVector) -> TrackParameters {
    let state = TrackState { position: calorimeter_position, momentum };
    let mass = 0.13957018_f64;
    let energy = momentum.magnitude_squared().sqrt().hypot(mass);

    TrackParameters {
        energy_at_dca: energy,
        momentum_at_dca: momentum,
        charge: 1,
        mass,
        particle_id: 211,
        start_state: TrackState {
            position: CartesianVector::new(0.0, 0.0, 0.0),
            momentum,
        },
        end_state: state,
        calorimeter_state: state,
        flags: TrackFlags::REACHES_CALORIMETER | TrackFlags::CAN_FORM_PFO,
        uid: 0,
    }
}
