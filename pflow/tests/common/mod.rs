//! Shared scaffolding for the end-to-end tests: a cylindrical toy detector and
//! generators for electromagnetic and hadronic test showers.

#![allow(dead_code)]

use pflow::geometry::{Detector, GeometryParameters, LayerParameters, SubDetectorParameters};
use pflow::hit::{CaloHitParameters, DetectorRegion, HitType};
use pflow::track::{TrackFlags, TrackParameters, TrackState};
use pflow::vector::CartesianVector;

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

/// A barrel-centric toy detector: fine ECAL at 1500 mm, coarse HCAL at 1700 mm,
/// muon yoke beyond the coil.
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

/// An ECAL hit payload at the given position.
#[must_use]
pub fn ecal_hit(position: CartesianVector, energy: f64, parent_address: u64) -> CaloHitParameters {
    let direction = position
        .unit_vector()
        .unwrap_or(CartesianVector::new(1.0, 0.0, 0.0));

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
        parent_address,
    }
}

/// A charged track payload with the given momentum at the calorimeter face.
#[must_use]
pub fn charged_track(
    calorimeter_position: CartesianVector,
    momentum: CartesianVector,
    charge: i32,
    particle_id: i32,
    uid: u64,
) -> TrackParameters {
    let mass = 0.13957018_f64;
    let energy = momentum.magnitude().hypot(mass);
    let state = TrackState {
        position: calorimeter_position,
        momentum,
    };

    TrackParameters {
        energy_at_dca: energy,
        momentum_at_dca: momentum,
        charge,
        mass,
        particle_id,
        start_state: TrackState {
            position: CartesianVector::new(0.0, 0.0, 0.0),
            momentum,
        },
        end_state: state,
        calorimeter_state: state,
        flags: TrackFlags::REACHES_CALORIMETER | TrackFlags::CAN_FORM_PFO,
        uid,
    }
}

/// The expected electromagnetic longitudinal profile: per-bin energies of width
/// half a radiation length, matching the shape the photon id compares against.
#[must_use]
pub fn em_profile_bins(energy: f64, n_bins: usize) -> Vec<f64> {
    let b = 0.5_f64;
    let a = b.mul_add((energy / 0.01).ln() - 0.5, 1.0);

    // ln Gamma(a) via the Stirling series, adequate for a in the few-unit range
    let ln_gamma = (a - 0.5).mul_add(a.ln(), -a)
        + 0.5 * (2.0 * std::f64::consts::PI).ln()
        + 1.0 / (12.0 * a);

    (0..n_bins)
        .map(|bin| {
            let t = 0.5_f64.mul_add(bin as f64, 0.25);
            let bt = b * t;
            let density = (a - 1.0).mul_add(bt.ln(), -bt) - ln_gamma;
            energy * b * density.exp() * 0.5
        })
        .collect()
}

/// Hits of an electromagnetic shower along the azimuth `phi`, carrying `energy` GeV
/// in total and profiled like a photon. Parent addresses start at `address_base`.
#[must_use]
pub fn em_shower_hits(phi: f64, energy: f64, address_base: u64) -> Vec<CaloHitParameters> {
    let mut hits = Vec::new();
    let bins = em_profile_bins(energy, 48);
    let tangent = CartesianVector::new(-phi.sin(), phi.cos(), 0.0);

    for (bin, bin_energy) in bins.iter().enumerate() {
        if *bin_energy < 1e-4 {
            continue;
        }

        let depth = 0.5_f64.mul_add(bin as f64, 0.25);
        let radius = 2.5_f64.mul_add(bin as f64, 1500.0);
        let centre = CartesianVector::new(radius * phi.cos(), radius * phi.sin(), 0.0);

        for (i, offset) in [-4.0, 4.0].into_iter().enumerate() {
            let mut parameters = ecal_hit(
                centre + tangent * offset,
                0.5 * bin_energy,
                address_base + 2 * bin as u64 + i as u64,
            );
            parameters.n_radiation_lengths = depth;
            hits.push(parameters);
        }
    }

    hits
}

/// Hits of a hadron-like shower along the x axis: `n_layers` layers with two hits
/// each, `energy` GeV in total.
#[must_use]
pub fn hadron_shower_hits(n_layers: u32, energy: f64, address_base: u64) -> Vec<CaloHitParameters> {
    let energy_per_hit = energy / f64::from(2 * n_layers);
    let mut hits = Vec::new();

    for layer in 0..n_layers {
        let radius = 5.0_f64.mul_add(f64::from(layer), 1500.0);

        for (i, offset) in [-4.0, 4.0].into_iter().enumerate() {
            hits.push(ecal_hit(
                CartesianVector::new(radius, offset, 0.0),
                energy_per_hit,
                address_base + 2 * u64::from(layer) + i as u64,
            ));
        }
    }

    hits
}
