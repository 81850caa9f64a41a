//! Fast, shower-shape-based particle identification: the longitudinal profile
//! comparison against the electromagnetic expectation, the photon tag derived from
//! it, and the mip/muon signatures.

use super::arena::Arena;
use super::cluster::{Cluster, ClusterId, ShowerProfile};
use super::error::Result;
use super::hit::CaloHit;
use super::store::EventStore;

/// Bin width, in radiation lengths, of the longitudinal profile histogram.
const PROFILE_BIN_WIDTH: f64 = 0.5;
/// Number of profile bins; showers beyond this depth contribute to the last bin.
const PROFILE_N_BINS: usize = 100;
/// Largest profile shift probed when locating the shower start, in bins.
const PROFILE_MAX_SHIFT_BINS: usize = 20;
/// Critical energy steering the expected-profile shape, in GeV.
const PROFILE_CRITICAL_ENERGY: f64 = 0.01;
/// Longitudinal decay parameter of the expected profile.
const PROFILE_PARAMETER_B: f64 = 0.5;

/// Options of the fast photon tag.
#[derive(Clone, Debug)]
pub struct PhotonIdSettings {
    /// Minimum number of calo hits.
    pub min_calo_hits: usize,
    /// Maximum inner pseudo layer.
    pub max_inner_layer: u32,
    /// Minimum electromagnetic energy, in GeV.
    pub min_electromagnetic_energy: f64,
    /// Maximum mip fraction.
    pub max_mip_fraction: f64,
    /// Minimum radial direction cosine of the fit to all hits.
    pub min_radial_direction_cosine: f64,
    /// Maximum shower-profile start, in radiation lengths.
    pub max_profile_start: f64,
    /// Maximum shower-profile discrepancy.
    pub max_profile_discrepancy: f64,
}

impl Default for PhotonIdSettings {
    fn default() -> Self {
        Self {
            min_calo_hits: 5,
            max_inner_layer: 10,
            min_electromagnetic_energy: 0.2,
            max_mip_fraction: 0.7,
            min_radial_direction_cosine: 0.9,
            max_profile_start: 5.0,
            max_profile_discrepancy: 0.8,
        }
    }
}

// Lanczos approximation, g = 7, n = 9
fn ln_gamma(x: f64) -> f64 {
    const COEFFICIENTS: [f64; 9] = [
        0.99999999999980993,
        676.5203681218851,
        -1259.1392167224028,
        771.32342877765313,
        -176.61502916214059,
        12.507343278686905,
        -0.13857109526572012,
        9.9843695780195716e-6,
        1.5056327351493116e-7,
    ];

    if x < 0.5 {
        // reflection formula
        return std::f64::consts::PI.ln()
            - (std::f64::consts::PI * x).sin().ln()
            - ln_gamma(1.0 - x);
    }

    let x = x - 1.0;
    let mut sum = COEFFICIENTS[0];
    for (i, coefficient) in COEFFICIENTS.iter().enumerate().skip(1) {
        sum += coefficient / (x + i as f64);
    }

    let t = x + 7.5;
    0.5f64.mul_add(
        (2.0 * std::f64::consts::PI).ln(),
        (x + 0.5).mul_add(t.ln(), -t) + sum.ln(),
    )
}

/// Expected electromagnetic longitudinal profile, integrated per bin and normalised
/// to `energy`.
fn expected_profile(energy: f64) -> Vec<f64> {
    let a = PROFILE_PARAMETER_B
        .mul_add((energy / PROFILE_CRITICAL_ENERGY).ln() - 0.5, 1.0)
        .max(1.01);
    let ln_gamma_a = ln_gamma(a);

    (0..PROFILE_N_BINS)
        .map(|bin| {
            let t = PROFILE_BIN_WIDTH.mul_add(bin as f64, 0.5 * PROFILE_BIN_WIDTH);
            let bt = PROFILE_PARAMETER_B * t;
            // dE/dt evaluated at the bin centre, times the bin width
            let density = (a - 1.0).mul_add(bt.ln(), -bt) - ln_gamma_a;
            energy * PROFILE_PARAMETER_B * density.exp() * PROFILE_BIN_WIDTH
        })
        .collect()
}

/// Compare the cluster's longitudinal energy profile to the electromagnetic
/// expectation: the returned start is the depth shift minimising the absolute
/// difference, the discrepancy that minimum normalised to the cluster energy.
///
/// # Errors
///
/// Returns an error only for inconsistent cluster state.
pub fn shower_profile(hits: &Arena<CaloHit>, cluster: &Cluster) -> Result<ShowerProfile> {
    let mut observed = vec![0.0_f64; PROFILE_N_BINS];
    let mut total_energy = 0.0;

    for (_, id) in cluster.ordered_hits().hits() {
        let hit = hits.get(id)?;
        let energy = hit.electromagnetic_energy();

        if energy <= 0.0 {
            continue;
        }

        let bin = ((hit.n_radiation_lengths() / PROFILE_BIN_WIDTH) as usize)
            .min(PROFILE_N_BINS - 1);
        observed[bin] += energy;
        total_energy += energy;
    }

    if total_energy <= 0.0 {
        return Ok(ShowerProfile {
            start: f64::from(u16::MAX),
            discrepancy: 1.0,
        });
    }

    let expected = expected_profile(total_energy);
    let mut best_shift = 0usize;
    let mut best_discrepancy = f64::MAX;

    for shift in 0..=PROFILE_MAX_SHIFT_BINS {
        let mut difference = 0.0;

        for (bin, observed_energy) in observed.iter().enumerate() {
            let expected_energy = if bin >= shift { expected[bin - shift] } else { 0.0 };
            difference += (observed_energy - expected_energy).abs();
        }

        let discrepancy = difference / total_energy;

        if discrepancy < best_discrepancy {
            best_discrepancy = discrepancy;
            best_shift = shift;
        }
    }

    Ok(ShowerProfile {
        start: best_shift as f64 * PROFILE_BIN_WIDTH,
        discrepancy: best_discrepancy,
    })
}

/// Fast photon tag from shower shapes. Clusters with track associations never
/// qualify.
///
/// # Errors
///
/// Propagates unknown ids and inconsistent cluster state.
pub fn is_photon(
    store: &mut EventStore,
    id: ClusterId,
    settings: &PhotonIdSettings,
) -> Result<bool> {
    let cluster = store.cluster(id)?;

    if !cluster.associated_tracks().is_empty() {
        return Ok(false);
    }

    if cluster.n_calo_hits() < settings.min_calo_hits {
        return Ok(false);
    }

    if cluster.inner_layer().is_none_or(|layer| layer > settings.max_inner_layer) {
        return Ok(false);
    }

    if cluster.electromagnetic_energy() < settings.min_electromagnetic_energy {
        return Ok(false);
    }

    if cluster.mip_fraction() > settings.max_mip_fraction {
        return Ok(false);
    }

    let fit = store.fit_to_all_hits(id)?;

    if !fit.is_successful()
        || (fit.radial_direction_cosine()? < settings.min_radial_direction_cosine)
    {
        return Ok(false);
    }

    let profile = store.shower_profile(id)?;

    Ok((profile.start <= settings.max_profile_start)
        && (profile.discrepancy <= settings.max_profile_discrepancy))
}

/// Fast muon tag: a long, narrow, mip-like cluster with little energy.
///
/// # Errors
///
/// Propagates unknown ids.
pub fn is_muon_fast(store: &EventStore, id: ClusterId) -> Result<bool> {
    let cluster = store.cluster(id)?;

    Ok((cluster.mip_fraction() > 0.7)
        && (cluster.n_calo_hits() >= 5)
        && (cluster.layer_span() >= 5)
        && (cluster.electromagnetic_energy() < 2.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ClusterSeed, EventStore};
    use crate::testing;
    use crate::vector::CartesianVector;
    use float_cmp::assert_approx_eq;

    #[test]
    fn ln_gamma_matches_known_values() {
        // gamma(1) = 1, gamma(5) = 24
        assert_approx_eq!(f64, ln_gamma(1.0), 0.0, epsilon = 1e-10);
        assert_approx_eq!(f64, ln_gamma(5.0), 24.0_f64.ln(), epsilon = 1e-10);
    }

    #[test]
    fn expected_profile_carries_the_full_energy() {
        let total: f64 = expected_profile(10.0).iter().sum();
        assert_approx_eq!(f64, total, 10.0, epsilon = 0.1);
    }

    #[test]
    fn em_like_deposit_is_tagged_as_photon() {
        let detector = testing::toy_detector();
        let mut store = EventStore::new();

        // deposit energies along x following the electromagnetic expectation, one
        // pair of hits per profile bin
        let energy = 10.0;
        let expected = expected_profile(energy);
        let mut hit_ids = Vec::new();

        for (bin, bin_energy) in expected.iter().enumerate().take(30) {
            if *bin_energy < 1e-4 {
                continue;
            }

            let depth = PROFILE_BIN_WIDTH.mul_add(bin as f64, 0.5 * PROFILE_BIN_WIDTH);
            let radius = 2.5_f64.mul_add(bin as f64, 1500.0);

            for transverse in [-5.0, 5.0] {
                let mut parameters = testing::ecal_hit(
                    CartesianVector::new(radius, transverse, 0.0),
                    0.5 * bin_energy,
                );
                parameters.n_radiation_lengths = depth;
                hit_ids.push(store.create_calo_hit(parameters, &detector, None).unwrap());
            }
        }

        store.create_cluster_list("Clusters").unwrap();
        store.replace_current_cluster_list("Clusters").unwrap();
        let cluster = store.create_cluster(ClusterSeed::Hits(hit_ids)).unwrap();

        let profile = store.shower_profile(cluster).unwrap();
        assert!(profile.discrepancy < 0.8, "discrepancy {}", profile.discrepancy);
        assert!(profile.start < 5.0, "start {}", profile.start);

        assert!(is_photon(&mut store, cluster, &PhotonIdSettings::default()).unwrap());
    }

    #[test]
    fn low_em_energy_blob_is_not_a_photon() {
        let detector = testing::toy_detector();
        let mut store = EventStore::new();

        let mut hit_ids = Vec::new();
        for layer in 3..5_u32 {
            for transverse in [-10.0, 0.0, 10.0] {
                let radius = 5.0_f64.mul_add(f64::from(layer), 1500.0);
                let mut parameters =
                    testing::ecal_hit(CartesianVector::new(radius, transverse, 0.0), 0.01);
                parameters.hadronic_energy = 0.05;
                hit_ids.push(store.create_calo_hit(parameters, &detector, None).unwrap());
            }
        }

        store.create_cluster_list("Clusters").unwrap();
        store.replace_current_cluster_list("Clusters").unwrap();
        let cluster = store.create_cluster(ClusterSeed::Hits(hit_ids)).unwrap();

        assert!(!is_photon(&mut store, cluster, &PhotonIdSettings::default()).unwrap());
    }
}
