//! Kink handling: a parent track decaying to a single charged daughter plus a
//! neutral. When the reconstructed decay mass falls inside one of the configured
//! windows, the PFO id and kinematics are set from the parent hypothesis.

use super::algorithm::{Algorithm, EventContext, StageBuilder};
use super::config::Config;
use super::error::Result;
use super::particle_id;
use super::pids;
use super::vector::CartesianVector;

/// Invariant mass of a two-body decay `parent -> daughter + neutral`, reconstructed
/// from the parent momentum at its end point and the daughter momentum at its start
/// point.
#[must_use]
pub fn kink_mass(
    parent_momentum: &CartesianVector,
    daughter_momentum: &CartesianVector,
    daughter_mass: f64,
    neutral_mass: f64,
) -> f64 {
    let daughter_energy = daughter_mass
        .mul_add(daughter_mass, daughter_momentum.magnitude_squared())
        .sqrt();

    let neutral_momentum = *parent_momentum - *daughter_momentum;
    let neutral_energy = neutral_mass
        .mul_add(neutral_mass, neutral_momentum.magnitude_squared())
        .sqrt();

    let total_energy = daughter_energy + neutral_energy;
    total_energy
        .mul_add(total_energy, -parent_momentum.magnitude_squared())
        .max(0.0)
        .sqrt()
}

/// The kink PFO stage.
pub struct KinkPfoCreationAlgorithm {
    find_decays_with_neutrinos: bool,
    find_decays_with_neutrons: bool,
    lower_cut_pi_to_mu_nu: f64,
    upper_cut_pi_to_mu_nu: f64,
    lower_cut_k_to_mu_nu: f64,
    upper_cut_k_to_mu_nu: f64,
    lower_cut_sigma_to_n_pi: f64,
    upper_cut_sigma_to_n_pi: f64,
}

impl Default for KinkPfoCreationAlgorithm {
    fn default() -> Self {
        Self {
            find_decays_with_neutrinos: true,
            find_decays_with_neutrons: false,
            lower_cut_pi_to_mu_nu: 0.1,
            upper_cut_pi_to_mu_nu: 0.16,
            lower_cut_k_to_mu_nu: 0.45,
            upper_cut_k_to_mu_nu: 0.55,
            lower_cut_sigma_to_n_pi: 1.15,
            upper_cut_sigma_to_n_pi: 1.25,
        }
    }
}

impl Algorithm for KinkPfoCreationAlgorithm {
    fn read_settings(&mut self, config: &Config, _: &mut StageBuilder<'_>) -> Result<()> {
        self.find_decays_with_neutrinos =
            config.read_or("FindDecaysWithNeutrinos", self.find_decays_with_neutrinos)?;
        self.find_decays_with_neutrons =
            config.read_or("FindDecaysWithNeutrons", self.find_decays_with_neutrons)?;
        self.lower_cut_pi_to_mu_nu =
            config.read_or("LowerCutOnPiToMuNuMass", self.lower_cut_pi_to_mu_nu)?;
        self.upper_cut_pi_to_mu_nu =
            config.read_or("UpperCutOnPiToMuNuMass", self.upper_cut_pi_to_mu_nu)?;
        self.lower_cut_k_to_mu_nu =
            config.read_or("LowerCutOnKToMuNuMass", self.lower_cut_k_to_mu_nu)?;
        self.upper_cut_k_to_mu_nu =
            config.read_or("UpperCutOnKToMuNuMass", self.upper_cut_k_to_mu_nu)?;
        self.lower_cut_sigma_to_n_pi =
            config.read_or("LowerCutOnSigmaToNPiMass", self.lower_cut_sigma_to_n_pi)?;
        self.upper_cut_sigma_to_n_pi =
            config.read_or("UpperCutOnSigmaToNPiMass", self.upper_cut_sigma_to_n_pi)?;
        Ok(())
    }

    fn run(&mut self, context: &mut EventContext<'_>) -> Result<()> {
        for pfo_id in context.store.current_pfo_ids()? {
            // a kink topology: exactly one parent track with a single daughter track
            // and no parents or siblings of its own
            let tracks = context.store.pfo(pfo_id)?.tracks().to_vec();

            let Some(parent_id) = tracks
                .iter()
                .copied()
                .find(|id| {
                    context.store.track(*id).is_ok_and(|track| {
                        (track.daughters().len() == 1)
                            && track.parents().is_empty()
                            && track.siblings().is_empty()
                    })
                })
            else {
                continue;
            };

            let parent = context.store.track(parent_id)?;
            let daughter_id = parent.daughters()[0];
            let parent_momentum_at_end = parent.end_state().momentum;
            let parent_energy = parent.energy_at_dca();
            let parent_charge = parent.charge();

            let daughter_momentum_at_start =
                context.store.track(daughter_id)?.start_state().momentum;

            // when the daughter left a cluster, it must look muon-like for the
            // decay-with-neutrino hypotheses to apply
            let daughter_cluster = context.store.track(daughter_id)?.associated_cluster();
            let daughter_is_muon_like = match daughter_cluster {
                Some(cluster_id) => particle_id::is_muon_fast(context.store, cluster_id)?,
                None => true,
            };

            let muon_mass = pids::particle_mass(pids::MU_MINUS).unwrap_or(0.0);
            let pion_mass = pids::particle_mass(pids::PI_MINUS).unwrap_or(0.0);
            let neutron_mass = pids::particle_mass(pids::NEUTRON).unwrap_or(0.0);

            let mu_nu_mass =
                kink_mass(&parent_momentum_at_end, &daughter_momentum_at_start, muon_mass, 0.0);
            let n_pi_mass = kink_mass(
                &parent_momentum_at_end,
                &daughter_momentum_at_start,
                pion_mass,
                neutron_mass,
            );

            let mut new_particle_id = None;

            if self.find_decays_with_neutrinos && daughter_is_muon_like {
                if (mu_nu_mass > self.lower_cut_pi_to_mu_nu)
                    && (mu_nu_mass < self.upper_cut_pi_to_mu_nu)
                {
                    new_particle_id =
                        Some(if parent_charge > 0 { pids::PI_PLUS } else { pids::PI_MINUS });
                } else if (mu_nu_mass > self.lower_cut_k_to_mu_nu)
                    && (mu_nu_mass < self.upper_cut_k_to_mu_nu)
                {
                    new_particle_id =
                        Some(if parent_charge > 0 { pids::K_PLUS } else { pids::K_MINUS });
                }
            }

            if new_particle_id.is_none()
                && self.find_decays_with_neutrons
                && (n_pi_mass > self.lower_cut_sigma_to_n_pi)
                && (n_pi_mass < self.upper_cut_sigma_to_n_pi)
            {
                new_particle_id = Some(if parent_charge > 0 {
                    pids::SIGMA_PLUS
                } else {
                    pids::SIGMA_MINUS
                });
            }

            if let Some(particle_id) = new_particle_id {
                log::debug!(
                    "kink pfo {pfo_id:?}: mass(mu nu) = {mu_nu_mass:.4}, id -> {particle_id}"
                );

                let pfo = context.store.pfo_mut(pfo_id)?;
                pfo.set_particle_id(particle_id);
                pfo.set_mass(pids::particle_mass(particle_id).unwrap_or(0.0));
                pfo.set_charge(parent_charge);
                pfo.set_energy(parent_energy);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;

    #[test]
    fn pion_decay_kinematics_reconstruct_the_pion_mass() {
        // pi -> mu nu with the neutrino collinear: parent 2 GeV along x, neutrino
        // takes 0.3 GeV
        let parent = CartesianVector::new(2.0, 0.0, 0.0);
        let daughter = CartesianVector::new(1.7, 0.0, 0.0);
        let muon_mass = pids::particle_mass(pids::MU_MINUS).unwrap();

        let mass = kink_mass(&parent, &daughter, muon_mass, 0.0);
        assert!(mass > 0.1 && mass < 0.16, "mass {mass}");
    }

    #[test]
    fn zero_neutral_momentum_returns_daughter_mass() {
        let momentum = CartesianVector::new(1.0, 0.0, 0.0);
        let mass = kink_mass(&momentum, &momentum, 0.105658, 0.0);
        assert_approx_eq!(f64, mass, 0.105658, epsilon = 1e-6);
    }
}
