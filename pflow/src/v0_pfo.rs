//! V0 handling: a neutral particle decaying to two opposite-charge sibling tracks
//! with no parents. PFOs whose track pair falls into one of the invariant-mass
//! windows are relabelled as the decaying neutral.

use super::algorithm::{Algorithm, EventContext, StageBuilder};
use super::config::Config;
use super::error::Result;
use super::pids;
use super::vector::CartesianVector;

/// Invariant mass of two decay products from their momenta at the track starts.
#[must_use]
pub fn v0_mass(
    momentum1: &CartesianVector,
    momentum2: &CartesianVector,
    mass1: f64,
    mass2: f64,
) -> f64 {
    let energy1 = mass1.mul_add(mass1, momentum1.magnitude_squared()).sqrt();
    let energy2 = mass2.mul_add(mass2, momentum2.magnitude_squared()).sqrt();

    let total_energy = energy1 + energy2;
    let total_momentum = *momentum1 + *momentum2;

    total_energy
        .mul_add(total_energy, -total_momentum.magnitude_squared())
        .max(0.0)
        .sqrt()
}

/// The V0 PFO stage.
pub struct V0PfoCreationAlgorithm {
    lower_cut_k_short: f64,
    upper_cut_k_short: f64,
    lower_cut_lambda: f64,
    upper_cut_lambda: f64,
    max_conversion_mass: f64,
}

impl Default for V0PfoCreationAlgorithm {
    fn default() -> Self {
        Self {
            lower_cut_k_short: 0.45,
            upper_cut_k_short: 0.55,
            lower_cut_lambda: 1.09,
            upper_cut_lambda: 1.14,
            max_conversion_mass: 0.05,
        }
    }
}

impl Algorithm for V0PfoCreationAlgorithm {
    fn read_settings(&mut self, config: &Config, _: &mut StageBuilder<'_>) -> Result<()> {
        self.lower_cut_k_short = config.read_or("LowerCutOnKShortMass", self.lower_cut_k_short)?;
        self.upper_cut_k_short = config.read_or("UpperCutOnKShortMass", self.upper_cut_k_short)?;
        self.lower_cut_lambda = config.read_or("LowerCutOnLambdaMass", self.lower_cut_lambda)?;
        self.upper_cut_lambda = config.read_or("UpperCutOnLambdaMass", self.upper_cut_lambda)?;
        self.max_conversion_mass =
            config.read_or("MaxConversionMass", self.max_conversion_mass)?;
        Ok(())
    }

    fn run(&mut self, context: &mut EventContext<'_>) -> Result<()> {
        for pfo_id in context.store.current_pfo_ids()? {
            let tracks = context.store.pfo(pfo_id)?.tracks().to_vec();

            if tracks.len() != 2 {
                continue;
            }

            let first = context.store.track(tracks[0])?;
            let second = context.store.track(tracks[1])?;

            // two opposite-charge parentless siblings
            if !first.siblings().contains(&tracks[1])
                || !first.parents().is_empty()
                || !second.parents().is_empty()
                || (first.charge() * second.charge() >= 0)
            {
                continue;
            }

            let momentum1 = first.start_state().momentum;
            let momentum2 = second.start_state().momentum;
            let total_energy = first.energy_at_dca() + second.energy_at_dca();
            let total_momentum = momentum1 + momentum2;

            let pion_mass = pids::particle_mass(pids::PI_MINUS).unwrap_or(0.0);
            let proton_mass = pids::particle_mass(pids::PROTON).unwrap_or(0.0);
            let electron_mass = pids::particle_mass(pids::E_MINUS).unwrap_or(0.0);

            let pi_pi_mass = v0_mass(&momentum1, &momentum2, pion_mass, pion_mass);

            // the proton hypothesis goes to the higher-momentum leg
            let (p_momentum, pi_momentum) =
                if momentum1.magnitude_squared() >= momentum2.magnitude_squared() {
                    (momentum1, momentum2)
                } else {
                    (momentum2, momentum1)
                };
            let p_pi_mass = v0_mass(&p_momentum, &pi_momentum, proton_mass, pion_mass);
            let e_e_mass = v0_mass(&momentum1, &momentum2, electron_mass, electron_mass);

            let new_particle_id = if (pi_pi_mass > self.lower_cut_k_short)
                && (pi_pi_mass < self.upper_cut_k_short)
            {
                Some(pids::K_SHORT)
            } else if (p_pi_mass > self.lower_cut_lambda) && (p_pi_mass < self.upper_cut_lambda) {
                Some(pids::LAMBDA)
            } else if e_e_mass < self.max_conversion_mass {
                Some(pids::PHOTON)
            } else {
                None
            };

            if let Some(particle_id) = new_particle_id {
                log::debug!(
                    "v0 pfo {pfo_id:?}: mass(pi pi) = {pi_pi_mass:.4}, id -> {particle_id}"
                );

                let pfo = context.store.pfo_mut(pfo_id)?;
                pfo.set_particle_id(particle_id);
                pfo.set_mass(pids::particle_mass(particle_id).unwrap_or(0.0));
                pfo.set_charge(0);
                pfo.set_energy(total_energy);
                pfo.set_momentum(total_momentum);
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
    fn k_short_mass_is_reconstructed() {
        // symmetric pi+ pi- pair tuned to the K0s mass
        let momentum1 = CartesianVector::new(1.0, 0.20596, 0.0);
        let momentum2 = CartesianVector::new(1.0, -0.20596, 0.0);
        let pion_mass = pids::particle_mass(pids::PI_MINUS).unwrap();

        let mass = v0_mass(&momentum1, &momentum2, pion_mass, pion_mass);
        assert_approx_eq!(f64, mass, 0.4976, epsilon = 2e-3);
    }

    #[test]
    fn mass_of_parallel_massless_legs_vanishes() {
        let momentum = CartesianVector::new(1.0, 0.0, 0.0);
        assert_approx_eq!(f64, v0_mass(&momentum, &momentum, 0.0, 0.0), 0.0, epsilon = 1e-9);
    }
}
