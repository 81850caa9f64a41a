//! PDG Monte Carlo particle codes and masses used during PFO construction.

/// Photon.
pub const PHOTON: i32 = 22;
/// Electron.
pub const E_MINUS: i32 = 11;
/// Positron.
pub const E_PLUS: i32 = -11;
/// Muon.
pub const MU_MINUS: i32 = 13;
/// Anti-muon.
pub const MU_PLUS: i32 = -13;
/// Neutral pion.
pub const PI_ZERO: i32 = 111;
/// Positively charged pion.
pub const PI_PLUS: i32 = 211;
/// Negatively charged pion.
pub const PI_MINUS: i32 = -211;
/// Short-lived neutral kaon.
pub const K_SHORT: i32 = 310;
/// Long-lived neutral kaon.
pub const K_LONG: i32 = 130;
/// Positively charged kaon.
pub const K_PLUS: i32 = 321;
/// Negatively charged kaon.
pub const K_MINUS: i32 = -321;
/// Neutron.
pub const NEUTRON: i32 = 2112;
/// Proton.
pub const PROTON: i32 = 2212;
/// Lambda baryon.
pub const LAMBDA: i32 = 3122;
/// Positively charged sigma baryon.
pub const SIGMA_PLUS: i32 = 3222;
/// Negatively charged sigma baryon.
pub const SIGMA_MINUS: i32 = 3112;

/// Return the mass, in GeV, for a supported particle code; the sign of the code is
/// ignored.
#[must_use]
pub fn particle_mass(pdg_code: i32) -> Option<f64> {
    match pdg_code.abs() {
        PHOTON => Some(0.0),
        E_MINUS => Some(0.00051099891),
        MU_MINUS => Some(0.105658367),
        PI_ZERO => Some(0.1349766),
        PI_PLUS => Some(0.13957018),
        K_SHORT | K_LONG => Some(0.497614),
        K_PLUS => Some(0.493677),
        NEUTRON => Some(0.9395654),
        PROTON => Some(0.93827203),
        LAMBDA => Some(1.115683),
        SIGMA_PLUS => Some(1.18937),
        SIGMA_MINUS => Some(1.197449),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;

    #[test]
    fn masses_ignore_charge_sign() {
        assert_approx_eq!(
            f64,
            particle_mass(PI_PLUS).unwrap(),
            particle_mass(PI_MINUS).unwrap()
        );
        assert_approx_eq!(f64, particle_mass(PHOTON).unwrap(), 0.0);
    }

    #[test]
    fn unsupported_code_has_no_mass() {
        assert!(particle_mass(12).is_none());
    }
}
