//! Monte-Carlo truth particles. The truth graph is a pure observer: every stage must
//! function identically when no MC information is attached to the event.

use super::hit::McId;
use super::vector::CartesianVector;
use serde::{Deserialize, Serialize};

/// Input payload describing one MC particle.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct McParticleParameters {
    /// Particle energy, in GeV.
    pub energy: f64,
    /// Particle momentum at production, in GeV.
    pub momentum: CartesianVector,
    /// Radius at which the particle was produced, in mm.
    pub inner_radius: f64,
    /// Radius at which the particle decayed or left the detector, in mm.
    pub outer_radius: f64,
    /// PDG particle code.
    pub particle_id: i32,
    /// Opaque id of the particle in the caller's event model.
    pub uid: u64,
}

/// One node of the event-global truth DAG.
#[derive(Clone, Debug)]
pub struct McParticle {
    parameters: McParticleParameters,
    parents: Vec<McId>,
    daughters: Vec<McId>,
}

impl McParticle {
    pub(crate) fn new(parameters: McParticleParameters) -> Self {
        Self {
            parameters,
            parents: Vec::new(),
            daughters: Vec::new(),
        }
    }

    /// Particle energy, in GeV.
    #[must_use]
    pub const fn energy(&self) -> f64 {
        self.parameters.energy
    }

    /// Particle momentum at production, in GeV.
    #[must_use]
    pub const fn momentum(&self) -> &CartesianVector {
        &self.parameters.momentum
    }

    /// Radius at which the particle was produced, in mm.
    #[must_use]
    pub const fn inner_radius(&self) -> f64 {
        self.parameters.inner_radius
    }

    /// Radius at which the particle decayed or left the detector, in mm.
    #[must_use]
    pub const fn outer_radius(&self) -> f64 {
        self.parameters.outer_radius
    }

    /// PDG particle code.
    #[must_use]
    pub const fn particle_id(&self) -> i32 {
        self.parameters.particle_id
    }

    /// Opaque id of the particle in the caller's event model.
    #[must_use]
    pub const fn uid(&self) -> u64 {
        self.parameters.uid
    }

    /// Parent particles.
    #[must_use]
    pub fn parents(&self) -> &[McId] {
        &self.parents
    }

    /// Daughter particles.
    #[must_use]
    pub fn daughters(&self) -> &[McId] {
        &self.daughters
    }

    /// Whether the particle has no parents.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parents.is_empty()
    }

    pub(crate) fn add_parent(&mut self, parent: McId) {
        if !self.parents.contains(&parent) {
            self.parents.push(parent);
        }
    }

    pub(crate) fn add_daughter(&mut self, daughter: McId) {
        if !self.daughters.contains(&daughter) {
            self.daughters.push(daughter);
        }
    }
}
