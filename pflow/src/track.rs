//! Measured tracks: immutable trajectory parameters plus the mutable relational state
//! (parent/daughter/sibling links and the cluster association).

use super::arena::Id;
use super::cluster::ClusterId;
use super::helix::Helix;
use super::hit::McId;
use super::vector::CartesianVector;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Typed id of a track.
pub type TrackId = Id<Track>;

bitflags! {
    /// Quality bits reported by the external track fitting.
    #[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
    pub struct TrackFlags: u8 {
        /// The trajectory reaches the calorimeter front face.
        const REACHES_CALORIMETER = 1;
        /// The trajectory exits through the end cap rather than the barrel.
        const PROJECTED_TO_ENDCAP = 1 << 1;
        /// The fit quality allows this track to enter a particle flow object.
        const CAN_FORM_PFO = 1 << 2;
    }
}

/// Position and momentum of a trajectory at one point.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct TrackState {
    /// Position, in mm.
    pub position: CartesianVector,
    /// Momentum, in GeV.
    pub momentum: CartesianVector,
}

/// Input payload describing one track, handed to the engine by the calling harness.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TrackParameters {
    /// Energy at the distance of closest approach to the interaction point, in GeV.
    pub energy_at_dca: f64,
    /// Momentum at the distance of closest approach, in GeV.
    pub momentum_at_dca: CartesianVector,
    /// Charge, in units of e.
    pub charge: i32,
    /// Mass hypothesis, in GeV.
    pub mass: f64,
    /// PDG particle id hypothesis.
    pub particle_id: i32,
    /// Trajectory state at the first measurement.
    pub start_state: TrackState,
    /// Trajectory state at the last measurement.
    pub end_state: TrackState,
    /// Trajectory state projected to the calorimeter front face.
    pub calorimeter_state: TrackState,
    /// Quality bits from the external track fitting.
    pub flags: TrackFlags,
    /// Opaque id of the track in the caller's event model.
    pub uid: u64,
}

/// One measured track. The trajectory attributes are immutable; the relational sets
/// are maintained by the object store.
#[derive(Clone, Debug)]
pub struct Track {
    parameters: TrackParameters,
    helix_at_calorimeter: Option<Helix>,
    parents: Vec<TrackId>,
    daughters: Vec<TrackId>,
    siblings: Vec<TrackId>,
    associated_cluster: Option<ClusterId>,
    mc_particle: Option<McId>,
}

impl Track {
    pub(crate) fn new(
        parameters: TrackParameters,
        helix_at_calorimeter: Option<Helix>,
        mc_particle: Option<McId>,
    ) -> Self {
        Self {
            parameters,
            helix_at_calorimeter,
            parents: Vec::new(),
            daughters: Vec::new(),
            siblings: Vec::new(),
            associated_cluster: None,
            mc_particle,
        }
    }

    /// Energy at the distance of closest approach, in GeV.
    #[must_use]
    pub const fn energy_at_dca(&self) -> f64 {
        self.parameters.energy_at_dca
    }

    /// Momentum at the distance of closest approach, in GeV.
    #[must_use]
    pub const fn momentum_at_dca(&self) -> &CartesianVector {
        &self.parameters.momentum_at_dca
    }

    /// Charge, in units of e.
    #[must_use]
    pub const fn charge(&self) -> i32 {
        self.parameters.charge
    }

    /// Mass hypothesis, in GeV.
    #[must_use]
    pub const fn mass(&self) -> f64 {
        self.parameters.mass
    }

    /// PDG particle id hypothesis.
    #[must_use]
    pub const fn particle_id(&self) -> i32 {
        self.parameters.particle_id
    }

    /// Trajectory state at the first measurement.
    #[must_use]
    pub const fn start_state(&self) -> &TrackState {
        &self.parameters.start_state
    }

    /// Trajectory state at the last measurement.
    #[must_use]
    pub const fn end_state(&self) -> &TrackState {
        &self.parameters.end_state
    }

    /// Trajectory state projected to the calorimeter front face.
    #[must_use]
    pub const fn calorimeter_state(&self) -> &TrackState {
        &self.parameters.calorimeter_state
    }

    /// Helix fit at the calorimeter front face; absent for trajectories the fit could
    /// not be built for.
    #[must_use]
    pub const fn helix_at_calorimeter(&self) -> Option<&Helix> {
        self.helix_at_calorimeter.as_ref()
    }

    /// Quality bits from the external track fitting.
    #[must_use]
    pub const fn flags(&self) -> TrackFlags {
        self.parameters.flags
    }

    /// Whether the trajectory reaches the calorimeter front face.
    #[must_use]
    pub const fn reaches_calorimeter(&self) -> bool {
        self.parameters.flags.contains(TrackFlags::REACHES_CALORIMETER)
    }

    /// Whether the trajectory exits through the end cap.
    #[must_use]
    pub const fn is_projected_to_endcap(&self) -> bool {
        self.parameters.flags.contains(TrackFlags::PROJECTED_TO_ENDCAP)
    }

    /// Whether the fit quality allows this track to enter a particle flow object.
    #[must_use]
    pub const fn can_form_pfo(&self) -> bool {
        self.parameters.flags.contains(TrackFlags::CAN_FORM_PFO)
    }

    /// Parent tracks.
    #[must_use]
    pub fn parents(&self) -> &[TrackId] {
        &self.parents
    }

    /// Daughter tracks.
    #[must_use]
    pub fn daughters(&self) -> &[TrackId] {
        &self.daughters
    }

    /// Sibling tracks.
    #[must_use]
    pub fn siblings(&self) -> &[TrackId] {
        &self.siblings
    }

    /// The associated cluster, if any. A track holds at most one association.
    #[must_use]
    pub const fn associated_cluster(&self) -> Option<ClusterId> {
        self.associated_cluster
    }

    /// Whether the track currently has a cluster association.
    #[must_use]
    pub const fn has_associated_cluster(&self) -> bool {
        self.associated_cluster.is_some()
    }

    /// Truth link, absent when the event carries no MC information.
    #[must_use]
    pub const fn mc_particle(&self) -> Option<McId> {
        self.mc_particle
    }

    /// Opaque id of the track in the caller's event model.
    #[must_use]
    pub const fn uid(&self) -> u64 {
        self.parameters.uid
    }

    pub(crate) fn add_parent(&mut self, parent: TrackId) {
        if !self.parents.contains(&parent) {
            self.parents.push(parent);
        }
    }

    pub(crate) fn add_daughter(&mut self, daughter: TrackId) {
        if !self.daughters.contains(&daughter) {
            self.daughters.push(daughter);
        }
    }

    pub(crate) fn add_sibling(&mut self, sibling: TrackId) {
        if !self.siblings.contains(&sibling) {
            self.siblings.push(sibling);
        }
    }

    pub(crate) fn set_associated_cluster(&mut self, cluster: Option<ClusterId>) {
        self.associated_cluster = cluster;
    }
}
