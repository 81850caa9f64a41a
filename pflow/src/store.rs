//! The per-event object store: arenas owning every reconstruction object, the named
//! lists stages communicate through, and the transactional fragmentation and
//! reclustering contexts.
//!
//! Hit ownership is tracked per *domain*: the committed event state is domain zero,
//! and every clustering variant run inside an open context claims hits in a fresh
//! domain. Within one domain a hit belongs to at most one cluster; committing a
//! context folds the surviving domain back into the committed one.

use super::arena::Arena;
use super::cluster::{Cluster, ClusterId, ShowerProfile};
use super::error::{Error, Result};
use super::fit::{self, ClusterFitResult};
use super::geometry::Detector;
use super::hit::{CaloHit, CaloHitParameters, HitId, McId, OrderedCaloHitList};
use super::mc::{McParticle, McParticleParameters};
use super::particle_id;
use super::pfo::{ParticleFlowObject, PfoId, PfoParameters};
use super::track::{Track, TrackId, TrackParameters};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;

/// The committed hit-ownership domain.
const COMMITTED_DOMAIN: u32 = 0;

/// Seed used to create a new cluster.
#[derive(Clone, Debug)]
pub enum ClusterSeed {
    /// A single calo hit.
    Hit(HitId),
    /// A list of calo hits.
    Hits(Vec<HitId>),
    /// A track; the cluster starts empty, bound to the track and pointing along its
    /// calorimeter-face momentum.
    Track(TrackId),
}

/// Snapshot of the current-list designations, taken before each stage so that a
/// failing stage can be rolled back.
#[derive(Clone, Debug)]
pub struct Designations {
    hit: Option<String>,
    cluster: Option<String>,
    track: Option<String>,
    pfo: Option<String>,
}

#[derive(Debug)]
struct ReclusterContext {
    previous: Designations,
    original_list: String,
    candidate_lists: Vec<String>,
    track_list: String,
    hit_list: String,
    tracks: Vec<TrackId>,
    original_associations: Vec<(TrackId, ClusterId)>,
}

#[derive(Debug)]
struct FragmentationContext {
    previous: Designations,
    original_list: String,
    fragment_list: String,
}

/// The object store for one event.
#[derive(Default)]
pub struct EventStore {
    hits: Arena<CaloHit>,
    tracks: Arena<Track>,
    mc_particles: Arena<McParticle>,
    clusters: Arena<Cluster>,
    pfos: Arena<ParticleFlowObject>,

    cluster_domains: FxHashMap<ClusterId, u32>,
    hit_owners: FxHashMap<(u32, HitId), ClusterId>,
    active_domain: u32,
    next_domain: u32,

    hit_lists: BTreeMap<String, OrderedCaloHitList>,
    cluster_lists: BTreeMap<String, Vec<ClusterId>>,
    track_lists: BTreeMap<String, Vec<TrackId>>,
    pfo_lists: BTreeMap<String, Vec<PfoId>>,

    current_hit_list: Option<String>,
    current_cluster_list: Option<String>,
    current_track_list: Option<String>,
    current_pfo_list: Option<String>,

    recluster: Option<ReclusterContext>,
    fragmentation: Option<FragmentationContext>,
    temp_counter: u32,
}

impl EventStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_domain: 1,
            ..Self::default()
        }
    }

    fn temp_name(&mut self, prefix: &str) -> String {
        self.temp_counter += 1;
        format!("{prefix}_{}", self.temp_counter)
    }

    // ---------------------------------------------------------------- object creation

    /// Create a calo hit; the pseudo layer is assigned once, here, via the detector's
    /// pseudo-layer calculator.
    ///
    /// # Errors
    ///
    /// Propagates pseudo-layer calculation failures.
    pub fn create_calo_hit(
        &mut self,
        parameters: CaloHitParameters,
        detector: &Detector,
        mc_particle: Option<McId>,
    ) -> Result<HitId> {
        let pseudo_layer = detector.pseudo_layer(&parameters.position)?;
        Ok(self.hits.insert(CaloHit::new(parameters, pseudo_layer, mc_particle)))
    }

    /// Create a track. The helix fit at the calorimeter is built here from the
    /// calorimeter-face track state and the local field.
    ///
    /// # Errors
    ///
    /// Propagates field lookup failures.
    pub fn create_track(
        &mut self,
        parameters: TrackParameters,
        detector: &Detector,
        mc_particle: Option<McId>,
    ) -> Result<TrackId> {
        let helix = if parameters.charge == 0 {
            None
        } else {
            let state = &parameters.calorimeter_state;
            let bfield = detector.bfield(&state.position)?.abs();
            super::helix::Helix::new(state.position, state.momentum, parameters.charge, bfield).ok()
        };

        Ok(self.tracks.insert(Track::new(parameters, helix, mc_particle)))
    }

    /// Create an MC particle.
    pub fn create_mc_particle(&mut self, parameters: McParticleParameters) -> McId {
        self.mc_particles.insert(McParticle::new(parameters))
    }

    /// Record a parent/daughter relation between two tracks.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Failure`] when the relation would close a cycle.
    pub fn set_track_parent_daughter(&mut self, parent: TrackId, daughter: TrackId) -> Result<()> {
        if parent == daughter {
            return Err(Error::Failure("track cannot parent itself".to_owned()));
        }

        // reject anything that would make the per-event relation graph cyclic
        let mut frontier = vec![daughter];
        while let Some(current) = frontier.pop() {
            if current == parent {
                return Err(Error::Failure(
                    "parent/daughter relation would create a cycle".to_owned(),
                ));
            }
            frontier.extend_from_slice(self.tracks.get(current)?.daughters());
        }

        self.tracks.get_mut(parent)?.add_daughter(daughter);
        self.tracks.get_mut(daughter)?.add_parent(parent);
        Ok(())
    }

    /// Record a sibling relation between two tracks.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Failure`] when both ids name the same track.
    pub fn set_track_siblings(&mut self, lhs: TrackId, rhs: TrackId) -> Result<()> {
        if lhs == rhs {
            return Err(Error::Failure("track cannot be its own sibling".to_owned()));
        }

        self.tracks.get_mut(lhs)?.add_sibling(rhs);
        self.tracks.get_mut(rhs)?.add_sibling(lhs);
        Ok(())
    }

    /// Record a parent/daughter relation between two MC particles.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] for unknown ids.
    pub fn set_mc_parent_daughter(&mut self, parent: McId, daughter: McId) -> Result<()> {
        self.mc_particles.get_mut(parent)?.add_daughter(daughter);
        self.mc_particles.get_mut(daughter)?.add_parent(parent);
        Ok(())
    }

    // --------------------------------------------------------------------- accessors

    /// Borrow a calo hit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] for a stale or unknown id.
    pub fn hit(&self, id: HitId) -> Result<&CaloHit> {
        self.hits.get(id)
    }

    /// Borrow a track.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] for a stale or unknown id.
    pub fn track(&self, id: TrackId) -> Result<&Track> {
        self.tracks.get(id)
    }

    /// Borrow a cluster.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] for a stale or unknown id.
    pub fn cluster(&self, id: ClusterId) -> Result<&Cluster> {
        self.clusters.get(id)
    }

    /// Mutably borrow a cluster, e.g. to update its flags or current fit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] for a stale or unknown id.
    pub fn cluster_mut(&mut self, id: ClusterId) -> Result<&mut Cluster> {
        self.clusters.get_mut(id)
    }

    /// Borrow an MC particle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] for a stale or unknown id.
    pub fn mc_particle(&self, id: McId) -> Result<&McParticle> {
        self.mc_particles.get(id)
    }

    /// Borrow a particle flow object.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] for a stale or unknown id.
    pub fn pfo(&self, id: PfoId) -> Result<&ParticleFlowObject> {
        self.pfos.get(id)
    }

    /// Mutably borrow a particle flow object.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] for a stale or unknown id.
    pub fn pfo_mut(&mut self, id: PfoId) -> Result<&mut ParticleFlowObject> {
        self.pfos.get_mut(id)
    }

    /// The hit arena, for read-only helpers.
    #[must_use]
    pub const fn hits_arena(&self) -> &Arena<CaloHit> {
        &self.hits
    }

    /// Whether a cluster id is live.
    #[must_use]
    pub fn cluster_exists(&self, id: ClusterId) -> bool {
        self.clusters.contains(id)
    }

    /// Whether the hit is unclaimed in the active ownership domain.
    #[must_use]
    pub fn is_hit_available(&self, id: HitId) -> bool {
        !self.hit_owners.contains_key(&(self.active_domain, id))
    }

    /// The cluster owning the hit in the committed domain, if any.
    #[must_use]
    pub fn committed_hit_owner(&self, id: HitId) -> Option<ClusterId> {
        self.hit_owners.get(&(COMMITTED_DOMAIN, id)).copied()
    }

    // ------------------------------------------------------------------- designations

    /// Snapshot the current-list designations.
    #[must_use]
    pub fn designations(&self) -> Designations {
        Designations {
            hit: self.current_hit_list.clone(),
            cluster: self.current_cluster_list.clone(),
            track: self.current_track_list.clone(),
            pfo: self.current_pfo_list.clone(),
        }
    }

    /// Restore previously snapshot designations; names that no longer resolve fall
    /// back to no designation.
    pub fn restore_designations(&mut self, designations: Designations) {
        self.current_hit_list =
            designations.hit.filter(|name| self.hit_lists.contains_key(name));
        self.current_cluster_list = designations
            .cluster
            .filter(|name| self.cluster_lists.contains_key(name));
        self.current_track_list = designations
            .track
            .filter(|name| self.track_lists.contains_key(name));
        self.current_pfo_list =
            designations.pfo.filter(|name| self.pfo_lists.contains_key(name));
    }

    // ---------------------------------------------------------------------- hit lists

    /// Create a named hit list from the given hits. Name collisions on create fail.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotAllowed`] when the name exists, or propagates unknown hit
    /// ids.
    pub fn create_hit_list<I: IntoIterator<Item = HitId>>(
        &mut self,
        name: &str,
        hits: I,
    ) -> Result<()> {
        if self.hit_lists.contains_key(name) {
            return Err(Error::NotAllowed("hit list name already exists"));
        }

        let mut list = OrderedCaloHitList::new();
        for id in hits {
            let hit = self.hits.get(id)?;
            list.add_hit(id, hit.pseudo_layer(), hit.input_energy())?;
        }

        self.hit_lists.insert(name.to_owned(), list);
        Ok(())
    }

    /// Borrow a named hit list.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] for an unknown name.
    pub fn hit_list(&self, name: &str) -> Result<&OrderedCaloHitList> {
        self.hit_lists
            .get(name)
            .ok_or_else(|| Error::OutOfRange(format!("hit list {name}")))
    }

    /// Borrow the current hit list.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotInitialized`] when no current hit list is designated.
    pub fn current_ordered_hits(&self) -> Result<&OrderedCaloHitList> {
        let name = self
            .current_hit_list
            .as_ref()
            .ok_or(Error::NotInitialized("current hit list"))?;
        self.hit_list(name)
    }

    /// Name of the current hit list.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotInitialized`] when no current hit list is designated.
    pub fn current_hit_list_name(&self) -> Result<&str> {
        self.current_hit_list
            .as_deref()
            .ok_or(Error::NotInitialized("current hit list"))
    }

    /// Designate a named hit list as current. The designation is untouched on failure.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] for an unknown name.
    pub fn replace_current_hit_list(&mut self, name: &str) -> Result<()> {
        if !self.hit_lists.contains_key(name) {
            return Err(Error::OutOfRange(format!("hit list {name}")));
        }

        self.current_hit_list = Some(name.to_owned());
        Ok(())
    }

    /// Drop the current hit-list designation.
    pub fn drop_current_hit_list(&mut self) {
        self.current_hit_list = None;
    }

    // -------------------------------------------------------------------- track lists

    /// Save tracks under a named list; an existing list is appended to, never
    /// overwritten.
    ///
    /// # Errors
    ///
    /// Propagates unknown track ids.
    pub fn save_track_list(&mut self, name: &str, tracks: &[TrackId]) -> Result<()> {
        for id in tracks {
            self.tracks.get(*id)?;
        }

        let list = self.track_lists.entry(name.to_owned()).or_default();
        for id in tracks {
            if !list.contains(id) {
                list.push(*id);
            }
        }

        Ok(())
    }

    /// Borrow a named track list.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] for an unknown name.
    pub fn track_list(&self, name: &str) -> Result<&[TrackId]> {
        self.track_lists
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| Error::OutOfRange(format!("track list {name}")))
    }

    /// Ids in the current track list, cloned for iteration while mutating the store.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotInitialized`] when no current track list is designated.
    pub fn current_track_ids(&self) -> Result<Vec<TrackId>> {
        let name = self
            .current_track_list
            .as_ref()
            .ok_or(Error::NotInitialized("current track list"))?;
        self.track_list(name).map(<[TrackId]>::to_vec)
    }

    /// Name of the current track list.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotInitialized`] when no current track list is designated.
    pub fn current_track_list_name(&self) -> Result<&str> {
        self.current_track_list
            .as_deref()
            .ok_or(Error::NotInitialized("current track list"))
    }

    /// Designate a named track list as current. The designation is untouched on
    /// failure.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] for an unknown name.
    pub fn replace_current_track_list(&mut self, name: &str) -> Result<()> {
        if !self.track_lists.contains_key(name) {
            return Err(Error::OutOfRange(format!("track list {name}")));
        }

        self.current_track_list = Some(name.to_owned());
        Ok(())
    }

    // ------------------------------------------------------------------ cluster lists

    /// Ids in the current cluster list, cloned for iteration while mutating the store.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotInitialized`] when no current cluster list is designated.
    pub fn current_cluster_ids(&self) -> Result<Vec<ClusterId>> {
        let name = self
            .current_cluster_list
            .as_ref()
            .ok_or(Error::NotInitialized("current cluster list"))?;
        self.cluster_list(name).map(<[ClusterId]>::to_vec)
    }

    /// Name of the current cluster list.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotInitialized`] when no current cluster list is designated.
    pub fn current_cluster_list_name(&self) -> Result<&str> {
        self.current_cluster_list
            .as_deref()
            .ok_or(Error::NotInitialized("current cluster list"))
    }

    /// Borrow a named cluster list.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] for an unknown name.
    pub fn cluster_list(&self, name: &str) -> Result<&[ClusterId]> {
        self.cluster_lists
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| Error::OutOfRange(format!("cluster list {name}")))
    }

    /// Create an empty named cluster list. Name collisions on create fail.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotAllowed`] when the name exists.
    pub fn create_cluster_list(&mut self, name: &str) -> Result<()> {
        if self.cluster_lists.contains_key(name) {
            return Err(Error::NotAllowed("cluster list name already exists"));
        }

        self.cluster_lists.insert(name.to_owned(), Vec::new());
        Ok(())
    }

    /// Save the current cluster list under `name`; an existing list is appended to,
    /// never overwritten.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotInitialized`] when no current cluster list is designated.
    pub fn save_cluster_list(&mut self, name: &str) -> Result<()> {
        let source = self.current_cluster_list_name()?.to_owned();
        self.save_cluster_list_from(&source, name)
    }

    /// Save a named cluster list under another name; the target is appended to.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] for an unknown source name.
    pub fn save_cluster_list_from(&mut self, source: &str, target: &str) -> Result<()> {
        let ids = self.cluster_list(source)?.to_vec();
        let list = self.cluster_lists.entry(target.to_owned()).or_default();

        for id in ids {
            if !list.contains(&id) {
                list.push(id);
            }
        }

        Ok(())
    }

    /// Designate a named cluster list as current. The designation is untouched on
    /// failure.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] for an unknown name.
    pub fn replace_current_cluster_list(&mut self, name: &str) -> Result<()> {
        if !self.cluster_lists.contains_key(name) {
            return Err(Error::OutOfRange(format!("cluster list {name}")));
        }

        self.current_cluster_list = Some(name.to_owned());
        Ok(())
    }

    /// Drop the current cluster-list designation.
    pub fn drop_current_cluster_list(&mut self) {
        self.current_cluster_list = None;
    }

    /// Forget a named cluster list without touching the clusters it holds.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] for an unknown name.
    pub fn remove_cluster_list(&mut self, name: &str) -> Result<()> {
        self.cluster_lists
            .remove(name)
            .ok_or_else(|| Error::OutOfRange(format!("cluster list {name}")))?;

        if self.current_cluster_list.as_deref() == Some(name) {
            self.current_cluster_list = None;
        }

        Ok(())
    }

    /// Delete a named cluster list together with every cluster it holds.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] for an unknown name.
    pub fn delete_cluster_list(&mut self, name: &str) -> Result<()> {
        let ids = self.cluster_list(name)?.to_vec();

        for id in ids {
            if self.clusters.contains(id) {
                self.delete_cluster(id)?;
            }
        }

        let _ = self.cluster_lists.remove(name);

        if self.current_cluster_list.as_deref() == Some(name) {
            self.current_cluster_list = None;
        }

        Ok(())
    }

    /// Create a fresh, empty, temporary cluster list and designate it current. Inside
    /// an open reclustering context the list becomes a recluster candidate with its
    /// own hit-ownership domain.
    ///
    /// # Errors
    ///
    /// Never fails currently; the `Result` mirrors the other list operations.
    pub fn begin_temporary_cluster_list(&mut self) -> Result<String> {
        let name = self.temp_name("TempClusters");
        self.cluster_lists.insert(name.clone(), Vec::new());
        self.current_cluster_list = Some(name.clone());

        if let Some(context) = self.recluster.as_mut() {
            context.candidate_lists.push(name.clone());
            self.active_domain = self.next_domain;
            self.next_domain += 1;
        }

        Ok(name)
    }

    // ------------------------------------------------------------- cluster operations

    fn claim_hit(&mut self, domain: u32, hit: HitId, cluster: ClusterId) -> Result<()> {
        if self.hit_owners.contains_key(&(domain, hit)) {
            return Err(Error::ClusterHitOverlap);
        }

        self.hit_owners.insert((domain, hit), cluster);
        Ok(())
    }

    fn cluster_domain(&self, id: ClusterId) -> Result<u32> {
        self.cluster_domains
            .get(&id)
            .copied()
            .ok_or_else(|| Error::Failure(format!("cluster {id:?} has no ownership domain")))
    }

    /// Create a cluster from a seed and add it to the current cluster list.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotInitialized`] without a current cluster list,
    /// [`Error::ClusterHitOverlap`] when a seed hit is already claimed, or propagates
    /// unknown ids.
    pub fn create_cluster(&mut self, seed: ClusterSeed) -> Result<ClusterId> {
        let list_name = self.current_cluster_list_name()?.to_owned();

        let cluster = match &seed {
            ClusterSeed::Hit(_) | ClusterSeed::Hits(_) => Cluster::new(),
            ClusterSeed::Track(track_id) => {
                let track = self.tracks.get(*track_id)?;
                let direction = track
                    .calorimeter_state()
                    .momentum
                    .unit_vector()
                    .or_else(|_| track.momentum_at_dca().unit_vector())?;
                Cluster::with_seed_track(*track_id, direction)
            }
        };

        let id = self.clusters.insert(cluster);
        self.cluster_domains.insert(id, self.active_domain);

        let seed_hits = match seed {
            ClusterSeed::Hit(hit) => vec![hit],
            ClusterSeed::Hits(hits) => hits,
            ClusterSeed::Track(_) => Vec::new(),
        };

        for hit in seed_hits {
            if let Err(error) = self.add_hit_to_cluster(id, hit) {
                // roll the partially built cluster back before surfacing the error
                self.delete_cluster(id)?;
                return Err(error);
            }
        }

        self.cluster_lists
            .get_mut(&list_name)
            .ok_or_else(|| Error::OutOfRange(format!("cluster list {list_name}")))?
            .push(id);

        Ok(id)
    }

    /// Add a hit to a cluster's primary hit list.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClusterHitOverlap`] when the hit already belongs to another
    /// cluster in the same ownership domain.
    pub fn add_hit_to_cluster(&mut self, cluster_id: ClusterId, hit_id: HitId) -> Result<()> {
        let domain = self.cluster_domain(cluster_id)?;
        let hit = self.hits.get(hit_id)?.clone();

        self.claim_hit(domain, hit_id, cluster_id)?;

        if let Err(error) = self.clusters.get_mut(cluster_id)?.add_hit(hit_id, &hit) {
            self.hit_owners.remove(&(domain, hit_id));
            return Err(error);
        }

        Ok(())
    }

    /// Remove a hit from a cluster's primary hit list.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] when the hit is not in the cluster.
    pub fn remove_hit_from_cluster(&mut self, cluster_id: ClusterId, hit_id: HitId) -> Result<()> {
        let domain = self.cluster_domain(cluster_id)?;
        let hit = self.hits.get(hit_id)?.clone();

        self.clusters.get_mut(cluster_id)?.remove_hit(hit_id, &hit)?;
        self.hit_owners.remove(&(domain, hit_id));

        Ok(())
    }

    /// Add a hit to a cluster's isolated hit list.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClusterHitOverlap`] when the hit already belongs to another
    /// cluster in the same ownership domain.
    pub fn add_isolated_hit_to_cluster(
        &mut self,
        cluster_id: ClusterId,
        hit_id: HitId,
    ) -> Result<()> {
        let domain = self.cluster_domain(cluster_id)?;
        let hit = self.hits.get(hit_id)?.clone();

        self.claim_hit(domain, hit_id, cluster_id)?;

        if let Err(error) = self.clusters.get_mut(cluster_id)?.add_isolated_hit(hit_id, &hit) {
            self.hit_owners.remove(&(domain, hit_id));
            return Err(error);
        }

        Ok(())
    }

    /// Remove a hit from a cluster's isolated hit list.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] when the hit is not isolated in the cluster.
    pub fn remove_isolated_hit_from_cluster(
        &mut self,
        cluster_id: ClusterId,
        hit_id: HitId,
    ) -> Result<()> {
        let domain = self.cluster_domain(cluster_id)?;
        let hit = self.hits.get(hit_id)?.clone();

        self.clusters.get_mut(cluster_id)?.remove_isolated_hit(hit_id, &hit)?;
        self.hit_owners.remove(&(domain, hit_id));

        Ok(())
    }

    /// Merge `donor` into `recipient` and destroy the donor: the recipient acquires
    /// all hits, isolated hits and track associations; tracks re-point to the
    /// recipient; the donor disappears from every named list.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Failure`] when the two ids coincide or the clusters live in
    /// different ownership domains.
    pub fn merge_and_delete_clusters(
        &mut self,
        recipient_id: ClusterId,
        donor_id: ClusterId,
    ) -> Result<()> {
        if recipient_id == donor_id {
            return Err(Error::Failure("cannot merge a cluster into itself".to_owned()));
        }

        let recipient_domain = self.cluster_domain(recipient_id)?;
        let donor_domain = self.cluster_domain(donor_id)?;

        if recipient_domain != donor_domain {
            return Err(Error::Failure(
                "cannot merge clusters across ownership domains".to_owned(),
            ));
        }

        self.clusters.get(recipient_id)?;
        let donor = self.clusters.remove(donor_id)?;
        self.cluster_domains.remove(&donor_id);

        for (_, hit_id) in donor.ordered_hits().hits() {
            self.hit_owners.remove(&(donor_domain, hit_id));
            let hit = self.hits.get(hit_id)?.clone();
            self.hit_owners.insert((recipient_domain, hit_id), recipient_id);
            self.clusters.get_mut(recipient_id)?.add_hit(hit_id, &hit)?;
        }

        for hit_id in donor.isolated_hits() {
            self.hit_owners.remove(&(donor_domain, *hit_id));
            let hit = self.hits.get(*hit_id)?.clone();
            self.hit_owners.insert((recipient_domain, *hit_id), recipient_id);
            self.clusters.get_mut(recipient_id)?.add_isolated_hit(*hit_id, &hit)?;
        }

        for track_id in donor.associated_tracks() {
            self.tracks.get_mut(*track_id)?.set_associated_cluster(Some(recipient_id));
            self.clusters.get_mut(recipient_id)?.add_associated_track(*track_id);
        }

        for list in self.cluster_lists.values_mut() {
            list.retain(|id| *id != donor_id);
        }

        self.clusters.get_mut(recipient_id)?.invalidate_caches();
        Ok(())
    }

    /// Delete a cluster: its hits become available again, associated tracks lose the
    /// association and the cluster disappears from every named list.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] for a stale or unknown id.
    pub fn delete_cluster(&mut self, id: ClusterId) -> Result<()> {
        let domain = self.cluster_domain(id)?;
        let cluster = self.clusters.remove(id)?;
        self.cluster_domains.remove(&id);

        for (_, hit_id) in cluster.ordered_hits().hits() {
            self.hit_owners.remove(&(domain, hit_id));
        }

        for hit_id in cluster.isolated_hits() {
            self.hit_owners.remove(&(domain, *hit_id));
        }

        for track_id in cluster.associated_tracks() {
            self.tracks.get_mut(*track_id)?.set_associated_cluster(None);
        }

        for list in self.cluster_lists.values_mut() {
            list.retain(|other| *other != id);
        }

        Ok(())
    }

    // ------------------------------------------------------- track-cluster association

    /// Associate a track with a cluster. Symmetric on both sides.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotAllowed`] when the track already holds an association.
    pub fn add_track_cluster_association(
        &mut self,
        track_id: TrackId,
        cluster_id: ClusterId,
    ) -> Result<()> {
        self.clusters.get(cluster_id)?;

        let track = self.tracks.get_mut(track_id)?;
        if track.has_associated_cluster() {
            return Err(Error::NotAllowed("track already holds a cluster association"));
        }

        track.set_associated_cluster(Some(cluster_id));
        self.clusters.get_mut(cluster_id)?.add_associated_track(track_id);
        Ok(())
    }

    /// Remove one track-cluster association. Symmetric on both sides.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] when the pair is not associated.
    pub fn remove_track_cluster_association(
        &mut self,
        track_id: TrackId,
        cluster_id: ClusterId,
    ) -> Result<()> {
        let track = self.tracks.get_mut(track_id)?;

        if track.associated_cluster() != Some(cluster_id) {
            return Err(Error::OutOfRange(format!(
                "track {track_id:?} not associated with cluster {cluster_id:?}"
            )));
        }

        track.set_associated_cluster(None);
        self.clusters.get_mut(cluster_id)?.remove_associated_track(track_id)?;
        Ok(())
    }

    /// Remove the associations of every track in the current track list.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotInitialized`] when no current track list is designated.
    pub fn remove_current_track_cluster_associations(&mut self) -> Result<()> {
        for track_id in self.current_track_ids()? {
            if let Some(cluster_id) = self.tracks.get(track_id)?.associated_cluster() {
                self.remove_track_cluster_association(track_id, cluster_id)?;
            }
        }

        Ok(())
    }

    /// Remove every track-cluster association in the event.
    ///
    /// # Errors
    ///
    /// Propagates inconsistent association state.
    pub fn remove_all_track_cluster_associations(&mut self) -> Result<()> {
        let track_ids: Vec<TrackId> = self.tracks.ids().collect();

        for track_id in track_ids {
            if let Some(cluster_id) = self.tracks.get(track_id)?.associated_cluster() {
                self.remove_track_cluster_association(track_id, cluster_id)?;
            }
        }

        Ok(())
    }

    // ---------------------------------------------------------------- cached products

    /// Fit through all hits of a cluster, cached until the cluster next changes.
    ///
    /// # Errors
    ///
    /// Propagates unknown ids and inconsistent cluster state.
    pub fn fit_to_all_hits(&mut self, id: ClusterId) -> Result<ClusterFitResult> {
        if let Some(fit) = self.clusters.get(id)?.fit_to_all_hits_cache {
            return Ok(fit);
        }

        let fit = fit::fit_all_hits(&self.hits, self.clusters.get(id)?)?;
        self.clusters.get_mut(id)?.fit_to_all_hits_cache = Some(fit);
        Ok(fit)
    }

    /// Longitudinal shower profile of a cluster compared to the electromagnetic
    /// expectation, cached until the cluster next changes.
    ///
    /// # Errors
    ///
    /// Propagates unknown ids and inconsistent cluster state.
    pub fn shower_profile(&mut self, id: ClusterId) -> Result<ShowerProfile> {
        if let Some(profile) = self.clusters.get(id)?.shower_profile_cache {
            return Ok(profile);
        }

        let profile = particle_id::shower_profile(&self.hits, self.clusters.get(id)?)?;
        self.clusters.get_mut(id)?.shower_profile_cache = Some(profile);
        Ok(profile)
    }

    /// Whether topological merging may touch this cluster: photon-tagged clusters only
    /// merge when mip-like or tightly fit, anything else is fair game.
    ///
    /// # Errors
    ///
    /// Propagates unknown ids.
    pub fn can_merge_cluster(
        &mut self,
        id: ClusterId,
        min_mip_fraction: f64,
        max_all_hits_rms: f64,
    ) -> Result<bool> {
        let cluster = self.clusters.get(id)?;

        if !cluster.is_photon() {
            return Ok(true);
        }

        if cluster.mip_fraction() > min_mip_fraction {
            return Ok(true);
        }

        let fit = self.fit_to_all_hits(id)?;
        Ok(fit.is_successful() && fit.rms()? < max_all_hits_rms)
    }

    // -------------------------------------------------------------------------- PFOs

    /// Create a named PFO list. Name collisions on create fail.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotAllowed`] when the name exists.
    pub fn create_pfo_list(&mut self, name: &str) -> Result<()> {
        if self.pfo_lists.contains_key(name) {
            return Err(Error::NotAllowed("pfo list name already exists"));
        }

        self.pfo_lists.insert(name.to_owned(), Vec::new());
        Ok(())
    }

    /// Designate a named PFO list as current.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] for an unknown name.
    pub fn replace_current_pfo_list(&mut self, name: &str) -> Result<()> {
        if !self.pfo_lists.contains_key(name) {
            return Err(Error::OutOfRange(format!("pfo list {name}")));
        }

        self.current_pfo_list = Some(name.to_owned());
        Ok(())
    }

    /// Ids in the current PFO list.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotInitialized`] when no current PFO list is designated.
    pub fn current_pfo_ids(&self) -> Result<Vec<PfoId>> {
        let name = self
            .current_pfo_list
            .as_ref()
            .ok_or(Error::NotInitialized("current pfo list"))?;
        self.pfo_lists
            .get(name)
            .cloned()
            .ok_or_else(|| Error::OutOfRange(format!("pfo list {name}")))
    }

    /// Create a PFO in the current PFO list.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] for a PFO with neither clusters nor tracks,
    /// [`Error::NotAllowed`] when a constituent cluster is not committed, or
    /// propagates unknown ids.
    pub fn create_pfo(&mut self, parameters: PfoParameters) -> Result<PfoId> {
        if parameters.clusters.is_empty() && parameters.tracks.is_empty() {
            return Err(Error::InvalidParameter(
                "a pfo must hold at least one cluster or track".to_owned(),
            ));
        }

        for cluster_id in &parameters.clusters {
            self.clusters.get(*cluster_id)?;

            if self.cluster_domain(*cluster_id)? != COMMITTED_DOMAIN {
                return Err(Error::NotAllowed("pfo cluster is not committed"));
            }
        }

        for track_id in &parameters.tracks {
            self.tracks.get(*track_id)?;
        }

        let name = self
            .current_pfo_list
            .as_ref()
            .ok_or(Error::NotInitialized("current pfo list"))?
            .clone();

        let id = self.pfos.insert(ParticleFlowObject::new(parameters));
        self.pfo_lists
            .get_mut(&name)
            .ok_or_else(|| Error::OutOfRange(format!("pfo list {name}")))?
            .push(id);

        Ok(id)
    }

    /// Delete a PFO.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] for a stale or unknown id.
    pub fn delete_pfo(&mut self, id: PfoId) -> Result<()> {
        self.pfos.remove(id)?;

        for list in self.pfo_lists.values_mut() {
            list.retain(|other| *other != id);
        }

        Ok(())
    }

    /// Add a cluster to a PFO.
    ///
    /// # Errors
    ///
    /// Propagates unknown ids.
    pub fn add_cluster_to_pfo(&mut self, pfo_id: PfoId, cluster_id: ClusterId) -> Result<()> {
        self.clusters.get(cluster_id)?;
        self.pfos.get_mut(pfo_id)?.add_cluster(cluster_id);
        Ok(())
    }

    /// Remove a cluster from a PFO. The caller must delete a PFO this empties.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] when the cluster is not a constituent.
    pub fn remove_cluster_from_pfo(&mut self, pfo_id: PfoId, cluster_id: ClusterId) -> Result<()> {
        if self.pfos.get_mut(pfo_id)?.remove_cluster(cluster_id) {
            Ok(())
        } else {
            Err(Error::OutOfRange(format!("cluster {cluster_id:?} in pfo {pfo_id:?}")))
        }
    }

    /// Add a track to a PFO.
    ///
    /// # Errors
    ///
    /// Propagates unknown ids.
    pub fn add_track_to_pfo(&mut self, pfo_id: PfoId, track_id: TrackId) -> Result<()> {
        self.tracks.get(track_id)?;
        self.pfos.get_mut(pfo_id)?.add_track(track_id);
        Ok(())
    }

    /// Remove a track from a PFO. The caller must delete a PFO this empties.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] when the track is not a constituent.
    pub fn remove_track_from_pfo(&mut self, pfo_id: PfoId, track_id: TrackId) -> Result<()> {
        if self.pfos.get_mut(pfo_id)?.remove_track(track_id) {
            Ok(())
        } else {
            Err(Error::OutOfRange(format!("track {track_id:?} in pfo {pfo_id:?}")))
        }
    }

    // ----------------------------------------------------------------- fragmentation

    /// Open a fragmentation context: the given clusters move to an "original" list and
    /// a fresh "fragments" list with its own ownership domain becomes current, so the
    /// same hits can be re-clustered into candidate fragments.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotAllowed`] when any context is already open.
    pub fn begin_fragmentation(
        &mut self,
        clusters: Vec<ClusterId>,
    ) -> Result<(String, String)> {
        if self.fragmentation.is_some() || self.recluster.is_some() {
            return Err(Error::NotAllowed("a fragmentation or reclustering context is open"));
        }

        for id in &clusters {
            self.clusters.get(*id)?;
        }

        let previous = self.designations();
        let original_list = self.temp_name("FragmentOriginal");
        let fragment_list = self.temp_name("Fragments");

        // move the originals out of whatever lists hold them into the original list
        for list in self.cluster_lists.values_mut() {
            list.retain(|id| !clusters.contains(id));
        }
        self.cluster_lists.insert(original_list.clone(), clusters);
        self.cluster_lists.insert(fragment_list.clone(), Vec::new());

        self.current_cluster_list = Some(fragment_list.clone());
        self.active_domain = self.next_domain;
        self.next_domain += 1;

        self.fragmentation = Some(FragmentationContext {
            previous,
            original_list: original_list.clone(),
            fragment_list: fragment_list.clone(),
        });

        Ok((original_list, fragment_list))
    }

    /// Close a fragmentation context, keeping one of the two lists and deleting the
    /// clusters of the other. The kept clusters return to the previously current
    /// cluster list.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotAllowed`] without an open context and
    /// [`Error::OutOfRange`] when `keep` names neither context list.
    pub fn end_fragmentation(&mut self, keep: &str) -> Result<()> {
        let context = self
            .fragmentation
            .take()
            .ok_or(Error::NotAllowed("no fragmentation context is open"))?;

        let keep_fragments = if keep == context.fragment_list {
            true
        } else if keep == context.original_list {
            false
        } else {
            self.fragmentation = Some(context);
            return Err(Error::OutOfRange(format!("fragmentation list {keep}")));
        };

        let kept_name = if keep_fragments {
            &context.fragment_list
        } else {
            &context.original_list
        };
        let dropped_name = if keep_fragments {
            &context.original_list
        } else {
            &context.fragment_list
        };

        let kept = self.cluster_list(kept_name)?.to_vec();
        self.delete_cluster_list(dropped_name)?;

        if keep_fragments {
            // fold the surviving fragments into the committed ownership domain
            for id in &kept {
                self.commit_cluster_domain(*id)?;
            }
        }

        let _ = self.cluster_lists.remove(kept_name);
        let _ = self.cluster_lists.remove(dropped_name);
        self.active_domain = COMMITTED_DOMAIN;
        self.restore_designations(context.previous);

        if let Ok(current) = self.current_cluster_list_name() {
            let current = current.to_owned();
            let list = self
                .cluster_lists
                .get_mut(&current)
                .ok_or_else(|| Error::OutOfRange(format!("cluster list {current}")))?;

            for id in kept {
                if !list.contains(&id) {
                    list.push(id);
                }
            }
        }

        Ok(())
    }

    fn commit_cluster_domain(&mut self, id: ClusterId) -> Result<()> {
        let domain = self.cluster_domain(id)?;

        if domain == COMMITTED_DOMAIN {
            return Ok(());
        }

        let cluster = self.clusters.get(id)?;
        let mut hit_ids: Vec<HitId> =
            cluster.ordered_hits().hits().map(|(_, hit_id)| hit_id).collect();
        hit_ids.extend_from_slice(cluster.isolated_hits());

        for hit_id in &hit_ids {
            if self.hit_owners.contains_key(&(COMMITTED_DOMAIN, *hit_id)) {
                return Err(Error::ClusterHitOverlap);
            }
        }

        for hit_id in hit_ids {
            self.hit_owners.remove(&(domain, hit_id));
            self.hit_owners.insert((COMMITTED_DOMAIN, hit_id), id);
        }

        self.cluster_domains.insert(id, COMMITTED_DOMAIN);
        Ok(())
    }

    // ------------------------------------------------------------------- reclustering

    /// Open a reclustering context bound to the given tracks and clusters. The
    /// clusters move to an "original" list; the tracks and the union of the clusters'
    /// hits become the current track and hit lists. Returns the original list name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotAllowed`] when any context is already open.
    pub fn begin_reclustering(
        &mut self,
        tracks: Vec<TrackId>,
        clusters: Vec<ClusterId>,
    ) -> Result<String> {
        if self.recluster.is_some() || self.fragmentation.is_some() {
            return Err(Error::NotAllowed("a fragmentation or reclustering context is open"));
        }

        for id in &tracks {
            self.tracks.get(*id)?;
        }
        for id in &clusters {
            self.clusters.get(*id)?;
        }

        let previous = self.designations();
        let original_list = self.temp_name("ReclusterOriginal");
        let track_list = self.temp_name("ReclusterTracks");
        let hit_list = self.temp_name("ReclusterHits");

        let mut hit_ids = Vec::new();
        let mut original_associations = Vec::new();

        for id in &clusters {
            let cluster = self.clusters.get(*id)?;
            hit_ids.extend(cluster.ordered_hits().hits().map(|(_, hit_id)| hit_id));
            hit_ids.extend_from_slice(cluster.isolated_hits());

            for track_id in cluster.associated_tracks() {
                original_associations.push((*track_id, *id));
            }
        }

        self.create_hit_list(&hit_list, hit_ids)?;
        self.save_track_list(&track_list, &tracks)?;

        for list in self.cluster_lists.values_mut() {
            list.retain(|id| !clusters.contains(id));
        }
        self.cluster_lists.insert(original_list.clone(), clusters);

        self.replace_current_hit_list(&hit_list)?;
        self.replace_current_track_list(&track_list)?;
        self.current_cluster_list = Some(original_list.clone());

        self.recluster = Some(ReclusterContext {
            previous,
            original_list: original_list.clone(),
            candidate_lists: Vec::new(),
            track_list,
            hit_list,
            tracks,
            original_associations,
        });

        Ok(original_list)
    }

    /// Whether a reclustering context is open.
    #[must_use]
    pub const fn has_open_reclustering(&self) -> bool {
        self.recluster.is_some()
    }

    /// Close the reclustering context, committing `selected` (either the original
    /// list or one of the candidate lists). Every other candidate is deleted, the
    /// surviving clusters return to the previously current cluster list, and the
    /// context tracks are left without associations unless the originals, whose
    /// recorded associations are restored, were selected.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotAllowed`] without an open context and
    /// [`Error::OutOfRange`] when `selected` names no context list.
    pub fn end_reclustering(&mut self, selected: &str) -> Result<()> {
        let context = self
            .recluster
            .take()
            .ok_or(Error::NotAllowed("no reclustering context is open"))?;

        let keep_original = selected == context.original_list;

        if !keep_original && !context.candidate_lists.iter().any(|name| name == selected) {
            self.recluster = Some(context);
            return Err(Error::OutOfRange(format!("recluster candidate {selected}")));
        }

        // every context track drops whatever association the last candidate run left
        for track_id in &context.tracks {
            if let Some(cluster_id) = self.tracks.get(*track_id)?.associated_cluster() {
                self.remove_track_cluster_association(*track_id, cluster_id)?;
            }
        }

        if keep_original {
            for name in &context.candidate_lists {
                self.delete_cluster_list(name)?;
            }

            for (track_id, cluster_id) in &context.original_associations {
                self.add_track_cluster_association(*track_id, *cluster_id)?;
            }
        } else {
            self.delete_cluster_list(&context.original_list)?;

            for name in &context.candidate_lists {
                if name != selected {
                    self.delete_cluster_list(name)?;
                }
            }
        }

        let kept = self.cluster_list(selected)?.to_vec();

        if !keep_original {
            for id in &kept {
                self.commit_cluster_domain(*id)?;
            }
        }

        let _ = self.cluster_lists.remove(selected);
        if keep_original {
            let _ = self.cluster_lists.remove(&context.original_list);
        }
        let _ = self.track_lists.remove(&context.track_list);
        let _ = self.hit_lists.remove(&context.hit_list);

        self.active_domain = COMMITTED_DOMAIN;
        self.restore_designations(context.previous);

        if let Ok(current) = self.current_cluster_list_name() {
            let current = current.to_owned();
            let list = self
                .cluster_lists
                .get_mut(&current)
                .ok_or_else(|| Error::OutOfRange(format!("cluster list {current}")))?;

            for id in kept {
                if !list.contains(&id) {
                    list.push(id);
                }
            }
        }

        Ok(())
    }

    /// Restore the originals of an open reclustering context, if any. Called by the
    /// pipeline driver when a stage aborts.
    ///
    /// # Errors
    ///
    /// Propagates list restoration failures.
    pub fn abort_reclustering(&mut self) -> Result<()> {
        if let Some(original) = self.recluster.as_ref().map(|c| c.original_list.clone()) {
            self.end_reclustering(&original)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{
        Detector, GeometryParameters, LayerParameters, SubDetectorParameters,
    };
    use crate::hit::{DetectorRegion, HitType};
    use crate::track::{TrackFlags, TrackState};
    use crate::vector::CartesianVector;

    fn sub_detector(inner: f64, spacing: f64, n_layers: usize) -> SubDetectorParameters {
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
                    n_radiation_lengths: i as f64,
                    n_interaction_lengths: 0.1 * i as f64,
                })
                .collect(),
        }
    }

    fn detector() -> Detector {
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
        detector.initialize().unwrap();
        detector
    }

    fn hit_parameters(position: CartesianVector) -> CaloHitParameters {
        CaloHitParameters {
            position,
            expected_direction: CartesianVector::new(1.0, 0.0, 0.0),
            cell_normal: CartesianVector::new(1.0, 0.0, 0.0),
            cell_size_transverse: 10.0,
            cell_size_longitudinal: 25.0,
            n_radiation_lengths: 1.0,
            n_interaction_lengths: 0.1,
            input_energy: 0.05,
            electromagnetic_energy: 0.05,
            hadronic_energy: 0.05,
            density_weight: 1.0,
            is_possible_mip: false,
            is_isolated: false,
            hit_type: HitType::Ecal,
            region: DetectorRegion::Barrel,
            parent_address: 0,
        }
    }

    fn track_parameters(momentum: CartesianVector) -> TrackParameters {
        let state = TrackState {
            position: CartesianVector::new(1500.0, 0.0, 0.0),
            momentum,
        };
        TrackParameters {
            energy_at_dca: momentum.magnitude(),
            momentum_at_dca: momentum,
            charge: 1,
            mass: 0.13957018,
            particle_id: 211,
            start_state: state,
            end_state: state,
            calorimeter_state: state,
            flags: TrackFlags::REACHES_CALORIMETER | TrackFlags::CAN_FORM_PFO,
            uid: 1,
        }
    }

    struct Fixture {
        store: EventStore,
        hits: Vec<HitId>,
    }

    fn fixture(n_hits: usize) -> Fixture {
        let detector = detector();
        let mut store = EventStore::new();

        let hits: Vec<HitId> = (0..n_hits)
            .map(|i| {
                store
                    .create_calo_hit(
                        hit_parameters(CartesianVector::new(
                            5.0_f64.mul_add(i as f64, 1500.0),
                            0.0,
                            0.0,
                        )),
                        &detector,
                        None,
                    )
                    .unwrap()
            })
            .collect();

        store.cluster_lists.insert("Clusters".to_owned(), Vec::new());
        store.current_cluster_list = Some("Clusters".to_owned());

        Fixture { store, hits }
    }

    #[test]
    fn hit_cannot_join_two_clusters() {
        let Fixture { mut store, hits } = fixture(2);

        let a = store.create_cluster(ClusterSeed::Hit(hits[0])).unwrap();
        let b = store.create_cluster(ClusterSeed::Hit(hits[1])).unwrap();

        assert!(matches!(
            store.add_hit_to_cluster(b, hits[0]),
            Err(Error::ClusterHitOverlap)
        ));

        store.remove_hit_from_cluster(a, hits[0]).unwrap();
        store.add_hit_to_cluster(b, hits[0]).unwrap();
    }

    #[test]
    fn merge_transfers_hits_and_tracks() {
        let detector = detector();
        let Fixture { mut store, hits } = fixture(4);

        let recipient = store
            .create_cluster(ClusterSeed::Hits(vec![hits[0], hits[1]]))
            .unwrap();
        let donor = store
            .create_cluster(ClusterSeed::Hits(vec![hits[2], hits[3]]))
            .unwrap();

        let track = store
            .create_track(track_parameters(CartesianVector::new(10.0, 0.0, 0.1)), &detector, None)
            .unwrap();
        store.add_track_cluster_association(track, donor).unwrap();

        store.merge_and_delete_clusters(recipient, donor).unwrap();

        assert!(!store.cluster_exists(donor));
        assert_eq!(store.cluster(recipient).unwrap().n_calo_hits(), 4);
        assert_eq!(store.track(track).unwrap().associated_cluster(), Some(recipient));
        assert_eq!(store.cluster_list("Clusters").unwrap(), &[recipient]);
    }

    #[test]
    fn merge_of_empty_donor_transfers_only_associations() {
        let detector = detector();
        let Fixture { mut store, hits } = fixture(1);

        let recipient = store.create_cluster(ClusterSeed::Hit(hits[0])).unwrap();
        let track = store
            .create_track(track_parameters(CartesianVector::new(10.0, 0.0, 0.1)), &detector, None)
            .unwrap();
        let donor = store.create_cluster(ClusterSeed::Track(track)).unwrap();
        store.add_track_cluster_association(track, donor).unwrap();

        store.merge_and_delete_clusters(recipient, donor).unwrap();

        assert_eq!(store.cluster(recipient).unwrap().n_calo_hits(), 1);
        assert_eq!(store.track(track).unwrap().associated_cluster(), Some(recipient));
    }

    #[test]
    fn delete_cluster_frees_hits_and_associations() {
        let detector = detector();
        let Fixture { mut store, hits } = fixture(1);

        let cluster = store.create_cluster(ClusterSeed::Hit(hits[0])).unwrap();
        let track = store
            .create_track(track_parameters(CartesianVector::new(10.0, 0.0, 0.1)), &detector, None)
            .unwrap();
        store.add_track_cluster_association(track, cluster).unwrap();

        store.delete_cluster(cluster).unwrap();

        assert!(store.is_hit_available(hits[0]));
        assert!(!store.track(track).unwrap().has_associated_cluster());
        assert!(store.cluster_list("Clusters").unwrap().is_empty());
    }

    #[test]
    fn track_holds_one_association_at_a_time() {
        let detector = detector();
        let Fixture { mut store, hits } = fixture(2);

        let a = store.create_cluster(ClusterSeed::Hit(hits[0])).unwrap();
        let b = store.create_cluster(ClusterSeed::Hit(hits[1])).unwrap();
        let track = store
            .create_track(track_parameters(CartesianVector::new(10.0, 0.0, 0.1)), &detector, None)
            .unwrap();

        store.add_track_cluster_association(track, a).unwrap();
        assert!(store.add_track_cluster_association(track, b).is_err());

        store.remove_track_cluster_association(track, a).unwrap();
        store.add_track_cluster_association(track, b).unwrap();
    }

    #[test]
    fn save_appends_and_create_collides() {
        let Fixture { mut store, hits } = fixture(2);

        let a = store.create_cluster(ClusterSeed::Hit(hits[0])).unwrap();
        store.save_cluster_list("Saved").unwrap();

        let b = store.create_cluster(ClusterSeed::Hit(hits[1])).unwrap();
        store.save_cluster_list("Saved").unwrap();

        assert_eq!(store.cluster_list("Saved").unwrap(), &[a, b]);
        assert!(store.create_hit_list("Saved", hits.clone()).is_ok());
        assert!(store.create_hit_list("Saved", hits).is_err());
    }

    #[test]
    fn reclustering_restores_originals() {
        let detector = detector();
        let Fixture { mut store, hits } = fixture(4);

        let original = store
            .create_cluster(ClusterSeed::Hits(hits.clone()))
            .unwrap();
        let track = store
            .create_track(track_parameters(CartesianVector::new(10.0, 0.0, 0.1)), &detector, None)
            .unwrap();
        store.add_track_cluster_association(track, original).unwrap();
        store.save_track_list("Tracks", &[track]).unwrap();
        store.replace_current_track_list("Tracks").unwrap();

        let original_name = store
            .begin_reclustering(vec![track], vec![original])
            .unwrap();

        // the hits are free in the candidate domain
        let candidate_list = store.begin_temporary_cluster_list().unwrap();
        let candidate = store
            .create_cluster(ClusterSeed::Hits(hits.clone()))
            .unwrap();
        assert!(store.cluster_exists(candidate));
        assert_eq!(store.current_cluster_list_name().unwrap(), candidate_list);

        store.end_reclustering(&original_name).unwrap();

        assert!(store.cluster_exists(original));
        assert!(!store.cluster_exists(candidate));
        assert_eq!(store.track(track).unwrap().associated_cluster(), Some(original));
        assert_eq!(store.cluster_list("Clusters").unwrap(), &[original]);
        assert_eq!(store.current_cluster_list_name().unwrap(), "Clusters");
    }

    #[test]
    fn reclustering_commits_candidates() {
        let detector = detector();
        let Fixture { mut store, hits } = fixture(4);

        let original = store
            .create_cluster(ClusterSeed::Hits(hits.clone()))
            .unwrap();
        let track = store
            .create_track(track_parameters(CartesianVector::new(10.0, 0.0, 0.1)), &detector, None)
            .unwrap();
        store.save_track_list("Tracks", &[track]).unwrap();
        store.replace_current_track_list("Tracks").unwrap();

        store.begin_reclustering(vec![track], vec![original]).unwrap();

        let candidate_list = store.begin_temporary_cluster_list().unwrap();
        let left = store
            .create_cluster(ClusterSeed::Hits(hits[..2].to_vec()))
            .unwrap();
        let right = store
            .create_cluster(ClusterSeed::Hits(hits[2..].to_vec()))
            .unwrap();

        store.end_reclustering(&candidate_list).unwrap();

        assert!(!store.cluster_exists(original));
        assert!(store.cluster_exists(left));
        assert!(store.cluster_exists(right));
        assert_eq!(store.committed_hit_owner(hits[0]), Some(left));
        assert_eq!(store.committed_hit_owner(hits[3]), Some(right));
        assert_eq!(store.cluster_list("Clusters").unwrap(), &[left, right]);
    }

    #[test]
    fn only_one_reclustering_context_at_a_time() {
        let detector = detector();
        let Fixture { mut store, hits } = fixture(1);

        let cluster = store.create_cluster(ClusterSeed::Hit(hits[0])).unwrap();
        let track = store
            .create_track(track_parameters(CartesianVector::new(10.0, 0.0, 0.1)), &detector, None)
            .unwrap();
        store.save_track_list("Tracks", &[track]).unwrap();
        store.replace_current_track_list("Tracks").unwrap();

        store.begin_reclustering(vec![track], vec![cluster]).unwrap();
        assert!(store.begin_reclustering(vec![track], vec![]).is_err());
        assert!(store.begin_fragmentation(vec![]).is_err());
    }

    #[test]
    fn fragmentation_keeps_fragments() {
        let Fixture { mut store, hits } = fixture(4);

        let original = store
            .create_cluster(ClusterSeed::Hits(hits.clone()))
            .unwrap();

        let (_, fragment_list) = store.begin_fragmentation(vec![original]).unwrap();
        let left = store
            .create_cluster(ClusterSeed::Hits(hits[..2].to_vec()))
            .unwrap();
        let right = store
            .create_cluster(ClusterSeed::Hits(hits[2..].to_vec()))
            .unwrap();

        store.end_fragmentation(&fragment_list).unwrap();

        assert!(!store.cluster_exists(original));
        assert_eq!(store.committed_hit_owner(hits[0]), Some(left));
        assert_eq!(store.committed_hit_owner(hits[2]), Some(right));
        assert_eq!(store.cluster_list("Clusters").unwrap(), &[left, right]);
    }

    #[test]
    fn fragmentation_can_keep_originals() {
        let Fixture { mut store, hits } = fixture(2);

        let original = store
            .create_cluster(ClusterSeed::Hits(hits.clone()))
            .unwrap();

        let (original_list, _) = store.begin_fragmentation(vec![original]).unwrap();
        let fragment = store.create_cluster(ClusterSeed::Hit(hits[0])).unwrap();

        store.end_fragmentation(&original_list).unwrap();

        assert!(store.cluster_exists(original));
        assert!(!store.cluster_exists(fragment));
        assert_eq!(store.committed_hit_owner(hits[0]), Some(original));
    }

    #[test]
    fn empty_pfo_is_rejected() {
        let Fixture { mut store, .. } = fixture(0);
        store.create_pfo_list("Pfos").unwrap();
        store.replace_current_pfo_list("Pfos").unwrap();

        assert!(store
            .create_pfo(PfoParameters {
                particle_id: 22,
                charge: 0,
                mass: 0.0,
                energy: 1.0,
                momentum: CartesianVector::new(1.0, 0.0, 0.0),
                clusters: Vec::new(),
                tracks: Vec::new(),
            })
            .is_err());
    }

    #[test]
    fn track_relation_cycles_are_rejected() {
        let detector = detector();
        let mut store = EventStore::new();

        let a = store
            .create_track(track_parameters(CartesianVector::new(2.0, 0.0, 0.1)), &detector, None)
            .unwrap();
        let b = store
            .create_track(track_parameters(CartesianVector::new(1.7, 0.0, 0.1)), &detector, None)
            .unwrap();

        store.set_track_parent_daughter(a, b).unwrap();
        assert!(store.set_track_parent_daughter(b, a).is_err());
        assert!(store.set_track_parent_daughter(a, a).is_err());
    }
}
