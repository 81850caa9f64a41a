//! The pipeline driver: owns the detector context, the configured stage instances
//! and the per-event lifecycle. Stages are composed declaratively; a failing stage
//! aborts the event, rolling back any open reclustering context and the current-list
//! designations.

use super::algorithm::{Algorithm, AlgorithmPool, AlgorithmRegistry, EventContext, StageBuilder};
use super::backscattered_tracks::BackscatteredTracksAlgorithm;
use super::broken_tracks::BrokenTracksAlgorithm;
use super::cone_based_merging::ConeBasedMergingAlgorithm;
use super::cone_clustering::ConeClusteringAlgorithm;
use super::config::Config;
use super::error::{Error, Result};
use super::event_preparation::EventPreparationAlgorithm;
use super::fragment_removal::{FragmentRemovalAlgorithm, FragmentRemovalParentAlgorithm};
use super::geometry::Detector;
use super::hit::{CaloHitParameters, HitId, McId};
use super::isolated_hit_merging::IsolatedHitMergingAlgorithm;
use super::kink_pfo::KinkPfoCreationAlgorithm;
use super::looping_tracks::LoopingTracksAlgorithm;
use super::mc::McParticleParameters;
use super::mip_photon_separation::MipPhotonSeparationAlgorithm;
use super::muon_cluster_association::MuonClusterAssociationAlgorithm;
use super::muon_reconstruction::MuonReconstructionAlgorithm;
use super::pfo_construction::{
    ClusterPreparationAlgorithm, PfoConstructionAlgorithm, PfoCreationAlgorithm,
    TrackPreparationAlgorithm,
};
use super::primary_clustering::PrimaryClusteringAlgorithm;
use super::proximity_based_merging::ProximityBasedMergingAlgorithm;
use super::reclustering::{ReclusteringAlgorithm, ResolveTrackAssociationsAlgorithm};
use super::shower_mip_merging::ShowerMipMergingAlgorithm;
use super::soft_cluster_merging::SoftClusterMergingAlgorithm;
use super::store::EventStore;
use super::topological::TopologicalAssociationAlgorithm;
use super::track::TrackParameters;
use super::track_cluster_association::TrackClusterAssociationAlgorithm;
use super::v0_pfo::V0PfoCreationAlgorithm;
use super::vector::CartesianVector;

/// The default per-event stage sequence.
const DEFAULT_PIPELINE: &str = "
pipeline:
  - type: EventPreparation
  - type: MuonReconstruction
  - type: PrimaryClustering
  - type: TopologicalAssociation
  - type: TrackClusterAssociation
  - type: Reclustering
  - type: PfoConstruction
";

/// Build a registry holding every built-in stage type.
///
/// # Errors
///
/// Returns [`Error::NotAllowed`] only if a type name were registered twice, which
/// would be an internal inconsistency.
pub fn built_in_registry() -> Result<AlgorithmRegistry> {
    let mut registry = AlgorithmRegistry::new();

    registry.register("EventPreparation", || {
        Box::<EventPreparationAlgorithm>::default()
    })?;
    registry.register("MuonReconstruction", || {
        Box::<MuonReconstructionAlgorithm>::default()
    })?;
    registry.register("PrimaryClustering", || {
        Box::<PrimaryClusteringAlgorithm>::default()
    })?;
    registry.register("ConeClustering", || Box::new(ConeClusteringAlgorithm::outward()))?;
    registry.register("InwardConeClustering", || {
        Box::new(ConeClusteringAlgorithm::inward())
    })?;
    registry.register("TopologicalAssociation", || {
        Box::<TopologicalAssociationAlgorithm>::default()
    })?;
    registry.register("ShowerMipMerging", || Box::new(ShowerMipMergingAlgorithm::variant(1)))?;
    registry.register("ShowerMipMerging2", || Box::new(ShowerMipMergingAlgorithm::variant(2)))?;
    registry.register("ShowerMipMerging3", || Box::new(ShowerMipMergingAlgorithm::variant(3)))?;
    registry.register("ShowerMipMerging4", || Box::new(ShowerMipMergingAlgorithm::variant(4)))?;
    registry.register("BrokenTracks", || Box::<BrokenTracksAlgorithm>::default())?;
    registry.register("LoopingTracks", || Box::<LoopingTracksAlgorithm>::default())?;
    registry.register("BackscatteredTracks", || {
        Box::<BackscatteredTracksAlgorithm>::default()
    })?;
    registry.register("ConeBasedMerging", || Box::<ConeBasedMergingAlgorithm>::default())?;
    registry.register("SoftClusterMerging", || Box::<SoftClusterMergingAlgorithm>::default())?;
    registry.register("IsolatedHitMerging", || Box::<IsolatedHitMergingAlgorithm>::default())?;
    registry.register("ProximityBasedMerging", || {
        Box::<ProximityBasedMergingAlgorithm>::default()
    })?;
    registry.register("MipPhotonSeparation", || {
        Box::new(MipPhotonSeparationAlgorithm::standard())
    })?;
    registry.register("MuonPhotonSeparation", || {
        Box::new(MipPhotonSeparationAlgorithm::muon())
    })?;
    registry.register("MuonClusterAssociation", || {
        Box::<MuonClusterAssociationAlgorithm>::default()
    })?;
    registry.register("TrackClusterAssociation", || {
        Box::<TrackClusterAssociationAlgorithm>::default()
    })?;
    registry.register("Reclustering", || Box::<ReclusteringAlgorithm>::default())?;
    registry.register("ResolveTrackAssociations", || {
        Box::<ResolveTrackAssociationsAlgorithm>::default()
    })?;
    registry.register("FragmentRemoval", || {
        Box::<FragmentRemovalParentAlgorithm>::default()
    })?;
    registry.register("MainFragmentRemoval", || Box::new(FragmentRemovalAlgorithm::main()))?;
    registry.register("NeutralFragmentRemoval", || {
        Box::new(FragmentRemovalAlgorithm::neutral())
    })?;
    registry.register("PhotonFragmentRemoval", || {
        Box::new(FragmentRemovalAlgorithm::photon())
    })?;
    registry.register("PfoConstruction", || Box::<PfoConstructionAlgorithm>::default())?;
    registry.register("TrackPreparation", || Box::<TrackPreparationAlgorithm>::default())?;
    registry.register("ClusterPreparation", || {
        Box::<ClusterPreparationAlgorithm>::default()
    })?;
    registry.register("PfoCreation", || Box::<PfoCreationAlgorithm>::default())?;
    registry.register("KinkPfoCreation", || Box::<KinkPfoCreationAlgorithm>::default())?;
    registry.register("V0PfoCreation", || Box::<V0PfoCreationAlgorithm>::default())?;

    Ok(registry)
}

/// One calo hit of the event input, with an optional truth link by index into the
/// input MC particles.
#[derive(Clone, Debug)]
pub struct CaloHitInput {
    /// The hit payload.
    pub parameters: CaloHitParameters,
    /// Index of the matching MC particle, if any.
    pub mc_particle_index: Option<usize>,
}

impl From<CaloHitParameters> for CaloHitInput {
    fn from(parameters: CaloHitParameters) -> Self {
        Self {
            parameters,
            mc_particle_index: None,
        }
    }
}

/// One track of the event input, with an optional truth link by index into the input
/// MC particles.
#[derive(Clone, Debug)]
pub struct TrackInput {
    /// The track payload.
    pub parameters: TrackParameters,
    /// Index of the matching MC particle, if any.
    pub mc_particle_index: Option<usize>,
}

impl From<TrackParameters> for TrackInput {
    fn from(parameters: TrackParameters) -> Self {
        Self {
            parameters,
            mc_particle_index: None,
        }
    }
}

/// The in-memory object graph handed to [`Engine::process_event`]. Relations refer
/// to positions in the respective input vectors.
#[derive(Clone, Debug, Default)]
pub struct EventInput {
    /// Truth particles; may be empty, the pipeline never requires MC.
    pub mc_particles: Vec<McParticleParameters>,
    /// Truth (parent, daughter) relations.
    pub mc_relations: Vec<(usize, usize)>,
    /// Calorimeter and muon-yoke hits.
    pub calo_hits: Vec<CaloHitInput>,
    /// Reconstructed tracks.
    pub tracks: Vec<TrackInput>,
    /// Track (parent, daughter) relations.
    pub track_parent_daughter_relations: Vec<(usize, usize)>,
    /// Track sibling relations.
    pub track_sibling_relations: Vec<(usize, usize)>,
}

/// Output view of one particle flow object, decoupled from the object store. Hits
/// are reported by their opaque parent addresses so that callers can map back into
/// their own event model.
#[derive(Clone, Debug, PartialEq)]
pub struct PfoSummary {
    /// PDG particle id.
    pub particle_id: i32,
    /// Charge, in units of e.
    pub charge: i32,
    /// Mass, in GeV.
    pub mass: f64,
    /// Energy, in GeV.
    pub energy: f64,
    /// Momentum, in GeV.
    pub momentum: CartesianVector,
    /// Per constituent cluster: the sorted parent addresses of its hits.
    pub clusters: Vec<Vec<u64>>,
    /// Opaque ids of the constituent tracks.
    pub track_uids: Vec<u64>,
}

/// The reconstructed event.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EventOutput {
    /// The particle flow objects, in creation order.
    pub pfos: Vec<PfoSummary>,
}

/// Builder assembling an [`Engine`]: detector, stage registry (built-ins plus
/// user-defined factories) and the pipeline configuration.
pub struct EngineBuilder {
    registry: AlgorithmRegistry,
    detector: Detector,
    config_text: Option<String>,
}

impl EngineBuilder {
    /// Start a builder around an initialised detector.
    ///
    /// # Errors
    ///
    /// Propagates registry construction failures.
    pub fn new(detector: Detector) -> Result<Self> {
        Ok(Self {
            registry: built_in_registry()?,
            detector,
            config_text: None,
        })
    }

    /// Register a user-defined stage type. Must happen before [`Self::build`]; the
    /// registry is sealed once event processing begins.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotAllowed`] for a duplicate type name.
    pub fn register_algorithm(
        &mut self,
        type_name: &str,
        factory: impl Fn() -> Box<dyn Algorithm> + 'static,
    ) -> Result<()> {
        self.registry.register(type_name, factory)
    }

    /// Use the given YAML pipeline configuration instead of the default one.
    #[must_use]
    pub fn with_configuration(mut self, yaml: &str) -> Self {
        self.config_text = Some(yaml.to_owned());
        self
    }

    /// Instantiate and configure every pipeline stage and seal the engine.
    ///
    /// # Errors
    ///
    /// Propagates configuration parsing and stage setup failures.
    pub fn build(self) -> Result<Engine> {
        let config = match &self.config_text {
            Some(text) => Config::from_yaml_str(text)?,
            None => Config::from_yaml_str(DEFAULT_PIPELINE)?,
        };

        let mut pool = AlgorithmPool::new();
        let mut stage_builder = StageBuilder::new(&self.registry, &mut pool);

        let mut pipeline = Vec::new();
        for node in config.children("pipeline") {
            pipeline.push(stage_builder.create_stage(&node)?);
        }

        if pipeline.is_empty() {
            return Err(Error::InvalidParameter(
                "configuration declares no pipeline stages".to_owned(),
            ));
        }

        pool.initialize_all(&self.detector)?;

        Ok(Engine {
            detector: self.detector,
            pool,
            pipeline,
        })
    }
}

/// A configured reconstruction engine. One engine instance processes events
/// sequentially; independent instances share nothing and may run in parallel.
pub struct Engine {
    detector: Detector,
    pool: AlgorithmPool,
    pipeline: Vec<String>,
}

impl Engine {
    /// Start building an engine around an initialised detector.
    ///
    /// # Errors
    ///
    /// Propagates registry construction failures.
    pub fn builder(detector: Detector) -> Result<EngineBuilder> {
        EngineBuilder::new(detector)
    }

    /// The detector context.
    #[must_use]
    pub const fn detector(&self) -> &Detector {
        &self.detector
    }

    fn check_index(index: usize, len: usize, what: &str) -> Result<()> {
        if index >= len {
            return Err(Error::InvalidParameter(format!(
                "{what} relation index {index} out of range ({len} entries)"
            )));
        }

        Ok(())
    }

    fn populate_store(&self, input: &EventInput, store: &mut EventStore) -> Result<()> {
        let mc_ids: Vec<McId> = input
            .mc_particles
            .iter()
            .map(|parameters| store.create_mc_particle(parameters.clone()))
            .collect();

        for (parent, daughter) in &input.mc_relations {
            Self::check_index(*parent, mc_ids.len(), "mc")?;
            Self::check_index(*daughter, mc_ids.len(), "mc")?;
            store.set_mc_parent_daughter(mc_ids[*parent], mc_ids[*daughter])?;
        }

        let mut hit_ids: Vec<HitId> = Vec::with_capacity(input.calo_hits.len());
        for hit in &input.calo_hits {
            let mc_particle = match hit.mc_particle_index {
                Some(index) => {
                    Self::check_index(index, mc_ids.len(), "hit mc")?;
                    Some(mc_ids[index])
                }
                None => None,
            };
            hit_ids.push(store.create_calo_hit(
                hit.parameters.clone(),
                &self.detector,
                mc_particle,
            )?);
        }

        store.create_hit_list("Input", hit_ids)?;
        store.replace_current_hit_list("Input")?;

        let mut track_ids = Vec::with_capacity(input.tracks.len());
        for track in &input.tracks {
            let mc_particle = match track.mc_particle_index {
                Some(index) => {
                    Self::check_index(index, mc_ids.len(), "track mc")?;
                    Some(mc_ids[index])
                }
                None => None,
            };
            track_ids.push(store.create_track(
                track.parameters.clone(),
                &self.detector,
                mc_particle,
            )?);
        }

        for (parent, daughter) in &input.track_parent_daughter_relations {
            Self::check_index(*parent, track_ids.len(), "track")?;
            Self::check_index(*daughter, track_ids.len(), "track")?;
            store.set_track_parent_daughter(track_ids[*parent], track_ids[*daughter])?;
        }

        for (lhs, rhs) in &input.track_sibling_relations {
            Self::check_index(*lhs, track_ids.len(), "track")?;
            Self::check_index(*rhs, track_ids.len(), "track")?;
            store.set_track_siblings(track_ids[*lhs], track_ids[*rhs])?;
        }

        store.save_track_list("InputTracks", &track_ids)?;
        store.replace_current_track_list("InputTracks")?;

        store.create_pfo_list("Pfos")?;
        store.replace_current_pfo_list("Pfos")?;

        Ok(())
    }

    fn collect_output(store: &EventStore) -> Result<EventOutput> {
        let mut pfos = Vec::new();

        for pfo_id in store.current_pfo_ids()? {
            let pfo = store.pfo(pfo_id)?;

            let mut clusters = Vec::with_capacity(pfo.clusters().len());
            for cluster_id in pfo.clusters() {
                let cluster = store.cluster(*cluster_id)?;
                let mut addresses = Vec::with_capacity(cluster.n_calo_hits());

                for (_, hit_id) in cluster.ordered_hits().hits() {
                    addresses.push(store.hit(hit_id)?.parent_address());
                }
                for hit_id in cluster.isolated_hits() {
                    addresses.push(store.hit(*hit_id)?.parent_address());
                }

                addresses.sort_unstable();
                clusters.push(addresses);
            }

            let mut track_uids = Vec::with_capacity(pfo.tracks().len());
            for track_id in pfo.tracks() {
                track_uids.push(store.track(*track_id)?.uid());
            }

            pfos.push(PfoSummary {
                particle_id: pfo.particle_id(),
                charge: pfo.charge(),
                mass: pfo.mass(),
                energy: pfo.energy(),
                momentum: *pfo.momentum(),
                clusters,
                track_uids,
            });
        }

        Ok(EventOutput { pfos })
    }

    /// Run the pipeline over one event. Any stage failure aborts the event: open
    /// reclustering contexts roll back, the list designations are restored, and the
    /// error is surfaced.
    ///
    /// # Errors
    ///
    /// Propagates the first failing stage.
    pub fn process_event(&mut self, input: &EventInput) -> Result<EventOutput> {
        let mut store = EventStore::new();
        self.populate_store(input, &mut store)?;

        for stage in &self.pipeline {
            let snapshot = store.designations();
            let mut context = EventContext::new(&mut store, &self.detector, &mut self.pool);

            if let Err(error) = context.run_stage(stage) {
                log::error!("stage {stage} failed, aborting event: {error}");

                if let Err(rollback_error) = store.abort_reclustering() {
                    log::error!("reclustering rollback also failed: {rollback_error}");
                }

                store.restore_designations(snapshot);
                return Err(error);
            }
        }

        Self::collect_output(&store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config as StageConfig;
    use crate::testing;

    #[test]
    fn default_pipeline_builds() {
        let engine = Engine::builder(testing::toy_detector()).unwrap().build().unwrap();
        assert_eq!(engine.pipeline.len(), 7);
    }

    #[test]
    fn empty_event_yields_no_pfos() {
        let mut engine = Engine::builder(testing::toy_detector()).unwrap().build().unwrap();
        let output = engine.process_event(&EventInput::default()).unwrap();
        assert!(output.pfos.is_empty());
    }

    #[test]
    fn user_defined_stage_types_are_accepted() {
        struct NoOpAlgorithm;

        impl Algorithm for NoOpAlgorithm {
            fn read_settings(
                &mut self,
                _: &StageConfig,
                _: &mut StageBuilder<'_>,
            ) -> crate::error::Result<()> {
                Ok(())
            }

            fn run(&mut self, _: &mut EventContext<'_>) -> crate::error::Result<()> {
                Ok(())
            }
        }

        let mut builder = Engine::builder(testing::toy_detector()).unwrap();
        builder.register_algorithm("NoOp", || Box::new(NoOpAlgorithm)).unwrap();

        // a second registration under the same name must fail
        assert!(builder.register_algorithm("NoOp", || Box::new(NoOpAlgorithm)).is_err());

        let mut engine = builder
            .with_configuration("pipeline:\n  - type: NoOp\n")
            .build()
            .unwrap();
        let output = engine.process_event(&EventInput::default()).unwrap();
        assert!(output.pfos.is_empty());
    }

    #[test]
    fn unknown_stage_type_fails_to_build() {
        let builder = Engine::builder(testing::toy_detector()).unwrap();
        assert!(builder
            .with_configuration("pipeline:\n  - type: DoesNotExist\n")
            .build()
            .is_err());
    }
}
