//! PFO construction: final track and cluster preparation followed by the assembly of
//! charged and neutral particle flow objects.

use super::algorithm::{Algorithm, EventContext, StageBuilder};
use super::config::Config;
use super::error::Result;
use super::particle_id::{self, PhotonIdSettings};
use super::pfo::PfoParameters;
use super::pids;
use super::track::TrackId;
use super::vector::CartesianVector;

/// Parent stage: runs track preparation, fragment removal, cluster preparation, PFO
/// creation and the decay-topology stages, in order.
#[derive(Default)]
pub struct PfoConstructionAlgorithm {
    stage_names: Vec<String>,
}

impl PfoConstructionAlgorithm {
    /// The default child sequence.
    pub const DEFAULT_STAGES: [&'static str; 6] = [
        "TrackPreparation",
        "FragmentRemoval",
        "ClusterPreparation",
        "PfoCreation",
        "KinkPfoCreation",
        "V0PfoCreation",
    ];
}

impl Algorithm for PfoConstructionAlgorithm {
    fn read_settings(&mut self, config: &Config, builder: &mut StageBuilder<'_>) -> Result<()> {
        self.stage_names = builder.create_stage_list(config, "pfoConstructionAlgorithms")?;

        if self.stage_names.is_empty() {
            for stage in Self::DEFAULT_STAGES {
                self.stage_names
                    .push(builder.create_stage(&Config::from_yaml_str(&format!("type: {stage}"))?)?);
            }
        }

        Ok(())
    }

    fn run(&mut self, context: &mut EventContext<'_>) -> Result<()> {
        for name in &self.stage_names {
            context.run_stage(name)?;
        }

        Ok(())
    }
}

/// Finalises the track-cluster associations before PFO assembly.
#[derive(Default)]
pub struct TrackPreparationAlgorithm {
    track_association_name: Option<String>,
}

impl Algorithm for TrackPreparationAlgorithm {
    fn read_settings(&mut self, config: &Config, builder: &mut StageBuilder<'_>) -> Result<()> {
        self.track_association_name = match builder
            .create_optional_stage(config, "TrackClusterAssociation")?
        {
            Some(name) => Some(name),
            None => Some(builder.create_stage(&Config::from_yaml_str("type: TrackClusterAssociation")?)?),
        };

        Ok(())
    }

    fn run(&mut self, context: &mut EventContext<'_>) -> Result<()> {
        if let Some(name) = self.track_association_name.clone() {
            context.run_stage(&name)?;
        }

        Ok(())
    }
}

/// Prepares clusters for PFO assembly: saves the surviving candidates under the
/// final list name and applies the fast photon id.
pub struct ClusterPreparationAlgorithm {
    final_cluster_list_name: String,
    should_perform_photon_id: bool,
    photon_id: PhotonIdSettings,
}

impl Default for ClusterPreparationAlgorithm {
    fn default() -> Self {
        Self {
            final_cluster_list_name: "PfoClusters".to_owned(),
            should_perform_photon_id: true,
            photon_id: PhotonIdSettings::default(),
        }
    }
}

impl Algorithm for ClusterPreparationAlgorithm {
    fn read_settings(&mut self, config: &Config, _: &mut StageBuilder<'_>) -> Result<()> {
        self.final_cluster_list_name =
            config.read_or("FinalClusterListName", self.final_cluster_list_name.clone())?;
        self.should_perform_photon_id =
            config.read_or("ShouldPerformPhotonId", self.should_perform_photon_id)?;
        self.photon_id.min_calo_hits =
            config.read_or("PhotonIdMinCaloHits", self.photon_id.min_calo_hits)?;
        self.photon_id.max_inner_layer =
            config.read_or("PhotonIdMaxInnerLayer", self.photon_id.max_inner_layer)?;
        self.photon_id.min_electromagnetic_energy = config.read_or(
            "PhotonIdMinElectromagneticEnergy",
            self.photon_id.min_electromagnetic_energy,
        )?;
        self.photon_id.max_mip_fraction =
            config.read_or("PhotonIdMaxMipFraction", self.photon_id.max_mip_fraction)?;
        self.photon_id.min_radial_direction_cosine = config.read_or(
            "PhotonIdMinRadialDirectionCosine",
            self.photon_id.min_radial_direction_cosine,
        )?;
        self.photon_id.max_profile_start =
            config.read_or("PhotonIdMaxProfileStart", self.photon_id.max_profile_start)?;
        self.photon_id.max_profile_discrepancy = config.read_or(
            "PhotonIdMaxProfileDiscrepancy",
            self.photon_id.max_profile_discrepancy,
        )?;
        Ok(())
    }

    fn run(&mut self, context: &mut EventContext<'_>) -> Result<()> {
        context.store.save_cluster_list(&self.final_cluster_list_name)?;
        context.store.replace_current_cluster_list(&self.final_cluster_list_name)?;

        if self.should_perform_photon_id {
            for cluster_id in context.store.current_cluster_ids()? {
                let tag = particle_id::is_photon(context.store, cluster_id, &self.photon_id)?;
                context.store.cluster_mut(cluster_id)?.set_photon_tag(tag);
            }
        }

        Ok(())
    }
}

/// Assembles the particle flow objects: one charged PFO per track family, one
/// neutral PFO per surviving trackless cluster above threshold.
pub struct PfoCreationAlgorithm {
    min_photon_energy: f64,
    min_neutral_hadron_energy: f64,
}

impl Default for PfoCreationAlgorithm {
    fn default() -> Self {
        Self {
            min_photon_energy: 0.1,
            min_neutral_hadron_energy: 0.25,
        }
    }
}

impl PfoCreationAlgorithm {
    fn create_charged_pfos(context: &mut EventContext<'_>) -> Result<()> {
        for track_id in context.store.current_track_ids()? {
            let track = context.store.track(track_id)?;

            if !track.can_form_pfo() {
                continue;
            }

            // siblings share one pfo, created when the lowest id is reached
            let siblings = track.siblings().to_vec();

            if siblings.iter().any(|sibling| *sibling < track_id) {
                continue;
            }

            let mut family: Vec<TrackId> = vec![track_id];
            family.extend_from_slice(&siblings);

            // a kink parent lends the pfo its kinematics; co-daughters of that
            // parent join the same pfo, built once at the lowest daughter id
            let parent_track = track.parents().first().copied();
            let kinematics_track = if let Some(parent) = parent_track {
                let co_daughters = context.store.track(parent)?.daughters().to_vec();

                if co_daughters.iter().any(|daughter| *daughter < track_id) {
                    continue;
                }

                for daughter in co_daughters {
                    if !family.contains(&daughter) {
                        family.push(daughter);
                    }
                }

                family.push(parent);
                parent
            } else {
                track_id
            };

            let mut energy = 0.0;
            let mut momentum = CartesianVector::default();
            let mut charge = 0;

            if parent_track.is_some() {
                let source = context.store.track(kinematics_track)?;
                energy = source.energy_at_dca();
                momentum = *source.momentum_at_dca();
                charge = source.charge();
            } else {
                for member in &family {
                    let member_track = context.store.track(*member)?;
                    energy += member_track.energy_at_dca();
                    momentum += *member_track.momentum_at_dca();
                    charge += member_track.charge();
                }
            }

            let mut clusters = Vec::new();
            for member in &family {
                if let Some(cluster_id) = context.store.track(*member)?.associated_cluster() {
                    if !clusters.contains(&cluster_id) {
                        clusters.push(cluster_id);
                    }
                }
            }

            let source = context.store.track(kinematics_track)?;
            let particle_id = if source.particle_id() != 0 {
                source.particle_id()
            } else if charge >= 0 {
                pids::PI_PLUS
            } else {
                pids::PI_MINUS
            };
            let mass = source.mass();

            context.store.create_pfo(PfoParameters {
                particle_id,
                charge,
                mass,
                energy,
                momentum,
                clusters,
                tracks: family,
            })?;
        }

        Ok(())
    }

    fn create_neutral_pfos(&self, context: &mut EventContext<'_>) -> Result<()> {
        for cluster_id in context.store.current_cluster_ids()? {
            let cluster = context.store.cluster(cluster_id)?;

            if !cluster.associated_tracks().is_empty() {
                continue;
            }

            let is_photon = cluster.is_photon();
            let energy = if is_photon {
                cluster.electromagnetic_energy()
            } else {
                cluster.hadronic_energy()
            };

            let threshold = if is_photon {
                self.min_photon_energy
            } else {
                self.min_neutral_hadron_energy
            };

            if energy < threshold {
                continue;
            }

            let (particle_id, mass) = if is_photon {
                (pids::PHOTON, 0.0)
            } else {
                (pids::NEUTRON, pids::particle_mass(pids::NEUTRON).unwrap_or(0.0))
            };

            let direction = match context.store.fit_to_all_hits(cluster_id) {
                Ok(fit) if fit.is_successful() => fit.direction()?,
                _ => context.store.cluster(cluster_id)?.initial_direction()?,
            };

            let momentum_magnitude = energy.mul_add(energy, -(mass * mass)).max(0.0).sqrt();

            context.store.create_pfo(PfoParameters {
                particle_id,
                charge: 0,
                mass,
                energy,
                momentum: direction * momentum_magnitude,
                clusters: vec![cluster_id],
                tracks: Vec::new(),
            })?;
        }

        Ok(())
    }
}

impl Algorithm for PfoCreationAlgorithm {
    fn read_settings(&mut self, config: &Config, _: &mut StageBuilder<'_>) -> Result<()> {
        self.min_photon_energy = config.read_or("MinPhotonEnergy", self.min_photon_energy)?;
        self.min_neutral_hadron_energy =
            config.read_or("MinNeutralHadronEnergy", self.min_neutral_hadron_energy)?;
        Ok(())
    }

    fn run(&mut self, context: &mut EventContext<'_>) -> Result<()> {
        Self::create_charged_pfos(context)?;
        self.create_neutral_pfos(context)?;

        log::debug!("pfo creation: {} pfos", context.store.current_pfo_ids()?.len());

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::AlgorithmPool;
    use crate::store::{ClusterSeed, EventStore};
    use crate::testing;

    fn shower_cluster(
        store: &mut EventStore,
        detector: &crate::geometry::Detector,
        energy_per_hit: f64,
    ) -> crate::cluster::ClusterId {
        let hits: Vec<_> = (0..10_u32)
            .flat_map(|layer| {
                [-5.0, 5.0].map(|offset| {
                    store
                        .create_calo_hit(
                            testing::ecal_hit(
                                CartesianVector::new(
                                    5.0_f64.mul_add(f64::from(layer), 1500.0),
                                    offset,
                                    0.0,
                                ),
                                energy_per_hit,
                            ),
                            detector,
                            None,
                        )
                        .unwrap()
                })
            })
            .collect();

        store.create_cluster(ClusterSeed::Hits(hits)).unwrap()
    }

    #[test]
    fn charged_and_neutral_pfos_are_assembled() {
        let detector = testing::toy_detector();
        let mut store = EventStore::new();
        store.create_cluster_list("Clusters").unwrap();
        store.replace_current_cluster_list("Clusters").unwrap();
        store.create_pfo_list("Pfos").unwrap();
        store.replace_current_pfo_list("Pfos").unwrap();

        let charged_cluster = shower_cluster(&mut store, &detector, 0.25);
        let neutral_cluster = shower_cluster(&mut store, &detector, 0.1);

        let track = store
            .create_track(
                testing::pion_track(
                    CartesianVector::new(1500.0, 0.0, 0.0),
                    CartesianVector::new(5.0, 0.0, 0.0),
                ),
                &detector,
                None,
            )
            .unwrap();
        store.add_track_cluster_association(track, charged_cluster).unwrap();
        store.save_track_list("Tracks", &[track]).unwrap();
        store.replace_current_track_list("Tracks").unwrap();

        let mut pool = AlgorithmPool::new();
        let mut context = crate::algorithm::EventContext::new(&mut store, &detector, &mut pool);
        PfoCreationAlgorithm::default().run(&mut context).unwrap();

        let pfo_ids = store.current_pfo_ids().unwrap();
        assert_eq!(pfo_ids.len(), 2);

        let charged = store.pfo(pfo_ids[0]).unwrap();
        assert_eq!(charged.charge(), 1);
        assert_eq!(charged.particle_id(), 211);
        assert_eq!(charged.tracks(), &[track]);
        assert_eq!(charged.clusters(), &[charged_cluster]);
        assert!((charged.energy() - 5.0).abs() < 0.1);

        let neutral = store.pfo(pfo_ids[1]).unwrap();
        assert_eq!(neutral.charge(), 0);
        assert_eq!(neutral.clusters(), &[neutral_cluster]);
    }

    #[test]
    fn soft_trackless_cluster_gives_no_pfo() {
        let detector = testing::toy_detector();
        let mut store = EventStore::new();
        store.create_cluster_list("Clusters").unwrap();
        store.replace_current_cluster_list("Clusters").unwrap();
        store.create_pfo_list("Pfos").unwrap();
        store.replace_current_pfo_list("Pfos").unwrap();

        shower_cluster(&mut store, &detector, 0.005);
        store.save_track_list("Tracks", &[]).unwrap();
        store.replace_current_track_list("Tracks").unwrap();

        let mut pool = AlgorithmPool::new();
        let mut context = crate::algorithm::EventContext::new(&mut store, &detector, &mut pool);
        PfoCreationAlgorithm::default().run(&mut context).unwrap();

        assert!(store.current_pfo_ids().unwrap().is_empty());
    }
}
