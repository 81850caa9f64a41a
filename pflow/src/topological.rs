//! Topological association: a stack of independent merge passes over the current
//! cluster list, composed declaratively under this parent stage.

use super::algorithm::{Algorithm, EventContext, StageBuilder};
use super::cluster::ClusterId;
use super::config::Config;
use super::error::Result;
use super::store::EventStore;
use itertools::Itertools;

/// Candidate clusters are examined in (outer layer, hit count, id) order, so that
/// merge sequences are identical on every run.
pub(crate) fn sort_clusters_for_merging(
    store: &EventStore,
    ids: Vec<ClusterId>,
) -> Vec<ClusterId> {
    ids.into_iter()
        .sorted_by_key(|id| {
            store
                .cluster(*id)
                .map(|cluster| (cluster.outer_layer(), cluster.n_calo_hits(), *id))
                .unwrap_or((None, 0, *id))
        })
        .collect()
}

/// Parent stage running the configured association passes in order.
#[derive(Default)]
pub struct TopologicalAssociationAlgorithm {
    pass_names: Vec<String>,
}

impl TopologicalAssociationAlgorithm {
    /// The default pass stack, mirroring the standard reconstruction sequence.
    pub const DEFAULT_PASSES: [&'static str; 10] = [
        "LoopingTracks",
        "BrokenTracks",
        "ShowerMipMerging",
        "ShowerMipMerging2",
        "BackscatteredTracks",
        "ShowerMipMerging3",
        "ShowerMipMerging4",
        "ProximityBasedMerging",
        "ConeBasedMerging",
        "SoftClusterMerging",
    ];
}

impl Algorithm for TopologicalAssociationAlgorithm {
    fn read_settings(&mut self, config: &Config, builder: &mut StageBuilder<'_>) -> Result<()> {
        self.pass_names = builder.create_stage_list(config, "associationAlgorithms")?;

        if self.pass_names.is_empty() {
            for pass in Self::DEFAULT_PASSES {
                self.pass_names
                    .push(builder.create_stage(&Config::from_yaml_str(&format!("type: {pass}"))?)?);
            }
        }

        Ok(())
    }

    fn run(&mut self, context: &mut EventContext<'_>) -> Result<()> {
        for name in &self.pass_names {
            context.run_stage(name)?;
        }

        Ok(())
    }
}
