//! End-to-end reconstruction of single-particle and two-particle events through the
//! default pipeline.

mod common;

use common::{charged_track, em_shower_hits, hadron_shower_hits, toy_detector};
use pflow::engine::{Engine, EventInput};
use pflow::vector::CartesianVector;
use rand::Rng;
use rand_pcg::Pcg64;

fn engine() -> Engine {
    Engine::builder(toy_detector())
        .expect("registry builds")
        .build()
        .expect("default pipeline builds")
}

#[test]
fn single_photon_gives_one_photon_pfo() {
    let mut input = EventInput::default();
    input.calo_hits = em_shower_hits(0.0, 10.0, 0)
        .into_iter()
        .map(Into::into)
        .collect();

    let output = engine().process_event(&input).unwrap();

    assert_eq!(output.pfos.len(), 1, "expected exactly one pfo");
    let photon = &output.pfos[0];

    assert_eq!(photon.particle_id, 22);
    assert_eq!(photon.charge, 0);
    assert_eq!(photon.clusters.len(), 1);
    assert!(photon.track_uids.is_empty());
    assert!(
        (photon.energy - 10.0).abs() < 1.0,
        "photon energy {} not within 10% of 10 GeV",
        photon.energy
    );
}

#[test]
fn single_charged_pion_gives_one_charged_pfo() {
    let mut input = EventInput::default();
    input.calo_hits = hadron_shower_hits(20, 10.0, 0)
        .into_iter()
        .map(Into::into)
        .collect();
    input.tracks = vec![charged_track(
        CartesianVector::new(1500.0, 0.0, 0.0),
        CartesianVector::new(10.0, 0.0, 0.0),
        1,
        211,
        77,
    )
    .into()];

    let output = engine().process_event(&input).unwrap();

    assert_eq!(output.pfos.len(), 1, "expected exactly one pfo");
    let pion = &output.pfos[0];

    assert_eq!(pion.particle_id.abs(), 211);
    assert_eq!(pion.charge, 1);
    assert_eq!(pion.clusters.len(), 1);
    assert_eq!(pion.track_uids, vec![77]);
    assert!(
        (pion.energy - 10.0).abs() < 0.1,
        "charged energy {} should follow the track",
        pion.energy
    );
}

#[test]
fn two_separated_showers_stay_two_pfos() {
    // two 20 GeV electromagnetic showers, ten degrees apart
    let mut input = EventInput::default();
    let mut hits = em_shower_hits(0.0, 20.0, 0);
    hits.extend(em_shower_hits(10.0_f64.to_radians(), 20.0, 1000));
    input.calo_hits = hits.into_iter().map(Into::into).collect();

    let output = engine().process_event(&input).unwrap();

    assert_eq!(output.pfos.len(), 2, "the cone merging stage must not join them");

    for pfo in &output.pfos {
        assert_eq!(pfo.charge, 0);
        assert_eq!(pfo.clusters.len(), 1);
        assert!((pfo.energy - 20.0).abs() < 2.0, "pfo energy {}", pfo.energy);
    }
}

#[test]
fn soft_fragment_is_absorbed_into_charged_pfo() {
    // a 5 GeV track matched by a 5 GeV shower, plus a 0.3 GeV orphan neighbour
    let mut input = EventInput::default();
    let mut hits = hadron_shower_hits(20, 5.0, 0);

    for layer in 3..6_u32 {
        let radius = 5.0_f64.mul_add(f64::from(layer), 1500.0);

        for (i, offset) in [35.0, 39.0].into_iter().enumerate() {
            let mut parameters = common::ecal_hit(
                CartesianVector::new(radius, offset, 0.0),
                0.05,
                500 + 2 * u64::from(layer) + i as u64,
            );
            parameters.electromagnetic_energy = 0.01;
            hits.push(parameters);
        }
    }

    input.calo_hits = hits.into_iter().map(Into::into).collect();
    input.tracks = vec![charged_track(
        CartesianVector::new(1500.0, 0.0, 0.0),
        CartesianVector::new(5.0, 0.0, 0.0),
        1,
        211,
        5,
    )
    .into()];

    let output = engine().process_event(&input).unwrap();

    assert_eq!(output.pfos.len(), 1, "the orphan must not survive as its own pfo");
    let pion = &output.pfos[0];

    assert_eq!(pion.charge, 1);
    assert_eq!(pion.track_uids, vec![5]);
    assert!(
        (pion.energy - 5.0).abs() < 0.1,
        "charged energy {} should follow the track",
        pion.energy
    );

    // every hit, orphan included, ended up inside the single charged pfo
    let n_hits: usize = pion.clusters.iter().map(Vec::len).sum();
    assert_eq!(n_hits, 86);
}

#[test]
fn reconstruction_is_deterministic() {
    // jittered two-shower event, identical for both runs thanks to the fixed seed
    let build_input = || {
        let mut rng = Pcg64::new(0xcafef00dd15ea5e5, 0xa02bdbf7bb3c0a7);
        let mut input = EventInput::default();

        let mut hits = em_shower_hits(0.0, 12.0, 0);
        hits.extend(em_shower_hits(0.3, 8.0, 1000));

        for parameters in &mut hits {
            let jitter: f64 = rng.gen_range(-1.0..1.0);
            parameters.position.z += jitter;
        }

        input.calo_hits = hits.into_iter().map(Into::into).collect();
        input.tracks = vec![charged_track(
            CartesianVector::new(1500.0, 0.0, 0.0),
            CartesianVector::new(11.9, 0.0, 0.0),
            1,
            211,
            9,
        )
        .into()];
        input
    };

    let first = engine().process_event(&build_input()).unwrap();
    let second = engine().process_event(&build_input()).unwrap();

    assert_eq!(first, second);
    assert!(!first.pfos.is_empty());
}
