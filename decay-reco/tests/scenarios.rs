//! End-to-end reconstruction scenarios
//!
//! These tests drive the public API the way an application would: fill lists,
//! assemble decays, match truth, run whole pipelines and check the rows.

use approx::assert_relative_eq;
use decay_reco::assembler::{assemble, DecayPattern};
use decay_reco::cut::Cut;
use decay_reco::filler::{fill, ListFill};
use decay_reco::particles;
use decay_reco::truth;
use decay_reco::{
    Beam, Event, EventRecord, MatchClass, McParticle, MemorySink, Pipeline, PipelineConfig,
    TableConfig, TrackRecord, VariableManager,
};
use std::collections::{BTreeMap, HashSet};

fn track(id: u32, charge: i32, momentum: [f64; 3], mc_index: Option<usize>) -> TrackRecord {
    TrackRecord {
        id,
        charge,
        momentum,
        position: [0.0; 3],
        position_error: 0.01,
        attributes: BTreeMap::from([
            ("pionID".to_string(), 0.9),
            ("kaonID".to_string(), 0.9),
            ("nCDCHits".to_string(), 40.0),
        ]),
        mc_index,
    }
}

fn fill_lists(event: &mut Event, vm: &VariableManager, labels: &[&str]) {
    for label in labels {
        let step = ListFill::new(label, "", vm).unwrap();
        fill(&step, event, vm).unwrap();
    }
}

/// K- at rest and two back-to-back pi+ with the D+ candidate at mass `m`
fn kpipi_event(number: u64, m: f64) -> Event {
    let m_k = particles::lookup("K-").unwrap().mass;
    let m_pi = particles::lookup("pi+").unwrap().mass;
    let e = 0.5 * (m - m_k);
    let q = (e * e - m_pi * m_pi).sqrt();
    let record = EventRecord {
        event: number,
        tracks: vec![
            track(0, -1, [0.0, 0.0, 0.0], None),
            track(1, 1, [q, 0.0, 0.0], None),
            track(2, 1, [-q, 0.0, 0.0], None),
        ],
        ..Default::default()
    };
    Event::from_record(record, Beam::default()).unwrap()
}

#[test]
fn test_duplicate_slot_collapses_to_one_candidate() {
    let vm = VariableManager::new();
    let record = EventRecord {
        event: 1,
        tracks: vec![
            track(0, 1, [0.4, 0.1, 0.0], None),
            track(1, 1, [0.0, 0.5, 0.2], None),
            track(2, -1, [-0.3, 0.0, 0.1], None),
        ],
        ..Default::default()
    };
    let mut event = Event::from_record(record, Beam::default()).unwrap();
    fill_lists(&mut event, &vm, &["pi+", "pi-"]);

    let pattern = DecayPattern::parse("D+ -> pi+ pi- pi+", "", &vm).unwrap();
    let stats = assemble(&pattern, &mut event, &vm).unwrap();

    assert_eq!(stats.accepted, 1);
    assert_eq!(event.store.get("D+").unwrap().len(), 1);
}

#[test]
fn test_mass_window_excludes_and_shrinks_store() {
    let vm = VariableManager::new();
    let window = "1.83965 < M < 1.89965";

    for (m, survivors) in [(1.87, 1), (1.80, 0)] {
        let mut open = kpipi_event(1, m);
        fill_lists(&mut open, &vm, &["K-", "pi+"]);
        let pattern = DecayPattern::parse("D+ -> K- pi+ pi+", "", &vm).unwrap();
        assemble(&pattern, &mut open, &vm).unwrap();
        let d = open.store.get("D+").unwrap()[0];
        assert_relative_eq!(open.store.candidate(d).p4().mass(), m, epsilon = 1e-9);

        let mut cut = kpipi_event(1, m);
        fill_lists(&mut cut, &vm, &["K-", "pi+"]);
        let pattern = DecayPattern::parse("D+ -> K- pi+ pi+", window, &vm).unwrap();
        let stats = assemble(&pattern, &mut cut, &vm).unwrap();

        let excluded = 1 - survivors;
        assert_eq!(cut.store.get("D+").unwrap().len(), survivors);
        assert_eq!(stats.rejected, excluded);
        assert_eq!(cut.store.len(), open.store.len() - excluded);
    }
}

/// D+ -> K- pi+ pi+ in the generated table, one track per generated daughter
fn truth_event(tag_last_pion: bool) -> Event {
    let mc = |pdg: i32, mother: Option<usize>, momentum: [f64; 3]| McParticle {
        pdg,
        mother,
        momentum,
        energy: None,
        production_vertex: [0.0; 3],
    };
    let record = EventRecord {
        event: 4,
        tracks: vec![
            track(0, -1, [0.3, 0.1, 0.2], Some(1)),
            track(1, 1, [-0.2, 0.4, 0.1], Some(2)),
            track(2, 1, [0.1, -0.3, 0.5], if tag_last_pion { Some(3) } else { None }),
        ],
        mc_particles: vec![
            mc(411, None, [0.2, 0.2, 0.8]),
            mc(-321, Some(0), [0.3, 0.1, 0.2]),
            mc(211, Some(0), [-0.2, 0.4, 0.1]),
            mc(211, Some(0), [0.1, -0.3, 0.5]),
        ],
        ..Default::default()
    };
    Event::from_record(record, Beam::default()).unwrap()
}

fn reconstruct_and_match(tag_last_pion: bool) -> MatchClass {
    let vm = VariableManager::new();
    let mut event = truth_event(tag_last_pion);
    fill_lists(&mut event, &vm, &["K-", "pi+"]);
    let pattern = DecayPattern::parse("D+ -> K- pi+ pi+", "", &vm).unwrap();
    assemble(&pattern, &mut event, &vm).unwrap();
    let d = event.store.get("D+").unwrap()[0];
    truth::match_candidate(&mut event, d)
}

#[test]
fn test_truth_exact_then_missing() {
    assert_eq!(reconstruct_and_match(true), MatchClass::Exact);
    assert_eq!(reconstruct_and_match(false), MatchClass::MissingDaughters);
}

#[test]
fn test_truth_monotone_under_lost_origin() {
    let full = reconstruct_and_match(true);
    let partial = reconstruct_and_match(false);
    assert!(partial.quality() <= full.quality());
}

#[test]
fn test_no_shared_leaves_in_assembled_candidates() {
    let vm = VariableManager::new();
    let record = EventRecord {
        event: 9,
        tracks: (0..6)
            .map(|i| {
                let x = 0.1 * (i + 1) as f64;
                track(i, if i % 2 == 0 { 1 } else { -1 }, [x, 0.2 - x, 0.3], None)
            })
            .collect(),
        ..Default::default()
    };
    let mut event = Event::from_record(record, Beam::default()).unwrap();
    fill_lists(&mut event, &vm, &["pi+", "pi-", "K-"]);
    assemble(&DecayPattern::parse("rho0 -> pi+ pi-", "", &vm).unwrap(), &mut event, &vm).unwrap();
    assemble(&DecayPattern::parse("D0 -> K- pi+", "", &vm).unwrap(), &mut event, &vm).unwrap();
    assemble(&DecayPattern::parse("B0 -> D0 rho0", "", &vm).unwrap(), &mut event, &vm).unwrap();

    let b_list = event.store.get("B0").unwrap();
    assert!(!b_list.is_empty());
    for id in b_list {
        let sources = event.store.leaf_sources(*id);
        let unique: HashSet<_> = sources.iter().collect();
        assert_eq!(unique.len(), sources.len(), "{} reuses a track", id);
    }
}

#[test]
fn test_cut_evaluation_is_pure() {
    let vm = VariableManager::new();
    let mut event = kpipi_event(2, 1.87);
    fill_lists(&mut event, &vm, &["K-", "pi+"]);
    assemble(&DecayPattern::parse("D+ -> K- pi+ pi+", "", &vm).unwrap(), &mut event, &vm).unwrap();

    let cut = Cut::compile("1.83965 < M < 1.89965 and abs(charge) == 1", &vm).unwrap();
    let d = event.store.get("D+").unwrap()[0];
    let size = event.store.len();
    let lists = event.store.labels().to_vec();
    let first = cut.passes(&vm, &event, d);
    assert_eq!(cut.passes(&vm, &event, d), first);
    assert!(first);
    assert_eq!(event.store.len(), size);
    assert_eq!(event.store.labels(), lists.as_slice());
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn kpipi_config() -> PipelineConfig {
    init_logging();
    let table = TableConfig::new("D+")
        .with_descriptor("^D+ -> ^K- ^pi+ ^pi+", &["D", "K", "pi1", "pi2"])
        .with_role_variables(&["@kinematics", "charge"])
        .with_variables(&["M", "nDaughters"]);
    PipelineConfig::new(table)
        .with_beam(Beam::symmetric(5.29))
        .fill("K-", "kaonID > 0.6")
        .fill("pi+", "pionID > 0.3")
        .reconstruct("D+ -> K- pi+ pi+", "1.83965 < M < 1.89965")
}

#[test]
fn test_empty_event_produces_no_rows() {
    let pipeline = Pipeline::new(&kpipi_config()).unwrap();
    let m_k = particles::lookup("K-").unwrap().mass;
    let e = 0.5 * (1.87 - m_k);
    let q = (e * e - 0.139_570 * 0.139_570).sqrt();
    let good = EventRecord {
        event: 2,
        tracks: vec![
            track(0, -1, [0.0; 3], None),
            track(1, 1, [q, 0.0, 0.0], None),
            track(2, 1, [-q, 0.0, 0.0], None),
        ],
        ..Default::default()
    };
    let empty = EventRecord { event: 1, ..Default::default() };

    let mut sink = MemorySink::new();
    let stats = pipeline.run(vec![empty, good], &mut sink).unwrap();
    assert_eq!(stats.events, 2);
    assert_eq!(stats.rows, 1);
    assert_eq!(sink.rows.len(), 1);
    assert_eq!(sink.rows[0].event, 2);
}

#[test]
fn test_rows_are_complete_and_deterministic() {
    let pipeline = Pipeline::new(&kpipi_config()).unwrap();
    let records: Vec<EventRecord> = (0..5u32)
        .map(|n| EventRecord {
            event: n as u64,
            tracks: (0..5u32)
                .map(|i| {
                    let a = 0.3 + 0.05 * (i + n) as f64;
                    track(i, if i == 0 { -1 } else { 1 }, [a, -0.5 * a, 0.2 * i as f64], None)
                })
                .collect(),
            ..Default::default()
        })
        .collect();

    let mut first = MemorySink::new();
    let mut second = MemorySink::new();
    pipeline.run(records.clone(), &mut first).unwrap();
    pipeline.run(records, &mut second).unwrap();

    assert_eq!(first.rows, second.rows);
    for row in &first.rows {
        assert_eq!(row.values.len(), pipeline.columns().len());
        assert!(row.candidate < row.n_candidates);
    }
    assert_eq!(first.columns[0], "D_px");
}

#[test]
fn test_pipeline_from_json() {
    init_logging();
    let config: PipelineConfig = serde_json::from_str(
        r#"{
            "beam": {"her_energy": 5.29, "ler_energy": 5.29, "crossing_angle": 0.0},
            "variables": {"aliases": {"D_mass": "M"}},
            "steps": [
                {"kind": "fill", "list": "K-", "cut": "kaonID > 0.6"},
                {"kind": "fill", "list": "pi+", "cut": "pionID > 0.3"},
                {"kind": "reconstruct", "decay": "D+ -> K- pi+ pi+", "cut": "1.83965 < D_mass < 1.89965"},
                {"kind": "match_truth", "list": "D+"},
                {"kind": "rest_of_event", "list": "D+", "masks": [{"name": "clean", "track_cut": "nCDCHits > 0"}]},
                {"kind": "continuum_suppression", "list": "D+", "mask": "clean"}
            ],
            "output": {"list": "D+", "variables": ["D_mass", "isSignal", "roeNTracks", "R2"]}
        }"#,
    )
    .unwrap();
    let pipeline = Pipeline::new(&config).unwrap();
    assert_eq!(pipeline.columns(), &["D_mass", "isSignal", "roeNTracks", "R2"]);

    let m_k = particles::lookup("K-").unwrap().mass;
    let e = 0.5 * (1.87 - m_k);
    let q = (e * e - 0.139_570 * 0.139_570).sqrt();
    let record: EventRecord = serde_json::from_str(&format!(
        r#"{{
            "event": 11,
            "tracks": [
                {{"id": 0, "charge": -1, "momentum": [0.0, 0.0, 0.0], "attributes": {{"kaonID": 0.9, "nCDCHits": 30}}, "mc_index": 1}},
                {{"id": 1, "charge": 1, "momentum": [{q}, 0.0, 0.0], "attributes": {{"pionID": 0.8, "nCDCHits": 30}}, "mc_index": 2}},
                {{"id": 2, "charge": 1, "momentum": [-{q}, 0.0, 0.0], "attributes": {{"pionID": 0.8, "nCDCHits": 30}}, "mc_index": 3}},
                {{"id": 3, "charge": -1, "momentum": [0.1, 0.5, -0.2], "attributes": {{"pionID": 0.8, "nCDCHits": 30}}}}
            ],
            "mc_particles": [
                {{"pdg": 411, "momentum": [0.0, 0.0, 0.0]}},
                {{"pdg": -321, "mother": 0, "momentum": [0.0, 0.0, 0.0]}},
                {{"pdg": 211, "mother": 0, "momentum": [{q}, 0.0, 0.0]}},
                {{"pdg": 211, "mother": 0, "momentum": [-{q}, 0.0, 0.0]}}
            ]
        }}"#,
        q = q
    ))
    .unwrap();

    let output = pipeline.process_event(record).unwrap();
    assert_eq!(output.rows.len(), 1);
    let values = &output.rows[0].values;
    assert_relative_eq!(values[0], 1.87, epsilon = 1e-9);
    assert_eq!(values[1], 1.0);
    assert_eq!(values[2], 1.0);
    assert!(values[3].is_finite());
}
