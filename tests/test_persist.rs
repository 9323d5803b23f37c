mod common;

use std::fs;
use std::sync::Arc;

use xtalsearch::core::candidate::Status;
use xtalsearch::engine::SearchEngine;
use xtalsearch::error::EngineError;
use xtalsearch::interface::prompt::CannedPrompter;
use xtalsearch::persist;

use common::{test_composition, test_config, MockChannelFactory, MockOptimizer};

fn engine_with_population(session: &std::path::Path) -> Arc<SearchEngine> {
    let engine = SearchEngine::new(
        test_config(session),
        test_composition(),
        Arc::new(MockOptimizer::local()),
        Arc::new(CannedPrompter::new(true, vec![])),
        Box::new(MockChannelFactory::new()),
    );
    engine.seed_initial_population().unwrap();
    engine
}

#[test]
fn save_then_load_roundtrips_every_candidate() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_with_population(dir.path());

    // Pretend one candidate finished optimizing so energies are present.
    {
        let s = engine.store().at(0).unwrap();
        let mut c = s.write();
        c.status = Status::Optimized;
        c.energy = Some(-42.5);
        c.enthalpy = Some(-42.25);
        c.pv = Some(0.25);
        c.spacegroup = 225;
    }
    engine.save().unwrap();

    let originals: Vec<_> = engine.store().list().iter().map(|s| s.read().clone()).collect();

    // A reader whose optimizer has no outputs keeps the persisted values.
    let reader = MockOptimizer::new("GULP", 1, false);
    let loaded = persist::load_session(&dir.path().join(persist::SESSION_STATE_FILE), &reader)
        .unwrap();

    assert_eq!(loaded.composition, test_composition());
    assert_eq!(loaded.candidates.len(), originals.len());

    for (a, b) in loaded.candidates.iter().zip(&originals) {
        assert_eq!(a.generation, b.generation);
        assert_eq!(a.id_number, b.id_number);
        assert_eq!(a.index, b.index);
        assert_eq!(a.status, b.status);
        assert_eq!(a.parents, b.parents);
        assert_eq!(a.cell, b.cell);
        assert_eq!(a.energy, b.energy);
        assert_eq!(a.enthalpy, b.enthalpy);
        assert_eq!(a.pv, b.pv);
        assert_eq!(a.atoms.len(), b.atoms.len());
        for (x, y) in a.atoms.iter().zip(&b.atoms) {
            assert_eq!(x.atomic_number, y.atomic_number);
            assert_eq!(x.position, y.position);
        }
    }
}

#[test]
fn saving_keeps_the_previous_state_file() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_with_population(dir.path());

    engine.save().unwrap();
    engine.save().unwrap();

    assert!(dir.path().join("xtalopt.state").exists());
    assert!(dir.path().join("xtalopt.state.old").exists());
    assert!(!dir.path().join("xtalopt.state.tmp").exists());
}

#[test]
fn legacy_state_file_name_still_loads() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_with_population(dir.path());
    engine.save().unwrap();

    // Demote one candidate's state file to the legacy name.
    let s = engine.store().at(2).unwrap();
    let (tag, local_path) = {
        let c = s.read();
        (c.tag(), c.local_path.clone())
    };
    fs::rename(
        local_path.join(persist::STRUCTURE_STATE_FILE),
        local_path.join(persist::LEGACY_STRUCTURE_STATE_FILE),
    )
    .unwrap();

    let reader = MockOptimizer::new("GULP", 1, false);
    let loaded = persist::load_session(&dir.path().join(persist::SESSION_STATE_FILE), &reader)
        .unwrap();

    assert_eq!(loaded.candidates.len(), 3);
    let legacy = loaded
        .candidates
        .iter()
        .find(|c| c.tag() == tag)
        .expect("legacy candidate missing");
    // Indices stay dense after the defensive reassignment.
    let mut indices: Vec<usize> = loaded.candidates.iter().map(|c| c.index).collect();
    indices.sort_unstable();
    assert_eq!(indices, vec![0, 1, 2]);
    assert_eq!(legacy.status, Status::WaitingForOptimization);
}

#[test]
fn incomplete_saves_are_refused() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_with_population(dir.path());
    engine.save().unwrap();

    let path = dir.path().join(persist::SESSION_STATE_FILE);
    let text = fs::read_to_string(&path).unwrap();
    fs::write(&path, text.replace("\"save_successful\": true", "\"save_successful\": false"))
        .unwrap();

    let reader = MockOptimizer::new("GULP", 1, false);
    match persist::load_session(&path, &reader) {
        Err(EngineError::CorruptState(msg)) => assert!(msg.contains("incomplete")),
        other => panic!("expected CorruptState, got {other:?}"),
    }
}

#[test]
fn missing_session_file_is_a_corrupt_state_error() {
    let dir = tempfile::tempdir().unwrap();
    let reader = MockOptimizer::new("GULP", 1, false);
    match persist::load_session(&dir.path().join("xtalopt.state"), &reader) {
        Err(EngineError::CorruptState(_)) => {}
        other => panic!("expected CorruptState, got {other:?}"),
    }
}

#[test]
fn resumed_engines_requeue_waiting_candidates() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_with_population(dir.path());
    engine.save().unwrap();
    drop(engine);

    let resumed = SearchEngine::load(
        &dir.path().join(persist::SESSION_STATE_FILE),
        Arc::new(MockOptimizer::new("GULP", 1, false)),
        Arc::new(CannedPrompter::new(true, vec![])),
        Box::new(MockChannelFactory::new()),
        true,
    )
    .unwrap();

    assert!(resumed.is_read_only());
    assert_eq!(resumed.store().size(), 3);
    assert_eq!(resumed.queue().pending_count(), 3);
}

#[test]
fn candidate_state_written_with_the_new_name_only() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_with_population(dir.path());
    engine.save().unwrap();

    let s = engine.store().at(0).unwrap();
    let local_path = s.read().local_path.clone();
    assert!(local_path.join(persist::STRUCTURE_STATE_FILE).exists());
    assert!(!local_path.join(persist::LEGACY_STRUCTURE_STATE_FILE).exists());
}
