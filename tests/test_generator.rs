mod common;

use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;

use xtalsearch::core::config::{ParamRange, VolumeMode};
use xtalsearch::engine::generator::{
    check_candidate, generate_random_candidate, probability_list, sample_index,
};

use common::{test_composition, test_config};

#[test]
fn probability_list_matches_the_reference_example() {
    let probs = probability_list(&[-5.0, -2.0, -1.0, 3.0, 5.0]);
    assert_eq!(probs.len(), 5);

    // Cumulative list ends at 1 and its leading differences shrink.
    assert!(probs[4] > 0.99);
    assert!((probs[4] - 1.0).abs() < 1e-9);

    let mut diffs = vec![probs[0]];
    for i in 1..4 {
        diffs.push(probs[i] - probs[i - 1]);
    }
    for pair in diffs.windows(2) {
        assert!(pair[0] >= pair[1] - 1e-12, "differences increased: {diffs:?}");
    }
}

#[test]
fn probability_list_handles_degenerate_spreads() {
    let probs = probability_list(&[2.5, 2.5, 2.5]);
    assert_eq!(probs.len(), 3);
    assert!((probs[2] - 1.0).abs() < 1e-9);
    assert!((probs[0] - 1.0 / 3.0).abs() < 1e-9);

    assert_eq!(probability_list(&[]).len(), 0);
    assert_eq!(probability_list(&[1.0]), vec![1.0]);
}

#[test]
fn sampling_returns_an_index_inside_the_list() {
    let probs = probability_list(&[-5.0, -2.0, -1.0, 3.0, 5.0]);
    let mut rng = StdRng::seed_from_u64(17);
    let mut seen_low = false;
    for _ in 0..200 {
        let i = sample_index(&probs, &mut rng);
        assert!(i < probs.len());
        if i == 0 {
            seen_low = true;
        }
    }
    // The lowest-enthalpy entry carries the biggest weight; two hundred
    // draws that never pick it would mean the sampler returns the draw
    // instead of the index.
    assert!(seen_low);
}

proptest! {
    #[test]
    fn probability_list_is_a_cumulative_distribution(
        mut enthalpies in proptest::collection::vec(-1000.0f64..1000.0, 2..20)
    ) {
        enthalpies.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let probs = probability_list(&enthalpies);

        prop_assert_eq!(probs.len(), enthalpies.len());
        prop_assert!(probs[0] >= 0.0);
        for pair in probs.windows(2) {
            prop_assert!(pair[1] >= pair[0] - 1e-12);
        }
        prop_assert!(probs[probs.len() - 1] <= 1.0 + 1e-9);

        let mut weight_sum = probs[0];
        for pair in probs.windows(2) {
            weight_sum += pair[1] - pair[0];
        }
        prop_assert!((weight_sum - 1.0).abs() < 1e-6);
    }
}

#[test]
fn random_candidates_nearly_always_pass_check() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(dir.path());
    let comp = test_composition();
    let mut rng = StdRng::seed_from_u64(23);

    let mut passed = 0;
    for _ in 0..1000 {
        if let Some(mut c) = generate_random_candidate(&cfg, &comp, 1, 0, &mut rng) {
            if check_candidate(&mut c, &cfg) {
                passed += 1;
            }
        }
    }
    assert!(passed >= 990, "only {passed}/1000 random candidates passed");
}

#[test]
fn generated_candidates_respect_composition_and_bounds() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(dir.path());
    let comp = test_composition();
    let mut rng = StdRng::seed_from_u64(29);

    let mut c = generate_random_candidate(&cfg, &comp, 1, 5, &mut rng).unwrap();
    assert_eq!(c.generation, 1);
    assert_eq!(c.id_number, 5);
    assert_eq!(c.parents, "Randomly generated");
    assert!(c.matches_composition(&comp));
    assert!(c.shortest_interatomic_distance().unwrap() >= 1.5);

    assert!(check_candidate(&mut c, &cfg));
    let (vmin, vmax) = cfg.volume_bounds();
    assert!(c.volume() >= vmin - 1e-9 && c.volume() <= vmax + 1e-9);
}

#[test]
fn check_salvages_an_out_of_range_volume() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(dir.path());
    // Slack in the length bounds so the rescale cannot push a length out.
    cfg.a = ParamRange::new(2.0, 6.0);
    cfg.b = ParamRange::new(2.0, 6.0);
    cfg.c = ParamRange::new(2.0, 6.0);
    cfg.volume = VolumeMode::Range { min: 30.0, max: 120.0 };
    let comp = test_composition();
    let mut rng = StdRng::seed_from_u64(31);

    let mut c = generate_random_candidate(&cfg, &comp, 1, 1, &mut rng).unwrap();
    // Blow the cell up far past the window; check must rescale, not reject.
    c.rescale_volume(5000.0);
    assert!(check_candidate(&mut c, &cfg));
    assert!(c.volume() >= 30.0 - 1e-9 && c.volume() <= 120.0 + 1e-9);
}

#[test]
fn check_rescales_fixed_volume_unconditionally() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(dir.path());
    cfg.a = ParamRange::new(2.0, 6.0);
    cfg.b = ParamRange::new(2.0, 6.0);
    cfg.c = ParamRange::new(2.0, 6.0);
    cfg.volume = VolumeMode::Fixed(64.0);
    cfg.min_interatomic_distance = None;
    let comp = test_composition();
    let mut rng = StdRng::seed_from_u64(37);

    let mut c = generate_random_candidate(&cfg, &comp, 1, 1, &mut rng).unwrap();
    assert!(check_candidate(&mut c, &cfg));
    assert!((c.volume() - 64.0).abs() < 1e-6);
}

#[test]
fn check_pins_fixed_lattice_parameters() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(dir.path());
    cfg.a = ParamRange::new(4.0, 4.0);
    cfg.volume = VolumeMode::Range { min: 1.0, max: 500.0 };
    cfg.min_interatomic_distance = None;
    let comp = test_composition();
    let mut rng = StdRng::seed_from_u64(41);

    let mut c = generate_random_candidate(&cfg, &comp, 1, 1, &mut rng).unwrap();
    assert!(check_candidate(&mut c, &cfg));
    assert!((c.cell.a - 4.0).abs() < 1e-9);
}
