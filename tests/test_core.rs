use nalgebra::Point3;
use rand::rngs::StdRng;
use rand::SeedableRng;

use xtalsearch::core::candidate::{Atom, Candidate};
use xtalsearch::core::cell::UnitCell;
use xtalsearch::core::composition::{atomic_number_of, element_symbol, Composition};
use xtalsearch::core::symmetry::detect_spacegroup;

#[test]
fn cubic_cell_volume() {
    let cell = UnitCell::new(4.0, 4.0, 4.0, 90.0, 90.0, 90.0);
    assert!((cell.volume() - 64.0).abs() < 1e-9);
}

#[test]
fn from_vectors_roundtrips_parameters() {
    let cell = UnitCell::new(3.1, 4.2, 5.3, 82.0, 95.0, 110.0);
    let rebuilt = UnitCell::from_vectors(cell.vector(0), cell.vector(1), cell.vector(2));
    assert!((rebuilt.a - cell.a).abs() < 1e-9);
    assert!((rebuilt.b - cell.b).abs() < 1e-9);
    assert!((rebuilt.c - cell.c).abs() < 1e-9);
    assert!((rebuilt.alpha - cell.alpha).abs() < 1e-9);
    assert!((rebuilt.beta - cell.beta).abs() < 1e-9);
    assert!((rebuilt.gamma - cell.gamma).abs() < 1e-9);
}

#[test]
fn min_image_distance_wraps_across_the_boundary() {
    let cell = UnitCell::new(10.0, 10.0, 10.0, 90.0, 90.0, 90.0);
    let p1 = cell.to_cartesian(&Point3::new(0.05, 0.5, 0.5));
    let p2 = cell.to_cartesian(&Point3::new(0.95, 0.5, 0.5));
    assert!((cell.min_image_distance(&p1, &p2) - 1.0).abs() < 1e-9);
}

#[test]
fn fix_angles_lands_in_range_and_preserves_the_structure() {
    let cell = UnitCell::new(4.0, 4.0, 4.0, 90.0, 90.0, 150.0);
    let mut c = Candidate::new(cell);
    c.atoms = vec![
        Atom {
            atomic_number: 14,
            position: cell.to_cartesian(&Point3::new(0.1, 0.2, 0.3)),
        },
        Atom {
            atomic_number: 14,
            position: cell.to_cartesian(&Point3::new(0.6, 0.7, 0.8)),
        },
    ];
    let volume_before = c.volume();
    let iad_before = c.shortest_interatomic_distance().unwrap();

    c.fix_angles();

    for angle in [c.cell.alpha, c.cell.beta, c.cell.gamma] {
        assert!((60.0..=120.0).contains(&angle), "angle {angle} out of range");
    }
    assert!((c.volume() - volume_before).abs() < 1e-6);
    let iad_after = c.shortest_interatomic_distance().unwrap();
    assert!((iad_after - iad_before).abs() < 1e-6);
}

#[test]
fn random_placement_respects_minimum_distance() {
    let cell = UnitCell::new(6.0, 6.0, 6.0, 90.0, 90.0, 90.0);
    let mut c = Candidate::new(cell);
    let mut rng = StdRng::seed_from_u64(11);
    for _ in 0..8 {
        assert!(c.add_atom_randomly(14, Some(1.5), &mut rng));
    }
    assert!(c.shortest_interatomic_distance().unwrap() >= 1.5);
}

#[test]
fn candidate_tag_and_composition_check() {
    let mut c = Candidate::new(UnitCell::new(4.0, 4.0, 4.0, 90.0, 90.0, 90.0));
    c.generation = 3;
    c.id_number = 7;
    assert_eq!(c.tag(), "3x7");

    let comp = Composition::from_pairs(&[(8, 1), (12, 1)]);
    c.atoms = vec![
        Atom { atomic_number: 12, position: Point3::origin() },
        Atom { atomic_number: 8, position: Point3::new(2.0, 0.0, 0.0) },
    ];
    assert!(c.matches_composition(&comp));
    c.atoms.pop();
    assert!(!c.matches_composition(&comp));
}

#[test]
fn composition_iterates_in_ascending_atomic_number() {
    let comp = Composition::from_pairs(&[(14, 4), (8, 2), (1, 6)]);
    let order: Vec<u8> = comp.entries().map(|(z, _)| z).collect();
    assert_eq!(order, vec![1, 8, 14]);
    assert_eq!(comp.total_atoms(), 12);
    assert_eq!(comp.expand().len(), 12);
}

#[test]
fn element_symbol_lookup_roundtrips() {
    assert_eq!(element_symbol(14), "Si");
    assert_eq!(atomic_number_of("Si"), Some(14));
    assert_eq!(atomic_number_of("Nope"), None);
}

#[test]
fn spacegroup_classifier_buckets_by_metric() {
    let atoms = vec![Atom { atomic_number: 14, position: Point3::origin() }];
    let cubic = UnitCell::new(4.0, 4.0, 4.0, 90.0, 90.0, 90.0);
    assert_eq!(detect_spacegroup(&cubic, &atoms, 0.05), 195);

    let ortho = UnitCell::new(3.0, 4.0, 5.0, 90.0, 90.0, 90.0);
    assert_eq!(detect_spacegroup(&ortho, &atoms, 0.05), 16);

    let tri = UnitCell::new(3.0, 4.0, 5.0, 85.0, 95.0, 105.0);
    assert_eq!(detect_spacegroup(&tri, &atoms, 0.05), 1);

    let degenerate = UnitCell::new(f64::NAN, 4.0, 5.0, 90.0, 90.0, 90.0);
    assert_eq!(detect_spacegroup(&degenerate, &atoms, 0.05), 0);
}
