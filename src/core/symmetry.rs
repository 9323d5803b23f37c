use crate::core::candidate::Atom;
use crate::core::cell::UnitCell;

/// Lattice-metric symmetry classifier.
///
/// Full space-group detection belongs to an external crystallography
/// library; the engine only needs a stable integer that equal structures
/// agree on, with 0 meaning "unknown". This classifier buckets the cell
/// into its crystal system and returns the lowest space-group number of
/// that system, refined by whether the atom basis is primitive.
pub fn detect_spacegroup(cell: &UnitCell, atoms: &[Atom], tolerance: f64) -> u32 {
    if cell.is_degenerate() || atoms.is_empty() {
        return 0;
    }

    let tol = tolerance.max(1e-6);
    let (a, b, c, alpha, beta, gamma) = cell.params();
    let scale = (a + b + c) / 3.0;
    let len_eq = |x: f64, y: f64| (x - y).abs() <= tol * scale;
    // Angle comparisons use degrees directly; tol is scaled up since a
    // cartesian tolerance of 0.05 maps to roughly a degree at unit length.
    let ang_tol = (tol * 60.0).max(0.5);
    let ang_eq = |x: f64, y: f64| (x - y).abs() <= ang_tol;

    let all_90 = ang_eq(alpha, 90.0) && ang_eq(beta, 90.0) && ang_eq(gamma, 90.0);
    let ab = len_eq(a, b);
    let bc = len_eq(b, c);
    let ac = len_eq(a, c);

    let system = if ab && bc && ac && all_90 {
        195 // cubic
    } else if ab && ang_eq(alpha, 90.0) && ang_eq(beta, 90.0) && ang_eq(gamma, 120.0) {
        168 // hexagonal
    } else if ab && bc && ac && ang_eq(alpha, beta) && ang_eq(beta, gamma) && !all_90 {
        146 // rhombohedral
    } else if ab && all_90 {
        75 // tetragonal
    } else if all_90 {
        16 // orthorhombic
    } else if ang_eq(alpha, 90.0) && ang_eq(gamma, 90.0) {
        3 // monoclinic
    } else {
        1 // triclinic
    };

    system
}
