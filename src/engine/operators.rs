use std::f64::consts::TAU;

use nalgebra::{Matrix3, Point3};
use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::core::candidate::{Atom, Candidate, Status};
use crate::core::cell::UnitCell;
use crate::core::composition::Composition;

/// Stripple knobs, lifted out of the session config for the operator call.
#[derive(Debug, Clone, Copy)]
pub struct StrippleParams {
    pub strain_stdev_min: f64,
    pub strain_stdev_max: f64,
    pub amp_min: f64,
    pub amp_max: f64,
    pub per1: u32,
    pub per2: u32,
}

/// Clones a parent into a blank offspring: geometry kept, bookkeeping and
/// energies reset. The caller stamps generation, id and provenance.
fn offspring_shell(parent: &Candidate) -> Candidate {
    let mut child = parent.clone();
    child.id_number = 0;
    child.generation = 0;
    child.index = 0;
    child.parents.clear();
    child.energy = None;
    child.enthalpy = None;
    child.pv = None;
    child.status = Status::WaitingForOptimization;
    child.current_step = 1;
    child.fail_count = 0;
    child.spacegroup = 0;
    child.duplicate_of = None;
    child.local_path = Default::default();
    child.remote_path = String::new();
    child.opt_timer_start = None;
    child.opt_timer_end = None;
    child.job_id = None;
    child.invalidate_fingerprint();
    child
}

fn wrap01(f: &mut Point3<f64>) {
    f.coords.x = f.coords.x.rem_euclid(1.0);
    f.coords.y = f.coords.y.rem_euclid(1.0);
    f.coords.z = f.coords.z.rem_euclid(1.0);
}

fn wrapped_fractional(c: &Candidate) -> Vec<(u8, Point3<f64>)> {
    c.atoms
        .iter()
        .map(|a| {
            let mut f = c.cell.to_fractional(&a.position);
            wrap01(&mut f);
            (a.atomic_number, f)
        })
        .collect()
}

/// Applies a random symmetric strain of the given standard deviation to
/// the cell. Off-diagonal elements are halved so the full tensor keeps the
/// requested spread.
fn random_strain<R: Rng + ?Sized>(cell: &UnitCell, stdev: f64, rng: &mut R) -> UnitCell {
    if stdev <= 0.0 {
        return *cell;
    }
    let Ok(normal) = Normal::new(0.0, stdev) else {
        return *cell;
    };
    let mut eps = Matrix3::identity();
    for i in 0..3 {
        for j in i..3 {
            let draw = normal.sample(rng);
            if i == j {
                eps[(i, j)] += draw;
            } else {
                eps[(i, j)] += draw / 2.0;
                eps[(j, i)] += draw / 2.0;
            }
        }
    }
    let m = cell.matrix() * eps;
    UnitCell::from_vectors(m.column(0).into(), m.column(1).into(), m.column(2).into())
}

/// Cut-and-splice crossover over fractional-coordinate slabs.
///
/// Both parents are randomly shifted and wrapped, a cut plane is drawn so
/// parent one contributes between `min_contribution` and
/// `100 - min_contribution` percent of the atoms, and the stoichiometry is
/// repaired by transmuting surplus species into deficits. Returns the
/// child and the actual percentage parent one contributed.
pub fn crossover<R: Rng + ?Sized>(
    p1: &Candidate,
    p2: &Candidate,
    comp: &Composition,
    min_contribution: u32,
    rng: &mut R,
) -> Option<(Candidate, f64)> {
    let n = comp.total_atoms();
    if n < 2 || p1.atoms.is_empty() || p2.atoms.is_empty() {
        return None;
    }

    let lo = min_contribution as f64 / 100.0;
    let cut = rng.gen_range(lo..=(1.0 - lo));
    let axis = rng.gen_range(0..3usize);

    let mut shift_and_wrap = |atoms: Vec<(u8, Point3<f64>)>| {
        let shift = Point3::new(
            rng.gen_range(0.0..1.0),
            rng.gen_range(0.0..1.0),
            rng.gen_range(0.0..1.0),
        );
        atoms
            .into_iter()
            .map(|(z, mut f)| {
                f.coords += shift.coords;
                wrap01(&mut f);
                (z, f)
            })
            .collect::<Vec<_>>()
    };

    let f1 = shift_and_wrap(wrapped_fractional(p1));
    let f2 = shift_and_wrap(wrapped_fractional(p2));

    let mut selected: Vec<(u8, Point3<f64>)> = Vec::with_capacity(n);
    for (z, f) in f1 {
        if f[axis] < cut {
            selected.push((z, f));
        }
    }
    let from_p1 = selected.len();
    for (z, f) in f2 {
        if f[axis] >= cut {
            selected.push((z, f));
        }
    }

    if from_p1 == 0 || from_p1 == selected.len() {
        return None;
    }
    let percent1 = 100.0 * from_p1 as f64 / selected.len() as f64;
    if percent1 < min_contribution as f64 || percent1 > 100.0 - min_contribution as f64 {
        return None;
    }

    // Child cell interpolates the parents by contribution.
    let w = percent1 / 100.0;
    let (a1, b1, c1, al1, be1, ga1) = p1.cell.params();
    let (a2, b2, c2, al2, be2, ga2) = p2.cell.params();
    let cell = UnitCell::new(
        w * a1 + (1.0 - w) * a2,
        w * b1 + (1.0 - w) * b2,
        w * c1 + (1.0 - w) * c2,
        w * al1 + (1.0 - w) * al2,
        w * be1 + (1.0 - w) * be2,
        w * ga1 + (1.0 - w) * ga2,
    );

    repair_composition(&mut selected, comp, rng);

    let mut child = offspring_shell(p1);
    child.cell = cell;
    child.atoms = selected
        .into_iter()
        .map(|(z, f)| Atom {
            atomic_number: z,
            position: cell.to_cartesian(&f),
        })
        .collect();
    child.invalidate_fingerprint();
    Some((child, percent1))
}

/// Forces the atom list back onto the target stoichiometry: trims or pads
/// to the right total, then transmutes surplus species into deficits.
fn repair_composition<R: Rng + ?Sized>(
    atoms: &mut Vec<(u8, Point3<f64>)>,
    comp: &Composition,
    rng: &mut R,
) {
    let n = comp.total_atoms();

    while atoms.len() > n {
        let i = rng.gen_range(0..atoms.len());
        atoms.swap_remove(i);
    }
    while atoms.len() < n {
        let deficit = comp
            .entries()
            .find(|(z, count)| {
                atoms.iter().filter(|(az, _)| az == z).count() < *count as usize
            })
            .map(|(z, _)| z)
            .unwrap_or_else(|| comp.atomic_numbers()[0]);
        atoms.push((
            deficit,
            Point3::new(
                rng.gen_range(0.0..1.0),
                rng.gen_range(0.0..1.0),
                rng.gen_range(0.0..1.0),
            ),
        ));
    }

    let mut deficits: Vec<u8> = Vec::new();
    for (z, target) in comp.entries() {
        let have = atoms.iter().filter(|(az, _)| *az == z).count();
        for _ in have..target as usize {
            deficits.push(z);
        }
    }
    for (z, target) in comp.entries() {
        let mut have = atoms.iter().filter(|(az, _)| *az == z).count();
        while have > target as usize {
            let candidates: Vec<usize> = atoms
                .iter()
                .enumerate()
                .filter(|(_, (az, _))| *az == z)
                .map(|(i, _)| i)
                .collect();
            let pick = candidates[rng.gen_range(0..candidates.len())];
            match deficits.pop() {
                Some(new_z) => atoms[pick].0 = new_z,
                None => break,
            }
            have -= 1;
        }
    }
}

/// Sinusoidal ripple plus random strain.
///
/// One fractional axis is displaced by a two-wave cosine of the other two
/// axes; the cell is strained with a standard deviation drawn from the
/// configured interval. Returns (child, stdev, amplitude).
pub fn stripple<R: Rng + ?Sized>(
    parent: &Candidate,
    params: &StrippleParams,
    rng: &mut R,
) -> Option<(Candidate, f64, f64)> {
    if parent.atoms.is_empty() {
        return None;
    }
    let amplitude = rng.gen_range(params.amp_min..=params.amp_max);
    let stdev = rng.gen_range(params.strain_stdev_min..=params.strain_stdev_max);

    let axis = rng.gen_range(0..3usize);
    let u_axis = (axis + 1) % 3;
    let v_axis = (axis + 2) % 3;
    let theta1 = rng.gen_range(0.0..TAU);
    let theta2 = rng.gen_range(0.0..TAU);

    let fracs = wrapped_fractional(parent);
    let cell = random_strain(&parent.cell, stdev, rng);
    if cell.is_degenerate() {
        return None;
    }

    let mut child = offspring_shell(parent);
    child.cell = cell;
    child.atoms = fracs
        .into_iter()
        .map(|(z, mut f)| {
            let ripple = amplitude / 2.0
                * ((TAU * params.per1 as f64 * f[u_axis] + theta1).cos()
                    + (TAU * params.per2 as f64 * f[v_axis] + theta2).cos());
            f[axis] = (f[axis] + ripple).rem_euclid(1.0);
            Atom {
                atomic_number: z,
                position: cell.to_cartesian(&f),
            }
        })
        .collect();
    child.invalidate_fingerprint();
    Some((child, stdev, amplitude))
}

/// Random swaps of atoms of different species plus a random strain.
/// Returns (child, stdev).
pub fn permustrain<R: Rng + ?Sized>(
    parent: &Candidate,
    strain_stdev_max: f64,
    exchanges: usize,
    rng: &mut R,
) -> Option<(Candidate, f64)> {
    let n = parent.atoms.len();
    if n < 2 {
        return None;
    }

    let mut child = offspring_shell(parent);
    for _ in 0..exchanges {
        // Pairs of identical species would be no-ops; give up quietly on
        // single-species compositions.
        for _ in 0..100 {
            let i = rng.gen_range(0..n);
            let j = rng.gen_range(0..n);
            if child.atoms[i].atomic_number != child.atoms[j].atomic_number {
                let tmp = child.atoms[i].position;
                child.atoms[i].position = child.atoms[j].position;
                child.atoms[j].position = tmp;
                break;
            }
        }
    }

    let stdev = rng.gen_range(0.0..=strain_stdev_max);
    let cell = random_strain(&parent.cell, stdev, rng);
    if cell.is_degenerate() {
        return None;
    }
    child.set_cell_keep_fractional(cell);
    child.invalidate_fingerprint();
    Some((child, stdev))
}
