use std::path::PathBuf;

use chrono::{DateTime, Utc};
use nalgebra::Point3;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::core::cell::{self, UnitCell};
use crate::core::composition::Composition;
use crate::core::symmetry;

/// Lifecycle state of a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Empty,
    WaitingForOptimization,
    Submitted,
    InProcess,
    StepOptimized,
    Optimized,
    Duplicate,
    Error,
    Killed,
    Removed,
}

/// A single atom: species plus cartesian position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Atom {
    pub atomic_number: u8,
    pub position: Point3<f64>,
}

/// The duplicate-comparison key, derived lazily from the candidate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub spacegroup: u32,
    pub enthalpy: f64,
    pub volume: f64,
}

/// One crystal-structure proposal.
///
/// Keyed by `(generation, id_number)` across the session; `index` is the
/// store's insertion ordinal. Cross-references between candidates (for
/// example `duplicate_of`) use the `"GxI"` tag, never pointers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub id_number: u32,
    pub generation: u32,
    pub index: usize,
    pub parents: String,
    pub cell: UnitCell,
    pub atoms: Vec<Atom>,
    pub energy: Option<f64>,
    pub enthalpy: Option<f64>,
    pub pv: Option<f64>,
    pub status: Status,
    /// 1-based position in the optimizer plugin's step list.
    pub current_step: usize,
    pub fail_count: u32,
    /// Space group number 1..=230, or 0 when unknown.
    pub spacegroup: u32,
    pub duplicate_of: Option<String>,
    pub local_path: PathBuf,
    pub remote_path: String,
    pub opt_timer_start: Option<DateTime<Utc>>,
    pub opt_timer_end: Option<DateTime<Utc>>,
    pub job_id: Option<u64>,
    #[serde(skip)]
    fingerprint: Option<Fingerprint>,
}

impl Candidate {
    pub fn new(cell: UnitCell) -> Self {
        Self {
            id_number: 0,
            generation: 0,
            index: 0,
            parents: String::new(),
            cell,
            atoms: Vec::new(),
            energy: None,
            enthalpy: None,
            pv: None,
            status: Status::Empty,
            current_step: 1,
            fail_count: 0,
            spacegroup: 0,
            duplicate_of: None,
            local_path: PathBuf::new(),
            remote_path: String::new(),
            opt_timer_start: None,
            opt_timer_end: None,
            job_id: None,
            fingerprint: None,
        }
    }

    /// The `"GxI"` tag used in provenance and duplicate references.
    pub fn tag(&self) -> String {
        format!("{}x{}", self.generation, self.id_number)
    }

    pub fn volume(&self) -> f64 {
        self.cell.volume()
    }

    /// Swaps in a new cell while keeping every atom on the same fractional
    /// site, so the structure deforms with the lattice.
    pub fn set_cell_keep_fractional(&mut self, new_cell: UnitCell) {
        let old = self.cell;
        for atom in &mut self.atoms {
            let frac = old.to_fractional(&atom.position);
            atom.position = new_cell.to_cartesian(&frac);
        }
        self.cell = new_cell;
        self.fingerprint = None;
    }

    /// Rescales the cell isotropically to the target volume.
    pub fn rescale_volume(&mut self, target: f64) {
        let scaled = self.cell.scaled_to_volume(target);
        self.set_cell_keep_fractional(scaled);
    }

    /// Overwrites any pinned lattice parameters (passed as `Some(value)`)
    /// and leaves the rest untouched. Atoms follow the lattice.
    pub fn pin_parameters(
        &mut self,
        a: Option<f64>,
        b: Option<f64>,
        c: Option<f64>,
        alpha: Option<f64>,
        beta: Option<f64>,
        gamma: Option<f64>,
    ) {
        let mut cell = self.cell;
        if let Some(v) = a {
            cell.a = v;
        }
        if let Some(v) = b {
            cell.b = v;
        }
        if let Some(v) = c {
            cell.c = v;
        }
        if let Some(v) = alpha {
            cell.alpha = v;
        }
        if let Some(v) = beta {
            cell.beta = v;
        }
        if let Some(v) = gamma {
            cell.gamma = v;
        }
        if cell != self.cell {
            self.set_cell_keep_fractional(cell);
        }
    }

    /// Wraps every atom into the primary cell, fractional range [0, 1).
    pub fn wrap_atoms(&mut self) {
        let cell = self.cell;
        for atom in &mut self.atoms {
            let mut f = cell.to_fractional(&atom.position);
            f.coords.x = f.coords.x.rem_euclid(1.0);
            f.coords.y = f.coords.y.rem_euclid(1.0);
            f.coords.z = f.coords.z.rem_euclid(1.0);
            atom.position = cell.to_cartesian(&f);
        }
        self.fingerprint = None;
    }

    /// Re-expresses the lattice in a reduced basis so that all three cell
    /// angles land in [60, 120] degrees. The atoms stay on the same
    /// physical sites of the (unchanged) lattice.
    pub fn fix_angles(&mut self) {
        if self.cell.is_degenerate() {
            return;
        }
        let (reduced, raw) = cell::reduce_basis(&self.cell);
        if let Some(inv) = raw.try_inverse() {
            let new_m = reduced.matrix();
            for atom in &mut self.atoms {
                let mut f = inv * atom.position.coords;
                f.x = f.x.rem_euclid(1.0);
                f.y = f.y.rem_euclid(1.0);
                f.z = f.z.rem_euclid(1.0);
                atom.position = Point3::from(new_m * f);
            }
        }
        self.cell = reduced;
        self.fingerprint = None;
    }

    /// Minimum-image shortest distance over all atom pairs.
    /// None when fewer than two atoms are present.
    pub fn shortest_interatomic_distance(&self) -> Option<f64> {
        let n = self.atoms.len();
        if n < 2 {
            return None;
        }
        let mut best = f64::MAX;
        for i in 0..n {
            for j in (i + 1)..n {
                let d = self
                    .cell
                    .min_image_distance(&self.atoms[i].position, &self.atoms[j].position);
                if d < best {
                    best = d;
                }
            }
        }
        Some(best)
    }

    /// Places one atom at a uniform random fractional position, rejecting
    /// positions closer than `min_iad` to any existing atom. Gives up after
    /// 1000 attempts.
    pub fn add_atom_randomly<R: Rng + ?Sized>(
        &mut self,
        atomic_number: u8,
        min_iad: Option<f64>,
        rng: &mut R,
    ) -> bool {
        for _ in 0..1000 {
            let frac = Point3::new(
                rng.gen_range(0.0..1.0),
                rng.gen_range(0.0..1.0),
                rng.gen_range(0.0..1.0),
            );
            let pos = self.cell.to_cartesian(&frac);

            let clash = match min_iad {
                Some(limit) => self
                    .atoms
                    .iter()
                    .any(|a| self.cell.min_image_distance(&a.position, &pos) < limit),
                None => false,
            };
            if !clash {
                self.atoms.push(Atom { atomic_number, position: pos });
                self.fingerprint = None;
                return true;
            }
        }
        false
    }

    /// Runs space-group detection and records the result.
    pub fn find_spacegroup(&mut self, tolerance: f64) {
        self.spacegroup = symmetry::detect_spacegroup(&self.cell, &self.atoms, tolerance);
        self.fingerprint = None;
    }

    /// The lazily cached `(spacegroup, enthalpy, volume)` comparison key.
    pub fn fingerprint(&mut self) -> Fingerprint {
        if let Some(fp) = self.fingerprint {
            return fp;
        }
        let fp = Fingerprint {
            spacegroup: self.spacegroup,
            enthalpy: self.enthalpy.unwrap_or(0.0),
            volume: self.cell.volume(),
        };
        self.fingerprint = Some(fp);
        fp
    }

    /// Read-only fingerprint, bypassing the cache when it is cold. Used by
    /// the duplicate scanner, which snapshots under shared locks.
    pub fn fingerprint_now(&self) -> Fingerprint {
        self.fingerprint.unwrap_or_else(|| Fingerprint {
            spacegroup: self.spacegroup,
            enthalpy: self.enthalpy.unwrap_or(0.0),
            volume: self.cell.volume(),
        })
    }

    pub fn invalidate_fingerprint(&mut self) {
        self.fingerprint = None;
    }

    /// True when the candidate's atom counts match the composition exactly.
    pub fn matches_composition(&self, comp: &Composition) -> bool {
        if self.atoms.len() != comp.total_atoms() {
            return false;
        }
        comp.entries().all(|(z, count)| {
            self.atoms.iter().filter(|a| a.atomic_number == z).count() == count as usize
        })
    }
}
