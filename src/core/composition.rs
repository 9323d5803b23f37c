use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Element symbols indexed by atomic number (index 0 is a placeholder).
/// Covers H through Lr, which is more than any optimizer we drive supports.
const SYMBOLS: [&str; 104] = [
    "X", "H", "He", "Li", "Be", "B", "C", "N", "O", "F", "Ne", "Na", "Mg",
    "Al", "Si", "P", "S", "Cl", "Ar", "K", "Ca", "Sc", "Ti", "V", "Cr", "Mn",
    "Fe", "Co", "Ni", "Cu", "Zn", "Ga", "Ge", "As", "Se", "Br", "Kr", "Rb",
    "Sr", "Y", "Zr", "Nb", "Mo", "Tc", "Ru", "Rh", "Pd", "Ag", "Cd", "In",
    "Sn", "Sb", "Te", "I", "Xe", "Cs", "Ba", "La", "Ce", "Pr", "Nd", "Pm",
    "Sm", "Eu", "Gd", "Tb", "Dy", "Ho", "Er", "Tm", "Yb", "Lu", "Hf", "Ta",
    "W", "Re", "Os", "Ir", "Pt", "Au", "Hg", "Tl", "Pb", "Bi", "Po", "At",
    "Rn", "Fr", "Ra", "Ac", "Th", "Pa", "U", "Np", "Pu", "Am", "Cm", "Bk",
    "Cf", "Es", "Fm", "Md", "No", "Lr",
];

/// Returns the element symbol for an atomic number, or "X" when unknown.
pub fn element_symbol(atomic_number: u8) -> &'static str {
    SYMBOLS
        .get(atomic_number as usize)
        .copied()
        .unwrap_or("X")
}

/// Reverse lookup, case sensitive ("Si", not "SI").
pub fn atomic_number_of(symbol: &str) -> Option<u8> {
    SYMBOLS
        .iter()
        .position(|s| *s == symbol)
        .filter(|&i| i > 0)
        .map(|i| i as u8)
}

/// The stoichiometry of the search, fixed at session start.
///
/// Iteration order is ascending atomic number, which is the order the
/// random generator places atoms in and the order the VASP composition
/// check compares against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Composition {
    counts: BTreeMap<u8, u32>,
}

impl Composition {
    pub fn new(counts: BTreeMap<u8, u32>) -> Self {
        Self { counts }
    }

    pub fn from_pairs(pairs: &[(u8, u32)]) -> Self {
        Self {
            counts: pairs.iter().copied().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty() || self.total_atoms() == 0
    }

    pub fn total_atoms(&self) -> usize {
        self.counts.values().map(|&c| c as usize).sum()
    }

    /// Atomic numbers in ascending order.
    pub fn atomic_numbers(&self) -> Vec<u8> {
        self.counts.keys().copied().collect()
    }

    pub fn count_of(&self, atomic_number: u8) -> u32 {
        self.counts.get(&atomic_number).copied().unwrap_or(0)
    }

    /// (atomic_number, count) pairs in ascending atomic number order.
    pub fn entries(&self) -> impl Iterator<Item = (u8, u32)> + '_ {
        self.counts.iter().map(|(&z, &c)| (z, c))
    }

    /// The full multiset of atomic numbers, in composition order.
    pub fn expand(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_atoms());
        for (z, count) in self.entries() {
            for _ in 0..count {
                out.push(z);
            }
        }
        out
    }
}
