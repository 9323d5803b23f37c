use std::path::PathBuf;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Closed interval for one lattice parameter. `min == max` pins it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParamRange {
    pub min: f64,
    pub max: f64,
}

impl ParamRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn pinned(&self) -> Option<f64> {
        (self.min == self.max).then_some(self.min)
    }

    pub fn contains(&self, v: f64) -> bool {
        v >= self.min && v <= self.max
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        if let Some(v) = self.pinned() {
            return v;
        }
        rng.gen_range(self.min..self.max)
    }
}

/// Target cell volume policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum VolumeMode {
    Fixed(f64),
    Range { min: f64, max: f64 },
}

/// What to do with a candidate that keeps failing optimization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureAction {
    ReplaceWithRandom,
    MarkError,
}

/// Immutable session configuration, fixed at start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    pub description: String,
    /// Local session root; candidate directories live beneath it.
    pub session_path: PathBuf,
    /// Remote working root on the cluster.
    pub remote_path: String,
    pub host: String,
    pub username: String,
    pub port: u16,
    pub num_connections: usize,
    /// Keep this many candidates pending or in flight.
    pub target_in_flight: usize,
    pub fail_limit: u32,
    pub failure_action: FailureAction,
    pub seeds: Vec<PathBuf>,

    pub a: ParamRange,
    pub b: ParamRange,
    pub c: ParamRange,
    pub alpha: ParamRange,
    pub beta: ParamRange,
    pub gamma: ParamRange,
    pub volume: VolumeMode,
    pub min_interatomic_distance: Option<f64>,

    /// Operator percentages; the three must sum to 100.
    pub p_cross: u32,
    pub p_strip: u32,
    pub p_perm: u32,
    pub pop_size: usize,
    pub num_initial: usize,
    /// Minimum percentage either crossover parent contributes.
    pub cross_min_contribution: u32,

    pub strip_strain_stdev_min: f64,
    pub strip_strain_stdev_max: f64,
    pub strip_amp_min: f64,
    pub strip_amp_max: f64,
    pub strip_per1: u32,
    pub strip_per2: u32,

    pub perm_strain_stdev_max: f64,
    pub perm_exchanges: usize,

    pub tol_enthalpy: f64,
    pub tol_volume: f64,
    pub tol_spg: f64,

    pub rng_seed: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            description: String::new(),
            session_path: PathBuf::from("."),
            remote_path: String::new(),
            host: String::new(),
            username: String::new(),
            port: 22,
            num_connections: 2,
            target_in_flight: 10,
            fail_limit: 3,
            failure_action: FailureAction::ReplaceWithRandom,
            seeds: Vec::new(),
            a: ParamRange::new(3.0, 10.0),
            b: ParamRange::new(3.0, 10.0),
            c: ParamRange::new(3.0, 10.0),
            alpha: ParamRange::new(60.0, 120.0),
            beta: ParamRange::new(60.0, 120.0),
            gamma: ParamRange::new(60.0, 120.0),
            volume: VolumeMode::Range { min: 1.0, max: 500.0 },
            min_interatomic_distance: Some(0.8),
            p_cross: 15,
            p_strip: 50,
            p_perm: 35,
            pop_size: 20,
            num_initial: 20,
            cross_min_contribution: 25,
            strip_strain_stdev_min: 0.0,
            strip_strain_stdev_max: 0.5,
            strip_amp_min: 0.5,
            strip_amp_max: 1.0,
            strip_per1: 1,
            strip_per2: 1,
            perm_strain_stdev_max: 0.5,
            perm_exchanges: 4,
            tol_enthalpy: 1e-2,
            tol_volume: 1e-1,
            tol_spg: 0.05,
            rng_seed: 0,
        }
    }
}

impl SearchConfig {
    /// Rejects nonsensical limits before any structure is generated.
    pub fn check_limits(&self) -> Result<(), EngineError> {
        let ranges = [
            ("a", &self.a),
            ("b", &self.b),
            ("c", &self.c),
            ("alpha", &self.alpha),
            ("beta", &self.beta),
            ("gamma", &self.gamma),
        ];
        for (name, r) in ranges {
            if r.min > r.max || !r.min.is_finite() || !r.max.is_finite() {
                return Err(EngineError::ConfigInvalid(format!(
                    "illogical {name} limits: [{}, {}]",
                    r.min, r.max
                )));
            }
        }

        let min_cell = self.a.min * self.b.min * self.c.min;
        let max_cell = self.a.max * self.b.max * self.c.max;
        match self.volume {
            VolumeMode::Fixed(v) => {
                if v <= 0.0 || min_cell > v || max_cell < v {
                    return Err(EngineError::ConfigInvalid(format!(
                        "fixed volume {v} unreachable for the cell length limits"
                    )));
                }
            }
            VolumeMode::Range { min, max } => {
                if min > max || min_cell > max || max_cell < min {
                    return Err(EngineError::ConfigInvalid(format!(
                        "illogical volume limits: [{min}, {max}]"
                    )));
                }
            }
        }

        if self.p_cross + self.p_strip + self.p_perm != 100 {
            return Err(EngineError::ConfigInvalid(format!(
                "operator percentages must sum to 100, got {} + {} + {}",
                self.p_cross, self.p_strip, self.p_perm
            )));
        }
        if self.cross_min_contribution == 0 || self.cross_min_contribution > 50 {
            return Err(EngineError::ConfigInvalid(
                "crossover minimum contribution must be in 1..=50 percent".into(),
            ));
        }
        if self.pop_size == 0 {
            return Err(EngineError::ConfigInvalid("population size must be positive".into()));
        }
        Ok(())
    }

    /// Volume bounds to validate against, regardless of mode.
    pub fn volume_bounds(&self) -> (f64, f64) {
        match self.volume {
            VolumeMode::Fixed(v) => (v, v),
            VolumeMode::Range { min, max } => (min, max),
        }
    }
}
