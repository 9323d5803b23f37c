use rand::Rng;
use tracing::{debug, warn};

use crate::core::candidate::{Candidate, Status};
use crate::core::cell::UnitCell;
use crate::core::composition::Composition;
use crate::core::config::{SearchConfig, VolumeMode};
use crate::engine::operators::{self, StrippleParams};
use crate::error::EngineError;

/// Draws a fresh random cell and fills it with the composition's atoms.
///
/// Each atom gets up to 1000 placement attempts honoring the minimum
/// interatomic distance; if any atom cannot be placed the whole candidate
/// is abandoned.
pub fn generate_random_candidate<R: Rng + ?Sized>(
    cfg: &SearchConfig,
    comp: &Composition,
    generation: u32,
    id: u32,
    rng: &mut R,
) -> Option<Candidate> {
    let cell = UnitCell::new(
        cfg.a.sample(rng),
        cfg.b.sample(rng),
        cfg.c.sample(rng),
        cfg.alpha.sample(rng),
        cfg.beta.sample(rng),
        cfg.gamma.sample(rng),
    );
    let mut c = Candidate::new(cell);

    if let VolumeMode::Fixed(v) = cfg.volume {
        c.rescale_volume(v);
    }

    for (z, count) in comp.entries() {
        for _ in 0..count {
            if !c.add_atom_randomly(z, cfg.min_interatomic_distance, rng) {
                debug!(z, "random placement exhausted, abandoning candidate");
                return None;
            }
        }
    }

    c.generation = generation;
    c.id_number = id;
    c.parents = "Randomly generated".to_string();
    c.status = Status::WaitingForOptimization;
    Some(c)
}

/// Validates a candidate against the session limits, salvaging the volume
/// where the rules allow it.
///
/// Fixed-volume mode always rescales. Range mode rescales an out-of-range
/// volume to `(|V mod 1|) * (vmax - vmin) + vmin` (midpoint when that is
/// numerically zero) and then accepts it. Pinned lattice parameters are
/// assigned their fixed value and skipped by the bounds check.
pub fn check_candidate(c: &mut Candidate, cfg: &SearchConfig) -> bool {
    if c.status == Status::Empty {
        return false;
    }

    match cfg.volume {
        VolumeMode::Fixed(v) => c.rescale_volume(v),
        VolumeMode::Range { min, max } => {
            let vol = c.volume();
            if vol < min || vol > max {
                let mut newvol = (vol % 1.0).abs() * (max - min) + min;
                if newvol.abs() < 1e-8 {
                    newvol = (max - min) * 0.5 + min;
                }
                debug!(from = vol, to = newvol, "rescaling volume into range");
                c.rescale_volume(newvol);
            }
        }
    }

    c.pin_parameters(
        cfg.a.pinned(),
        cfg.b.pinned(),
        cfg.c.pinned(),
        cfg.alpha.pinned(),
        cfg.beta.pinned(),
        cfg.gamma.pinned(),
    );

    if c.cell.is_degenerate() {
        debug!("discarding candidate, degenerate cell");
        return false;
    }

    c.fix_angles();

    let checks = [
        (&cfg.a, c.cell.a),
        (&cfg.b, c.cell.b),
        (&cfg.c, c.cell.c),
        (&cfg.alpha, c.cell.alpha),
        (&cfg.beta, c.cell.beta),
        (&cfg.gamma, c.cell.gamma),
    ];
    for (range, value) in checks {
        if range.pinned().is_none() && !range.contains(value) {
            debug!(value, "discarding candidate, lattice parameter out of bounds");
            return false;
        }
    }

    if let Some(min_iad) = cfg.min_interatomic_distance {
        if let Some(d) = c.shortest_interatomic_distance() {
            if d < min_iad {
                debug!(distance = d, limit = min_iad, "discarding candidate, bad IAD");
                return false;
            }
        }
    }

    true
}

/// Builds the cumulative selection-probability list from enthalpies
/// already sorted ascending (ties broken by index upstream).
///
/// Weights fall linearly from the lowest enthalpy across a spread widened
/// by `(n+1)/n`, are normalized, then accumulated; the final entry is 1
/// up to rounding. Degenerate spreads fall back to uniform weights.
pub fn probability_list(enthalpies: &[f64]) -> Vec<f64> {
    let n = enthalpies.len();
    if n == 0 {
        return Vec::new();
    }
    if n == 1 {
        return vec![1.0];
    }

    let lo = enthalpies[0];
    let hi = enthalpies[n - 1];
    let spread = (hi - lo) * (n as f64 + 1.0) / n as f64;

    let mut weights: Vec<f64> = if spread < 1e-14 {
        vec![1.0; n]
    } else {
        enthalpies.iter().map(|e| 1.0 - (e - lo) / spread).collect()
    };

    let sum: f64 = weights.iter().sum();
    for w in &mut weights {
        *w /= sum;
    }

    let mut acc = 0.0;
    for w in &mut weights {
        acc += *w;
        *w = acc;
    }
    weights
}

/// Samples the cumulative list: the smallest index whose entry exceeds a
/// uniform draw. Returns the index, never the draw itself.
pub fn sample_index<R: Rng + ?Sized>(probs: &[f64], rng: &mut R) -> usize {
    let r = rng.gen::<f64>();
    for (i, p) in probs.iter().enumerate() {
        if r < *p {
            return i;
        }
    }
    probs.len().saturating_sub(1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    Crossover,
    Stripple,
    Permustrain,
}

impl Operator {
    fn name(self) -> &'static str {
        match self {
            Operator::Crossover => "crossover",
            Operator::Stripple => "stripple",
            Operator::Permustrain => "permustrain",
        }
    }
}

/// One bred offspring, ready for `initialize_and_add`.
pub struct Offspring {
    pub candidate: Candidate,
    pub generation: u32,
    pub parents: String,
}

/// Crossover of two chosen parents, with provenance and generation
/// stamped. The child's generation is one past the older parent.
pub fn crossover_offspring<R: Rng + ?Sized>(
    p1: &Candidate,
    p2: &Candidate,
    comp: &Composition,
    cfg: &SearchConfig,
    rng: &mut R,
) -> Option<Offspring> {
    operators::crossover(p1, p2, comp, cfg.cross_min_contribution, rng).map(
        |(child, percent1)| Offspring {
            generation: p1.generation.max(p2.generation) + 1,
            parents: format!(
                "Crossover: {} ({:.0}%) + {} ({:.0}%)",
                p1.tag(),
                percent1,
                p2.tag(),
                100.0 - percent1
            ),
            candidate: child,
        },
    )
}

pub fn stripple_offspring<R: Rng + ?Sized>(
    p1: &Candidate,
    cfg: &SearchConfig,
    rng: &mut R,
) -> Option<Offspring> {
    let params = StrippleParams {
        strain_stdev_min: cfg.strip_strain_stdev_min,
        strain_stdev_max: cfg.strip_strain_stdev_max,
        amp_min: cfg.strip_amp_min,
        amp_max: cfg.strip_amp_max,
        per1: cfg.strip_per1,
        per2: cfg.strip_per2,
    };
    operators::stripple(p1, &params, rng).map(|(child, stdev, amplitude)| Offspring {
        generation: p1.generation + 1,
        parents: format!(
            "Stripple: {} stdev={:.5} amp={:.5} waves={},{}",
            p1.tag(),
            stdev,
            amplitude,
            cfg.strip_per1,
            cfg.strip_per2
        ),
        candidate: child,
    })
}

pub fn permustrain_offspring<R: Rng + ?Sized>(
    p1: &Candidate,
    cfg: &SearchConfig,
    rng: &mut R,
) -> Option<Offspring> {
    operators::permustrain(p1, cfg.perm_strain_stdev_max, cfg.perm_exchanges, rng).map(
        |(child, stdev)| Offspring {
            generation: p1.generation + 1,
            parents: format!(
                "Permustrain: {} stdev={:.5} exch={}",
                p1.tag(),
                stdev,
                cfg.perm_exchanges
            ),
            candidate: child,
        },
    )
}

/// Breeds one child from the optimized population.
///
/// `parents` must be sorted ascending by enthalpy (ties by index) and
/// truncated to `pop_size + 1` entries upstream. The operator is drawn by
/// a single uniform roll against the configured percentages; an operator
/// that fails 1000 times in a row is re-drawn.
pub fn breed<R: Rng + ?Sized>(
    parents: &[Candidate],
    cfg: &SearchConfig,
    comp: &Composition,
    rng: &mut R,
) -> Result<Offspring, EngineError> {
    if parents.is_empty() {
        return Err(EngineError::OperatorFailed("breeding"));
    }
    let probs = probability_list(
        &parents.iter().map(|p| p.enthalpy.unwrap_or(0.0)).collect::<Vec<_>>(),
    );

    // Generous redraw budget; the original loops forever here.
    for _ in 0..100 {
        let r = rng.gen::<f64>();
        let op = if r < cfg.p_cross as f64 / 100.0 {
            Operator::Crossover
        } else if r < (cfg.p_cross + cfg.p_strip) as f64 / 100.0 {
            Operator::Stripple
        } else {
            Operator::Permustrain
        };

        for _ in 0..1000 {
            let produced = match op {
                Operator::Crossover => {
                    let p1 = &parents[sample_index(&probs, rng)];
                    let p2 = &parents[sample_index(&probs, rng)];
                    crossover_offspring(p1, p2, comp, cfg, rng)
                }
                Operator::Stripple => {
                    let p1 = &parents[sample_index(&probs, rng)];
                    stripple_offspring(p1, cfg, rng)
                }
                Operator::Permustrain => {
                    let p1 = &parents[sample_index(&probs, rng)];
                    permustrain_offspring(p1, cfg, rng)
                }
            };

            if let Some(mut off) = produced {
                if check_candidate(&mut off.candidate, cfg) {
                    return Ok(off);
                }
            }
        }
        warn!(operator = op.name(), "operator failed 1000 times, reselecting");
    }

    Err(EngineError::OperatorFailed("breeding"))
}
