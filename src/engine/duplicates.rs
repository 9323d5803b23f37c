use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use rayon::prelude::*;
use tracing::{debug, info};

use crate::core::candidate::{Fingerprint, Status};
use crate::engine::store::{Structure, Tracker};

/// Post-optimization duplicate scan.
///
/// Runs concurrently with scheduling; the store's read lock is held only
/// long enough to snapshot `(fingerprint, status)` for every candidate,
/// then the O(n^2) pair comparison works off the snapshot. Triggers while
/// a scan is scheduled or running are dropped.
pub struct DuplicateChecker {
    me: Weak<Self>,
    store: Arc<Tracker>,
    tol_enthalpy: f64,
    tol_volume: f64,
    tol_spg: f64,
    scheduled: AtomicBool,
}

struct Snapshot {
    structure: Arc<Structure>,
    fp: Fingerprint,
    status: Status,
    index: usize,
    tag: String,
}

impl DuplicateChecker {
    pub fn new(store: Arc<Tracker>, tol_enthalpy: f64, tol_volume: f64, tol_spg: f64) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            store,
            tol_enthalpy,
            tol_volume,
            tol_spg,
            scheduled: AtomicBool::new(false),
        })
    }

    /// Schedules one scan on a background thread; no-op when one is
    /// already pending.
    pub fn trigger(&self) {
        if self
            .scheduled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let Some(me) = self.me.upgrade() else {
            return;
        };
        std::thread::spawn(move || {
            me.scan();
            me.scheduled.store(false, Ordering::SeqCst);
        });
    }

    fn snapshot(&self) -> Vec<Snapshot> {
        let list = self.store.lock_for_read();
        list.iter()
            .map(|s| {
                let c = s.read();
                Snapshot {
                    structure: Arc::clone(s),
                    fp: c.fingerprint_now(),
                    status: c.status,
                    index: c.index,
                    tag: c.tag(),
                }
            })
            .collect()
    }

    /// One full pair scan over the current population.
    ///
    /// Fingerprint agreement is pure and runs in parallel over the
    /// snapshot; marking is a sequential pass that re-reads live status,
    /// so a structure that just lost a pair drops out of the
    /// representative pool and every `duplicate_of` points at a structure
    /// that is still `Optimized`.
    pub fn scan(&self) {
        let snap = self.snapshot();
        let n = snap.len();

        let matching: Vec<Vec<usize>> = (0..n)
            .into_par_iter()
            .map(|i| {
                let si = &snap[i];
                if si.status != Status::Optimized || si.fp.spacegroup == 0 {
                    return Vec::new();
                }
                snap.iter()
                    .enumerate()
                    .skip(i + 1)
                    .filter(|(_, sj)| {
                        sj.status == Status::Optimized
                            && sj.fp.spacegroup == si.fp.spacegroup
                            && (si.fp.enthalpy - sj.fp.enthalpy).abs() <= self.tol_enthalpy
                            && (si.fp.volume - sj.fp.volume).abs() <= self.tol_volume
                    })
                    .map(|(j, _)| j)
                    .collect()
            })
            .collect();

        for i in 0..n {
            let si = &snap[i];
            if si.structure.read().status != Status::Optimized {
                continue;
            }
            for &j in &matching[i] {
                let sj = &snap[j];
                if sj.structure.read().status != Status::Optimized {
                    continue;
                }

                // The higher enthalpy loses; equal enthalpies fall back to
                // the younger (larger index) candidate.
                let i_loses = match si.fp.enthalpy.partial_cmp(&sj.fp.enthalpy) {
                    Some(std::cmp::Ordering::Greater) => true,
                    Some(std::cmp::Ordering::Less) => false,
                    _ => si.index > sj.index,
                };
                if i_loses {
                    mark_duplicate(si, sj);
                    // i is gone; stop comparing it against anything else.
                    break;
                } else {
                    mark_duplicate(sj, si);
                }
            }
        }
    }

    /// Reverts every duplicate to `Optimized`, refreshes space groups and
    /// runs a fresh scan.
    pub fn reset_duplicates(&self) {
        let list = self.store.list();
        for s in &list {
            let mut c = s.write();
            c.find_spacegroup(self.tol_spg);
            if c.status == Status::Duplicate {
                c.status = Status::Optimized;
                c.duplicate_of = None;
            }
        }
        info!(count = list.len(), "duplicate flags reset, rescanning");
        self.scan();
    }
}

fn mark_duplicate(loser: &Snapshot, winner: &Snapshot) {
    let mut c = loser.structure.write();
    c.status = Status::Duplicate;
    c.duplicate_of = Some(winner.tag.clone());
    debug!(duplicate = %loser.tag, of = %winner.tag, "marked duplicate");
}
