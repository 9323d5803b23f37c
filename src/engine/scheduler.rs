use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{debug, warn};

use crate::core::candidate::Status;
use crate::core::config::SearchConfig;
use crate::engine::optimizer::{JobState, Optimizer};
use crate::engine::pool::{ConnectionPool, RemoteChannel};
use crate::engine::remote::LocalChannel;
use crate::engine::store::{Structure, Tracker};

/// Drives candidates through the optimizer's step list.
///
/// Owns the job-start tracker (candidates awaiting submission) and the
/// in-flight set. The submission and polling passes are plain methods so
/// the engine's background loops, and the tests, can invoke them one
/// iteration at a time. Candidates that reach the failure limit are
/// handed back to the caller, which applies the session's failure policy.
pub struct QueueManager {
    store: Arc<Tracker>,
    pool: Option<Arc<ConnectionPool>>,
    optimizer: Arc<dyn Optimizer>,
    cfg: SearchConfig,
    job_start: Mutex<VecDeque<Arc<Structure>>>,
    in_flight: Mutex<Vec<Arc<Structure>>>,
}

impl QueueManager {
    pub fn new(
        store: Arc<Tracker>,
        pool: Option<Arc<ConnectionPool>>,
        optimizer: Arc<dyn Optimizer>,
        cfg: SearchConfig,
    ) -> Self {
        Self {
            store,
            pool,
            optimizer,
            cfg,
            job_start: Mutex::new(VecDeque::new()),
            in_flight: Mutex::new(Vec::new()),
        }
    }

    pub fn append_to_job_start_tracker(&self, s: Arc<Structure>) {
        let mut tracker = self.job_start.lock().unwrap();
        if !tracker.iter().any(|e| Arc::ptr_eq(e, &s)) {
            tracker.push_back(s);
        }
    }

    pub fn pending_count(&self) -> usize {
        self.job_start.lock().unwrap().len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().unwrap().len()
    }

    /// All candidates the store currently reports as `Optimized`.
    pub fn optimized_structures(&self) -> Vec<Arc<Structure>> {
        self.store
            .list()
            .into_iter()
            .filter(|s| s.read().status == Status::Optimized)
            .collect()
    }

    fn with_channel<T>(&self, f: impl FnOnce(&mut dyn RemoteChannel) -> T) -> Option<T> {
        match &self.pool {
            Some(pool) => {
                let mut checked_out = pool.get_free_connection()?;
                Some(f(checked_out.channel()))
            }
            None => {
                let mut local = LocalChannel;
                Some(f(&mut local))
            }
        }
    }

    /// Submits queued candidates while a channel is free. Returns the
    /// candidates that hit the failure limit during submission.
    pub fn submit_pending(&self) -> Vec<Arc<Structure>> {
        let mut exhausted = Vec::new();

        loop {
            let Some(s) = self.job_start.lock().unwrap().pop_front() else {
                break;
            };

            let submitted = self.with_channel(|chan| {
                let mut c = s.write();
                self.optimizer
                    .write_input(&mut c, chan)
                    .and_then(|()| self.optimizer.start_job(&mut c, chan))
                    .map(|()| {
                        c.status = Status::Submitted;
                        c.opt_timer_start = Some(Utc::now());
                        c.opt_timer_end = None;
                    })
                    .map_err(|e| {
                        c.fail_count += 1;
                        debug!(tag = %c.tag(), error = %e, "submission failed");
                        c.fail_count
                    })
            });

            match submitted {
                // Pool invalid or tearing down; put the candidate back.
                None => {
                    self.job_start.lock().unwrap().push_front(s);
                    break;
                }
                Some(Ok(())) => {
                    self.in_flight.lock().unwrap().push(s);
                }
                Some(Err(fails)) if fails < self.cfg.fail_limit => {
                    self.job_start.lock().unwrap().push_back(s);
                }
                Some(Err(_)) => exhausted.push(s),
            }
        }

        exhausted
    }

    /// One polling pass over the in-flight set. Returns the candidates
    /// that hit the failure limit.
    pub fn poll_in_flight(&self) -> Vec<Arc<Structure>> {
        let snapshot: Vec<Arc<Structure>> = self.in_flight.lock().unwrap().clone();
        let mut exhausted = Vec::new();

        for s in snapshot {
            let state = self.with_channel(|chan| {
                let c = s.read();
                self.optimizer.poll(&c, chan)
            });

            let state = match state {
                None => break,
                Some(Ok(state)) => state,
                Some(Err(e)) => {
                    warn!(error = %e, "poll failed, treating job as missing");
                    JobState::Missing
                }
            };

            match state {
                JobState::Queued => {}
                JobState::Running => {
                    let mut c = s.write();
                    if c.status == Status::Submitted {
                        c.status = Status::InProcess;
                    }
                }
                JobState::Finished => {
                    self.remove_in_flight(&s);
                    if let Err(victim) = self.handle_finished(&s) {
                        exhausted.push(victim);
                    }
                }
                JobState::Failed => {
                    self.remove_in_flight(&s);
                    if let Err(victim) = self.register_failure(&s) {
                        exhausted.push(victim);
                    }
                }
                JobState::Missing => {
                    // The queue lost the job; resubmit from scratch.
                    self.remove_in_flight(&s);
                    s.write().status = Status::WaitingForOptimization;
                    self.append_to_job_start_tracker(s);
                }
            }
        }

        exhausted
    }

    fn remove_in_flight(&self, s: &Arc<Structure>) {
        self.in_flight.lock().unwrap().retain(|e| !Arc::ptr_eq(e, s));
    }

    /// Reads the finished step and either advances the candidate to the
    /// next step or marks it optimized.
    fn handle_finished(&self, s: &Arc<Structure>) -> Result<(), Arc<Structure>> {
        s.write().status = Status::StepOptimized;

        let fetched = self.with_channel(|chan| {
            let c = s.read();
            self.optimizer.fetch_outputs(&c, chan)
        });
        if let Some(Err(e)) = fetched {
            warn!(error = %e, "output transfer failed");
            return self.register_failure(s);
        }

        let mut c = s.write();
        if let Err(e) = self.optimizer.load(&mut c) {
            warn!(tag = %c.tag(), error = %e, "optimizer rejected output");
            c.fail_count += 1;
            let fails = c.fail_count;
            if fails < self.cfg.fail_limit {
                c.status = Status::WaitingForOptimization;
                drop(c);
                self.append_to_job_start_tracker(Arc::clone(s));
                return Ok(());
            }
            drop(c);
            return Err(Arc::clone(s));
        }

        c.fail_count = 0;
        c.opt_timer_end = Some(Utc::now());
        c.invalidate_fingerprint();

        if c.current_step < self.optimizer.num_steps() {
            c.current_step += 1;
            c.status = Status::WaitingForOptimization;
            drop(c);
            self.append_to_job_start_tracker(Arc::clone(s));
        } else {
            c.find_spacegroup(self.cfg.tol_spg);
            c.status = Status::Optimized;
            debug!(tag = %c.tag(), enthalpy = ?c.enthalpy, "candidate optimized");
        }
        Ok(())
    }

    fn register_failure(&self, s: &Arc<Structure>) -> Result<(), Arc<Structure>> {
        let mut c = s.write();
        c.fail_count += 1;
        if c.fail_count < self.cfg.fail_limit {
            c.status = Status::WaitingForOptimization;
            drop(c);
            self.append_to_job_start_tracker(Arc::clone(s));
            Ok(())
        } else {
            drop(c);
            Err(Arc::clone(s))
        }
    }
}
