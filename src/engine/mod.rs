pub mod duplicates;
pub mod external;
pub mod generator;
pub mod operators;
pub mod optimizer;
pub mod pool;
pub mod remote;
pub mod scheduler;
pub mod store;
pub mod template;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, error, info, warn};

use crate::core::candidate::{Candidate, Status};
use crate::core::cell::UnitCell;
use crate::core::composition::Composition;
use crate::core::config::{FailureAction, SearchConfig};
use crate::error::EngineError;
use crate::interface::prompt::Prompter;
use crate::persist;
use duplicates::DuplicateChecker;
use optimizer::Optimizer;
use pool::{ChannelFactory, ConnectionPool, Credentials, FaultKind};
use scheduler::QueueManager;
use store::{StoreEvent, Structure, Tracker};

/// Engine id for the optimizer that runs without a cluster.
const LOCAL_OPTIMIZER_ID: &str = "GULP";

/// How many rejected random candidates the initial fill tolerates before
/// giving up on the configuration.
const INITIAL_FILL_ATTEMPT_LIMIT: usize = 10_000;

/// The search session: owns the store, the scheduler, the pool and the
/// engine-wide RNG, and runs the cooperative background loops.
///
/// All cross-component notifications flow over the store's event channel;
/// no component calls back into another while holding a lock.
pub struct SearchEngine {
    me: Weak<Self>,
    cfg: SearchConfig,
    comp: Composition,
    store: Arc<Tracker>,
    queue: Arc<QueueManager>,
    duplicates: Arc<DuplicateChecker>,
    pool: Option<Arc<ConnectionPool>>,
    optimizer: Arc<dyn Optimizer>,
    prompter: Arc<dyn Prompter>,
    rng: Mutex<ChaCha8Rng>,
    /// Serializes `(generation, id_number)` allocation.
    naming: Mutex<()>,
    stop: Arc<AtomicBool>,
    read_only: AtomicBool,
    events: Mutex<Option<Receiver<StoreEvent>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl SearchEngine {
    pub fn new(
        cfg: SearchConfig,
        comp: Composition,
        optimizer: Arc<dyn Optimizer>,
        prompter: Arc<dyn Prompter>,
        factory: Box<dyn ChannelFactory>,
    ) -> Arc<Self> {
        let (tx, rx) = unbounded();
        let store = Arc::new(Tracker::new(tx));

        // A purely local optimizer gets no connection pool.
        let pool = (optimizer.id_string() != LOCAL_OPTIMIZER_ID)
            .then(|| Arc::new(ConnectionPool::new(cfg.num_connections, factory)));

        let queue = Arc::new(QueueManager::new(
            Arc::clone(&store),
            pool.clone(),
            Arc::clone(&optimizer),
            cfg.clone(),
        ));
        let duplicates = DuplicateChecker::new(
            Arc::clone(&store),
            cfg.tol_enthalpy,
            cfg.tol_volume,
            cfg.tol_spg,
        );

        let rng = if cfg.rng_seed != 0 {
            ChaCha8Rng::seed_from_u64(cfg.rng_seed)
        } else {
            ChaCha8Rng::from_entropy()
        };

        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            cfg,
            comp,
            store,
            queue,
            duplicates,
            pool,
            optimizer,
            prompter,
            rng: Mutex::new(rng),
            naming: Mutex::new(()),
            stop: Arc::new(AtomicBool::new(false)),
            read_only: AtomicBool::new(false),
            events: Mutex::new(Some(rx)),
            threads: Mutex::new(Vec::new()),
        })
    }

    pub fn store(&self) -> &Arc<Tracker> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<QueueManager> {
        &self.queue
    }

    pub fn duplicates(&self) -> &Arc<DuplicateChecker> {
        &self.duplicates
    }

    pub fn config(&self) -> &SearchConfig {
        &self.cfg
    }

    pub fn composition(&self) -> &Composition {
        &self.comp
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    /// Starts a fresh session: validates the configuration, establishes
    /// the pool, seeds the population and spins up the loops.
    pub fn start_search(&self) -> Result<(), EngineError> {
        self.seed_initial_population()?;
        self.spawn_loops();
        self.duplicates.reset_duplicates();
        Ok(())
    }

    /// Everything `start_search` does before the background loops begin:
    /// config validation, pool setup, seed import and the initial random
    /// fill.
    pub fn seed_initial_population(&self) -> Result<(), EngineError> {
        info!("starting optimization");
        self.cfg.check_limits()?;
        if self.comp.is_empty() {
            return Err(EngineError::ConfigInvalid("composition is not set".into()));
        }
        self.check_vasp_prerequisites()?;

        if let Err(e) = self.setup_connections() {
            error!(error = %e, "cannot establish connection pool");
            return Err(e);
        }

        self.store.delete_all_structures();

        // Seeds first, then randoms up to the initial population.
        for seed in self.cfg.seeds.clone() {
            let mut c = Candidate::new(UnitCell::new(1.0, 1.0, 1.0, 90.0, 90.0, 90.0));
            if let Err(e) = self.optimizer.read(&mut c, &seed) {
                self.store.delete_all_structures();
                return Err(EngineError::PluginFailure {
                    tag: seed.display().to_string(),
                    message: format!("error loading seed: {e}"),
                });
            }
            c.status = Status::WaitingForOptimization;
            let parents = format!("Seeded: {}", seed.display());
            debug!(seed = %seed.display(), "loaded seed");
            self.initialize_and_add(c, 1, parents);
        }

        let mut failed = 0usize;
        while self.store.size() < self.cfg.num_initial {
            if failed >= INITIAL_FILL_ATTEMPT_LIMIT {
                return Err(EngineError::StructureBuildFailed { attempts: failed });
            }
            let candidate = {
                let mut rng = self.rng.lock().unwrap();
                generator::generate_random_candidate(&self.cfg, &self.comp, 1, 0, &mut *rng)
            };
            let Some(mut c) = candidate else {
                failed += 1;
                continue;
            };
            if !generator::check_candidate(&mut c, &self.cfg) {
                failed += 1;
                continue;
            }
            let kept = self.store.size() + 1;
            info!(generated = kept + failed, kept, rejected = failed, "generating structures");
            self.initialize_and_add(c, 1, "Randomly generated".to_string());
        }

        self.save()?;
        Ok(())
    }

    fn check_vasp_prerequisites(&self) -> Result<(), EngineError> {
        if self.optimizer.id_string() != "VASP" {
            return Ok(());
        }
        let potcar_ok = self
            .optimizer
            .get_data("POTCAR info")
            .and_then(|v| v.as_array().map(|a| !a.is_empty()))
            .unwrap_or(false);
        if !potcar_ok {
            return Err(EngineError::ConfigInvalid(
                "VASP is selected and POTCAR info is empty; choose pseudopotentials first".into(),
            ));
        }
        let recorded: Vec<u8> = self
            .optimizer
            .get_data("Composition")
            .and_then(|v| {
                v.as_array().map(|a| {
                    a.iter()
                        .filter_map(|e| e.as_u64().map(|z| z as u8))
                        .collect()
                })
            })
            .unwrap_or_default();
        if recorded != self.comp.atomic_numbers() {
            return Err(EngineError::ConfigInvalid(
                "POTCAR composition does not match the session composition".into(),
            ));
        }
        self.optimizer
            .build_auxiliary_files()
            .map_err(|e| EngineError::PluginFailure {
                tag: "POTCAR".into(),
                message: e.to_string(),
            })
    }

    /// Opens the pool, looping through the prompter on recoverable faults.
    fn setup_connections(&self) -> Result<(), EngineError> {
        let Some(pool) = &self.pool else {
            return Ok(());
        };
        let mut password: Option<String> = None;
        loop {
            let creds = Credentials {
                host: self.cfg.host.clone(),
                username: self.cfg.username.clone(),
                password: password.clone(),
                port: self.cfg.port,
            };
            let fault = match pool.make_connections(&creds) {
                Ok(()) => return Ok(()),
                Err(fault) => fault,
            };
            match fault.kind {
                FaultKind::UnknownHost => {
                    let msg = format!(
                        "The host {}:{} has an unknown key, or has changed its key:\n{}\n\
                         Would you like to trust this host?",
                        self.cfg.host,
                        self.cfg.port,
                        pool.server_key_hash()
                    );
                    if self.prompter.ask_yes_no(&msg) {
                        pool.validate_server_key();
                        continue;
                    }
                    return Err(fault.into());
                }
                FaultKind::BadPassword => {
                    let msg = format!(
                        "Please enter a password for {}@{}:{}:",
                        self.cfg.username, self.cfg.host, self.cfg.port
                    );
                    match self.prompter.ask_password(&msg) {
                        Some(pw) => {
                            password = Some(pw);
                            continue;
                        }
                        None => return Err(fault.into()),
                    }
                }
                _ => return Err(fault.into()),
            }
        }
    }

    /// Publishes a candidate under the session's naming discipline:
    /// `id_number` is allocated under the store lock, directories are
    /// created, the space group is stamped.
    pub fn initialize_and_add(
        &self,
        mut c: Candidate,
        generation: u32,
        parents: String,
    ) -> Arc<Structure> {
        let _naming = self.naming.lock().unwrap();

        let mut id = 1;
        {
            let list = self.store.lock_for_write();
            for s in list.iter() {
                let e = s.read();
                if e.generation == generation && e.id_number >= id {
                    id = e.id_number + 1;
                }
            }
        }

        c.generation = generation;
        c.id_number = id;
        c.parents = parents;
        let dir = format!("{generation:05}x{id:05}");
        c.local_path = self.cfg.session_path.join(&dir);
        c.remote_path = format!("{}/{}", self.cfg.remote_path.trim_end_matches('/'), dir);
        if let Err(e) = std::fs::create_dir_all(&c.local_path) {
            error!(path = %c.local_path.display(), error = %e, "cannot create structure directory");
        }
        c.current_step = 1;
        c.find_spacegroup(self.cfg.tol_spg);

        let s = Structure::new(c);
        self.store.append(Arc::clone(&s));
        s
    }

    /// Breeds (or randomly generates) one new candidate on a worker thread.
    pub fn generate_new_structure(&self) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        std::thread::spawn(move || me.generate_new_structure_blocking());
    }

    pub fn generate_new_structure_blocking(&self) {
        let mut optimized: Vec<Candidate> = self
            .store
            .list()
            .iter()
            .filter_map(|s| {
                let c = s.read();
                (c.status == Status::Optimized).then(|| c.clone())
            })
            .collect();

        // Not enough survivors to breed from; fall back to random.
        if optimized.len() < 3 {
            let c = self.random_valid_candidate();
            self.initialize_and_add(c, 1, "Randomly generated".to_string());
            return;
        }

        optimized.sort_by(|x, y| {
            x.enthalpy
                .unwrap_or(0.0)
                .partial_cmp(&y.enthalpy.unwrap_or(0.0))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(x.index.cmp(&y.index))
        });
        optimized.truncate(self.cfg.pop_size + 1);

        let bred = {
            let mut rng = self.rng.lock().unwrap();
            generator::breed(&optimized, &self.cfg, &self.comp, &mut *rng)
        };
        match bred {
            Ok(off) => {
                self.initialize_and_add(off.candidate, off.generation, off.parents);
            }
            Err(e) => {
                warn!(error = %e, "breeding failed, substituting a random candidate");
                let c = self.random_valid_candidate();
                self.initialize_and_add(c, 1, "Randomly generated".to_string());
            }
        }
    }

    fn random_valid_candidate(&self) -> Candidate {
        loop {
            let candidate = {
                let mut rng = self.rng.lock().unwrap();
                generator::generate_random_candidate(&self.cfg, &self.comp, 1, 0, &mut *rng)
            };
            if let Some(mut c) = candidate {
                if generator::check_candidate(&mut c, &self.cfg) {
                    return c;
                }
            }
        }
    }

    /// In-place replacement of a failed candidate with a fresh random
    /// structure. `(generation, id_number, index)` survive; energies, step
    /// and failure bookkeeping reset.
    pub fn replace_with_random(&self, s: &Arc<Structure>, reason: &str) {
        let fresh = self.random_valid_candidate();
        let mut c = s.write();
        c.cell = fresh.cell;
        c.atoms = fresh.atoms;
        c.energy = None;
        c.enthalpy = None;
        c.pv = None;
        c.current_step = 1;
        c.fail_count = 0;
        c.status = Status::WaitingForOptimization;
        c.duplicate_of = None;
        c.job_id = None;
        c.parents = if reason.is_empty() {
            "Randomly generated".to_string()
        } else {
            format!("Randomly generated ({reason})")
        };
        c.invalidate_fingerprint();
        c.find_spacegroup(self.cfg.tol_spg);
    }

    /// Applies the configured failure policy to candidates that ran out
    /// of retries.
    pub fn apply_failure_policy(&self, victims: Vec<Arc<Structure>>) {
        for s in victims {
            match self.cfg.failure_action {
                FailureAction::ReplaceWithRandom => {
                    let fails = s.read().fail_count;
                    self.replace_with_random(&s, &format!("failed {fails} times"));
                    self.queue.append_to_job_start_tracker(s);
                }
                FailureAction::MarkError => {
                    let mut c = s.write();
                    warn!(tag = %c.tag(), "marking candidate as errored");
                    c.status = Status::Error;
                }
            }
        }
    }

    /// Spins up the event pump, the scheduling loop and the breeding loop.
    pub fn spawn_loops(&self) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        self.stop.store(false, Ordering::SeqCst);
        let mut threads = self.threads.lock().unwrap();

        if let Some(rx) = self.events.lock().unwrap().take() {
            let pump = Arc::clone(&me);
            threads.push(std::thread::spawn(move || pump.event_pump(rx)));
        }

        let sched = Arc::clone(&me);
        threads.push(std::thread::spawn(move || sched.scheduling_loop()));

        threads.push(std::thread::spawn(move || me.breeding_loop()));
    }

    fn event_pump(&self, rx: Receiver<StoreEvent>) {
        loop {
            match rx.recv_timeout(Duration::from_millis(200)) {
                Ok(StoreEvent::NewStructureAdded(s)) => {
                    if s.read().status == Status::WaitingForOptimization {
                        self.queue.append_to_job_start_tracker(Arc::clone(&s));
                    }
                    self.duplicates.trigger();
                }
                Ok(StoreEvent::StructureCountChanged(n)) => {
                    debug!(count = n, "structure count changed");
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.stop.load(Ordering::SeqCst) {
                        return;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    fn scheduling_loop(&self) {
        while !self.stop.load(Ordering::SeqCst) {
            let victims = self.queue.submit_pending();
            self.apply_failure_policy(victims);
            let victims = self.queue.poll_in_flight();
            self.apply_failure_policy(victims);

            for _ in 0..10 {
                if self.stop.load(Ordering::SeqCst) {
                    return;
                }
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }

    fn breeding_loop(&self) {
        while !self.stop.load(Ordering::SeqCst) {
            let active = self.queue.pending_count() + self.queue.in_flight_count();
            if active < self.cfg.target_in_flight {
                self.generate_new_structure_blocking();
            } else {
                std::thread::sleep(Duration::from_millis(500));
            }
        }
    }

    /// Cooperative halt: flags the loops, joins them, then drains the
    /// pool. In-flight remote jobs are left to finish on their own.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        let handles = std::mem::take(&mut *self.threads.lock().unwrap());
        for h in handles {
            let _ = h.join();
        }
        if let Some(pool) = &self.pool {
            pool.shutdown();
        }
        info!("search halted");
    }

    /// Writes the session file and every candidate's state file.
    pub fn save(&self) -> Result<(), EngineError> {
        persist::save_session(&self.cfg, &self.comp, &self.store)
    }

    /// Resumes a persisted session.
    ///
    /// Candidates are republished in index order; pool failures drop the
    /// session to read-only instead of aborting (the prompter decides for
    /// recoverable faults).
    pub fn load(
        path: &Path,
        optimizer: Arc<dyn Optimizer>,
        prompter: Arc<dyn Prompter>,
        factory: Box<dyn ChannelFactory>,
        force_read_only: bool,
    ) -> Result<Arc<Self>, EngineError> {
        let loaded = persist::load_session(path, optimizer.as_ref())?;
        let engine = Self::new(loaded.config, loaded.composition, optimizer, prompter, factory);
        engine.read_only.store(force_read_only, Ordering::SeqCst);

        for c in loaded.candidates {
            let waiting = c.status == Status::WaitingForOptimization;
            let s = Structure::new(c);
            engine.store.append(Arc::clone(&s));
            if waiting {
                engine.queue.append_to_job_start_tracker(s);
            }
        }
        info!(count = engine.store.size(), read_only = engine.is_read_only(), "session loaded");

        if engine.is_read_only() {
            return Ok(engine);
        }

        if let Err(e) = engine.setup_connections() {
            warn!(error = %e, "pool setup failed, resuming in read-only mode");
            engine.read_only.store(true, Ordering::SeqCst);
            return Ok(engine);
        }

        engine.spawn_loops();
        Ok(engine)
    }
}
