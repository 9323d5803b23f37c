#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use serde_json::Value;

use xtalsearch::core::candidate::{Atom, Candidate, Status};
use xtalsearch::core::cell::UnitCell;
use xtalsearch::core::composition::Composition;
use xtalsearch::core::config::{ParamRange, SearchConfig, VolumeMode};
use xtalsearch::engine::optimizer::{JobState, Optimizer};
use xtalsearch::engine::pool::{
    ChannelFactory, ConnectionFault, Credentials, ExecOutput, FaultKind, RemoteChannel,
};

/// Optimizer double: submission succeeds through the channel, polling
/// reports finished, and `load` either relaxes to a volume-derived energy
/// (`relax = true`) or fails like a plugin with no output on disk.
pub struct MockOptimizer {
    id: &'static str,
    steps: usize,
    relax: bool,
    data: Mutex<HashMap<String, Value>>,
}

impl MockOptimizer {
    pub fn new(id: &'static str, steps: usize, relax: bool) -> Self {
        Self {
            id,
            steps,
            relax,
            data: Mutex::new(HashMap::new()),
        }
    }

    /// Local-only variant; the engine builds no pool for it.
    pub fn local() -> Self {
        Self::new("GULP", 1, true)
    }
}

impl Optimizer for MockOptimizer {
    fn id_string(&self) -> &'static str {
        self.id
    }

    fn num_steps(&self) -> usize {
        self.steps
    }

    fn read(&self, _candidate: &mut Candidate, path: &Path) -> Result<()> {
        bail!("mock optimizer cannot read seeds ({})", path.display())
    }

    fn write_input(&self, _candidate: &mut Candidate, channel: &mut dyn RemoteChannel) -> Result<()> {
        channel.exec("write-input")?;
        Ok(())
    }

    fn start_job(&self, candidate: &mut Candidate, channel: &mut dyn RemoteChannel) -> Result<()> {
        channel.exec("start-job")?;
        candidate.job_id = Some(u64::from(candidate.id_number));
        Ok(())
    }

    fn poll(&self, _candidate: &Candidate, _channel: &mut dyn RemoteChannel) -> Result<JobState> {
        Ok(JobState::Finished)
    }

    fn load(&self, candidate: &mut Candidate) -> Result<()> {
        if !self.relax {
            bail!("no relaxation output on disk");
        }
        let energy = -candidate.volume();
        candidate.energy = Some(energy);
        candidate.enthalpy = Some(energy);
        candidate.pv = Some(0.0);
        Ok(())
    }

    fn get_data(&self, key: &str) -> Option<Value> {
        self.data.lock().unwrap().get(key).cloned()
    }

    fn set_data(&self, key: &str, value: Value) {
        self.data.lock().unwrap().insert(key.to_string(), value);
    }
}

/// Channel double that tracks how many execs run concurrently.
pub struct MockChannel {
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl RemoteChannel for MockChannel {
    fn exec(&mut self, _command: &str) -> Result<ExecOutput> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(2));
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(ExecOutput {
            status: 0,
            stdout: "1".to_string(),
            stderr: String::new(),
        })
    }

    fn upload_text(&mut self, _remote_path: &str, _contents: &str) -> Result<()> {
        Ok(())
    }

    fn download_text(&mut self, _remote_path: &str) -> Result<String> {
        Ok(String::new())
    }

    fn mkdir_all(&mut self, _remote_path: &str) -> Result<()> {
        Ok(())
    }
}

pub struct MockChannelFactory {
    pub active: Arc<AtomicUsize>,
    pub peak: Arc<AtomicUsize>,
    /// Faults returned before the first successful connect.
    pub faults: Mutex<Vec<FaultKind>>,
}

impl MockChannelFactory {
    pub fn new() -> Self {
        Self {
            active: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
            faults: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_with(faults: Vec<FaultKind>) -> Self {
        let f = Self::new();
        *f.faults.lock().unwrap() = faults;
        f
    }
}

impl ChannelFactory for MockChannelFactory {
    fn connect(&self, _creds: &Credentials) -> Result<Box<dyn RemoteChannel>, ConnectionFault> {
        if let Some(kind) = self.faults.lock().unwrap().pop() {
            return Err(ConnectionFault::new(kind, "scripted fault"));
        }
        Ok(Box::new(MockChannel {
            active: Arc::clone(&self.active),
            peak: Arc::clone(&self.peak),
        }))
    }

    fn server_key_hash(&self, _creds: &Credentials) -> Option<String> {
        Some("aa:bb:cc".to_string())
    }

    fn trust_server_key(&self, _creds: &Credentials) -> bool {
        true
    }
}

/// Bounds from the initial-fill scenario: silicon, easy packing.
pub fn test_config(session: &Path) -> SearchConfig {
    SearchConfig {
        session_path: session.to_path_buf(),
        remote_path: "/tmp/xs-remote".to_string(),
        a: ParamRange::new(3.0, 5.0),
        b: ParamRange::new(3.0, 5.0),
        c: ParamRange::new(3.0, 5.0),
        alpha: ParamRange::new(80.0, 100.0),
        beta: ParamRange::new(80.0, 100.0),
        gamma: ParamRange::new(80.0, 100.0),
        volume: VolumeMode::Range { min: 30.0, max: 120.0 },
        min_interatomic_distance: Some(1.5),
        num_initial: 3,
        rng_seed: 7,
        ..SearchConfig::default()
    }
}

pub fn test_composition() -> Composition {
    Composition::from_pairs(&[(14, 4)])
}

/// Hand-built candidate for store and duplicate tests.
pub fn make_candidate(generation: u32, id: u32, enthalpy: f64) -> Candidate {
    let cell = UnitCell::new(4.0, 4.0, 4.0, 90.0, 90.0, 90.0);
    let mut c = Candidate::new(cell);
    c.generation = generation;
    c.id_number = id;
    c.atoms = vec![
        Atom {
            atomic_number: 14,
            position: cell.to_cartesian(&nalgebra::Point3::new(0.0, 0.0, 0.0)),
        },
        Atom {
            atomic_number: 14,
            position: cell.to_cartesian(&nalgebra::Point3::new(0.5, 0.5, 0.5)),
        },
    ];
    c.energy = Some(enthalpy);
    c.enthalpy = Some(enthalpy);
    c.pv = Some(0.0);
    c.status = Status::WaitingForOptimization;
    c
}
