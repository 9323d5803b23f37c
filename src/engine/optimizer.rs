use std::path::Path;

use anyhow::Result;
use serde_json::Value;

use crate::core::candidate::Candidate;
use crate::engine::pool::RemoteChannel;

/// Remote job status as reported by the queue on the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
    Finished,
    Failed,
    /// The queue has no record of the job; it must be resubmitted.
    Missing,
}

/// One external relaxation program.
///
/// The engine drives every candidate through the plugin's step list
/// (`1..=num_steps`), writing inputs and polling over a checked-out pool
/// channel. A plugin whose `id_string` is `"GULP"` runs purely locally and
/// the engine constructs no connection pool for it.
pub trait Optimizer: Send + Sync {
    fn id_string(&self) -> &'static str;

    /// Number of relaxation steps candidates pass through.
    fn num_steps(&self) -> usize;

    /// Imports a seed structure from a file on disk.
    fn read(&self, candidate: &mut Candidate, path: &Path) -> Result<()>;

    /// Writes the input deck for the candidate's current step.
    fn write_input(&self, candidate: &mut Candidate, channel: &mut dyn RemoteChannel)
        -> Result<()>;

    /// Launches the relaxation; records the queue's job id on the candidate.
    fn start_job(&self, candidate: &mut Candidate, channel: &mut dyn RemoteChannel)
        -> Result<()>;

    /// Queries the queue for the candidate's job.
    fn poll(&self, candidate: &Candidate, channel: &mut dyn RemoteChannel) -> Result<JobState>;

    /// Copies the finished job's output files from the candidate's remote
    /// directory into its local one. Local plugins need no transport and
    /// keep the default no-op.
    fn fetch_outputs(
        &self,
        _candidate: &Candidate,
        _channel: &mut dyn RemoteChannel,
    ) -> Result<()> {
        Ok(())
    }

    /// Parses the newest relaxation output in the candidate's local
    /// directory, updating geometry and energies.
    fn load(&self, candidate: &mut Candidate) -> Result<()>;

    /// Free-form plugin data, e.g. `"POTCAR info"` for VASP.
    fn get_data(&self, key: &str) -> Option<Value>;

    fn set_data(&self, key: &str, value: Value);

    /// Assembles derived input files (e.g. the POTCAR compilation) before
    /// the session starts.
    fn build_auxiliary_files(&self) -> Result<()> {
        Ok(())
    }
}
