use thiserror::Error;

use crate::engine::pool::ConnectionFault;

/// Fault taxonomy for the search engine.
///
/// A failed candidate never corrupts the store: plugin and transport
/// failures are mapped onto the candidate's own status and the failure
/// policy, while the variants here surface conditions the session itself
/// must react to.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Nonsensical limits, fatal before the session starts.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Random placement exhausted its attempts.
    #[error("random structure generation failed after {attempts} rejected candidates")]
    StructureBuildFailed { attempts: usize },

    /// A genetic operator ran out of retries.
    #[error("operator {0} failed after 1000 attempts")]
    OperatorFailed(&'static str),

    #[error(transparent)]
    Connection(#[from] ConnectionFault),

    /// The optimizer plugin rejected input or output for a candidate.
    #[error("optimizer plugin failure for {tag}: {message}")]
    PluginFailure { tag: String, message: String },

    /// Persistence refused a state file.
    #[error("corrupt session state: {0}")]
    CorruptState(String),

    #[error("remote transport failure: {0}")]
    TransportFailure(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("state (de)serialization failed: {0}")]
    State(#[from] serde_json::Error),
}
