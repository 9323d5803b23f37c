use std::fs;
use std::io::Write as _;
use std::path::Path;

use nalgebra::Point3;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::candidate::{Atom, Candidate};
use crate::core::composition::Composition;
use crate::core::config::SearchConfig;
use crate::engine::optimizer::Optimizer;
use crate::engine::store::Tracker;
use crate::error::EngineError;

pub const SESSION_STATE_FILE: &str = "xtalopt.state";
const SESSION_STATE_OLD: &str = "xtalopt.state.old";
const SESSION_STATE_TMP: &str = "xtalopt.state.tmp";
pub const STRUCTURE_STATE_FILE: &str = "structure.state";
/// Older sessions wrote this name; readers accept it, writers do not.
pub const LEGACY_STRUCTURE_STATE_FILE: &str = "xtal.state";

const STATE_VERSION: u32 = 2;

#[derive(Debug, Serialize, Deserialize)]
struct SessionState {
    version: u32,
    save_successful: bool,
    composition: Composition,
    config: SearchConfig,
}

/// Result of a successful `load_session`.
#[derive(Debug)]
pub struct LoadedSession {
    pub config: SearchConfig,
    pub composition: Composition,
    /// Sorted by index, reassigned densely from zero.
    pub candidates: Vec<Candidate>,
}

/// Writes the top-level session file atomically and every candidate's
/// `structure.state`.
///
/// The tmp file is written twice: first with `save_successful` down, then,
/// after all candidate states landed, with the flag up, fsynced and
/// renamed over the live file. The previous file survives as `.old`.
pub fn save_session(
    cfg: &SearchConfig,
    comp: &Composition,
    store: &Tracker,
) -> Result<(), EngineError> {
    let dir = &cfg.session_path;
    fs::create_dir_all(dir)?;
    let live = dir.join(SESSION_STATE_FILE);
    let tmp = dir.join(SESSION_STATE_TMP);

    write_session_state(&tmp, cfg, comp, false)?;

    for s in store.list() {
        let c = s.read();
        if c.local_path.as_os_str().is_empty() {
            continue;
        }
        fs::create_dir_all(&c.local_path)?;
        let json = serde_json::to_string_pretty(&*c)?;
        fs::write(c.local_path.join(STRUCTURE_STATE_FILE), json)?;
    }

    write_session_state(&tmp, cfg, comp, true)?;
    if live.exists() {
        let _ = fs::rename(&live, dir.join(SESSION_STATE_OLD));
    }
    fs::rename(&tmp, &live)?;
    debug!(path = %live.display(), "session saved");
    Ok(())
}

fn write_session_state(
    path: &Path,
    cfg: &SearchConfig,
    comp: &Composition,
    save_successful: bool,
) -> Result<(), EngineError> {
    let state = SessionState {
        version: STATE_VERSION,
        save_successful,
        composition: comp.clone(),
        config: cfg.clone(),
    };
    let json = serde_json::to_string_pretty(&state)?;
    let mut f = fs::File::create(path)?;
    f.write_all(json.as_bytes())?;
    f.sync_all()?;
    Ok(())
}

/// Loads a persisted session from its top-level state file.
///
/// Refuses incomplete saves, accepts the legacy per-candidate state file
/// name, lets the optimizer refresh each candidate from its newest output
/// (non-fatal), and republishes candidates in dense index order.
pub fn load_session(
    path: &Path,
    optimizer: &dyn Optimizer,
) -> Result<LoadedSession, EngineError> {
    let text = fs::read_to_string(path)
        .map_err(|e| EngineError::CorruptState(format!("cannot read {}: {e}", path.display())))?;
    let state: SessionState = serde_json::from_str(&text)
        .map_err(|e| EngineError::CorruptState(format!("unparseable session file: {e}")))?;
    if !state.save_successful {
        return Err(EngineError::CorruptState(format!(
            "{} is incomplete, corrupt, or invalid (try {}.old if it exists)",
            path.display(),
            path.display()
        )));
    }

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut candidates = Vec::new();

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let sub = entry.path();
        let state_file = [STRUCTURE_STATE_FILE, LEGACY_STRUCTURE_STATE_FILE]
            .iter()
            .map(|name| sub.join(name))
            .find(|p| p.exists());
        let Some(state_file) = state_file else {
            continue;
        };

        let mut c = read_candidate_state(&state_file, &state.composition)?;
        c.local_path = sub.clone();

        // The optimizer overwrites geometry and energies from its own
        // output files; status and timing survive the refresh.
        let status = c.status;
        let timer_end = c.opt_timer_end;
        if let Err(e) = optimizer.load(&mut c) {
            warn!(
                path = %sub.display(),
                error = %e,
                "no usable optimizer output (harmless for never-optimized structures)"
            );
        }
        c.status = status;
        c.opt_timer_end = timer_end;
        candidates.push(c);
    }

    candidates.sort_by_key(|c| c.index);
    for (i, c) in candidates.iter_mut().enumerate() {
        c.index = i;
    }

    Ok(LoadedSession {
        config: state.config,
        composition: state.composition,
        candidates,
    })
}

fn read_candidate_state(path: &Path, comp: &Composition) -> Result<Candidate, EngineError> {
    let text = fs::read_to_string(path)?;
    let mut c: Candidate = serde_json::from_str(&text).map_err(|e| {
        EngineError::CorruptState(format!("unparseable state file {}: {e}", path.display()))
    })?;

    // Defensive pre-fill: a state file without atoms still yields a
    // candidate of the right composition for the optimizer to populate.
    if c.atoms.is_empty() {
        c.atoms = comp
            .expand()
            .into_iter()
            .map(|z| Atom {
                atomic_number: z,
                position: Point3::origin(),
            })
            .collect();
    }
    Ok(c)
}
