use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, bail, Context, Result};
use nalgebra::Point3;
use serde_json::Value;

use crate::core::candidate::{Atom, Candidate};
use crate::core::cell::UnitCell;
use crate::core::composition::{atomic_number_of, element_symbol};
use crate::engine::optimizer::{JobState, Optimizer};
use crate::engine::pool::RemoteChannel;
use crate::engine::template::interpret_template;

/// Remote VASP plugin.
///
/// Inputs are uploaded to the candidate's remote directory and submitted
/// through the cluster's queue; the POTCAR compilation is assembled once
/// per session from the `"POTCAR info"` data entries, ordered to match the
/// alphabetical species order of `%POSCAR%`.
pub struct VaspOptimizer {
    incar_templates: Vec<String>,
    kpoints_templates: Vec<String>,
    /// Queue submission script; expanded like any other template.
    job_script: String,
    queue_submit: String,
    queue_status: String,
    data: Mutex<HashMap<String, Value>>,
    potcar: Mutex<String>,
}

impl VaspOptimizer {
    pub fn new(
        incar_templates: Vec<String>,
        kpoints_templates: Vec<String>,
        job_script: String,
    ) -> Self {
        Self {
            incar_templates,
            kpoints_templates,
            job_script,
            queue_submit: "qsub job.pbs".to_string(),
            queue_status: "qstat -f".to_string(),
            data: Mutex::new(HashMap::new()),
            potcar: Mutex::new(String::new()),
        }
    }

    pub fn with_queue_commands(mut self, submit: impl Into<String>, status: impl Into<String>) -> Self {
        self.queue_submit = submit.into();
        self.queue_status = status.into();
        self
    }

    fn template_for<'a>(&self, templates: &'a [String], step: usize) -> Result<&'a str> {
        templates
            .get(step.saturating_sub(1))
            .map(String::as_str)
            .ok_or_else(|| anyhow!("no VASP template for step {step}"))
    }

    /// Atom indices grouped by element symbol in alphabetical order, the
    /// same order `%POSCAR%` emits and CONTCAR reports back.
    fn alphabetical_atom_order(atoms: &[Atom]) -> Vec<usize> {
        let mut by_symbol: BTreeMap<&'static str, Vec<usize>> = BTreeMap::new();
        for (i, atom) in atoms.iter().enumerate() {
            by_symbol
                .entry(element_symbol(atom.atomic_number))
                .or_default()
                .push(i);
        }
        by_symbol.into_values().flatten().collect()
    }

    fn parse_outcar(text: &str) -> Result<(f64, f64)> {
        let mut energy = None;
        let mut enthalpy = None;
        for line in text.lines() {
            if line.contains("free  energy   TOTEN") || line.contains("free energy    TOTEN") {
                if let Some(v) = line
                    .split('=')
                    .nth(1)
                    .and_then(|r| r.split_whitespace().next())
                    .and_then(|t| t.parse::<f64>().ok())
                {
                    energy = Some(v);
                }
            }
            if line.contains("enthalpy is  TOTEN") {
                if let Some(v) = line
                    .split('=')
                    .nth(1)
                    .and_then(|r| r.split_whitespace().next())
                    .and_then(|t| t.parse::<f64>().ok())
                {
                    enthalpy = Some(v);
                }
            }
        }
        let energy = energy.ok_or_else(|| anyhow!("no TOTEN in OUTCAR"))?;
        Ok((energy, enthalpy.unwrap_or(energy)))
    }

    /// CONTCAR: comment, scale, three vectors, (symbols,) counts, Direct,
    /// fractional coordinates in alphabetical species order.
    fn parse_contcar(text: &str, candidate: &mut Candidate) -> Result<()> {
        let mut lines = text.lines();
        let _comment = lines.next().ok_or_else(|| anyhow!("empty CONTCAR"))?;
        let scale: f64 = lines
            .next()
            .and_then(|l| l.trim().parse().ok())
            .ok_or_else(|| anyhow!("bad CONTCAR scale line"))?;

        let mut vectors = [[0.0; 3]; 3];
        for row in &mut vectors {
            let line = lines.next().ok_or_else(|| anyhow!("truncated CONTCAR cell"))?;
            let vals: Vec<f64> = line
                .split_whitespace()
                .filter_map(|t| t.parse().ok())
                .collect();
            if vals.len() < 3 {
                bail!("malformed CONTCAR cell vector");
            }
            row.copy_from_slice(&vals[..3]);
        }
        let cell = UnitCell::from_vectors(
            nalgebra::Vector3::new(vectors[0][0], vectors[0][1], vectors[0][2]) * scale,
            nalgebra::Vector3::new(vectors[1][0], vectors[1][1], vectors[1][2]) * scale,
            nalgebra::Vector3::new(vectors[2][0], vectors[2][1], vectors[2][2]) * scale,
        );

        // VASP 5 writes a symbols line before the counts; VASP 4 does not.
        let mut counts_line = lines.next().ok_or_else(|| anyhow!("truncated CONTCAR"))?;
        let mut symbols: Vec<String> = Vec::new();
        if counts_line
            .split_whitespace()
            .next()
            .map(|t| t.parse::<usize>().is_err())
            .unwrap_or(true)
        {
            symbols = counts_line.split_whitespace().map(str::to_string).collect();
            counts_line = lines.next().ok_or_else(|| anyhow!("truncated CONTCAR"))?;
        }
        let counts: Vec<usize> = counts_line
            .split_whitespace()
            .filter_map(|t| t.parse().ok())
            .collect();
        let total: usize = counts.iter().sum();
        if total != candidate.atoms.len() {
            bail!(
                "CONTCAR atom count {total} does not match candidate ({})",
                candidate.atoms.len()
            );
        }

        // Skip "Selective dynamics" if present, require Direct coordinates.
        let mut mode = lines.next().ok_or_else(|| anyhow!("truncated CONTCAR"))?;
        if mode.trim_start().starts_with(['S', 's']) {
            mode = lines.next().ok_or_else(|| anyhow!("truncated CONTCAR"))?;
        }
        if !mode.trim_start().starts_with(['D', 'd']) {
            bail!("CONTCAR is not in Direct coordinates");
        }

        let order = Self::alphabetical_atom_order(&candidate.atoms);
        if !symbols.is_empty() {
            // Sanity check the symbols line against our own ordering.
            let expected: Vec<&str> = {
                let mut seen = Vec::new();
                for &i in &order {
                    let sym = element_symbol(candidate.atoms[i].atomic_number);
                    if seen.last() != Some(&sym) {
                        seen.push(sym);
                    }
                }
                seen
            };
            let got: Vec<&str> = symbols.iter().map(String::as_str).collect();
            if expected != got {
                bail!("CONTCAR species order {got:?} does not match {expected:?}");
            }
        }

        for &atom_idx in &order {
            let line = lines.next().ok_or_else(|| anyhow!("truncated CONTCAR coords"))?;
            let vals: Vec<f64> = line
                .split_whitespace()
                .take(3)
                .filter_map(|t| t.parse().ok())
                .collect();
            if vals.len() != 3 {
                bail!("malformed CONTCAR coordinate line");
            }
            candidate.atoms[atom_idx].position =
                cell.to_cartesian(&Point3::new(vals[0], vals[1], vals[2]));
        }
        candidate.cell = cell;
        candidate.invalidate_fingerprint();
        Ok(())
    }
}

impl Optimizer for VaspOptimizer {
    fn id_string(&self) -> &'static str {
        "VASP"
    }

    fn num_steps(&self) -> usize {
        self.incar_templates.len()
    }

    /// Seed import from a POSCAR/CONTCAR file with a VASP 5 symbols line.
    fn read(&self, candidate: &mut Candidate, path: &Path) -> Result<()> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read seed {}", path.display()))?;
        let mut lines = text.lines().skip(1);
        let scale: f64 = lines
            .next()
            .and_then(|l| l.trim().parse().ok())
            .ok_or_else(|| anyhow!("bad POSCAR scale"))?;
        let mut vecs = Vec::new();
        for _ in 0..3 {
            let line = lines.next().ok_or_else(|| anyhow!("truncated POSCAR"))?;
            let vals: Vec<f64> = line
                .split_whitespace()
                .filter_map(|t| t.parse().ok())
                .collect();
            if vals.len() < 3 {
                bail!("malformed POSCAR cell vector");
            }
            vecs.push(nalgebra::Vector3::new(vals[0], vals[1], vals[2]) * scale);
        }
        let cell = UnitCell::from_vectors(vecs[0], vecs[1], vecs[2]);

        let symbols: Vec<u8> = lines
            .next()
            .ok_or_else(|| anyhow!("truncated POSCAR"))?
            .split_whitespace()
            .map(|s| atomic_number_of(s).ok_or_else(|| anyhow!("unknown element {s}")))
            .collect::<Result<_>>()?;
        let counts: Vec<usize> = lines
            .next()
            .ok_or_else(|| anyhow!("truncated POSCAR"))?
            .split_whitespace()
            .filter_map(|t| t.parse().ok())
            .collect();
        if symbols.len() != counts.len() {
            bail!("POSCAR symbols and counts disagree");
        }

        let mut mode = lines.next().ok_or_else(|| anyhow!("truncated POSCAR"))?;
        if mode.trim_start().starts_with(['S', 's']) {
            mode = lines.next().ok_or_else(|| anyhow!("truncated POSCAR"))?;
        }
        if !mode.trim_start().starts_with(['D', 'd']) {
            bail!("only Direct-coordinate seeds are supported");
        }

        let mut atoms = Vec::new();
        for (&z, &count) in symbols.iter().zip(&counts) {
            for _ in 0..count {
                let line = lines.next().ok_or_else(|| anyhow!("truncated POSCAR coords"))?;
                let vals: Vec<f64> = line
                    .split_whitespace()
                    .take(3)
                    .filter_map(|t| t.parse().ok())
                    .collect();
                if vals.len() != 3 {
                    bail!("malformed POSCAR coordinate line");
                }
                atoms.push(Atom {
                    atomic_number: z,
                    position: cell.to_cartesian(&Point3::new(vals[0], vals[1], vals[2])),
                });
            }
        }

        candidate.cell = cell;
        candidate.atoms = atoms;
        candidate.invalidate_fingerprint();
        Ok(())
    }

    fn write_input(
        &self,
        candidate: &mut Candidate,
        channel: &mut dyn RemoteChannel,
    ) -> Result<()> {
        let step = candidate.current_step;
        let incar = interpret_template(self.template_for(&self.incar_templates, step)?, candidate);
        let kpoints =
            interpret_template(self.template_for(&self.kpoints_templates, step)?, candidate);
        let poscar = interpret_template("%POSCAR%", candidate);
        let job = interpret_template(&self.job_script, candidate);
        let potcar = self.potcar.lock().unwrap().clone();
        if potcar.is_empty() {
            bail!("POTCAR compilation has not been built");
        }

        let dir = candidate.remote_path.trim_end_matches('/').to_string();
        channel.mkdir_all(&dir)?;
        channel.upload_text(&format!("{dir}/INCAR"), &incar)?;
        channel.upload_text(&format!("{dir}/KPOINTS"), &kpoints)?;
        channel.upload_text(&format!("{dir}/POSCAR"), &poscar)?;
        channel.upload_text(&format!("{dir}/POTCAR"), &potcar)?;
        channel.upload_text(&format!("{dir}/job.pbs"), &job)?;
        Ok(())
    }

    fn start_job(
        &self,
        candidate: &mut Candidate,
        channel: &mut dyn RemoteChannel,
    ) -> Result<()> {
        let dir = candidate.remote_path.trim_end_matches('/');
        let out = channel.exec(&format!("cd '{dir}' && {}", self.queue_submit))?;
        if !out.success() {
            bail!("queue submission failed: {}", out.stderr);
        }
        let job_id: u64 = out
            .stdout
            .trim()
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect::<String>()
            .parse()
            .context("queue returned no job id")?;
        candidate.job_id = Some(job_id);
        Ok(())
    }

    fn poll(&self, candidate: &Candidate, channel: &mut dyn RemoteChannel) -> Result<JobState> {
        let Some(job_id) = candidate.job_id else {
            return Ok(JobState::Missing);
        };
        let out = channel.exec(&format!("{} {job_id} 2>&1", self.queue_status))?;

        if out.success() {
            for line in out.stdout.lines() {
                if let Some(state) = line.trim().strip_prefix("job_state = ") {
                    return Ok(match state.trim() {
                        "R" | "E" => JobState::Running,
                        "Q" | "H" | "W" => JobState::Queued,
                        "C" => JobState::Finished,
                        _ => JobState::Running,
                    });
                }
            }
        }

        // The queue forgot the job: finished if output exists, lost if not.
        let dir = candidate.remote_path.trim_end_matches('/');
        let probe = channel.exec(&format!("test -f '{dir}/OUTCAR'"))?;
        if probe.success() {
            Ok(JobState::Finished)
        } else {
            Ok(JobState::Missing)
        }
    }

    fn fetch_outputs(
        &self,
        candidate: &Candidate,
        channel: &mut dyn RemoteChannel,
    ) -> Result<()> {
        let dir = candidate.remote_path.trim_end_matches('/');
        std::fs::create_dir_all(&candidate.local_path)?;
        for name in ["OUTCAR", "CONTCAR"] {
            let contents = channel.download_text(&format!("{dir}/{name}"))?;
            std::fs::write(candidate.local_path.join(name), contents)?;
        }
        Ok(())
    }

    fn load(&self, candidate: &mut Candidate) -> Result<()> {
        let outcar = std::fs::read_to_string(candidate.local_path.join("OUTCAR"))
            .context("cannot read OUTCAR")?;
        let (energy, enthalpy) = Self::parse_outcar(&outcar)?;

        let contcar_path = candidate.local_path.join("CONTCAR");
        if contcar_path.exists() {
            let contcar = std::fs::read_to_string(&contcar_path)?;
            Self::parse_contcar(&contcar, candidate)?;
        }

        candidate.energy = Some(energy);
        candidate.enthalpy = Some(enthalpy);
        candidate.pv = Some(enthalpy - energy);
        candidate.invalidate_fingerprint();
        Ok(())
    }

    fn get_data(&self, key: &str) -> Option<Value> {
        self.data.lock().unwrap().get(key).cloned()
    }

    fn set_data(&self, key: &str, value: Value) {
        self.data.lock().unwrap().insert(key.to_string(), value);
    }

    /// Concatenates the per-element POTCAR files named by `"POTCAR info"`,
    /// in alphabetical symbol order to match `%POSCAR%`.
    fn build_auxiliary_files(&self) -> Result<()> {
        let info = self
            .get_data("POTCAR info")
            .ok_or_else(|| anyhow!("POTCAR info is not set"))?;
        let entries = info
            .as_array()
            .ok_or_else(|| anyhow!("POTCAR info must be a list"))?;

        let mut sources: BTreeMap<String, String> = BTreeMap::new();
        for entry in entries {
            let symbol = entry
                .get("symbol")
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow!("POTCAR entry without symbol"))?;
            let path = entry
                .get("path")
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow!("POTCAR entry without path"))?;
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("cannot read POTCAR for {symbol}"))?;
            sources.insert(symbol.to_string(), contents);
        }

        let mut compiled = String::new();
        for contents in sources.values() {
            compiled.push_str(contents);
            if !contents.ends_with('\n') {
                compiled.push('\n');
            }
        }
        *self.potcar.lock().unwrap() = compiled;
        Ok(())
    }
}
