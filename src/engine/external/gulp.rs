use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, bail, Context, Result};
use nalgebra::Point3;
use serde_json::Value;

use crate::core::candidate::{Atom, Candidate};
use crate::core::cell::UnitCell;
use crate::core::composition::atomic_number_of;
use crate::engine::optimizer::{JobState, Optimizer};
use crate::engine::pool::RemoteChannel;
use crate::engine::template::interpret_template;

const INPUT_FILE: &str = "xtal.gin";
const OUTPUT_FILE: &str = "xtal.got";

/// Local GULP plugin.
///
/// GULP relaxations run on the operator's machine, so the engine builds no
/// connection pool for this plugin; the channel handed in by the scheduler
/// is the local one. Each step writes a templated `.gin` input, runs the
/// executable synchronously and parses the `.got` output.
pub struct GulpOptimizer {
    executable: String,
    step_templates: Vec<String>,
    data: Mutex<HashMap<String, Value>>,
}

impl GulpOptimizer {
    pub fn new(executable: impl Into<String>, step_templates: Vec<String>) -> Self {
        Self {
            executable: executable.into(),
            step_templates,
            data: Mutex::new(HashMap::new()),
        }
    }

    /// Single-step template for a constant-pressure relaxation with the
    /// given potential block appended.
    pub fn default_template(potentials: &str) -> String {
        format!(
            "opti conp conjugate\n\
             cell\n\
             %a% %b% %c% %alphaDeg% %betaDeg% %gammaDeg%\n\
             fractional\n\
             %coordsFrac%\n\
             \n\
             {potentials}\n"
        )
    }

    fn template_for(&self, step: usize) -> Result<&str> {
        self.step_templates
            .get(step.saturating_sub(1))
            .map(String::as_str)
            .ok_or_else(|| anyhow!("no GULP template for step {step}"))
    }

    fn check_errors(output: &str) -> Result<()> {
        if output.contains("Conditions for a minimum have not been satisfied") {
            bail!("convergence failure");
        }
        if output.contains("Interatomic distance too small") {
            bail!("geometric collapse");
        }
        if output.contains("Dump of error info") {
            bail!("internal GULP error");
        }
        Ok(())
    }

    fn parse_tagged_float(output: &str, tags: &[&str]) -> Option<f64> {
        for line in output.lines() {
            let lower = line.to_ascii_lowercase();
            if tags.iter().any(|t| lower.contains(t)) {
                if let Some(rest) = line.split('=').nth(1) {
                    if let Some(token) = rest.split_whitespace().next() {
                        if let Ok(v) = token.parse::<f64>() {
                            return Some(v);
                        }
                    }
                }
            }
        }
        None
    }

    /// Final cell parameters from the "Final cell parameters" table.
    fn parse_final_cell(output: &str, fallback: UnitCell) -> UnitCell {
        let mut cell = fallback;
        let mut in_table = false;
        for line in output.lines() {
            let lower = line.to_ascii_lowercase();
            if lower.contains("final cell parameters") {
                in_table = true;
                continue;
            }
            if !in_table {
                continue;
            }
            let mut tokens = line.split_whitespace();
            let (Some(name), Some(value)) = (tokens.next(), tokens.next()) else {
                continue;
            };
            let Ok(v) = value.parse::<f64>() else { continue };
            match name {
                "a" => cell.a = v,
                "b" => cell.b = v,
                "c" => cell.c = v,
                "alpha" => cell.alpha = v,
                "beta" => cell.beta = v,
                "gamma" => {
                    cell.gamma = v;
                    // gamma closes the table
                    break;
                }
                _ => {}
            }
        }
        cell
    }

    /// Updates atom positions from the last "Final fractional coordinates"
    /// block. Shell rows are skipped; only cores move.
    fn parse_final_coordinates(
        output: &str,
        cell: &UnitCell,
        atoms: &mut [Atom],
    ) -> Result<()> {
        let lines: Vec<&str> = output.lines().collect();
        let start = lines
            .iter()
            .rposition(|l| l.to_ascii_lowercase().contains("final fractional coordinates"))
            .map(|i| i + 6)
            .ok_or_else(|| anyhow!("no final coordinates in GULP output"))?;

        let mut count = 0;
        for line in lines.into_iter().skip(start) {
            if count >= atoms.len() {
                break;
            }
            if line.contains("------") && count > 0 {
                break;
            }
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 6 {
                continue;
            }
            if parts[2].to_ascii_lowercase().starts_with('s') {
                continue;
            }
            let (x, y, z) = (
                parts[3].parse::<f64>().unwrap_or(f64::NAN),
                parts[4].parse::<f64>().unwrap_or(f64::NAN),
                parts[5].parse::<f64>().unwrap_or(f64::NAN),
            );
            if x.is_nan() || y.is_nan() || z.is_nan() {
                bail!("NaN coordinates in GULP output");
            }
            atoms[count].position = cell.to_cartesian(&Point3::new(x, y, z));
            count += 1;
        }
        if count != atoms.len() {
            bail!("atom count mismatch: expected {}, parsed {count}", atoms.len());
        }
        Ok(())
    }
}

impl Optimizer for GulpOptimizer {
    fn id_string(&self) -> &'static str {
        "GULP"
    }

    fn num_steps(&self) -> usize {
        self.step_templates.len()
    }

    /// Seed import from a GULP input file: a `cell` line plus
    /// `fractional` coordinate records.
    fn read(&self, candidate: &mut Candidate, path: &Path) -> Result<()> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read seed {}", path.display()))?;

        let mut lines = text.lines();
        let mut cell = None;
        let mut atoms = Vec::new();

        while let Some(line) = lines.next() {
            let lower = line.trim().to_ascii_lowercase();
            if lower == "cell" {
                let params = lines
                    .next()
                    .ok_or_else(|| anyhow!("cell keyword without parameter line"))?;
                let vals: Vec<f64> = params
                    .split_whitespace()
                    .take(6)
                    .filter_map(|t| t.parse().ok())
                    .collect();
                if vals.len() != 6 {
                    bail!("malformed cell line in seed");
                }
                cell = Some(UnitCell::new(
                    vals[0], vals[1], vals[2], vals[3], vals[4], vals[5],
                ));
            } else if lower == "fractional" {
                let cell = cell.ok_or_else(|| anyhow!("fractional block before cell"))?;
                for record in lines.by_ref() {
                    let parts: Vec<&str> = record.split_whitespace().collect();
                    if parts.len() < 4 {
                        break;
                    }
                    let Some(z) = atomic_number_of(parts[0]) else { break };
                    let offset = if parts[1].eq_ignore_ascii_case("core")
                        || parts[1].eq_ignore_ascii_case("shel")
                    {
                        2
                    } else {
                        1
                    };
                    if parts[1].eq_ignore_ascii_case("shel") {
                        continue;
                    }
                    if parts.len() < offset + 3 {
                        break;
                    }
                    let frac = Point3::new(
                        parts[offset].parse::<f64>()?,
                        parts[offset + 1].parse::<f64>()?,
                        parts[offset + 2].parse::<f64>()?,
                    );
                    atoms.push(Atom {
                        atomic_number: z,
                        position: cell.to_cartesian(&frac),
                    });
                }
            }
        }

        let cell = cell.ok_or_else(|| anyhow!("seed contains no cell"))?;
        if atoms.is_empty() {
            bail!("seed contains no atoms");
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
        let template = self.template_for(candidate.current_step)?;
        let input = interpret_template(template, candidate);
        let dir = candidate.local_path.display();
        channel.mkdir_all(&dir.to_string())?;
        channel.upload_text(
            &candidate.local_path.join(INPUT_FILE).display().to_string(),
            &input,
        )?;
        Ok(())
    }

    fn start_job(
        &self,
        candidate: &mut Candidate,
        channel: &mut dyn RemoteChannel,
    ) -> Result<()> {
        let dir = candidate.local_path.display();
        let out = channel.exec(&format!(
            "cd '{dir}' && {} < {INPUT_FILE} > {OUTPUT_FILE} 2>&1",
            self.executable
        ))?;
        if !out.success() {
            bail!("GULP exited with status {}: {}", out.status, out.stderr);
        }
        candidate.job_id = None;
        Ok(())
    }

    /// The run is synchronous, so a present output file means finished.
    fn poll(&self, candidate: &Candidate, _channel: &mut dyn RemoteChannel) -> Result<JobState> {
        if candidate.local_path.join(OUTPUT_FILE).exists() {
            Ok(JobState::Finished)
        } else {
            Ok(JobState::Missing)
        }
    }

    fn load(&self, candidate: &mut Candidate) -> Result<()> {
        let path = candidate.local_path.join(OUTPUT_FILE);
        let output = std::fs::read_to_string(&path)
            .with_context(|| format!("cannot read {}", path.display()))?;

        Self::check_errors(&output)?;

        let energy = Self::parse_tagged_float(&output, &["final energy", "total lattice energy"])
            .ok_or_else(|| anyhow!("no final energy in GULP output"))?;
        let enthalpy =
            Self::parse_tagged_float(&output, &["final enthalpy"]).unwrap_or(energy);

        let cell = Self::parse_final_cell(&output, candidate.cell);
        let mut atoms = candidate.atoms.clone();
        Self::parse_final_coordinates(&output, &cell, &mut atoms)?;

        candidate.cell = cell;
        candidate.atoms = atoms;
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
}
