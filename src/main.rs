use std::collections::BTreeMap;
use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use xtalsearch::core::composition::{atomic_number_of, Composition};
use xtalsearch::core::config::SearchConfig;
use xtalsearch::engine::external::gulp::GulpOptimizer;
use xtalsearch::engine::external::vasp::VaspOptimizer;
use xtalsearch::engine::optimizer::Optimizer;
use xtalsearch::engine::remote::SshChannelFactory;
use xtalsearch::engine::SearchEngine;
use xtalsearch::interface::prompt::StdioPrompter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Evolutionary crystal-structure search", long_about = None)]
struct Args {
    /// Session directory for state files and structure output
    #[arg(short, long, default_value = "xtalsearch-session")]
    session: PathBuf,

    /// Resume from an existing xtalopt.state file instead of starting fresh
    #[arg(long)]
    resume: Option<PathBuf>,

    /// Load the resumed session read-only
    #[arg(long, default_value_t = false)]
    read_only: bool,

    /// Composition, e.g. "Mg:6,O:6"
    #[arg(short, long, default_value = "Mg:6,O:6")]
    composition: String,

    /// Optimizer backend (gulp runs locally, vasp needs a cluster)
    #[arg(short, long, default_value = "gulp")]
    optimizer: String,

    /// File holding the GULP potential block
    #[arg(long)]
    potentials: Option<PathBuf>,

    /// Remote host for cluster optimizers
    #[arg(long, default_value = "")]
    host: String,

    /// Remote user for cluster optimizers
    #[arg(long, default_value = "")]
    user: String,

    #[arg(long, default_value_t = 22)]
    port: u16,

    /// Remote working directory for cluster optimizers
    #[arg(long, default_value = "")]
    remote_path: String,

    /// Number of structures in the initial generation
    #[arg(long, default_value_t = 20)]
    num_initial: usize,

    /// Candidates to keep pending or in flight
    #[arg(long, default_value_t = 10)]
    target: usize,

    /// RNG seed; 0 seeds from entropy
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

fn parse_composition(arg: &str) -> Result<Composition> {
    let mut counts = BTreeMap::new();
    for part in arg.split(',') {
        let (sym, count) = part
            .split_once(':')
            .ok_or_else(|| anyhow!("bad composition entry '{part}', expected Symbol:count"))?;
        let z = atomic_number_of(sym.trim())
            .ok_or_else(|| anyhow!("unknown element '{}'", sym.trim()))?;
        let count: u32 = count.trim().parse().context("bad composition count")?;
        counts.insert(z, count);
    }
    Ok(Composition::new(counts))
}

// Buckingham potentials for the MgO demo system.
const DEFAULT_POTENTIALS: &str = "buckingham\n\
    Mg core O core 1280.1 0.29969 0.0 0.0 10.0\n\
    O core O core 22764.0 0.149 27.88 0.0 10.0\n";

fn build_optimizer(args: &Args) -> Result<Arc<dyn Optimizer>> {
    match args.optimizer.to_lowercase().as_str() {
        "gulp" => {
            let potentials = match &args.potentials {
                Some(path) => std::fs::read_to_string(path)
                    .with_context(|| format!("cannot read {}", path.display()))?,
                None => DEFAULT_POTENTIALS.to_string(),
            };
            let template = GulpOptimizer::default_template(&potentials);
            Ok(Arc::new(GulpOptimizer::new("gulp", vec![template])))
        }
        "vasp" => {
            if args.host.is_empty() || args.user.is_empty() || args.remote_path.is_empty() {
                bail!("VASP needs --host, --user and --remote-path");
            }
            let incar = "SYSTEM = %gen%x%id%\nIBRION = 2\nISIF = 3\nNSW = 60\n".to_string();
            let kpoints = "Automatic\n0\nGamma\n4 4 4\n0 0 0\n".to_string();
            let job = "#!/bin/sh\n#PBS -N xs-%gen%x%id%\ncd $PBS_O_WORKDIR\nmpirun vasp\n"
                .to_string();
            Ok(Arc::new(VaspOptimizer::new(
                vec![incar],
                vec![kpoints],
                job,
            )))
        }
        other => bail!("unknown optimizer '{other}'"),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let optimizer = build_optimizer(&args)?;
    let prompter = Arc::new(StdioPrompter);
    let factory = Box::new(SshChannelFactory);

    let engine = match &args.resume {
        Some(path) => SearchEngine::load(path, optimizer, prompter, factory, args.read_only)
            .context("cannot resume session")?,
        None => {
            let comp = parse_composition(&args.composition)?;
            let cfg = SearchConfig {
                description: format!("xtalsearch {}", args.composition),
                session_path: args.session.clone(),
                remote_path: args.remote_path.clone(),
                host: args.host.clone(),
                username: args.user.clone(),
                port: args.port,
                num_initial: args.num_initial,
                target_in_flight: args.target,
                rng_seed: args.seed,
                ..SearchConfig::default()
            };
            let engine = SearchEngine::new(cfg, comp, optimizer, prompter, factory);
            engine.start_search().context("cannot start search")?;
            engine
        }
    };

    if engine.is_read_only() {
        println!("Session loaded read-only; {} structures.", engine.store().size());
        return Ok(());
    }

    println!("Search running. Commands: s = save, q = save and quit.");
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        match line?.trim() {
            "s" => {
                engine.save()?;
                println!("Session saved ({} structures).", engine.store().size());
            }
            "q" => break,
            _ => {}
        }
    }

    engine.save()?;
    engine.stop();
    Ok(())
}
