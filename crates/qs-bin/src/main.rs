//! qsolve entrypoint: CLI, logging, model loading, and the run driver.

use anyhow::{bail, Context, Result};
use clap::Parser;
use core_config::{ConfigFile, Method, Options};
use core_model::{LinearModel, Model};
use core_solver::{Connections, Solver};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// CLI arguments. Unset options fall back to `qsolve.toml`, then defaults.
#[derive(Parser, Debug)]
#[command(name = "qsolve", version, about = "Quantized state system solver")]
struct Args {
    /// Model description file(s); two or more run as connected models.
    #[arg(required = true)]
    pub models: Vec<PathBuf>,

    /// Options file path (overrides discovery of `qsolve.toml`).
    #[arg(long = "config")]
    pub config: Option<PathBuf>,

    /// QSS method: QSS1|QSS2|QSS3|LIQSS1|LIQSS2|LIQSS3|rQSS1|rQSS2|rQSS3.
    #[arg(long)]
    pub method: Option<String>,

    /// Relative tolerance.
    #[arg(long = "rTol")]
    pub rtol: Option<f64>,

    /// Absolute tolerance.
    #[arg(long = "aTol")]
    pub atol: Option<f64>,

    /// Zero-crossing anti-chatter tolerance (0 disables).
    #[arg(long = "zTol")]
    pub ztol: Option<f64>,

    /// Minimum time step.
    #[arg(long = "dtMin")]
    pub dt_min: Option<f64>,

    /// Maximum time step.
    #[arg(long = "dtMax")]
    pub dt_max: Option<f64>,

    /// Infinite-step relaxation cap.
    #[arg(long = "dtInf")]
    pub dt_inf: Option<f64>,

    /// Max step before a predicted crossing (0 disables the pull-back).
    #[arg(long = "dtZMax")]
    pub dt_zmax: Option<f64>,

    /// Zero-crossing bump step.
    #[arg(long = "dtZC")]
    pub dt_zc: Option<f64>,

    /// Numerical differentiation step.
    #[arg(long = "dtND")]
    pub dt_nd: Option<f64>,

    /// Connection sync step (0 syncs before every event).
    #[arg(long = "dtCon")]
    pub dt_con: Option<f64>,

    /// Sampled output step.
    #[arg(long = "dtOut")]
    pub dt_out: Option<f64>,

    /// Simulation start time.
    #[arg(long = "tBeg")]
    pub t_beg: Option<f64>,

    /// Simulation end time.
    #[arg(long = "tEnd")]
    pub t_end: Option<f64>,

    /// Requantize at inflection points.
    #[arg(long)]
    pub inflection: bool,

    /// Refine zero-crossing roots against the model.
    #[arg(long)]
    pub refine: bool,

    /// Input function mapping, `VAR=spec` (e.g. `u=sin[1,2,0]`).
    #[arg(long = "fxn")]
    pub fxn: Vec<String>,

    /// Connection mapping, `model.input=model.output`.
    #[arg(long = "con")]
    pub con: Vec<String>,

    /// Dependency augmentation, `var[:dep1,dep2]` glob specs.
    #[arg(long = "dep")]
    pub dep: Vec<String>,

    /// Variable output filter glob(s); default all.
    #[arg(long = "var")]
    pub var: Vec<String>,

    /// Output directory.
    #[arg(long = "out", default_value = ".")]
    pub out: PathBuf,

    /// Write requantization step counts.
    #[arg(long)]
    pub steps: bool,

    /// Write the dependency graph as dot.
    #[arg(long = "dot")]
    pub dot: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let _log_guard = match configure_logging() {
        Ok(g) => g,
        Err(e) => {
            eprintln!("Error: logging setup failed: {e}");
            return ExitCode::FAILURE;
        }
    };
    install_panic_hook();
    info!(target: "runtime", "startup");

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(target: "runtime", error = %e, "run failed");
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn configure_logging() -> Result<WorkerGuard> {
    let log_path = Path::new("qsolve.log");
    if log_path.exists() {
        let _ = std::fs::remove_file(log_path);
    }
    let appender = tracing_appender::rolling::never(".", "qsolve.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let filter = EnvFilter::try_from_env("QSOLVE_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
    Ok(guard)
}

fn install_panic_hook() {
    let default = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        error!(target: "runtime", info = %panic_info, "panic");
        default(panic_info);
    }));
}

fn build_options(args: &Args) -> Result<Options> {
    let mut opts = Options::default();
    let file: ConfigFile = core_config::load_file(args.config.clone())?;
    opts.apply_file(&file)?;

    if let Some(m) = &args.method {
        opts.method = Method::parse(m)?;
    }
    macro_rules! overlay {
        ($($field:ident),* $(,)?) => {
            $( if let Some(v) = args.$field { opts.$field = v; } )*
        };
    }
    overlay!(rtol, atol, ztol, dt_min, dt_max, dt_inf, dt_zmax, dt_zc, dt_nd, dt_con);
    if args.dt_out.is_some() {
        opts.dt_out = args.dt_out;
    }
    if args.t_beg.is_some() {
        opts.t_beg = args.t_beg;
    }
    if args.t_end.is_some() {
        opts.t_end = args.t_end;
    }
    if args.inflection {
        opts.inflection = true;
    }
    if args.refine {
        opts.refine = true;
    }
    for spec in &args.fxn {
        let (name, fx) = spec
            .split_once('=')
            .with_context(|| format!("bad --fxn spec (expected VAR=fn): {spec}"))?;
        opts.fxn.insert(name.to_string(), fx.to_string());
    }
    for spec in &args.con {
        let (inp, out) = spec
            .split_once('=')
            .with_context(|| format!("bad --con spec (expected in=out): {spec}"))?;
        opts.con.insert(inp.to_string(), out.to_string());
    }
    for spec in &args.dep {
        opts.dep.push(core_config::DepSpec::parse(spec)?);
    }
    for spec in &args.var {
        opts.var_filter.push(core_config::spec_regex(spec)?);
    }
    opts.out_dir = args.out.clone();
    opts.output.steps = args.steps;
    opts.dot.dependency = args.dot;
    opts.validate()?;
    Ok(opts)
}

fn run(args: &Args) -> Result<()> {
    let opts = build_options(args)?;
    std::fs::create_dir_all(&opts.out_dir)
        .with_context(|| format!("creating output directory {}", opts.out_dir.display()))?;

    let mut solvers = Vec::with_capacity(args.models.len());
    for path in &args.models {
        let model = LinearModel::load(path)?;
        info!(target: "runtime", model = model.name(), path = %path.display(), "model loaded");
        let solver = Solver::new(Box::new(model), opts.clone())?;
        solvers.push(solver);
    }

    if solvers.len() == 1 {
        let mut solver = solvers.pop().expect("one solver");
        solver.init()?;
        let stats = solver.simulate()?.clone();
        info!(
            target: "runtime",
            requantizations = stats.requantizations,
            zero_crossings = stats.zero_crossings,
            handlers = stats.handler_events,
            "done"
        );
        println!(
            "{}: {} requantizations, {} crossings, {} handler events",
            solver.name, stats.requantizations, stats.zero_crossings, stats.handler_events
        );
    } else {
        if opts.con.is_empty() {
            bail!("multiple models given but no --con connections specified");
        }
        let mut connections = Connections::new(solvers, &opts.con, opts.dt_con)?;
        connections.init()?;
        connections.simulate()?;
        for s in connections.solvers() {
            println!(
                "{}: {} requantizations, {} crossings, {} handler events",
                s.name,
                s.stats.requantizations,
                s.stats.zero_crossings,
                s.stats.handler_events
            );
        }
    }
    Ok(())
}
