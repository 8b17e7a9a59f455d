use anyhow::Result;
use blindlab_runner::pipeline::{dispatch_json, dispatch_options};
use blindlab_runner::pool::load_pool;
use blindlab_runner::{
    BatchMode, BatchSummary, CancelToken, HttpOracle, RunConfig, RunOutcome, RunPaths,
    RunStatus, RunTarget, CONFIG_TEMPLATE,
};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "blindlab", version, about = "Blind name/description comparison runner")]
struct Cli {
    /// Only log warnings and errors.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
    /// Log debug detail.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum StatusArg {
    Completed,
    Failed,
    Interrupted,
}

impl From<StatusArg> for RunStatus {
    fn from(value: StatusArg) -> Self {
        match value {
            StatusArg::Completed => RunStatus::Completed,
            StatusArg::Failed => RunStatus::Failed,
            StatusArg::Interrupted => RunStatus::Interrupted,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter configuration file.
    Init {
        #[arg(long, default_value = "blindlab.yaml")]
        path: PathBuf,
        #[arg(long)]
        force: bool,
    },
    /// Validate a configuration and summarize the batch it would build.
    Describe {
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Run the whole pipeline in a new run directory, or resume one.
    Run {
        config: PathBuf,
        #[arg(long, value_name = "RUN_DIR", conflicts_with = "run_dir")]
        resume: Option<PathBuf>,
        #[arg(long)]
        run_dir: Option<PathBuf>,
        #[arg(long)]
        workers: Option<usize>,
        #[arg(long)]
        json: bool,
    },
    /// Build trials only. Continues the existing batch unless --fresh.
    Build {
        config: PathBuf,
        #[arg(long)]
        run_dir: PathBuf,
        #[arg(long)]
        fresh: bool,
        #[arg(long)]
        json: bool,
    },
    /// Dispatch built trials to the oracle.
    Dispatch {
        config: PathBuf,
        #[arg(long)]
        run_dir: PathBuf,
        #[arg(long)]
        force_rerun: bool,
        #[arg(long, value_delimiter = ',')]
        indices: Option<Vec<u32>>,
        #[arg(long)]
        workers: Option<usize>,
        #[arg(long)]
        json: bool,
    },
    /// Show or re-finalize the status line of a run report.
    Report {
        #[arg(long)]
        run_dir: PathBuf,
        #[arg(long, value_enum)]
        status: Option<StatusArg>,
        #[arg(long)]
        json: bool,
    },
    /// Ask a running dispatch to stop handing out trials.
    Stop {
        #[arg(long)]
        run_dir: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

struct CommandOutput {
    payload: Option<Value>,
    exit_code: i32,
}

impl CommandOutput {
    fn done() -> Self {
        Self {
            payload: None,
            exit_code: 0,
        }
    }

    fn json(payload: Value) -> Self {
        Self {
            payload: Some(payload),
            exit_code: 0,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.quiet, cli.verbose);
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.command) {
        Ok(output) => {
            if let Some(payload) = &output.payload {
                emit_json(payload);
            }
            if output.exit_code != 0 {
                std::process::exit(output.exit_code);
            }
            Ok(())
        }
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing(quiet: bool, verbose: bool) {
    let default = if quiet {
        "warn"
    } else if verbose {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn load_config(path: &Path, workers: Option<usize>) -> Result<RunConfig> {
    let mut config = RunConfig::load(path)?;
    if let Some(w) = workers {
        config.dispatch.workers = w;
        config.validate()?;
    }
    tracing::debug!(
        config = %path.display(),
        experiment = %config.experiment.id,
        "configuration loaded"
    );
    Ok(config)
}

fn run_command(command: Commands) -> Result<CommandOutput> {
    match command {
        Commands::Init { path, force } => {
            if !force && path.exists() {
                return Err(anyhow::anyhow!(
                    "init file already exists (use --force): {}",
                    path.display()
                ));
            }
            std::fs::write(&path, CONFIG_TEMPLATE)?;
            println!("wrote: {}", path.display());
            println!("next: edit {} and fill in the fields marked REQUIRED", path.display());
            println!("next: blindlab describe {}", path.display());
        }
        Commands::Describe { config, json } => {
            let cfg = load_config(&config, None)?;
            let summary = describe(&cfg)?;
            if json {
                return Ok(CommandOutput::json(json!({
                    "ok": true,
                    "command": "describe",
                    "summary": summary,
                })));
            }
            if let Some(obj) = summary.as_object() {
                for (key, value) in obj {
                    match value {
                        Value::String(s) => println!("{}: {}", key, s),
                        Value::Null => println!("{}: unset", key),
                        other => println!("{}: {}", key, other),
                    }
                }
            }
        }
        Commands::Run {
            config,
            resume,
            run_dir,
            workers,
            json,
        } => {
            let cfg = load_config(&config, workers)?;
            let target = match &resume {
                Some(dir) => RunTarget::resume(dir)?,
                None => RunTarget::fresh(&cfg, run_dir.as_deref())?,
            };
            let cancel = CancelToken::with_control_file(&target.paths.run_control());
            cancel_on_interrupt(&cancel);
            let outcome = blindlab_runner::run_pipeline(&cfg, &target, &cancel)?;
            let exit_code = exit_code_for(outcome.status);
            if json {
                return Ok(CommandOutput {
                    payload: Some(json!({
                        "ok": outcome.status == RunStatus::Completed,
                        "command": "run",
                        "run": outcome.to_json(),
                    })),
                    exit_code,
                });
            }
            print_outcome(&outcome);
            return Ok(CommandOutput {
                payload: None,
                exit_code,
            });
        }
        Commands::Build {
            config,
            run_dir,
            fresh,
            json,
        } => {
            let cfg = load_config(&config, None)?;
            let mode = if fresh {
                BatchMode::Fresh
            } else {
                BatchMode::Continue
            };
            let paths = RunPaths::new(&run_dir);
            let summary = blindlab_runner::build_only(&cfg, &paths, mode)?;
            if json {
                return Ok(CommandOutput::json(json!({
                    "ok": true,
                    "command": "build",
                    "run_dir": run_dir.display().to_string(),
                    "batch": batch_json(&summary),
                })));
            }
            println!("run_dir: {}", run_dir.display());
            println!("trials_written: {}", summary.trials_written);
            if let Some(last) = summary.last_index() {
                println!("trial_range: {}..={}", summary.first_index, last);
            }
            println!("available_before: {}", summary.available_before);
            println!("low_pool: {}", summary.low_pool);
        }
        Commands::Dispatch {
            config,
            run_dir,
            force_rerun,
            indices,
            workers,
            json,
        } => {
            let cfg = load_config(&config, workers)?;
            let paths = RunPaths::new(&run_dir);
            let mut options = dispatch_options(&cfg);
            options.force_rerun = force_rerun;
            options.indices = indices;
            let oracle = HttpOracle::from_config(&cfg.oracle)?;
            let cancel = CancelToken::with_control_file(&paths.run_control());
            cancel_on_interrupt(&cancel);
            let report = blindlab_runner::dispatch_only(&paths, &oracle, &options, &cancel)?;
            let exit_code = if report.aborted.is_some() { 1 } else { 0 };
            if json {
                return Ok(CommandOutput {
                    payload: Some(json!({
                        "ok": report.aborted.is_none(),
                        "command": "dispatch",
                        "run_dir": run_dir.display().to_string(),
                        "dispatch": dispatch_json(&report),
                    })),
                    exit_code,
                });
            }
            println!("planned: {}", report.planned);
            println!("skipped: {}", report.skipped);
            println!("succeeded: {}", report.stats.succeeded);
            println!("failed: {}", report.stats.failed);
            println!("not_started: {}", report.unattempted());
            return Ok(CommandOutput {
                payload: None,
                exit_code,
            });
        }
        Commands::Report {
            run_dir,
            status,
            json,
        } => {
            let path = RunPaths::new(&run_dir).report();
            if let Some(status) = status {
                blindlab_runner::finalize_report(&path, status.into())?;
            }
            let current = blindlab_runner::read_final_status(&path)?;
            if json {
                return Ok(CommandOutput::json(json!({
                    "ok": true,
                    "command": "report",
                    "report": path.display().to_string(),
                    "status": current.as_str(),
                })));
            }
            println!("report: {}", path.display());
            println!("status: {}", current);
        }
        Commands::Stop { run_dir, json } => {
            let paths = RunPaths::new(&run_dir);
            if !run_dir.is_dir() {
                return Err(anyhow::anyhow!(
                    "run directory does not exist: {}",
                    run_dir.display()
                ));
            }
            blindlab_runner::request_stop(&paths.run_control())?;
            if json {
                return Ok(CommandOutput::json(json!({
                    "ok": true,
                    "command": "stop",
                    "control": paths.run_control().display().to_string(),
                })));
            }
            println!("stop requested: {}", paths.run_control().display());
        }
    }
    Ok(CommandOutput::done())
}

/// Routes SIGINT/SIGTERM into `cancel` so in-flight calls drain and the run
/// still writes an INTERRUPTED report.
fn cancel_on_interrupt(cancel: &CancelToken) {
    let token = cancel.clone();
    let installed = ctrlc::set_handler(move || {
        tracing::warn!("interrupt received, waiting for in-flight calls");
        token.cancel();
    });
    if let Err(e) = installed {
        tracing::warn!(error = %e, "could not install interrupt handler");
    }
}

fn exit_code_for(status: RunStatus) -> i32 {
    match status {
        RunStatus::Completed => 0,
        RunStatus::Interrupted => 2,
        _ => 1,
    }
}

fn describe(cfg: &RunConfig) -> Result<Value> {
    let pool = load_pool(&cfg.experiment.pool_path)?;
    let required = cfg.design.group_size * cfg.design.trial_count;
    Ok(json!({
        "experiment": cfg.experiment.id,
        "pool": cfg.experiment.pool_path.display().to_string(),
        "pool_entities": pool.len(),
        "group_size": cfg.design.group_size,
        "trial_count": cfg.design.trial_count,
        "entities_required": required,
        "pool_sufficient": pool.len() >= required,
        "low_pool": pool.len() < required * cfg.design.low_pool_factor,
        "mapping_strategy": cfg.design.mapping_strategy.as_str(),
        "selection_seed": cfg.design.selection_seed,
        "shuffle_seed": cfg.design.shuffle_seed,
        "model": cfg.oracle.model,
        "endpoint": cfg.oracle.endpoint,
        "api_key_env": cfg.oracle.api_key_env,
        "api_key_present": std::env::var(&cfg.oracle.api_key_env).map(|v| !v.trim().is_empty()).unwrap_or(false),
        "workers": cfg.dispatch.workers,
        "circuit_breaker_threshold": cfg.dispatch.circuit_breaker_threshold,
        "output_dir": cfg.experiment.output_dir.display().to_string(),
    }))
}

fn batch_json(summary: &BatchSummary) -> Value {
    json!({
        "first_index": summary.first_index,
        "last_index": summary.last_index(),
        "trials_written": summary.trials_written,
        "available_before": summary.available_before,
        "low_pool": summary.low_pool,
    })
}

fn print_outcome(outcome: &RunOutcome) {
    println!("run_id: {}", outcome.run_id);
    println!("run_dir: {}", outcome.run_dir.display());
    println!("status: {}", outcome.status);
    if let Some(parse) = &outcome.parse {
        println!("parsed: {}", parse.line());
    }
    if let Some(error) = &outcome.error {
        println!("error: {}", error);
    }
    println!("report: {}", outcome.run_dir.join("report.txt").display());
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Describe { json, .. }
        | Commands::Run { json, .. }
        | Commands::Build { json, .. }
        | Commands::Dispatch { json, .. }
        | Commands::Report { json, .. }
        | Commands::Stop { json, .. } => *json,
        Commands::Init { .. } => false,
    }
}
