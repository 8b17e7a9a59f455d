//! Run orchestration: BUILDING → DISPATCHING → PARSING → ANALYZING →
//! REPORTING, ending COMPLETED, FAILED or INTERRUPTED.
//!
//! Stage failures are folded into the outcome and the report; only problems
//! that prevent a run from starting at all (missing run directory, held lock)
//! come back as `Err`.

use crate::batch::{build_batch, load_batch_record, BatchMode, BatchRequest, BatchSummary};
use crate::config::RunConfig;
use crate::control::{acquire_run_operation_lock, reset_control, CancelToken};
use crate::dispatch::{
    describe_abort, dispatch, plan_units, DispatchAbort, DispatchOptions, DispatchReport,
};
use crate::oracle::{HttpOracle, ScoringOracle};
use crate::parse::{ParseError, ParseSummary, ResponseParser, ScoreMatrixParser};
use crate::paths::RunPaths;
use crate::pool::load_pool;
use crate::progress::spawn_reporter;
use crate::report::{finalize_report, write_report, ReportInput, RunStatus};
use crate::stages::{
    AnalysisMetrics, Analyzer, CommandAnalyzer, CommandCompiler, MappingAnalyzer, ResultCompiler,
};
use crate::trial::DEFAULT_QUERY_TEMPLATE;
use anyhow::{anyhow, Context, Result};
use blindlab_core::{atomic_write_bytes, atomic_write_json_pretty, sha256_file};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Stage {
    Pending,
    Building,
    Dispatching,
    Parsing,
    Analyzing,
    Reporting,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Pending => "PENDING",
            Stage::Building => "BUILDING",
            Stage::Dispatching => "DISPATCHING",
            Stage::Parsing => "PARSING",
            Stage::Analyzing => "ANALYZING",
            Stage::Reporting => "REPORTING",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineMode {
    /// New run directory, fresh batch.
    Fresh,
    /// Existing run directory; builds only the missing trials and dispatches
    /// only units without a terminal artifact.
    Resume,
}

#[derive(Debug, Clone)]
pub struct RunTarget {
    pub run_id: String,
    pub paths: RunPaths,
    pub mode: PipelineMode,
}

impl RunTarget {
    /// Targets `run_dir`, or a new timestamped directory under the configured
    /// output directory. The directory must not hold an earlier run.
    pub fn fresh(config: &RunConfig, run_dir: Option<&Path>) -> Result<Self> {
        let root = match run_dir {
            Some(dir) => dir.to_path_buf(),
            None => config
                .experiment
                .output_dir
                .join(format!("run_{}", Utc::now().format("%Y%m%d_%H%M%S"))),
        };
        if root.exists()
            && fs::read_dir(&root)
                .with_context(|| format!("failed to read {}", root.display()))?
                .next()
                .is_some()
        {
            return Err(anyhow!(
                "run directory {} already exists; use resume to continue it",
                root.display()
            ));
        }
        Ok(Self {
            run_id: run_id_for(&root),
            paths: RunPaths::new(&root),
            mode: PipelineMode::Fresh,
        })
    }

    pub fn resume(run_dir: &Path) -> Result<Self> {
        if !run_dir.is_dir() {
            return Err(anyhow!("run directory {} does not exist", run_dir.display()));
        }
        Ok(Self {
            run_id: run_id_for(run_dir),
            paths: RunPaths::new(run_dir),
            mode: PipelineMode::Resume,
        })
    }
}

fn run_id_for(root: &Path) -> String {
    root.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "run".to_string())
}

/// The collaborators a run is driven with.
pub struct PipelineStages<'a> {
    pub oracle: &'a dyn ScoringOracle,
    pub parser: &'a dyn ResponseParser,
    pub analyzer: &'a dyn Analyzer,
    pub compiler: Option<&'a dyn ResultCompiler>,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub status: RunStatus,
    /// Last stage entered.
    pub stage: Stage,
    pub error: Option<String>,
    pub batch: Option<BatchSummary>,
    pub dispatch: Option<DispatchReport>,
    pub parse: Option<ParseSummary>,
    pub metrics: Option<AnalysisMetrics>,
}

impl RunOutcome {
    pub fn to_json(&self) -> Value {
        json!({
            "run_id": self.run_id,
            "run_dir": self.run_dir.display().to_string(),
            "status": self.status.as_str(),
            "stage": self.stage.as_str(),
            "error": self.error,
            "trials_built": self.batch.as_ref().map(|b| b.trials_written),
            "dispatch": self.dispatch.as_ref().map(dispatch_json),
            "parse": self.parse,
            "metrics": self.metrics,
        })
    }
}

pub fn dispatch_json(report: &DispatchReport) -> Value {
    json!({
        "planned": report.planned,
        "skipped": report.skipped,
        "succeeded": report.stats.succeeded,
        "failed": report.stats.failed,
        "not_started": report.unattempted(),
        "average_ms": report.stats.average().map(|d| d.as_millis() as u64),
        "elapsed_ms": report.elapsed.as_millis() as u64,
        "aborted": report.aborted.as_ref().map(|a| describe_abort(a, report.unattempted())),
    })
}

fn write_run_state(
    path: &Path,
    run_id: &str,
    stage: Stage,
    status: &str,
    error: Option<&str>,
) -> Result<()> {
    let payload = json!({
        "schema_version": "run_state_v1",
        "run_id": run_id,
        "stage": stage.as_str(),
        "status": status,
        "error": error,
        "updated_at": Utc::now().to_rfc3339(),
    });
    atomic_write_json_pretty(path, &payload)
}

/// Mirrors stage and status into `runtime/run_state.json`. Dropped without
/// [`RunStateGuard::complete`], it records the run as failed.
struct RunStateGuard {
    path: PathBuf,
    run_id: String,
    stage: Stage,
    done: bool,
}

impl RunStateGuard {
    fn start(path: &Path, run_id: &str) -> Result<Self> {
        write_run_state(path, run_id, Stage::Pending, "running", None)?;
        Ok(Self {
            path: path.to_path_buf(),
            run_id: run_id.to_string(),
            stage: Stage::Pending,
            done: false,
        })
    }

    fn enter(&mut self, stage: Stage) -> Result<()> {
        self.stage = stage;
        write_run_state(&self.path, &self.run_id, stage, "running", None)
    }

    fn complete(&mut self, status: RunStatus, error: Option<&str>) -> Result<()> {
        let status = status.as_str().to_ascii_lowercase();
        write_run_state(&self.path, &self.run_id, self.stage, &status, error)?;
        self.done = true;
        Ok(())
    }
}

impl Drop for RunStateGuard {
    fn drop(&mut self) {
        if !self.done {
            let _ = write_run_state(&self.path, &self.run_id, self.stage, "failed", None);
        }
    }
}

pub fn load_query_template(config: &RunConfig) -> Result<String> {
    match &config.experiment.prompt_template_path {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("failed to read prompt template {}", path.display())),
        None => Ok(DEFAULT_QUERY_TEMPLATE.to_string()),
    }
}

/// Fills unset seeds. A batch directory that already records its seeds keeps
/// them; otherwise missing seeds are drawn at random so the snapshot can
/// reproduce the run.
pub fn resolve_seeds(config: &mut RunConfig, paths: &RunPaths, mode: BatchMode) -> Result<()> {
    if mode == BatchMode::Continue {
        if let Some(record) = load_batch_record(paths)? {
            for (name, configured, recorded) in [
                ("selection_seed", config.design.selection_seed, record.selection_seed),
                ("shuffle_seed", config.design.shuffle_seed, record.shuffle_seed),
            ] {
                if configured.is_some_and(|c| c != recorded) {
                    warn!(seed = name, configured, recorded, "using the seed recorded in the batch");
                }
            }
            config.design.selection_seed = Some(record.selection_seed);
            config.design.shuffle_seed = Some(record.shuffle_seed);
            return Ok(());
        }
    }
    config.design.selection_seed.get_or_insert_with(rand::random);
    config.design.shuffle_seed.get_or_insert_with(rand::random);
    Ok(())
}

/// Batch request for `trial_count` trials. Seeds must already be resolved.
pub fn batch_request(config: &RunConfig, trial_count: usize) -> Result<BatchRequest> {
    let design = &config.design;
    Ok(BatchRequest {
        trial_count,
        group_size: design.group_size,
        strategy: design.mapping_strategy,
        selection_seed: design
            .selection_seed
            .ok_or_else(|| anyhow!("selection seed is unresolved"))?,
        shuffle_seed: design
            .shuffle_seed
            .ok_or_else(|| anyhow!("shuffle seed is unresolved"))?,
        low_pool_factor: design.low_pool_factor,
        query_template: load_query_template(config)?,
    })
}

fn write_config_snapshot(config: &RunConfig, paths: &RunPaths) -> Result<String> {
    let yaml = config.to_yaml()?;
    let digest = config.digest()?;
    atomic_write_bytes(&paths.config_snapshot(), yaml.as_bytes())?;
    atomic_write_bytes(&paths.config_digest(), digest.as_bytes())?;
    Ok(digest)
}

pub fn dispatch_options(config: &RunConfig) -> DispatchOptions {
    DispatchOptions {
        workers: config.dispatch.workers,
        circuit_breaker_threshold: config.dispatch.circuit_breaker_threshold,
        ..DispatchOptions::default()
    }
}

/// Runs the pipeline with the production collaborators: the HTTP oracle, the
/// score-matrix parser and either the configured external stages or the
/// built-in analyzer. The caller owns `cancel`, typically a token bound to the
/// run's control file and tripped by the process interrupt handler.
pub fn run_pipeline(
    config: &RunConfig,
    target: &RunTarget,
    cancel: &CancelToken,
) -> Result<RunOutcome> {
    let oracle = HttpOracle::from_config(&config.oracle)?;
    let parser = ScoreMatrixParser;
    let command_analyzer = (!config.stages.analyzer_command.is_empty()).then(|| CommandAnalyzer {
        command: config.stages.analyzer_command.clone(),
    });
    let analyzer: &dyn Analyzer = match &command_analyzer {
        Some(a) => a,
        None => &MappingAnalyzer,
    };
    let compiler = (!config.stages.compiler_command.is_empty()).then(|| CommandCompiler {
        command: config.stages.compiler_command.clone(),
    });
    let stages = PipelineStages {
        oracle: &oracle,
        parser: &parser,
        analyzer,
        compiler: compiler.as_ref().map(|c| c as &dyn ResultCompiler),
    };
    execute_pipeline(config, target, &stages, cancel)
}

pub fn execute_pipeline(
    config: &RunConfig,
    target: &RunTarget,
    stages: &PipelineStages<'_>,
    cancel: &CancelToken,
) -> Result<RunOutcome> {
    let paths = &target.paths;
    paths.prepare()?;
    let _lock = acquire_run_operation_lock(&paths.operation_lock())?;
    reset_control(&paths.run_control())?;
    let mut state = RunStateGuard::start(&paths.run_state(), &target.run_id)?;
    info!(run_id = %target.run_id, run_dir = %paths.root.display(), mode = ?target.mode, "run started");

    let mut run = PipelineRun {
        target,
        stages,
        cancel,
        config: config.clone(),
        config_digest: None,
        pool_digest: None,
        batch: None,
        dispatch: None,
        parse: None,
        metrics: None,
    };
    let (mut status, mut failure) = run.drive(&mut state);

    // Reporting runs even after a failure so every run ends with a report.
    state.enter(Stage::Reporting)?;
    run.write_report(failure.as_deref())?;
    if status == RunStatus::Completed {
        if let Some(compiler) = stages.compiler {
            if let Err(e) = compiler.compile(paths) {
                let message = format!("REPORTING failed: {:#}", e);
                run.write_report(Some(&message))?;
                status = RunStatus::Failed;
                failure = Some(message);
            }
        }
    }
    finalize_report(&paths.report(), status)?;
    state.complete(status, failure.as_deref())?;

    match status {
        RunStatus::Completed => info!(run_id = %target.run_id, "run completed"),
        RunStatus::Interrupted => warn!(run_id = %target.run_id, reason = ?failure, "run interrupted"),
        _ => error!(run_id = %target.run_id, error = ?failure, "run failed"),
    }
    Ok(RunOutcome {
        run_id: target.run_id.clone(),
        run_dir: paths.root.clone(),
        status,
        stage: state.stage,
        error: failure,
        batch: run.batch,
        dispatch: run.dispatch,
        parse: run.parse,
        metrics: run.metrics,
    })
}

enum Flow {
    Continue,
    Stop(RunStatus, String),
}

struct PipelineRun<'a> {
    target: &'a RunTarget,
    stages: &'a PipelineStages<'a>,
    cancel: &'a CancelToken,
    config: RunConfig,
    config_digest: Option<String>,
    pool_digest: Option<String>,
    batch: Option<BatchSummary>,
    dispatch: Option<DispatchReport>,
    parse: Option<ParseSummary>,
    metrics: Option<AnalysisMetrics>,
}

impl PipelineRun<'_> {
    fn drive(&mut self, state: &mut RunStateGuard) -> (RunStatus, Option<String>) {
        for stage in [
            Stage::Building,
            Stage::Dispatching,
            Stage::Parsing,
            Stage::Analyzing,
        ] {
            if self.cancel.is_cancelled() {
                return (
                    RunStatus::Interrupted,
                    Some(format!("cancelled by operator before {}", stage)),
                );
            }
            if let Err(e) = state.enter(stage) {
                return (RunStatus::Failed, Some(format!("{} failed: {:#}", stage, e)));
            }
            info!(stage = %stage, "entering stage");
            let flow = match stage {
                Stage::Building => self.build(),
                Stage::Dispatching => self.dispatch(),
                Stage::Parsing => self.parse(),
                _ => self.analyze(),
            };
            match flow {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop(status, message)) => {
                    return (status, Some(format!("{}: {}", stage, message)))
                }
                Err(e) => return (RunStatus::Failed, Some(format!("{} failed: {:#}", stage, e))),
            }
        }
        (RunStatus::Completed, None)
    }

    fn build(&mut self) -> Result<Flow> {
        let paths = &self.target.paths;
        let (mode, count) = match self.target.mode {
            PipelineMode::Fresh => (BatchMode::Fresh, self.config.design.trial_count),
            PipelineMode::Resume => {
                let existing = paths.existing_trial_indices()?.len();
                (
                    BatchMode::Continue,
                    self.config.design.trial_count.saturating_sub(existing),
                )
            }
        };
        resolve_seeds(&mut self.config, paths, mode)?;
        self.config_digest = Some(write_config_snapshot(&self.config, paths)?);

        let pool_path = &self.config.experiment.pool_path;
        self.pool_digest = Some(sha256_file(pool_path)?);
        let pool = load_pool(pool_path)?;
        let request = batch_request(&self.config, count)?;
        self.batch = Some(build_batch(paths, &pool, mode, &request)?);
        Ok(Flow::Continue)
    }

    fn dispatch(&mut self) -> Result<Flow> {
        let paths = &self.target.paths;
        let options = dispatch_options(&self.config);
        let (units, skipped) = plan_units(paths, &options)?;
        let (tx, rx) = mpsc::channel();
        let reporter = spawn_reporter(rx);
        let result = dispatch(
            paths,
            units,
            skipped,
            self.stages.oracle,
            &options,
            self.cancel,
            Some(tx),
        );
        let _ = reporter.join();
        let report = result?;
        let flow = match &report.aborted {
            Some(abort @ DispatchAbort::CircuitOpen { .. }) => {
                Flow::Stop(RunStatus::Failed, describe_abort(abort, report.unattempted()))
            }
            Some(abort @ DispatchAbort::Cancelled) => {
                Flow::Stop(RunStatus::Interrupted, describe_abort(abort, report.unattempted()))
            }
            None => Flow::Continue,
        };
        self.dispatch = Some(report);
        Ok(flow)
    }

    fn parse(&mut self) -> Result<Flow> {
        match self.stages.parser.parse(&self.target.paths) {
            Ok(summary) => {
                let parsed = summary.parsed;
                if parsed < summary.total {
                    warn!(summary = %summary.line(), "continuing with the parsed subset");
                }
                self.parse = Some(summary);
                if parsed == 0 {
                    return Err(anyhow!("no responses could be parsed"));
                }
                Ok(Flow::Continue)
            }
            Err(ParseError::Failed {
                message,
                partial: Some(partial),
            }) if partial.parsed > 0 => {
                warn!(%message, summary = %partial.line(), "parser failed; continuing with the parsed subset");
                self.parse = Some(partial);
                Ok(Flow::Continue)
            }
            Err(ParseError::Failed { message, partial }) => {
                self.parse = partial;
                Err(anyhow!(message))
            }
        }
    }

    fn analyze(&mut self) -> Result<Flow> {
        let parse = self
            .parse
            .as_ref()
            .ok_or_else(|| anyhow!("analysis requires a parse summary"))?;
        self.metrics = Some(self.stages.analyzer.analyze(&self.target.paths, parse)?);
        Ok(Flow::Continue)
    }

    fn write_report(&self, failure: Option<&str>) -> Result<()> {
        let paths = &self.target.paths;
        let trials_on_disk = paths.existing_trial_indices().map(|v| v.len()).unwrap_or(0);
        let input = ReportInput {
            run_id: &self.target.run_id,
            run_dir: &paths.root,
            config: &self.config,
            config_digest: self.config_digest.as_deref(),
            pool_digest: self.pool_digest.as_deref(),
            batch: self.batch.as_ref(),
            trials_on_disk,
            dispatch: self.dispatch.as_ref(),
            parse: self.parse.as_ref(),
            metrics: self.metrics.as_ref(),
            failure,
        };
        write_report(&paths.report(), &input)
    }
}

/// Builds trials into an existing or new run directory without dispatching.
pub fn build_only(config: &RunConfig, paths: &RunPaths, mode: BatchMode) -> Result<BatchSummary> {
    paths.prepare()?;
    let _lock = acquire_run_operation_lock(&paths.operation_lock())?;
    let mut config = config.clone();
    let count = match mode {
        BatchMode::Fresh => config.design.trial_count,
        BatchMode::Continue => config
            .design
            .trial_count
            .saturating_sub(paths.existing_trial_indices()?.len()),
    };
    resolve_seeds(&mut config, paths, mode)?;
    write_config_snapshot(&config, paths)?;
    let pool = load_pool(&config.experiment.pool_path)?;
    build_batch(paths, &pool, mode, &batch_request(&config, count)?)
}

/// Dispatches the trials of a run directory outside the full pipeline.
pub fn dispatch_only(
    paths: &RunPaths,
    oracle: &dyn ScoringOracle,
    options: &DispatchOptions,
    cancel: &CancelToken,
) -> Result<DispatchReport> {
    let _lock = acquire_run_operation_lock(&paths.operation_lock())?;
    reset_control(&paths.run_control())?;
    let (units, skipped) = plan_units(paths, options)?;
    let (tx, rx) = mpsc::channel();
    let reporter = spawn_reporter(rx);
    let result = dispatch(paths, units, skipped, oracle, options, cancel, Some(tx));
    let _ = reporter.join();
    result
}
