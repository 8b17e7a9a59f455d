//! Concurrent dispatch of trial prompts to the scoring oracle.
//!
//! A fixed pool of OS threads pulls units from a shared queue. Each unit ends
//! in exactly one terminal artifact (success text or error text) written by the
//! worker that ran it. Statistics, the circuit-breaker streak and the queue sit
//! behind one mutex; progress leaves through a channel.

use crate::control::CancelToken;
use crate::oracle::{OracleError, OracleRequest, OracleResponse, ScoringOracle};
use crate::paths::RunPaths;
use crate::progress::{ProgressEvent, ProgressSender, StatsSnapshot};
use anyhow::{Context, Result};
use blindlab_core::{atomic_write_bytes, remove_file_if_exists};
use std::collections::VecDeque;
use std::fs;
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("requested trial indices have no query artifact: {0:?}")]
    UnknownIndices(Vec<u32>),
}

#[derive(Debug, Clone)]
pub struct DispatchUnit {
    pub trial_index: u32,
    pub prompt: String,
}

#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub workers: usize,
    /// Delete existing terminal artifacts for the selected indices and run
    /// them again.
    pub force_rerun: bool,
    /// Restrict dispatch to these trial indices.
    pub indices: Option<Vec<u32>>,
    pub circuit_breaker_threshold: usize,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            workers: 5,
            force_rerun: false,
            indices: None,
            circuit_breaker_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitOutcome {
    pub trial_index: u32,
    pub elapsed: Duration,
    pub error: Option<String>,
}

impl UnitOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Running timing statistics. Only successful units contribute to the average
/// duration; the estimate covers every unit not yet terminal.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchStats {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    success_time: Duration,
}

impl DispatchStats {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            ..Self::default()
        }
    }

    pub fn record_success(&mut self, elapsed: Duration) {
        self.succeeded += 1;
        self.success_time += elapsed;
    }

    pub fn record_failure(&mut self) {
        self.failed += 1;
    }

    pub fn remaining(&self) -> usize {
        self.total.saturating_sub(self.succeeded + self.failed)
    }

    pub fn average(&self) -> Option<Duration> {
        (self.succeeded > 0).then(|| self.success_time / self.succeeded as u32)
    }

    pub fn eta(&self) -> Option<Duration> {
        self.average().map(|avg| avg * self.remaining() as u32)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total: self.total,
            succeeded: self.succeeded,
            failed: self.failed,
            average: self.average(),
            eta: self.eta(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchAbort {
    Cancelled,
    CircuitOpen { consecutive: usize, last_error: String },
}

#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub planned: usize,
    pub skipped: usize,
    pub stats: DispatchStats,
    pub outcomes: Vec<UnitOutcome>,
    pub aborted: Option<DispatchAbort>,
    pub elapsed: Duration,
}

impl DispatchReport {
    pub fn attempted(&self) -> usize {
        self.outcomes.len()
    }

    pub fn unattempted(&self) -> usize {
        self.planned.saturating_sub(self.outcomes.len())
    }
}

/// Selects the units to run.
///
/// Without `force_rerun`, indices that already have a success or error
/// artifact are skipped. With it, those artifacts are deleted first. Returns the
/// units and the number skipped.
pub fn plan_units(paths: &RunPaths, options: &DispatchOptions) -> Result<(Vec<DispatchUnit>, usize)> {
    let existing = paths.existing_trial_indices()?;
    let selected: Vec<u32> = match &options.indices {
        Some(wanted) => {
            let missing: Vec<u32> = wanted
                .iter()
                .copied()
                .filter(|i| !existing.contains(i))
                .collect();
            if !missing.is_empty() {
                return Err(DispatchError::UnknownIndices(missing).into());
            }
            let mut wanted = wanted.clone();
            wanted.sort_unstable();
            wanted.dedup();
            wanted
        }
        None => existing,
    };

    let mut units = Vec::new();
    let mut skipped = 0;
    for index in selected {
        if options.force_rerun {
            remove_file_if_exists(&paths.response(index))?;
            remove_file_if_exists(&paths.response_error(index))?;
            remove_file_if_exists(&paths.response_raw(index))?;
        } else if paths.has_terminal_response(index) {
            skipped += 1;
            continue;
        }
        let prompt = fs::read_to_string(paths.query(index))
            .with_context(|| format!("failed to read query for trial {}", index))?;
        units.push(DispatchUnit {
            trial_index: index,
            prompt,
        });
    }
    Ok((units, skipped))
}

struct Shared {
    queue: VecDeque<DispatchUnit>,
    stats: DispatchStats,
    outcomes: Vec<UnitOutcome>,
    streak: usize,
    circuit_open: Option<DispatchAbort>,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub fn dispatch(
    paths: &RunPaths,
    units: Vec<DispatchUnit>,
    skipped: usize,
    oracle: &dyn ScoringOracle,
    options: &DispatchOptions,
    cancel: &CancelToken,
    progress: Option<ProgressSender>,
) -> Result<DispatchReport> {
    let started = Instant::now();
    let planned = units.len();
    let workers = options.workers.max(1).min(planned.max(1));
    let threshold = options.circuit_breaker_threshold.max(1);
    let shared = Mutex::new(Shared {
        queue: units.into(),
        stats: DispatchStats::new(planned),
        outcomes: Vec::with_capacity(planned),
        streak: 0,
        circuit_open: None,
    });

    if let Some(tx) = &progress {
        let _ = tx.send(ProgressEvent::Started {
            total: planned,
            skipped,
            workers,
        });
    }
    info!(planned, skipped, workers, "dispatching trials");

    thread::scope(|scope| {
        for worker_id in 0..workers {
            let shared = &shared;
            let progress = progress.clone();
            scope.spawn(move || {
                worker_loop(
                    worker_id, paths, oracle, shared, threshold, cancel, progress,
                )
            });
        }
    });

    let shared = shared.into_inner().unwrap_or_else(|p| p.into_inner());
    let aborted = match shared.circuit_open {
        Some(open) => Some(open),
        None if !shared.queue.is_empty() => Some(DispatchAbort::Cancelled),
        None => None,
    };
    let elapsed = started.elapsed();
    if let Some(tx) = &progress {
        if let Some(abort) = &aborted {
            let _ = tx.send(ProgressEvent::Aborted {
                reason: describe_abort(abort, shared.queue.len()),
            });
        }
        let _ = tx.send(ProgressEvent::Finished {
            snapshot: shared.stats.snapshot(),
            elapsed,
        });
    }
    Ok(DispatchReport {
        planned,
        skipped,
        stats: shared.stats,
        outcomes: shared.outcomes,
        aborted,
        elapsed,
    })
}

pub fn describe_abort(abort: &DispatchAbort, left: usize) -> String {
    match abort {
        DispatchAbort::Cancelled => format!("cancelled by operator, {} units not started", left),
        DispatchAbort::CircuitOpen {
            consecutive,
            last_error,
        } => format!(
            "circuit breaker open after {} consecutive systemic failures ({}), {} units not started",
            consecutive, last_error, left
        ),
    }
}

fn worker_loop(
    worker_id: usize,
    paths: &RunPaths,
    oracle: &dyn ScoringOracle,
    shared: &Mutex<Shared>,
    threshold: usize,
    cancel: &CancelToken,
    progress: Option<ProgressSender>,
) {
    loop {
        if cancel.is_cancelled() {
            debug!(worker_id, "worker stopping: cancelled");
            return;
        }
        let unit = {
            let mut guard = lock(shared);
            if guard.circuit_open.is_some() {
                return;
            }
            match guard.queue.pop_front() {
                Some(unit) => unit,
                None => return,
            }
        };

        let request = OracleRequest {
            trial_index: unit.trial_index,
            prompt: unit.prompt,
        };
        let start = Instant::now();
        let result = oracle.complete(&request);
        let elapsed = start.elapsed();
        let systemic = matches!(&result, Err(e) if e.is_systemic());
        let error = persist_result(paths, unit.trial_index, result, elapsed);

        let outcome = UnitOutcome {
            trial_index: unit.trial_index,
            elapsed,
            error,
        };
        let snapshot = {
            let mut guard = lock(shared);
            match &outcome.error {
                None => {
                    guard.stats.record_success(elapsed);
                    guard.streak = 0;
                }
                Some(message) => {
                    guard.stats.record_failure();
                    if systemic {
                        guard.streak += 1;
                        if guard.streak >= threshold && guard.circuit_open.is_none() {
                            guard.circuit_open = Some(DispatchAbort::CircuitOpen {
                                consecutive: guard.streak,
                                last_error: message.clone(),
                            });
                        }
                    } else {
                        guard.streak = 0;
                    }
                }
            }
            guard.outcomes.push(outcome.clone());
            guard.stats.snapshot()
        };
        if let Some(tx) = &progress {
            let _ = tx.send(ProgressEvent::UnitFinished {
                trial_index: outcome.trial_index,
                ok: outcome.succeeded(),
                elapsed,
                detail: outcome.error.clone(),
                snapshot,
            });
        }
    }
}

/// Writes the unit's terminal artifact. Returns the error description when the
/// unit failed, including failures to persist a successful response.
fn persist_result(
    paths: &RunPaths,
    index: u32,
    result: Result<OracleResponse, OracleError>,
    elapsed: Duration,
) -> Option<String> {
    match result {
        Ok(response) => match write_success(paths, index, &response) {
            Ok(()) => None,
            Err(e) => {
                let message = format!("failed to persist response: {:#}", e);
                write_error(paths, index, "persist_failed", &message, elapsed);
                Some(message)
            }
        },
        Err(err) => {
            let message = err.to_string();
            write_error(paths, index, err.kind(), &message, elapsed);
            Some(message)
        }
    }
}

fn write_success(paths: &RunPaths, index: u32, response: &OracleResponse) -> Result<()> {
    atomic_write_bytes(
        &paths.response_raw(index),
        &serde_json::to_vec_pretty(&response.raw)?,
    )?;
    atomic_write_bytes(&paths.response(index), response.text.as_bytes())
}

fn write_error(paths: &RunPaths, index: u32, kind: &str, message: &str, elapsed: Duration) {
    if let Err(e) = remove_file_if_exists(&paths.response(index)) {
        warn!(trial = index, error = %e, "could not remove stale response artifact");
    }
    let body = format!(
        "trial: {}\nerror_kind: {}\nelapsed_ms: {}\nmessage: {}\n",
        index,
        kind,
        elapsed.as_millis(),
        message
    );
    if let Err(e) = atomic_write_bytes(&paths.response_error(index), body.as_bytes()) {
        warn!(trial = index, error = %e, "could not write error artifact");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::spawn_reporter;
    use chrono::Utc;
    use serde_json::json;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    fn temp_run(tag: &str, trials: u32) -> (PathBuf, RunPaths) {
        let root = std::env::temp_dir().join(format!(
            "blindlab_dispatch_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let paths = RunPaths::new(&root);
        paths.prepare().expect("prepare");
        for i in 1..=trials {
            fs::write(paths.query(i), format!("prompt for trial {}", i)).expect("query");
        }
        (root, paths)
    }

    /// Answers every prompt, except listed trials which fail with the given
    /// error after sleeping `fail_delay`.
    struct ScriptedOracle {
        calls: AtomicUsize,
        fail: Vec<(u32, OracleError)>,
        ok_delay: Duration,
        fail_delay: Duration,
        cancel_after: Option<(usize, CancelToken)>,
    }

    impl ScriptedOracle {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: Vec::new(),
                ok_delay: Duration::from_millis(5),
                fail_delay: Duration::from_millis(5),
                cancel_after: None,
            }
        }
    }

    impl ScoringOracle for ScriptedOracle {
        fn complete(&self, request: &OracleRequest) -> Result<OracleResponse, OracleError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some((after, token)) = &self.cancel_after {
                if n >= *after {
                    token.cancel();
                }
            }
            if let Some((_, err)) = self.fail.iter().find(|(i, _)| *i == request.trial_index) {
                thread::sleep(self.fail_delay);
                return Err(err.clone());
            }
            thread::sleep(self.ok_delay);
            Ok(OracleResponse {
                text: format!("answer {}", request.trial_index),
                raw: json!({"choices": [{"message": {"content": "answer"}}]}),
            })
        }
    }

    fn run(
        paths: &RunPaths,
        oracle: &ScriptedOracle,
        options: &DispatchOptions,
        cancel: &CancelToken,
    ) -> DispatchReport {
        let (units, skipped) = plan_units(paths, options).expect("plan");
        dispatch(paths, units, skipped, oracle, options, cancel, None).expect("dispatch")
    }

    fn options(workers: usize) -> DispatchOptions {
        DispatchOptions {
            workers,
            ..DispatchOptions::default()
        }
    }

    #[test]
    fn error_artifact_replaces_stale_response() {
        let (root, paths) = temp_run("stale", 2);
        fs::write(paths.response(1), "old answer").unwrap();
        write_error(&paths, 1, "timeout", "timed out", Duration::from_millis(10));
        assert!(!paths.response(1).exists());
        let body = fs::read_to_string(paths.response_error(1)).unwrap();
        assert!(body.contains("error_kind: timeout"), "{}", body);

        // Removal fails on a directory; the error artifact is still written.
        fs::create_dir_all(paths.response(2)).unwrap();
        write_error(&paths, 2, "transport", "reset", Duration::from_millis(10));
        assert!(paths.response_error(2).exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn stats_average_only_counts_successes() {
        let mut stats = DispatchStats::new(10);
        for secs in [1, 2, 3, 4] {
            stats.record_success(Duration::from_secs(secs));
        }
        stats.record_failure();
        assert_eq!(stats.average(), Some(Duration::from_millis(2500)));
        assert_eq!(stats.remaining(), 5);
        assert_eq!(stats.eta(), Some(Duration::from_millis(12500)));
        assert_eq!(DispatchStats::new(3).eta(), None);
    }

    #[test]
    fn timeout_on_one_unit_leaves_four_successes_and_one_error() {
        let (root, paths) = temp_run("timeout", 5);
        let mut oracle = ScriptedOracle::new();
        oracle.fail = vec![(3, OracleError::Timeout(Duration::from_secs(1)))];
        oracle.fail_delay = Duration::from_millis(400);
        let report = run(&paths, &oracle, &options(2), &CancelToken::new());

        assert_eq!(report.stats.succeeded, 4);
        assert_eq!(report.stats.failed, 1);
        assert_eq!(report.aborted, None);
        for i in [1u32, 2, 4, 5] {
            assert!(paths.response(i).exists(), "missing success {}", i);
            assert!(paths.response_raw(i).exists());
            assert!(!paths.response_error(i).exists());
        }
        assert!(paths.response_error(3).exists());
        assert!(!paths.response(3).exists());
        let error_text = fs::read_to_string(paths.response_error(3)).unwrap();
        assert!(error_text.contains("error_kind: timeout"), "{}", error_text);

        let avg = report.stats.average().expect("average");
        assert!(avg < Duration::from_millis(200), "average {:?} includes failure", avg);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn every_unit_reaches_exactly_one_terminal_artifact() {
        let (root, paths) = temp_run("complete", 12);
        let mut oracle = ScriptedOracle::new();
        oracle.fail = vec![
            (2, OracleError::Http { status: 500, body: "x".into() }),
            (9, OracleError::MalformedBody("bad".into())),
        ];
        let (tx, rx) = mpsc::channel();
        let reporter = spawn_reporter(rx);
        let opts = options(4);
        let (units, skipped) = plan_units(&paths, &opts).unwrap();
        let report = dispatch(&paths, units, skipped, &oracle, &opts, &CancelToken::new(), Some(tx))
            .unwrap();
        reporter.join().unwrap();

        assert_eq!(report.stats.succeeded + report.stats.failed, 12);
        assert_eq!(report.attempted(), 12);
        for i in 1..=12u32 {
            assert!(paths.response(i).exists() ^ paths.response_error(i).exists());
        }
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn continue_twice_makes_no_new_calls() {
        let (root, paths) = temp_run("resume", 4);
        let mut oracle = ScriptedOracle::new();
        oracle.fail = vec![(2, OracleError::Transport("reset".into()))];
        run(&paths, &oracle, &options(2), &CancelToken::new());
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 4);

        let second = run(&paths, &oracle, &options(2), &CancelToken::new());
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 4);
        assert_eq!(second.planned, 0);
        assert_eq!(second.skipped, 4);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn force_rerun_replaces_prior_error() {
        let (root, paths) = temp_run("force", 3);
        let mut failing = ScriptedOracle::new();
        failing.fail = vec![(2, OracleError::Transport("reset".into()))];
        run(&paths, &failing, &options(1), &CancelToken::new());
        assert!(paths.response_error(2).exists());

        let healthy = ScriptedOracle::new();
        let opts = DispatchOptions {
            workers: 1,
            force_rerun: true,
            indices: Some(vec![2]),
            ..DispatchOptions::default()
        };
        let report = run(&paths, &healthy, &opts, &CancelToken::new());
        assert_eq!(report.planned, 1);
        assert_eq!(healthy.calls.load(Ordering::SeqCst), 1);
        assert!(paths.response(2).exists());
        assert!(!paths.response_error(2).exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn unknown_indices_are_rejected() {
        let (root, paths) = temp_run("unknown", 2);
        let opts = DispatchOptions {
            indices: Some(vec![1, 7]),
            ..DispatchOptions::default()
        };
        let err = plan_units(&paths, &opts).expect_err("7 does not exist");
        assert!(err.to_string().contains("[7]"), "{}", err);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn repeated_auth_failures_open_the_circuit() {
        let (root, paths) = temp_run("breaker", 10);
        let mut oracle = ScriptedOracle::new();
        oracle.fail = (1..=10)
            .map(|i| {
                (
                    i,
                    OracleError::Unauthorized {
                        status: 401,
                        body: "bad key".into(),
                    },
                )
            })
            .collect();
        let report = run(&paths, &oracle, &options(1), &CancelToken::new());
        assert!(matches!(
            report.aborted,
            Some(DispatchAbort::CircuitOpen { consecutive: 3, .. })
        ));
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 3);
        assert_eq!(report.unattempted(), 7);
        assert!(!paths.response_error(4).exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn ordinary_failures_reset_the_breaker_streak() {
        let (root, paths) = temp_run("streak", 6);
        let unauthorized = OracleError::Unauthorized {
            status: 403,
            body: "no".into(),
        };
        let mut oracle = ScriptedOracle::new();
        oracle.fail = vec![
            (1, unauthorized.clone()),
            (2, unauthorized.clone()),
            (3, OracleError::Http { status: 502, body: "x".into() }),
            (4, unauthorized.clone()),
            (5, unauthorized),
        ];
        let report = run(&paths, &oracle, &options(1), &CancelToken::new());
        assert_eq!(report.aborted, None);
        assert_eq!(report.attempted(), 6);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn cancellation_stops_new_submissions() {
        let (root, paths) = temp_run("cancel", 8);
        let token = CancelToken::new();
        let mut oracle = ScriptedOracle::new();
        oracle.cancel_after = Some((2, token.clone()));
        let report = run(&paths, &oracle, &options(1), &token);
        assert_eq!(report.aborted, Some(DispatchAbort::Cancelled));
        assert_eq!(report.attempted(), 2);
        assert!(paths.response(1).exists());
        assert!(paths.response(2).exists());
        assert!(!paths.has_terminal_response(3));

        // The interrupted batch resumes where it stopped.
        let resumed = run(&paths, &ScriptedOracle::new(), &options(2), &CancelToken::new());
        assert_eq!(resumed.skipped, 2);
        assert_eq!(resumed.attempted(), 6);
        let _ = fs::remove_dir_all(root);
    }
}
