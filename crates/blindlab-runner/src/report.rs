//! The run report: one plain-text file per run whose `Final Status:` line is
//! rewritten in place when the run reaches a terminal state.

use crate::batch::BatchSummary;
use crate::config::RunConfig;
use crate::dispatch::DispatchReport;
use crate::parse::ParseSummary;
use crate::stages::AnalysisMetrics;
use anyhow::{anyhow, Context, Result};
use blindlab_core::atomic_write_bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

const STATUS_PREFIX: &str = "Final Status:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Pending,
    Completed,
    Failed,
    Interrupted,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "PENDING",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Failed => "FAILED",
            RunStatus::Interrupted => "INTERRUPTED",
        }
    }

    pub fn is_terminal(self) -> bool {
        self != RunStatus::Pending
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(RunStatus::Pending),
            "COMPLETED" => Ok(RunStatus::Completed),
            "FAILED" => Ok(RunStatus::Failed),
            "INTERRUPTED" => Ok(RunStatus::Interrupted),
            other => Err(anyhow!(
                "unknown run status '{}' (expected completed, failed or interrupted)",
                other
            )),
        }
    }
}

/// Everything the report shows. Sections whose stage never ran are `None`.
#[derive(Debug, Clone, Copy)]
pub struct ReportInput<'a> {
    pub run_id: &'a str,
    pub run_dir: &'a Path,
    pub config: &'a RunConfig,
    pub config_digest: Option<&'a str>,
    pub pool_digest: Option<&'a str>,
    pub batch: Option<&'a BatchSummary>,
    pub trials_on_disk: usize,
    pub dispatch: Option<&'a DispatchReport>,
    pub parse: Option<&'a ParseSummary>,
    pub metrics: Option<&'a AnalysisMetrics>,
    pub failure: Option<&'a str>,
}

pub fn render_report(input: &ReportInput<'_>) -> String {
    let cfg = input.config;
    let mut out = String::new();
    let mut line = |s: String| {
        out.push_str(&s);
        out.push('\n');
    };

    line("Blind Comparison Run Report".to_string());
    line("===========================".to_string());
    line(format!("Run ID: {}", input.run_id));
    line(format!("Date: {}", Utc::now().to_rfc3339()));
    line(format!("{} {}", STATUS_PREFIX, RunStatus::Pending));
    line(format!("Run Directory: {}", input.run_dir.display()));
    line(String::new());

    line("Parameters".to_string());
    line("----------".to_string());
    line(format!("Experiment: {}", cfg.experiment.id));
    line(format!("Model: {}", cfg.oracle.model));
    line(format!("Group Size (k): {}", cfg.design.group_size));
    line(format!("Trials (m): {}", cfg.design.trial_count));
    line(format!("Mapping Strategy: {}", cfg.design.mapping_strategy));
    line(format!("Selection Seed: {}", seed_label(cfg.design.selection_seed)));
    line(format!("Shuffle Seed: {}", seed_label(cfg.design.shuffle_seed)));
    if let Some(digest) = input.config_digest {
        line(format!("Config Digest: {}", digest));
    }
    if let Some(digest) = input.pool_digest {
        line(format!("Pool Digest: {}", digest));
    }
    line(String::new());

    line("Batch".to_string());
    line("-----".to_string());
    line(format!("Trials On Disk: {}", input.trials_on_disk));
    match input.batch {
        Some(b) if b.trials_written > 0 => line(format!(
            "Built This Run: {} (trials {}..={}, {} entities available{})",
            b.trials_written,
            b.first_index,
            b.last_index().unwrap_or(b.first_index),
            b.available_before,
            if b.low_pool { ", LOW POOL" } else { "" }
        )),
        Some(_) => line("Built This Run: 0".to_string()),
        None => line("Built This Run: not reached".to_string()),
    }
    line(String::new());

    line("Dispatch".to_string());
    line("--------".to_string());
    match input.dispatch {
        Some(d) => {
            line(format!(
                "Planned: {}, Skipped: {}, Succeeded: {}, Failed: {}, Not Started: {}",
                d.planned,
                d.skipped,
                d.stats.succeeded,
                d.stats.failed,
                d.unattempted()
            ));
            let avg = d
                .stats
                .average()
                .map(|a| format!("{:.2}s", a.as_secs_f64()))
                .unwrap_or_else(|| "-".to_string());
            line(format!(
                "Average Call: {}, Wall Time: {:.1}s",
                avg,
                d.elapsed.as_secs_f64()
            ));
        }
        None => line("not reached".to_string()),
    }
    line(String::new());

    line("Parsing".to_string());
    line("-------".to_string());
    match input.parse {
        Some(p) => line(p.line()),
        None => line("not reached".to_string()),
    }
    line(String::new());

    if let Some(failure) = input.failure {
        line(format!("Failure: {}", failure));
        line(String::new());
    }

    line("Metrics".to_string());
    line("-------".to_string());
    match input.metrics {
        Some(m) if !m.is_empty() => {
            for (key, value) in m {
                line(format!("{}: {:.4}", key, value));
            }
        }
        _ => line("none".to_string()),
    }
    out
}

fn seed_label(seed: Option<u64>) -> String {
    seed.map(|s| s.to_string())
        .unwrap_or_else(|| "unset".to_string())
}

/// Writes a fresh report with a `PENDING` status line.
pub fn write_report(path: &Path, input: &ReportInput<'_>) -> Result<()> {
    atomic_write_bytes(path, render_report(input).as_bytes())
}

/// Rewrites the `Final Status:` line. Running it again with the same status
/// leaves the file unchanged. `PENDING` is not a final status.
pub fn finalize_report(path: &Path, status: RunStatus) -> Result<()> {
    if !status.is_terminal() {
        return Err(anyhow!("cannot finalize report {} as {}", path.display(), status));
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read report {}", path.display()))?;
    let mut found = false;
    let mut out = String::with_capacity(raw.len());
    for line in raw.split_inclusive('\n') {
        if !found && line.starts_with(STATUS_PREFIX) {
            found = true;
            out.push_str(&format!("{} {}", STATUS_PREFIX, status));
            if line.ends_with('\n') {
                out.push('\n');
            }
        } else {
            out.push_str(line);
        }
    }
    if !found {
        return Err(anyhow!(
            "report {} has no '{}' line",
            path.display(),
            STATUS_PREFIX
        ));
    }
    if out != raw {
        atomic_write_bytes(path, out.as_bytes())?;
    }
    Ok(())
}

pub fn read_final_status(path: &Path) -> Result<RunStatus> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read report {}", path.display()))?;
    let value = raw
        .lines()
        .find_map(|l| l.strip_prefix(STATUS_PREFIX))
        .ok_or_else(|| anyhow!("report {} has no '{}' line", path.display(), STATUS_PREFIX))?;
    value.parse()
}
