//! Post-dispatch stages: analysis of parsed matrices and compilation of
//! results across runs. Both can be delegated to external commands.

use crate::parse::ParseSummary;
use crate::paths::RunPaths;
use anyhow::{anyhow, Context, Result};
use blindlab_core::atomic_write_json_pretty;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::{debug, info};

pub type AnalysisMetrics = BTreeMap<String, f64>;

pub trait Analyzer {
    fn analyze(&self, paths: &RunPaths, parse: &ParseSummary) -> Result<AnalysisMetrics>;
}

pub trait ResultCompiler {
    fn compile(&self, paths: &RunPaths) -> Result<()>;
}

/// Scores each parsed trial by where the true description ranks in its row.
#[derive(Debug, Clone, Default)]
pub struct MappingAnalyzer;

impl Analyzer for MappingAnalyzer {
    fn analyze(&self, paths: &RunPaths, parse: &ParseSummary) -> Result<AnalysisMetrics> {
        let scores_raw = fs::read_to_string(paths.analysis.join("scores.txt"))
            .context("missing analysis/scores.txt")?;
        let mappings_raw = fs::read_to_string(paths.analysis.join("mappings.txt"))
            .context("missing analysis/mappings.txt")?;

        let matrices = read_matrices(&scores_raw)?;
        let mappings = read_mappings(&mappings_raw)?;
        if matrices.len() != mappings.len() {
            return Err(anyhow!(
                "score matrices ({}) and mapping rows ({}) are misaligned",
                matrices.len(),
                mappings.len()
            ));
        }
        if matrices.len() != parse.parsed {
            return Err(anyhow!(
                "parser reported {} trials but {} matrices were written",
                parse.parsed,
                matrices.len()
            ));
        }

        let mut hits = 0usize;
        let mut rank_sum = 0f64;
        let mut rows = 0usize;
        let mut k = 0usize;
        for (matrix, mapping) in matrices.iter().zip(mappings.iter()) {
            k = mapping.len();
            if matrix.len() != k || matrix.iter().any(|r| r.len() != k) {
                return Err(anyhow!("matrix shape does not match group size {}", k));
            }
            for (row, &target) in matrix.iter().zip(mapping.iter()) {
                if target == 0 || target > k {
                    return Err(anyhow!("mapping value {} outside 1..={}", target, k));
                }
                let true_score = row[target - 1];
                let better = row.iter().filter(|&&v| v > true_score).count();
                let ties = row.iter().filter(|&&v| v == true_score).count();
                // Ties share the average of the ranks they span.
                let rank = better as f64 + (ties as f64 + 1.0) / 2.0;
                if better == 0 && ties == 1 {
                    hits += 1;
                }
                rank_sum += rank;
                rows += 1;
            }
        }

        let mut metrics = AnalysisMetrics::new();
        metrics.insert("trials_analyzed".to_string(), matrices.len() as f64);
        metrics.insert("fraction_parsed".to_string(), parse.fraction());
        if rows > 0 {
            metrics.insert("top1_accuracy".to_string(), hits as f64 / rows as f64);
            metrics.insert("mean_rank_of_correct".to_string(), rank_sum / rows as f64);
            metrics.insert("chance_top1".to_string(), 1.0 / k as f64);
            metrics.insert("chance_mean_rank".to_string(), (k as f64 + 1.0) / 2.0);
        }
        write_metrics(paths, &metrics)?;
        Ok(metrics)
    }
}

fn read_matrices(raw: &str) -> Result<Vec<Vec<Vec<f64>>>> {
    let mut out = Vec::new();
    let mut current: Vec<Vec<f64>> = Vec::new();
    for line in raw.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                out.push(std::mem::take(&mut current));
            }
            continue;
        }
        let row = line
            .split('\t')
            .map(|c| c.trim().parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("bad score row: {}", line))?;
        current.push(row);
    }
    if !current.is_empty() {
        out.push(current);
    }
    Ok(out)
}

fn read_mappings(raw: &str) -> Result<Vec<Vec<usize>>> {
    raw.lines()
        .skip(1)
        .filter(|l| !l.trim().is_empty())
        .map(|line| {
            line.split('\t')
                .map(|c| c.trim().parse::<usize>())
                .collect::<Result<Vec<_>, _>>()
                .with_context(|| format!("bad mapping row: {}", line))
        })
        .collect()
}

fn write_metrics(paths: &RunPaths, metrics: &AnalysisMetrics) -> Result<()> {
    atomic_write_json_pretty(&paths.analysis.join("metrics.json"), &json!(metrics))
}

/// Analyzer delegated to an external program. The run directory is appended
/// as the last argument; stdout must end with a JSON object of numeric metrics.
#[derive(Debug, Clone)]
pub struct CommandAnalyzer {
    pub command: Vec<String>,
}

impl Analyzer for CommandAnalyzer {
    fn analyze(&self, paths: &RunPaths, _parse: &ParseSummary) -> Result<AnalysisMetrics> {
        let stdout = run_stage_command(&self.command, &paths.root)?;
        let metrics = metrics_from_stdout(&stdout)?;
        write_metrics(paths, &metrics)?;
        Ok(metrics)
    }
}

/// Result compiler delegated to an external program.
#[derive(Debug, Clone)]
pub struct CommandCompiler {
    pub command: Vec<String>,
}

impl ResultCompiler for CommandCompiler {
    fn compile(&self, paths: &RunPaths) -> Result<()> {
        let stdout = run_stage_command(&self.command, &paths.root)?;
        debug!(output = %stdout.trim(), "result compiler finished");
        Ok(())
    }
}

fn metrics_from_stdout(stdout: &str) -> Result<AnalysisMetrics> {
    let line = stdout
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .ok_or_else(|| anyhow!("analyzer produced no output"))?;
    let value: Value = serde_json::from_str(line.trim())
        .with_context(|| format!("analyzer output is not JSON: {}", line))?;
    let obj = value
        .as_object()
        .ok_or_else(|| anyhow!("analyzer output must be a JSON object"))?;
    let mut metrics = AnalysisMetrics::new();
    for (key, v) in obj {
        let n = v
            .as_f64()
            .ok_or_else(|| anyhow!("metric '{}' is not numeric", key))?;
        metrics.insert(key.clone(), n);
    }
    Ok(metrics)
}

pub fn run_stage_command(command: &[String], run_dir: &Path) -> Result<String> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| anyhow!("stage command is empty"))?;
    info!(program = %program, run_dir = %run_dir.display(), "running external stage");
    let output = Command::new(program)
        .args(args)
        .arg(run_dir)
        .current_dir(run_dir)
        .env("BLINDLAB_RUN_DIR", run_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .with_context(|| format!("failed to spawn {}", program))?;
    if !output.status.success() {
        let stderr_tail = String::from_utf8_lossy(&output.stderr)
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("no stderr output")
            .to_string();
        return Err(anyhow!(
            "{} exited with {}: {}",
            program,
            output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string()),
            stderr_tail
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn temp_run(tag: &str) -> (std::path::PathBuf, RunPaths) {
        let root = std::env::temp_dir().join(format!(
            "blindlab_stages_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let paths = RunPaths::new(&root);
        paths.prepare().expect("prepare");
        (root, paths)
    }

    fn summary(parsed: usize, total: usize) -> ParseSummary {
        ParseSummary {
            total,
            parsed,
            warnings: 0,
            parsed_indices: (1..=parsed as u32).collect(),
        }
    }

    #[test]
    fn mapping_analyzer_scores_hits_and_ranks() {
        let (root, paths) = temp_run("analyze");
        // Trial 1: both rows rank the mapped column first. Trial 2: both miss.
        fs::write(
            paths.analysis.join("scores.txt"),
            "0.9\t0.1\n0.2\t0.8\n\n0.3\t0.7\n0.6\t0.4\n\n",
        )
        .unwrap();
        fs::write(
            paths.analysis.join("mappings.txt"),
            "Map_idx1\tMap_idx2\n1\t2\n1\t2\n",
        )
        .unwrap();
        let metrics = MappingAnalyzer
            .analyze(&paths, &summary(2, 4))
            .expect("metrics");
        assert_eq!(metrics["trials_analyzed"], 2.0);
        assert_eq!(metrics["fraction_parsed"], 0.5);
        assert_eq!(metrics["top1_accuracy"], 0.5);
        assert_eq!(metrics["mean_rank_of_correct"], 1.5);
        assert_eq!(metrics["chance_top1"], 0.5);
        assert!(paths.analysis.join("metrics.json").exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn ties_share_rank_and_are_not_hits() {
        let (root, paths) = temp_run("ties");
        fs::write(paths.analysis.join("scores.txt"), "0.5\t0.5\n0.1\t0.9\n").unwrap();
        fs::write(paths.analysis.join("mappings.txt"), "Map_idx1\tMap_idx2\n1\t2\n").unwrap();
        let metrics = MappingAnalyzer.analyze(&paths, &summary(1, 1)).unwrap();
        assert_eq!(metrics["top1_accuracy"], 0.5);
        assert_eq!(metrics["mean_rank_of_correct"], 1.25);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn misaligned_inputs_fail() {
        let (root, paths) = temp_run("misaligned");
        fs::write(paths.analysis.join("scores.txt"), "0.5\t0.5\n0.1\t0.9\n").unwrap();
        fs::write(paths.analysis.join("mappings.txt"), "Map_idx1\tMap_idx2\n").unwrap();
        assert!(MappingAnalyzer.analyze(&paths, &summary(1, 1)).is_err());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn metrics_are_read_from_last_stdout_line() {
        let metrics = metrics_from_stdout("loading...\n{\"auc\": 0.61, \"n\": 12}\n\n").unwrap();
        assert_eq!(metrics["auc"], 0.61);
        assert_eq!(metrics["n"], 12.0);
        assert!(metrics_from_stdout("{\"label\": \"x\"}").is_err());
        assert!(metrics_from_stdout("").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn external_stage_receives_run_dir_and_reports_failure() {
        let (root, paths) = temp_run("command");
        let analyzer = CommandAnalyzer {
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                "test -d \"$0\" && echo '{\"score\": 1.0}'".to_string(),
            ],
        };
        let metrics = analyzer.analyze(&paths, &summary(0, 0)).expect("metrics");
        assert_eq!(metrics["score"], 1.0);

        let failing = CommandCompiler {
            command: vec!["sh".to_string(), "-c".to_string(), "echo boom >&2; exit 3".to_string()],
        };
        let err = failing.compile(&paths).expect_err("exit 3");
        assert!(err.to_string().contains("boom"), "{}", err);
        assert!(run_stage_command(&[], &paths.root).is_err());
        let _ = fs::remove_dir_all(root);
    }
}
