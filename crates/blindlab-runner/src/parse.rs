//! Response parsing: turns success artifacts into the fixed score-matrix format
//! consumed by analysis.

use crate::paths::RunPaths;
use crate::trial::Trial;
use blindlab_core::atomic_write_bytes;
use serde::{Deserialize, Serialize};
use std::fs;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseSummary {
    pub total: usize,
    pub parsed: usize,
    pub warnings: usize,
    pub parsed_indices: Vec<u32>,
}

impl ParseSummary {
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.parsed as f64 / self.total as f64
        }
    }

    pub fn line(&self) -> String {
        format!(
            "{}/{} responses parsed ({} warnings)",
            self.parsed, self.total, self.warnings
        )
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    /// Carries whatever was parsed before the failure. A partial summary with a
    /// nonzero count lets the pipeline continue on the valid subset.
    #[error("response parsing failed: {message}")]
    Failed {
        message: String,
        partial: Option<ParseSummary>,
    },
}

pub trait ResponseParser {
    fn parse(&self, paths: &RunPaths) -> Result<ParseSummary, ParseError>;
}

/// Extracts a k×k score matrix (rows = List A order, columns = List B ids)
/// from each successful response.
#[derive(Debug, Clone, Default)]
pub struct ScoreMatrixParser;

impl ResponseParser for ScoreMatrixParser {
    fn parse(&self, paths: &RunPaths) -> Result<ParseSummary, ParseError> {
        let fail = |message: String, partial: Option<ParseSummary>| ParseError::Failed {
            message,
            partial,
        };
        let indices = paths
            .existing_trial_indices()
            .map_err(|e| fail(format!("{:#}", e), None))?;

        let mut summary = ParseSummary {
            total: indices.len(),
            ..ParseSummary::default()
        };
        let mut scores_out = String::new();
        let mut mapping_rows: Vec<String> = Vec::new();
        let mut group_size = None;

        for index in indices {
            let response_path = paths.response(index);
            if !response_path.exists() {
                debug!(trial = index, "no successful response to parse");
                continue;
            }
            let trial: Trial = match fs::read(paths.trial_record(index))
                .map_err(|e| e.to_string())
                .and_then(|b| serde_json::from_slice(&b).map_err(|e| e.to_string()))
            {
                Ok(t) => t,
                Err(e) => {
                    warn!(trial = index, error = %e, "unreadable trial record");
                    summary.warnings += 1;
                    continue;
                }
            };
            let k = trial.group_size();
            group_size.get_or_insert(k);

            let text = match fs::read_to_string(&response_path) {
                Ok(t) => t,
                Err(e) => {
                    warn!(trial = index, error = %e, "unreadable response");
                    summary.warnings += 1;
                    continue;
                }
            };
            match parse_score_matrix(&text, k) {
                Ok(matrix) => {
                    summary.warnings += matrix.clamped;
                    if matrix.clamped > 0 {
                        warn!(trial = index, clamped = matrix.clamped, "scores clamped into [0, 1]");
                    }
                    for row in &matrix.rows {
                        let cells: Vec<String> = row.iter().map(|v| format!("{:.4}", v)).collect();
                        scores_out.push_str(&cells.join("\t"));
                        scores_out.push('\n');
                    }
                    scores_out.push('\n');
                    mapping_rows.push(trial.mapping_row());
                    summary.parsed += 1;
                    summary.parsed_indices.push(index);
                }
                Err(reason) => {
                    warn!(trial = index, %reason, "response did not contain a score matrix");
                    summary.warnings += 1;
                }
            }
        }

        let write = |path: std::path::PathBuf, body: String, summary: &ParseSummary| {
            atomic_write_bytes(&path, body.as_bytes())
                .map_err(|e| fail(format!("failed to write {}: {:#}", path.display(), e), Some(summary.clone())))
        };
        let header = (1..=group_size.unwrap_or(0))
            .map(|i| format!("Map_idx{}", i))
            .collect::<Vec<_>>()
            .join("\t");
        let mut mappings_out = format!("{}\n", header);
        for row in &mapping_rows {
            mappings_out.push_str(row);
            mappings_out.push('\n');
        }
        let indices_out: String = summary
            .parsed_indices
            .iter()
            .map(|i| format!("{}\n", i))
            .collect();
        write(paths.analysis.join("scores.txt"), scores_out, &summary)?;
        write(paths.analysis.join("mappings.txt"), mappings_out, &summary)?;
        write(paths.analysis.join("parsed_indices.txt"), indices_out, &summary)?;
        let summary_json = serde_json::to_string_pretty(&summary).map_err(|e| {
            fail(
                format!("failed to serialize parse summary: {}", e),
                Some(summary.clone()),
            )
        })?;
        write(paths.analysis.join("parse_summary.json"), summary_json, &summary)?;
        Ok(summary)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoreMatrix {
    pub rows: Vec<Vec<f64>>,
    pub clamped: usize,
}

/// Finds the first run of `k` consecutive lines that each carry at least `k`
/// numeric cells and takes the trailing `k` numbers of each.
///
/// Pipe tables and whitespace/tab/comma separated rows are both accepted;
/// leading labels such as `Ada Lovelace (1815)` never parse as numbers. A row
/// whose numbers are exactly `1..=k` is a column header naming description ids.
pub fn parse_score_matrix(text: &str, k: usize) -> Result<ScoreMatrix, String> {
    if k == 0 {
        return Err("group size is zero".to_string());
    }
    let mut rows: Vec<Vec<f64>> = Vec::with_capacity(k);
    for line in text.lines() {
        match numeric_row(line, k) {
            Some(row) => {
                rows.push(row);
                if rows.len() == k {
                    break;
                }
            }
            None => rows.clear(),
        }
    }
    if rows.len() < k {
        return Err(format!("expected {} rows of {} scores", k, k));
    }
    let mut clamped = 0;
    for row in rows.iter_mut() {
        for v in row.iter_mut() {
            if *v < 0.0 || *v > 1.0 {
                *v = v.clamp(0.0, 1.0);
                clamped += 1;
            }
        }
    }
    Ok(ScoreMatrix { rows, clamped })
}

fn numeric_row(line: &str, k: usize) -> Option<Vec<f64>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    let cells: Vec<&str> = if trimmed.contains('|') {
        trimmed.trim_matches('|').split('|').map(str::trim).collect()
    } else {
        trimmed
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|c| !c.is_empty())
            .collect()
    };
    let numbers: Vec<f64> = cells
        .iter()
        .filter_map(|c| c.trim_matches('*').parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .collect();
    if numbers.len() < k {
        return None;
    }
    let row = numbers[numbers.len() - k..].to_vec();
    if k > 1 && is_id_header(&row) {
        return None;
    }
    Some(row)
}

fn is_id_header(row: &[f64]) -> bool {
    row.iter().enumerate().all(|(i, v)| *v == (i + 1) as f64)
}
