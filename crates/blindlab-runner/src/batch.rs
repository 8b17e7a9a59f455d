//! Batch building: sampling entities without replacement into a sequence of
//! trials, either from a clean directory or continuing after the last index.

use crate::paths::RunPaths;
use crate::pool::{PoolEntity, UsedIndexLog};
use crate::trial::{generate_trial, MappingStrategy, Trial, TrialError};
use anyhow::{Context, Result};
use blindlab_core::{append_lines, atomic_write_bytes, ensure_dir};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::fs;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("insufficient unique available entities: need {required}, have {available}")]
    InsufficientPool { available: usize, required: usize },
    #[error(
        "batch artifacts are inconsistent: {trials} trials on disk but {rows} mapping rows; rebuild with a fresh batch"
    )]
    InconsistentArtifacts { trials: usize, rows: usize },
    #[error("batch was created with {existing} = {recorded}, cannot continue with {requested}")]
    DesignMismatch {
        existing: &'static str,
        recorded: String,
        requested: String,
    },
    #[error(transparent)]
    Trial(#[from] TrialError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchMode {
    /// Clears earlier trial artifacts and the used-index log.
    Fresh,
    /// Resumes at (max existing index) + 1.
    Continue,
}

#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub trial_count: usize,
    pub group_size: usize,
    pub strategy: MappingStrategy,
    pub selection_seed: u64,
    pub shuffle_seed: u64,
    pub low_pool_factor: usize,
    pub query_template: String,
}

/// Design parameters fixed when a batch directory is first built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub group_size: usize,
    pub strategy: MappingStrategy,
    pub selection_seed: u64,
    pub shuffle_seed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSummary {
    pub first_index: u32,
    pub trials_written: usize,
    pub available_before: usize,
    pub low_pool: bool,
}

impl BatchSummary {
    pub fn last_index(&self) -> Option<u32> {
        (self.trials_written > 0).then(|| self.first_index + self.trials_written as u32 - 1)
    }
}

fn batch_record_path(paths: &RunPaths) -> std::path::PathBuf {
    paths.queries.join("batch.json")
}

pub fn load_batch_record(paths: &RunPaths) -> Result<Option<BatchRecord>> {
    let path = batch_record_path(paths);
    if !path.exists() {
        return Ok(None);
    }
    let record = serde_json::from_slice(&fs::read(&path)?)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(record))
}

fn mapping_header(group_size: usize) -> String {
    (1..=group_size)
        .map(|i| format!("Map_idx{}", i))
        .collect::<Vec<_>>()
        .join("\t")
}

/// Returns (header column count, data row count) of the aggregated mapping file.
fn mapping_file_shape(paths: &RunPaths) -> Result<Option<(usize, usize)>> {
    let path = paths.mappings();
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(&path)?;
    let mut lines = raw.lines().filter(|l| !l.trim().is_empty());
    let Some(header) = lines.next() else {
        return Ok(None);
    };
    Ok(Some((header.split('\t').count(), lines.count())))
}

fn clear_dir(dir: &std::path::Path) -> Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir)?;
    }
    ensure_dir(dir)
}

/// Builds `request.trial_count` trials into the run directory.
///
/// Entity ids of a trial are appended to the used-index log only after all of
/// that trial's artifacts exist, so an interrupted build never marks entities
/// as consumed without a trial to show for them.
/// Appends the ids of on-disk trials that the used-index log is missing. A
/// build that stops between the mapping row and the log append leaves them out.
fn recover_used_indices(
    paths: &RunPaths,
    existing: &[u32],
    used: &mut UsedIndexLog,
) -> Result<usize> {
    let mut missing: Vec<u64> = Vec::new();
    for &index in existing {
        let path = paths.trial_record(index);
        let raw = fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
        let trial: Trial = serde_json::from_slice(&raw)
            .with_context(|| format!("invalid trial record {}", path.display()))?;
        for id in trial.entity_indices {
            if !used.contains(id) && !missing.contains(&id) {
                missing.push(id);
            }
        }
    }
    if !missing.is_empty() {
        warn!(
            log = %used.path().display(),
            ids = ?missing,
            "used-index log was missing ids of existing trials; appending them"
        );
        used.append(&missing)?;
    }
    Ok(missing.len())
}

pub fn build_batch(
    paths: &RunPaths,
    pool: &[PoolEntity],
    mode: BatchMode,
    request: &BatchRequest,
) -> Result<BatchSummary> {
    paths.prepare()?;
    let k = request.group_size;
    let required = request.trial_count * k;

    let record = match mode {
        BatchMode::Fresh => None,
        BatchMode::Continue => load_batch_record(paths)?,
    };
    if let Some(rec) = &record {
        if rec.group_size != k {
            return Err(BatchError::DesignMismatch {
                existing: "group_size",
                recorded: rec.group_size.to_string(),
                requested: k.to_string(),
            }
            .into());
        }
        if rec.strategy != request.strategy {
            return Err(BatchError::DesignMismatch {
                existing: "mapping_strategy",
                recorded: rec.strategy.to_string(),
                requested: request.strategy.to_string(),
            }
            .into());
        }
    }

    let existing = match mode {
        BatchMode::Fresh => Vec::new(),
        BatchMode::Continue => paths.existing_trial_indices()?,
    };
    if mode == BatchMode::Continue {
        match mapping_file_shape(paths)? {
            Some((cols, _)) if cols != k => {
                return Err(BatchError::DesignMismatch {
                    existing: "group_size",
                    recorded: cols.to_string(),
                    requested: k.to_string(),
                }
                .into());
            }
            Some((_, rows)) if rows != existing.len() => {
                return Err(BatchError::InconsistentArtifacts {
                    trials: existing.len(),
                    rows,
                }
                .into());
            }
            None if !existing.is_empty() => {
                return Err(BatchError::InconsistentArtifacts {
                    trials: existing.len(),
                    rows: 0,
                }
                .into());
            }
            _ => {}
        }
    }

    let mut used = UsedIndexLog::open(&paths.used_indices())?;
    if mode == BatchMode::Continue {
        recover_used_indices(paths, &existing, &mut used)?;
    }
    let used_snapshot = match mode {
        BatchMode::Fresh => Default::default(),
        BatchMode::Continue => used.snapshot(),
    };
    let mut available: Vec<&PoolEntity> = pool
        .iter()
        .filter(|e| !used_snapshot.contains(&e.index))
        .collect();
    available.sort_by_key(|e| e.index);
    let available_before = available.len();

    // Checked before anything on disk changes, so a refused fresh build keeps
    // the previous batch intact.
    if available_before < required {
        return Err(BatchError::InsufficientPool {
            available: available_before,
            required,
        }
        .into());
    }
    let low_pool = available_before < request.low_pool_factor.saturating_mul(required);
    if low_pool {
        warn!(
            available = available_before,
            required,
            factor = request.low_pool_factor,
            "entity pool is running low for this batch"
        );
    }

    if mode == BatchMode::Fresh {
        clear_dir(&paths.queries)?;
        clear_dir(&paths.responses)?;
        clear_dir(&paths.analysis)?;
        used.reset()?;
    }

    let record = match record {
        Some(rec) => rec,
        None => {
            let rec = BatchRecord {
                group_size: k,
                strategy: request.strategy,
                selection_seed: request.selection_seed,
                shuffle_seed: request.shuffle_seed,
            };
            atomic_write_bytes(&batch_record_path(paths), &serde_json::to_vec_pretty(&rec)?)?;
            rec
        }
    };

    if mapping_file_shape(paths)?.is_none() {
        atomic_write_bytes(&paths.mappings(), format!("{}\n", mapping_header(k)).as_bytes())?;
    }

    let first_index = existing.last().map(|i| i + 1).unwrap_or(1);
    info!(
        mode = ?mode,
        first_index,
        trials = request.trial_count,
        group_size = k,
        strategy = %record.strategy,
        available = available_before,
        "building batch"
    );

    for offset in 0..request.trial_count {
        let index = first_index + offset as u32;
        let mut rng = StdRng::seed_from_u64(record.selection_seed.wrapping_add(index as u64));
        let mut picks = rand::seq::index::sample(&mut rng, available.len(), k).into_vec();
        let selected: Vec<PoolEntity> = picks.iter().map(|&i| available[i].clone()).collect();

        let trial = generate_trial(
            index,
            &selected,
            k,
            record.strategy,
            record.shuffle_seed.wrapping_add(index as u64),
        )
        .map_err(BatchError::from)?;

        atomic_write_bytes(&paths.manifest(index), trial.manifest_tsv().as_bytes())?;
        atomic_write_bytes(&paths.trial_record(index), &serde_json::to_vec_pretty(&trial)?)?;
        atomic_write_bytes(
            &paths.query(index),
            trial.render_prompt(&request.query_template).as_bytes(),
        )?;
        append_lines(&paths.mappings(), &[trial.mapping_row()])?;
        used.append(&trial.entity_indices)?;

        picks.sort_unstable_by(|a, b| b.cmp(a));
        for i in picks {
            available.remove(i);
        }
        debug!(trial = index, entities = ?trial.entity_indices, "trial written");
    }

    Ok(BatchSummary {
        first_index,
        trials_written: request.trial_count,
        available_before,
        low_pool,
    })
}
