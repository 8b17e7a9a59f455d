use crate::trial::MappingStrategy;
use blindlab_core::sha256_bytes;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("invalid config: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Fully resolved run configuration. Every default is applied at
/// deserialization time and checked by [`RunConfig::validate`] before any
/// component reads it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    #[serde(default = "default_version")]
    pub version: String,
    pub experiment: ExperimentSection,
    #[serde(default)]
    pub design: DesignSection,
    #[serde(default)]
    pub oracle: OracleSection,
    #[serde(default)]
    pub dispatch: DispatchSection,
    #[serde(default)]
    pub stages: StagesSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ExperimentSection {
    pub id: String,
    pub pool_path: PathBuf,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub prompt_template_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DesignSection {
    #[serde(default = "default_group_size")]
    pub group_size: usize,
    #[serde(default = "default_trial_count")]
    pub trial_count: usize,
    #[serde(default)]
    pub mapping_strategy: MappingStrategy,
    #[serde(default)]
    pub selection_seed: Option<u64>,
    #[serde(default)]
    pub shuffle_seed: Option<u64>,
    #[serde(default = "default_low_pool_factor")]
    pub low_pool_factor: usize,
}

impl Default for DesignSection {
    fn default() -> Self {
        Self {
            group_size: default_group_size(),
            trial_count: default_trial_count(),
            mapping_strategy: MappingStrategy::default(),
            selection_seed: None,
            shuffle_seed: None,
            low_pool_factor: default_low_pool_factor(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct OracleSection {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl Default for OracleSection {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            api_key_env: default_api_key_env(),
            model: default_model(),
            temperature: 0.0,
            max_tokens: default_max_tokens(),
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DispatchSection {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_breaker_threshold")]
    pub circuit_breaker_threshold: usize,
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            circuit_breaker_threshold: default_breaker_threshold(),
        }
    }
}

/// External collaborators invoked as subprocesses. Empty commands select the
/// built-in stage (analysis) or skip the stage (compilation).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct StagesSection {
    #[serde(default)]
    pub analyzer_command: Vec<String>,
    #[serde(default)]
    pub compiler_command: Vec<String>,
}

fn default_version() -> String {
    "1".to_string()
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("output/runs")
}
fn default_group_size() -> usize {
    4
}
fn default_trial_count() -> usize {
    10
}
fn default_low_pool_factor() -> usize {
    5
}
fn default_endpoint() -> String {
    "https://openrouter.ai/api/v1/chat/completions".to_string()
}
fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".to_string()
}
fn default_model() -> String {
    "google/gemini-flash-1.5".to_string()
}
fn default_max_tokens() -> u32 {
    8192
}
fn default_timeout_seconds() -> u64 {
    120
}
fn default_workers() -> usize {
    5
}
fn default_breaker_threshold() -> usize {
    3
}

impl RunConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_yaml_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.resolve_relative_paths(path.parent().unwrap_or(Path::new(".")));
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(raw)
    }

    /// Relative paths in a config file are relative to the file itself.
    pub fn resolve_relative_paths(&mut self, base: &Path) {
        let rebase = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        rebase(&mut self.experiment.pool_path);
        rebase(&mut self.experiment.output_dir);
        if let Some(p) = self.experiment.prompt_template_path.as_mut() {
            rebase(p);
        }
    }

    /// Reports every problem at once rather than stopping at the first.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();
        if self.experiment.id.trim().is_empty() {
            problems.push("/experiment/id must not be empty".to_string());
        }
        if self.experiment.pool_path.as_os_str().is_empty() {
            problems.push("/experiment/pool_path must not be empty".to_string());
        }
        if self.design.group_size < 2 {
            problems.push("/design/group_size must be at least 2".to_string());
        }
        if self.design.trial_count == 0 {
            problems.push("/design/trial_count must be at least 1".to_string());
        }
        if self.design.low_pool_factor == 0 {
            problems.push("/design/low_pool_factor must be at least 1".to_string());
        }
        if self.oracle.model.trim().is_empty() {
            problems.push("/oracle/model must not be empty".to_string());
        }
        if !(0.0..=2.0).contains(&self.oracle.temperature) {
            problems.push("/oracle/temperature must be within 0.0..=2.0".to_string());
        }
        if self.oracle.max_tokens == 0 {
            problems.push("/oracle/max_tokens must be at least 1".to_string());
        }
        if self.oracle.timeout_seconds == 0 {
            problems.push("/oracle/timeout_seconds must be at least 1".to_string());
        }
        if self.dispatch.workers == 0 {
            problems.push("/dispatch/workers must be at least 1".to_string());
        }
        if self.dispatch.circuit_breaker_threshold == 0 {
            problems.push("/dispatch/circuit_breaker_threshold must be at least 1".to_string());
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }

    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn digest(&self) -> anyhow::Result<String> {
        Ok(sha256_bytes(self.to_yaml()?.as_bytes()))
    }
}

pub const CONFIG_TEMPLATE: &str = "\
version: '1'
experiment:
  id: ''                              # REQUIRED
  pool_path: ''                       # REQUIRED: tab-delimited pool with header row
  output_dir: output/runs
  prompt_template_path: null          # optional; built-in template when null
design:
  group_size: 4                       # k: entities per trial
  trial_count: 10                     # m: trials per batch
  mapping_strategy: correct           # correct | random
  selection_seed: null                # null draws a seed and records it
  shuffle_seed: null
  low_pool_factor: 5
oracle:
  endpoint: https://openrouter.ai/api/v1/chat/completions
  api_key_env: OPENROUTER_API_KEY
  model: google/gemini-flash-1.5
  temperature: 0.0
  max_tokens: 8192
  timeout_seconds: 120
dispatch:
  workers: 5
  circuit_breaker_threshold: 3
stages:
  analyzer_command: []
  compiler_command: []
";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_resolves_defaults() {
        let cfg = RunConfig::from_yaml_str(
            "experiment:\n  id: exp\n  pool_path: pool.tsv\n",
        )
        .expect("parse");
        cfg.validate().expect("valid");
        assert_eq!(cfg.design.group_size, 4);
        assert_eq!(cfg.design.low_pool_factor, 5);
        assert_eq!(cfg.dispatch.circuit_breaker_threshold, 3);
        assert_eq!(cfg.design.mapping_strategy, MappingStrategy::Correct);
        assert_eq!(cfg.oracle.timeout_seconds, 120);
    }

    #[test]
    fn validate_reports_all_problems() {
        let mut cfg = RunConfig::from_yaml_str(
            "experiment:\n  id: ''\n  pool_path: pool.tsv\n",
        )
        .expect("parse");
        cfg.design.group_size = 1;
        cfg.dispatch.workers = 0;
        let msg = cfg.validate().expect_err("should fail").to_string();
        assert!(msg.contains("/experiment/id"), "{}", msg);
        assert!(msg.contains("/design/group_size"), "{}", msg);
        assert!(msg.contains("/dispatch/workers"), "{}", msg);
        assert!(!msg.contains("/oracle/model"), "{}", msg);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = RunConfig::from_yaml_str(
            "experiment:\n  id: exp\n  pool_path: pool.tsv\ndesign:\n  grup_size: 3\n",
        );
        assert!(err.is_err());
    }

    #[test]
    fn template_parses_once_required_fields_are_filled() {
        let filled = CONFIG_TEMPLATE
            .replace("id: ''", "id: demo")
            .replace("pool_path: ''", "pool_path: pool.tsv");
        let cfg = RunConfig::from_yaml_str(&filled).expect("template parses");
        cfg.validate().expect("template valid");
        assert_eq!(cfg, RunConfig::from_yaml_str(&cfg.to_yaml().unwrap()).unwrap());
    }

    #[test]
    fn relative_paths_are_rebased() {
        let mut cfg = RunConfig::from_yaml_str(
            "experiment:\n  id: exp\n  pool_path: data/pool.tsv\n",
        )
        .expect("parse");
        cfg.resolve_relative_paths(Path::new("/srv/exp"));
        assert_eq!(cfg.experiment.pool_path, PathBuf::from("/srv/exp/data/pool.tsv"));
        assert_eq!(cfg.experiment.output_dir, PathBuf::from("/srv/exp/output/runs"));
    }
}
