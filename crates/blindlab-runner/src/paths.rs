use blindlab_core::ensure_dir;
use std::fs;
use std::path::{Path, PathBuf};

/// Artifact layout of one run directory.
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub root: PathBuf,
    pub queries: PathBuf,
    pub responses: PathBuf,
    pub analysis: PathBuf,
    pub runtime: PathBuf,
}

impl RunPaths {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            queries: root.join("queries"),
            responses: root.join("responses"),
            analysis: root.join("analysis"),
            runtime: root.join("runtime"),
        }
    }

    pub fn prepare(&self) -> anyhow::Result<()> {
        ensure_dir(&self.queries)?;
        ensure_dir(&self.responses)?;
        ensure_dir(&self.analysis)?;
        ensure_dir(&self.runtime)?;
        Ok(())
    }

    pub fn query(&self, index: u32) -> PathBuf {
        self.queries.join(format!("query_{:03}.txt", index))
    }

    pub fn manifest(&self, index: u32) -> PathBuf {
        self.queries.join(format!("manifest_{:03}.tsv", index))
    }

    pub fn trial_record(&self, index: u32) -> PathBuf {
        self.queries.join(format!("trial_{:03}.json", index))
    }

    pub fn mappings(&self) -> PathBuf {
        self.queries.join("mappings.tsv")
    }

    pub fn used_indices(&self) -> PathBuf {
        self.queries.join("used_indices.txt")
    }

    pub fn response(&self, index: u32) -> PathBuf {
        self.responses.join(format!("response_{:03}.txt", index))
    }

    pub fn response_raw(&self, index: u32) -> PathBuf {
        self.responses.join(format!("response_{:03}.raw.json", index))
    }

    pub fn response_error(&self, index: u32) -> PathBuf {
        self.responses.join(format!("response_{:03}.error.txt", index))
    }

    pub fn config_snapshot(&self) -> PathBuf {
        self.root.join("config_snapshot.yaml")
    }

    pub fn config_digest(&self) -> PathBuf {
        self.root.join("config_snapshot.digest")
    }

    pub fn report(&self) -> PathBuf {
        self.root.join("report.txt")
    }

    pub fn run_state(&self) -> PathBuf {
        self.runtime.join("run_state.json")
    }

    pub fn run_control(&self) -> PathBuf {
        self.runtime.join("run_control.json")
    }

    pub fn operation_lock(&self) -> PathBuf {
        self.runtime.join("operation.lock")
    }

    /// Trial indices with a query artifact, ascending.
    pub fn existing_trial_indices(&self) -> anyhow::Result<Vec<u32>> {
        indices_with_pattern(&self.queries, "query_", ".txt")
    }

    pub fn has_terminal_response(&self, index: u32) -> bool {
        self.response(index).exists() || self.response_error(index).exists()
    }
}

fn indices_with_pattern(dir: &Path, prefix: &str, suffix: &str) -> anyhow::Result<Vec<u32>> {
    let mut out = Vec::new();
    if !dir.exists() {
        return Ok(out);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(digits) = name
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_suffix(suffix))
        else {
            continue;
        };
        if let Ok(idx) = digits.parse::<u32>() {
            out.push(idx);
        }
    }
    out.sort_unstable();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn existing_indices_ignore_unrelated_files() {
        let root = std::env::temp_dir().join(format!(
            "blindlab_paths_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let paths = RunPaths::new(&root);
        paths.prepare().expect("prepare");
        for idx in [3u32, 1, 12] {
            fs::write(paths.query(idx), "q").expect("write");
        }
        fs::write(paths.queries.join("query_abc.txt"), "q").expect("write");
        fs::write(paths.manifest(1), "m").expect("write");
        assert_eq!(paths.existing_trial_indices().expect("scan"), vec![1, 3, 12]);
        assert_eq!(
            paths.query(7).file_name().unwrap().to_str(),
            Some("query_007.txt")
        );
        let _ = fs::remove_dir_all(root);
    }
}
