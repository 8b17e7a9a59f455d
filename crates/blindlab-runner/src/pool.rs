//! Entity pool input and the append-only log of consumed entity ids.

use blindlab_core::{append_lines, atomic_write_bytes};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("pool file {0} is empty; a header row is required")]
    MissingHeader(PathBuf),
    #[error("pool header is missing required column '{0}'")]
    MissingColumn(&'static str),
    #[error("used-index log {path} line {line}: '{value}' is not an integer id")]
    BadUsedEntry {
        path: PathBuf,
        line: usize,
        value: String,
    },
}

/// One scorable subject. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolEntity {
    pub index: u64,
    pub source_id: u64,
    pub name: String,
    pub year: i32,
    pub description: String,
}

impl PoolEntity {
    pub fn display_name(&self) -> String {
        format!("{} ({})", self.name, self.year)
    }
}

const COL_INDEX: &str = "Index";
const COL_ID: &str = "Id";
const COL_NAME: &str = "Name";
const COL_YEAR: &str = "BirthYear";
const COL_DESC: &str = "DescriptionText";

/// Upstream pools label the source id column `idADB`; accept it too.
const COL_ID_ALIASES: &[&str] = &[COL_ID, "idADB"];

struct Columns {
    index: usize,
    id: usize,
    name: usize,
    year: usize,
    desc: usize,
}

fn locate_columns(header: &str) -> Result<Columns, PoolError> {
    let cells: Vec<&str> = header.split('\t').map(|c| c.trim()).collect();
    let find = |names: &[&str]| {
        cells
            .iter()
            .position(|c| names.iter().any(|n| c.eq_ignore_ascii_case(n)))
    };
    Ok(Columns {
        index: find(&[COL_INDEX]).ok_or(PoolError::MissingColumn(COL_INDEX))?,
        id: find(COL_ID_ALIASES).ok_or(PoolError::MissingColumn(COL_ID))?,
        name: find(&[COL_NAME]).ok_or(PoolError::MissingColumn(COL_NAME))?,
        year: find(&[COL_YEAR]).ok_or(PoolError::MissingColumn(COL_YEAR))?,
        desc: find(&[COL_DESC]).ok_or(PoolError::MissingColumn(COL_DESC))?,
    })
}

pub fn load_pool(path: &Path) -> Result<Vec<PoolEntity>, PoolError> {
    let raw = fs::read_to_string(path).map_err(|source| PoolError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_pool(&raw, path)
}

/// Parses pool rows, skipping malformed ones with a warning. Whether enough
/// rows survive is decided by the caller, which knows `k` and `m`.
pub fn parse_pool(raw: &str, source: &Path) -> Result<Vec<PoolEntity>, PoolError> {
    let mut lines = raw.lines().enumerate();
    let header = loop {
        match lines.next() {
            Some((_, l)) if l.trim().is_empty() => continue,
            Some((_, l)) => break l,
            None => return Err(PoolError::MissingHeader(source.to_path_buf())),
        }
    };
    let cols = locate_columns(header.trim_start_matches('\u{feff}'))?;

    let mut out = Vec::new();
    let mut seen = HashSet::new();
    for (line_idx, line) in lines {
        if line.trim().is_empty() {
            continue;
        }
        let line_no = line_idx + 1;
        let cells: Vec<&str> = line.split('\t').collect();
        match parse_row(&cells, &cols) {
            Ok(entity) => {
                if !seen.insert(entity.index) {
                    warn!(line = line_no, index = entity.index, "skipping duplicate pool index");
                    continue;
                }
                out.push(entity);
            }
            Err(reason) => {
                warn!(line = line_no, %reason, "skipping malformed pool row");
            }
        }
    }
    Ok(out)
}

fn field<'a>(cells: &[&'a str], i: usize, label: &str) -> Result<&'a str, String> {
    cells
        .get(i)
        .map(|c| c.trim())
        .filter(|c| !c.is_empty())
        .ok_or_else(|| format!("missing field {}", label))
}

fn parse_row(cells: &[&str], cols: &Columns) -> Result<PoolEntity, String> {
    let index = field(cells, cols.index, COL_INDEX)?
        .parse::<u64>()
        .map_err(|_| format!("non-numeric {}", COL_INDEX))?;
    let source_id = field(cells, cols.id, COL_ID)?
        .parse::<u64>()
        .map_err(|_| format!("non-numeric {}", COL_ID))?;
    let year = field(cells, cols.year, COL_YEAR)?
        .parse::<i32>()
        .map_err(|_| format!("non-numeric {}", COL_YEAR))?;
    Ok(PoolEntity {
        index,
        source_id,
        name: field(cells, cols.name, COL_NAME)?.to_string(),
        year,
        description: field(cells, cols.desc, COL_DESC)?.to_string(),
    })
}

/// Entity ids consumed by earlier trials of a batch directory.
///
/// The on-disk form is newline-delimited integers. Ids are only ever appended;
/// [`UsedIndexLog::reset`] is reserved for fresh batches.
#[derive(Debug)]
pub struct UsedIndexLog {
    path: PathBuf,
    ids: BTreeSet<u64>,
}

impl UsedIndexLog {
    pub fn open(path: &Path) -> Result<Self, PoolError> {
        let mut ids = BTreeSet::new();
        if path.exists() {
            let raw = fs::read_to_string(path).map_err(|source| PoolError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            for (i, line) in raw.lines().enumerate() {
                let value = line.trim();
                if value.is_empty() {
                    continue;
                }
                let id = value.parse::<u64>().map_err(|_| PoolError::BadUsedEntry {
                    path: path.to_path_buf(),
                    line: i + 1,
                    value: value.to_string(),
                })?;
                ids.insert(id);
            }
        }
        Ok(Self {
            path: path.to_path_buf(),
            ids,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, id: u64) -> bool {
        self.ids.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn snapshot(&self) -> BTreeSet<u64> {
        self.ids.clone()
    }

    pub fn append(&mut self, ids: &[u64]) -> anyhow::Result<()> {
        let lines: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        append_lines(&self.path, &lines)?;
        self.ids.extend(ids.iter().copied());
        Ok(())
    }

    pub fn reset(&mut self) -> anyhow::Result<()> {
        atomic_write_bytes(&self.path, b"")?;
        self.ids.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    const HEADER: &str = "Index\tId\tName\tBirthYear\tDescriptionText";

    #[test]
    fn malformed_rows_are_skipped() {
        let raw = format!(
            "{}\n1\t101\tAda\t1815\tcurious\n2\t102\tBad\tabc\tno year\n3\t103\tMissing\t1900\t\n4\t104\tGrace\t1906\tprecise\n",
            HEADER
        );
        let pool = parse_pool(&raw, Path::new("pool.tsv")).expect("parse");
        let names: Vec<&str> = pool.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["Ada", "Grace"]);
        assert_eq!(pool[0].display_name(), "Ada (1815)");
    }

    #[test]
    fn columns_are_located_by_name() {
        let raw = "DescriptionText\tName\tidADB\tBirthYear\tIndex\nbold\tAlan\t9\t1912\t7\n";
        let pool = parse_pool(raw, Path::new("pool.tsv")).expect("parse");
        assert_eq!(pool.len(), 1);
        assert_eq!(pool[0].index, 7);
        assert_eq!(pool[0].source_id, 9);
        assert_eq!(pool[0].description, "bold");
    }

    #[test]
    fn missing_header_column_is_fatal() {
        let raw = "Index\tName\tBirthYear\tDescriptionText\n1\tA\t1900\tx\n";
        let err = parse_pool(raw, Path::new("pool.tsv")).expect_err("should fail");
        assert!(matches!(err, PoolError::MissingColumn("Id")));
        assert!(matches!(
            parse_pool("", Path::new("pool.tsv")),
            Err(PoolError::MissingHeader(_))
        ));
    }

    #[test]
    fn duplicate_indices_keep_first_row() {
        let raw = format!("{}\n1\t1\tA\t1900\tx\n1\t2\tB\t1901\ty\n", HEADER);
        let pool = parse_pool(&raw, Path::new("pool.tsv")).expect("parse");
        assert_eq!(pool.len(), 1);
        assert_eq!(pool[0].name, "A");
    }

    #[test]
    fn used_log_appends_and_reloads() {
        let root = std::env::temp_dir().join(format!(
            "blindlab_used_log_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let path = root.join("used_indices.txt");
        let mut log = UsedIndexLog::open(&path).expect("open");
        assert!(log.is_empty());
        log.append(&[3, 1]).expect("append");
        log.append(&[9]).expect("append");
        let reloaded = UsedIndexLog::open(&path).expect("reopen");
        assert_eq!(reloaded.snapshot().into_iter().collect::<Vec<_>>(), vec![1, 3, 9]);
        assert_eq!(fs::read_to_string(&path).expect("read"), "3\n1\n9\n");

        log.reset().expect("reset");
        assert!(UsedIndexLog::open(&path).expect("reopen").is_empty());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn used_log_rejects_garbage() {
        let root = std::env::temp_dir().join(format!(
            "blindlab_used_log_bad_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&root).expect("dir");
        let path = root.join("used_indices.txt");
        fs::write(&path, "1\nx\n").expect("write");
        let err = UsedIndexLog::open(&path).expect_err("should fail");
        assert!(err.to_string().contains("line 2"), "{}", err);
        let _ = fs::remove_dir_all(root);
    }
}
