//! Line-oriented path snapshots and set difference between them.
//!
//! A snapshot is a file of newline-delimited absolute paths. Two writers fed
//! in lockstep produce companion files whose line numbers refer to the same
//! item, so a diff over one file can be dereferenced through the other.

use std::collections::{BTreeMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};

#[derive(Debug, Error)]
pub enum DiffError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("path contains a line break: {0:?}")]
    EmbeddedNewline(String),
    #[error("line {line} is past the end of {file}")]
    LineOutOfRange { file: PathBuf, line: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffEntry {
    pub line: u64,
    pub path: String,
}

pub struct SnapshotWriter {
    path: PathBuf,
    out: BufWriter<File>,
    lines: u64,
}

impl SnapshotWriter {
    pub async fn create(path: impl Into<PathBuf>) -> Result<Self, DiffError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = File::create(&path).await?;
        Ok(Self {
            path,
            out: BufWriter::new(file),
            lines: 0,
        })
    }

    /// Appends `entry` and returns its 0-based line number.
    pub async fn push(&mut self, entry: &str) -> Result<u64, DiffError> {
        if entry.contains(['\n', '\r']) {
            return Err(DiffError::EmbeddedNewline(entry.to_string()));
        }
        self.out.write_all(entry.as_bytes()).await?;
        self.out.write_all(b"\n").await?;
        let line = self.lines;
        self.lines += 1;
        Ok(line)
    }

    /// Pushes a local filesystem path in snapshot form.
    pub async fn push_path(&mut self, path: &Path) -> Result<u64, DiffError> {
        self.push(&normalize_path(&path.to_string_lossy(), cfg!(windows)))
            .await
    }

    pub async fn finish(mut self) -> Result<PathBuf, DiffError> {
        self.out.flush().await?;
        Ok(self.path)
    }
}

/// Snapshot form of a path: `/` separators, lowercased when the
/// filesystem is case-insensitive. Snapshots compare exact strings.
pub fn normalize_path(path: &str, case_insensitive: bool) -> String {
    let path = path.replace('\\', "/");
    if case_insensitive {
        path.to_lowercase()
    } else {
        path
    }
}

/// Lines of `a` that do not occur anywhere in `b`, in `a`'s order.
pub async fn diff(a: &Path, b: &Path) -> Result<Vec<DiffEntry>, DiffError> {
    let mut present = HashSet::new();
    let mut lines = BufReader::new(File::open(b).await?).lines();
    while let Some(line) = lines.next_line().await? {
        present.insert(line);
    }

    let mut missing = Vec::new();
    let mut lines = BufReader::new(File::open(a).await?).lines();
    let mut line_no = 0u64;
    while let Some(line) = lines.next_line().await? {
        if !present.contains(&line) {
            missing.push(DiffEntry {
                line: line_no,
                path: line,
            });
        }
        line_no += 1;
    }
    Ok(missing)
}

/// Reads the given line numbers from `file`, returned in the order asked.
pub async fn read_lines_at(file: &Path, wanted: &[u64]) -> Result<Vec<String>, DiffError> {
    if wanted.is_empty() {
        return Ok(Vec::new());
    }
    let mut found: BTreeMap<u64, String> = wanted.iter().map(|l| (*l, String::new())).collect();
    let last = *found.keys().next_back().unwrap_or(&0);

    let mut lines = BufReader::new(File::open(file).await?).lines();
    let mut line_no = 0u64;
    let mut seen = 0usize;
    while let Some(line) = lines.next_line().await? {
        if let Some(slot) = found.get_mut(&line_no) {
            *slot = line;
            seen += 1;
        }
        if line_no == last {
            break;
        }
        line_no += 1;
    }
    if seen < found.len() {
        return Err(DiffError::LineOutOfRange {
            file: file.to_path_buf(),
            line: last,
        });
    }

    Ok(wanted
        .iter()
        .map(|line| found.get(line).cloned().unwrap_or_default())
        .collect())
}
