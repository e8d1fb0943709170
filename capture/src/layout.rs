use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

/// Where one capture run's images go: `{base_path}/{target}/{titer}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputTarget {
    pub base_path: PathBuf,
    pub target: String,
    pub titer: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum OutputError {
    #[error("{0} name cannot be empty")]
    Empty(&'static str),
    #[error("{field} name {value:?} must be a single path component")]
    NotAComponent { field: &'static str, value: String },
}

impl OutputTarget {
    /// Trims the names and rejects empty ones or ones that would escape the tree.
    pub fn new(
        base_path: impl Into<PathBuf>,
        target: &str,
        titer: &str,
    ) -> Result<Self, OutputError> {
        Ok(Self {
            base_path: base_path.into(),
            target: component("target", target)?,
            titer: component("titer", titer)?,
        })
    }

    /// `{base_path}/{target}/{titer}`, the parent of every run directory.
    pub fn series_dir(&self) -> PathBuf {
        self.base_path.join(&self.target).join(&self.titer)
    }
}

fn component(field: &'static str, raw: &str) -> Result<String, OutputError> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(OutputError::Empty(field));
    }
    if value == "." || value == ".." || value.contains(['/', '\\']) {
        return Err(OutputError::NotAComponent {
            field,
            value: value.to_string(),
        });
    }
    Ok(value.to_string())
}

/// Create the next numbered run directory under `target`'s series directory.
///
/// Run indices are `max(existing numeric subdirectories) + 1`, starting at 0.
/// Two concurrent allocations for the same series may race to the same index;
/// one process runs one capture at a time, so this is not guarded.
pub fn allocate_run_dir(target: &OutputTarget) -> io::Result<(u64, PathBuf)> {
    let series = target.series_dir();
    std::fs::create_dir_all(&series)?;

    let next = next_run_index(&series)?;
    let run_dir = series.join(next.to_string());
    std::fs::create_dir_all(&run_dir)?;
    debug!(run_dir = %run_dir.display(), run_index = next, "allocated run directory");
    Ok((next, run_dir))
}

fn next_run_index(series: &Path) -> io::Result<u64> {
    let mut max: Option<u64> = None;
    for entry in std::fs::read_dir(series)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(index) = name.to_str().and_then(parse_run_index) else {
            continue;
        };
        max = Some(max.map_or(index, |m| m.max(index)));
    }
    Ok(max.map_or(0, |m| m + 1))
}

fn parse_run_index(name: &str) -> Option<u64> {
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse().ok()
}

/// File name for a capture labelled `secs` seconds into the run, e.g. `12.50.png`.
pub fn image_file_name(secs: f64) -> String {
    // Normalise -0.00 that tiny negative rounding noise would otherwise print.
    let secs = if secs.abs() < 0.005 { 0.0 } else { secs };
    format!("{secs:.2}.png")
}
