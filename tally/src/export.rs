//! Durable storage for exported statistics and charts.
//!
//! Counters never touch the filesystem directly. They build a payload and a
//! file name and hand both to an [`ArtifactSink`]. [`DirectorySink`] is the
//! production sink; [`MemorySink`] keeps artifacts in memory for tests and
//! embedding.
//!
//! # File Names
//!
//! ```text
//! {name}_{timestamp}.json          <- window counts
//! {name}_total_{timestamp}.json    <- lifetime counts
//! graph_{name}_{timestamp}.html    <- rendered chart
//! ```
//!
//! `timestamp` is RFC 3339 with seconds precision in the local offset. The
//! name is the counter's display name with path separators and characters
//! that are invalid in file names replaced by `_`.

use std::fmt::{self, Display};
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, TimeZone};
use parking_lot::Mutex;

use crate::error::ExportError;

/// Destination for exported artifacts.
///
/// Implementations must be usable from several threads at once: scheduled
/// exports of different counters can run concurrently.
pub trait ArtifactSink: Send + Sync + fmt::Debug {
    /// Persists `payload` under `file_name`.
    ///
    /// Returns the location the artifact was written to.
    ///
    /// # Errors
    ///
    /// Returns an [`ExportError`] if the artifact could not be stored.
    fn persist(&self, file_name: &str, payload: &[u8]) -> Result<PathBuf, ExportError>;
}

/// Writes artifacts as files into one directory.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    /// Creates a sink writing into `dir`. The directory is created on first
    /// write if it does not exist.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Creates a sink for the configured output directory.
    ///
    /// An empty `configured` path means the current working directory; if
    /// that cannot be determined, `.` is used.
    pub fn from_setting(configured: &str) -> Self {
        if !configured.is_empty() {
            return Self::new(configured);
        }
        match std::env::current_dir() {
            Ok(cwd) => Self::new(cwd),
            Err(e) => {
                tracing::warn!("cannot read working directory, writing to '.': {e}");
                Self::new(".")
            }
        }
    }

    /// The directory artifacts are written to.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl ArtifactSink for DirectorySink {
    fn persist(&self, file_name: &str, payload: &[u8]) -> Result<PathBuf, ExportError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| ExportError::CreateDir {
            path: self.dir.clone(),
            source: e,
        })?;

        let path = self.dir.join(file_name);
        std::fs::write(&path, payload).map_err(|e| ExportError::Write {
            path: path.clone(),
            source: e,
        })?;
        Ok(path)
    }
}

/// Keeps artifacts in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    artifacts: Mutex<Vec<(String, Vec<u8>)>>,
}

impl MemorySink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns copies of all stored artifacts in write order.
    pub fn artifacts(&self) -> Vec<(String, Vec<u8>)> {
        self.artifacts.lock().clone()
    }

    /// Returns the file names of all stored artifacts in write order.
    pub fn names(&self) -> Vec<String> {
        self.artifacts.lock().iter().map(|(n, _)| n.clone()).collect()
    }

    /// Returns the payload of the most recent artifact whose name starts with
    /// `prefix`.
    pub fn latest(&self, prefix: &str) -> Option<Vec<u8>> {
        self.artifacts
            .lock()
            .iter()
            .rev()
            .find(|(n, _)| n.starts_with(prefix))
            .map(|(_, p)| p.clone())
    }
}

impl ArtifactSink for MemorySink {
    fn persist(&self, file_name: &str, payload: &[u8]) -> Result<PathBuf, ExportError> {
        self.artifacts
            .lock()
            .push((file_name.to_string(), payload.to_vec()));
        Ok(PathBuf::from(file_name))
    }
}

/// The kinds of artifact a counter produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    /// Counts since the last reset.
    Window,
    /// Counts since process start.
    Lifetime,
    /// Rendered chart page.
    Chart,
}

impl ArtifactKind {
    /// Short name used in logs and errors.
    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactKind::Window => "window",
            ArtifactKind::Lifetime => "lifetime",
            ArtifactKind::Chart => "chart",
        }
    }
}

impl Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds the file name for an artifact of `kind` taken at `at`.
pub fn artifact_name<Tz>(kind: ArtifactKind, display_name: &str, at: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let name = sanitize_file_component(display_name);
    let ts = at.to_rfc3339_opts(SecondsFormat::Secs, false);
    match kind {
        ArtifactKind::Window => format!("{name}_{ts}.json"),
        ArtifactKind::Lifetime => format!("{name}_total_{ts}.json"),
        ArtifactKind::Chart => format!("graph_{name}_{ts}.html"),
    }
}

/// Replaces characters that cannot appear in a file name with `_`.
fn sanitize_file_component(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}
