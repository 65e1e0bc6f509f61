//! Persisted resume data for a staging directory.
//!
//! A small plain-text marker records which files a previous run of the same
//! build started and finished. Line 1 is the opaque build version string;
//! the rest are `started:<name>` / `completed:<name>` lines. A missing file
//! or a mismatched version means the staging directory cannot be trusted at
//! all — never partially.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Marker filename inside the staging directory.
pub const RESUME_DATA_FILENAME: &str = ".chunkforge-resume";

const STARTED_PREFIX: &str = "started:";
const COMPLETED_PREFIX: &str = "completed:";

/// Resume state for one staging directory.
#[derive(Debug)]
pub struct ResumeData {
    path: PathBuf,
    version: String,
    files_started: HashSet<String>,
    files_completed: HashSet<String>,
}

impl ResumeData {
    /// Fresh, empty resume data for `version`, not yet persisted.
    pub fn new(staging_dir: &Path, version: impl Into<String>) -> Self {
        Self {
            path: staging_dir.join(RESUME_DATA_FILENAME),
            version: version.into(),
            files_started: HashSet::new(),
            files_completed: HashSet::new(),
        }
    }

    /// Load the marker from `staging_dir`. Returns `None` when absent or
    /// unreadable (both mean: no usable resume data).
    pub fn load(staging_dir: &Path) -> Option<Self> {
        let path = staging_dir.join(RESUME_DATA_FILENAME);
        let contents = fs::read_to_string(&path).ok()?;
        let mut lines = contents.lines();
        let version = lines.next()?.to_string();

        let mut files_started = HashSet::new();
        let mut files_completed = HashSet::new();
        for line in lines {
            if let Some(name) = line.strip_prefix(STARTED_PREFIX) {
                files_started.insert(name.to_string());
            } else if let Some(name) = line.strip_prefix(COMPLETED_PREFIX) {
                files_completed.insert(name.to_string());
            }
        }

        Some(Self {
            path,
            version,
            files_started,
            files_completed,
        })
    }

    /// Whether this resume data belongs to the given build version.
    pub fn is_compatible_with(&self, version: &str) -> bool {
        self.version == version
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn was_started(&self, filename: &str) -> bool {
        self.files_started.contains(filename)
    }

    pub fn was_completed(&self, filename: &str) -> bool {
        self.files_completed.contains(filename)
    }

    pub fn has_progress(&self) -> bool {
        !self.files_started.is_empty() || !self.files_completed.is_empty()
    }

    /// Record that construction of `filename` has begun, and persist.
    pub fn record_started(&mut self, filename: &str) -> io::Result<()> {
        self.files_started.insert(filename.to_string());
        self.save()
    }

    /// Record that `filename` was fully constructed and verified, and persist.
    pub fn record_completed(&mut self, filename: &str) -> io::Result<()> {
        self.files_completed.insert(filename.to_string());
        self.save()
    }

    /// Write the marker file.
    pub fn save(&self) -> io::Result<()> {
        let mut out = String::with_capacity(128);
        out.push_str(&self.version);
        out.push('\n');
        let mut started: Vec<&String> = self.files_started.iter().collect();
        started.sort();
        for name in started {
            out.push_str(STARTED_PREFIX);
            out.push_str(name);
            out.push('\n');
        }
        let mut completed: Vec<&String> = self.files_completed.iter().collect();
        completed.sort();
        for name in completed {
            out.push_str(COMPLETED_PREFIX);
            out.push_str(name);
            out.push('\n');
        }
        fs::write(&self.path, out)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Delete everything inside `staging_dir`, including the resume marker.
/// Used when on-disk resume data belongs to a different build version.
pub fn wipe_staging_dir(staging_dir: &Path) -> io::Result<()> {
    if !staging_dir.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(staging_dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}
