use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// A file below the working directory, with an optional version stamp.
///
/// The path is kept relative to the working directory so that persisted
/// state survives moving the directory; `version` lets consumers detect
/// regenerated inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub workdir: PathBuf,
    pub relative: String,
    #[serde(default)]
    pub version: Option<u64>,
}

impl FileRef {
    pub fn new(workdir: impl Into<PathBuf>, relative: impl Into<String>) -> Self {
        Self {
            workdir: workdir.into(),
            relative: relative.into(),
            version: None,
        }
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = Some(version);
        self
    }

    /// Full path for file system access.
    pub fn path(&self) -> PathBuf {
        self.workdir.join(&self.relative)
    }

    pub fn exists(&self) -> bool {
        self.path().is_file()
    }
}

impl fmt::Display for FileRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path().display())
    }
}

/// Generates file names of the form `workdir/jobname.taskname.file`.
#[derive(Debug, Clone)]
pub struct WorkDir {
    root: PathBuf,
    jobname: String,
    taskname: Option<String>,
}

impl WorkDir {
    pub fn new(root: impl Into<PathBuf>, jobname: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            jobname: jobname.into(),
            taskname: None,
        }
    }

    /// A copy scoped to one task's file prefix.
    pub fn for_task(&self, taskname: &str) -> Self {
        Self {
            taskname: Some(taskname.to_string()),
            ..self.clone()
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn jobname(&self) -> &str {
        &self.jobname
    }

    /// `jobname.taskname.name` (or `jobname.name` without a task).
    pub fn make_filename(&self, name: &str) -> FileRef {
        let mut parts = vec![self.jobname.as_str()];
        if let Some(task) = &self.taskname {
            parts.push(task);
        }
        parts.push(name);
        FileRef::new(&self.root, parts.join("."))
    }

    /// `jobname.subdir/jobname.taskname.name`, for tasks producing many files.
    pub fn make_filename_in(&self, subdir: &str, name: &str) -> FileRef {
        let inner = self.make_filename(name);
        FileRef::new(
            &self.root,
            format!("{}.{}/{}", self.jobname, subdir, inner.relative),
        )
    }

    /// Create `jobname.subdir/` if needed.
    pub fn ensure_subdir(&self, subdir: &str) -> std::io::Result<PathBuf> {
        let dir = self.root.join(format!("{}.{}", self.jobname, subdir));
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}
