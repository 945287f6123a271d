use std::collections::BTreeMap;
use std::path::PathBuf;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

// ── Top-level config ────────────────────────────────────────────────

/// Full configuration of one factoring job.
///
/// Parsed from a TOML parameter file. Task sections (`[tasks.<name>]`) are
/// read twice: here for their `kind`, and by the tasks themselves through
/// [`crate::Parameters`] for everything else.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Job name, first component of every WU id and file name.
    pub name: String,

    /// Directory holding all job files.
    pub workdir: PathBuf,

    /// State snapshot path. Defaults to `<workdir>/<name>.state.json`.
    #[serde(default)]
    pub database: Option<PathBuf>,

    #[serde(default)]
    pub pipeline: PipelineSection,

    #[serde(default)]
    pub workers: WorkerSection,

    /// Task sections in declaration order.
    #[serde(default)]
    pub tasks: IndexMap<String, TaskEntry>,
}

// ── Section configs ─────────────────────────────────────────────────

/// Driver order and notification routing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineSection {
    /// Fixed run order. Empty means the declaration order of `[tasks]`.
    #[serde(default)]
    pub order: Vec<String>,

    /// want-more-relations routing: sender task -> upstream producer task.
    #[serde(default)]
    pub routes: BTreeMap<String, String>,
}

/// Local worker pool that claims and runs WUs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSection {
    /// Number of worker threads. 0 disables local workers.
    #[serde(default = "default_threads")]
    pub threads: usize,

    /// Sleep between claim attempts when no WU is available.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_threads() -> usize {
    2
}

fn default_poll_interval_ms() -> u64 {
    200
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Kind selector of one task section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEntry {
    pub kind: TaskKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Runs one program synchronously and caches its output.
    Command,
    /// Distributes special-q ranges as work units.
    Sieving,
    /// Removes duplicate relations and asks for more when short.
    Filter,
}
