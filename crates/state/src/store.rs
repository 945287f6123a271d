use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use factorflow_core::FlowError;

use crate::dict::StateDict;
use crate::wu::{WuRecord, WuTable};

/// Everything that is persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct Snapshot {
    /// Per-task key/value partitions.
    #[serde(default)]
    pub(crate) tables: BTreeMap<String, BTreeMap<String, Value>>,
    /// Work units in submission order.
    #[serde(default)]
    pub(crate) workunits: IndexMap<String, WuRecord>,
}

#[derive(Debug)]
pub(crate) struct Inner {
    /// Live state, including writes not committed yet.
    pub(crate) snapshot: Snapshot,
    /// What the file holds.
    durable: Snapshot,
    path: Option<PathBuf>,
    /// Whether workers may claim WUs. Not persisted.
    pub(crate) serving: bool,
    dirty: bool,
}

impl Inner {
    pub(crate) fn touch(&mut self) {
        self.dirty = true;
    }

    /// Write the snapshot if anything changed since the last commit.
    pub(crate) fn commit(&mut self) -> Result<(), FlowError> {
        if !self.dirty {
            return Ok(());
        }
        self.durable = self.snapshot.clone();
        persist(self.path.as_deref(), &self.durable)?;
        self.dirty = false;
        Ok(())
    }

    /// Make the live record of `wuid` durable and nothing else. A record
    /// that is not durable yet stays pending: its creation belongs to a
    /// transaction some other handle has not committed.
    pub(crate) fn commit_workunit(&mut self, wuid: &str) -> Result<(), FlowError> {
        let Some(live) = self.snapshot.workunits.get(wuid) else {
            return Ok(());
        };
        match self.durable.workunits.get_mut(wuid) {
            Some(stored) if stored != live => *stored = live.clone(),
            _ => return Ok(()),
        }
        persist(self.path.as_deref(), &self.durable)
    }
}

/// Replace the file atomically: a crash leaves either the previous or the
/// new snapshot, never a mix.
fn persist(path: Option<&Path>, snapshot: &Snapshot) -> Result<(), FlowError> {
    let Some(path) = path else {
        return Ok(());
    };
    let tmp = tmp_path(path);
    let json = serde_json::to_vec_pretty(snapshot)?;
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    debug!(path = %path.display(), "State committed");
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Shared, durable state of one job.
///
/// Writes are visible to every handle immediately. They become durable on
/// the next commit, so several writes made with `commit = false` followed by
/// one committing write land on disk together or not at all. Worker-side
/// WU updates (claim, result upload, resubmit flag) only persist their own
/// record, so they never flush half of such a sequence.
#[derive(Debug, Clone)]
pub struct StateStore {
    inner: Arc<Mutex<Inner>>,
}

impl StateStore {
    /// Open (or create) a snapshot file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, FlowError> {
        let path = path.as_ref().to_path_buf();
        let snapshot = if path.exists() {
            let bytes = std::fs::read(&path)?;
            let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
            info!(
                path = %path.display(),
                tables = snapshot.tables.len(),
                workunits = snapshot.workunits.len(),
                "Loaded state snapshot"
            );
            snapshot
        } else {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            Snapshot::default()
        };
        Ok(Self::from_parts(snapshot, Some(path)))
    }

    /// A store that never touches the file system.
    pub fn in_memory() -> Self {
        Self::from_parts(Snapshot::default(), None)
    }

    fn from_parts(snapshot: Snapshot, path: Option<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                durable: snapshot.clone(),
                snapshot,
                path,
                serving: false,
                dirty: false,
            })),
        }
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Inner>, FlowError> {
        self.inner
            .lock()
            .map_err(|e| FlowError::LockPoisoned(format!("state store: {e}")))
    }

    /// Run `f` on the locked state, then commit if asked to.
    pub(crate) fn write<R>(
        &self,
        commit: bool,
        f: impl FnOnce(&mut Inner) -> Result<R, FlowError>,
    ) -> Result<R, FlowError> {
        let mut inner = self.lock()?;
        let out = f(&mut inner)?;
        inner.touch();
        if commit {
            inner.commit()?;
        }
        Ok(out)
    }

    /// Run `f`, which changes at most the WU whose id it returns, and make
    /// only that record durable.
    pub(crate) fn write_workunit<R>(
        &self,
        f: impl FnOnce(&mut Inner) -> Result<(Option<String>, R), FlowError>,
    ) -> Result<R, FlowError> {
        let mut inner = self.lock()?;
        let (changed, out) = f(&mut inner)?;
        if let Some(wuid) = changed {
            inner.touch();
            inner.commit_workunit(&wuid)?;
        }
        Ok(out)
    }

    /// Make all pending writes durable.
    pub fn commit(&self) -> Result<(), FlowError> {
        self.lock()?.commit()
    }

    /// Handle on one task's partition.
    pub fn dict(&self, table: &str) -> StateDict {
        StateDict::new(self.clone(), table)
    }

    /// Handle on the global work unit table.
    pub fn workunits(&self) -> WuTable {
        WuTable::new(self.clone())
    }

    /// Names of all non-empty partitions.
    pub fn tables(&self) -> Result<Vec<String>, FlowError> {
        Ok(self
            .lock()?
            .snapshot
            .tables
            .iter()
            .filter(|(_, t)| !t.is_empty())
            .map(|(name, _)| name.clone())
            .collect())
    }

    pub fn set_serving(&self, serving: bool) -> Result<(), FlowError> {
        self.lock()?.serving = serving;
        Ok(())
    }

    pub fn is_serving(&self) -> Result<bool, FlowError> {
        Ok(self.lock()?.serving)
    }
}
