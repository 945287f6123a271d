//! Requests, notifications and the bus tasks talk through.
//!
//! Tasks never hold references to each other. A task pulls data with a
//! [`RequestKey`] and pushes events with a [`Notification`]; the mediator
//! decides who answers or reacts.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use factorflow_core::{CommandResult, FileRef, FlowError};

// ── Requests ─────────────────────────────────────────────────────────

/// Every question a task can ask. Each key is answered by exactly one task
/// (or by the mediator itself for the built-in keys).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKey {
    GetRawPolynomials,
    GetPolynomial,
    GetPolynomialFilename,
    GetHaveTwoAlgSides,
    GetFactorbaseFilename,
    GetFreerelFilename,
    GetRenumberFilename,
    GetFreerelRelcount,
    GetRenumberPrimecount,
    GetSieverFilenames,
    GetSieverRelcount,
    GetDup1Filenames,
    GetDup1Relcount,
    GetUniqueFilenames,
    GetUniqueRelcount,
    GetPurgedFilename,
    GetMergedFilename,
    GetIndexFilename,
    GetDenseFilename,
    GetDependencyFilename,
    GetKernelFilename,
    GetWuResult,
    GetWorkdirJobname,
    GetWorkdirPath,
}

impl RequestKey {
    /// Payload type every answer to this key must have.
    pub fn expects(self) -> ValueKind {
        use RequestKey::*;
        match self {
            GetRawPolynomials | GetPolynomial | GetWorkdirJobname | GetWorkdirPath => ValueKind::Text,
            GetHaveTwoAlgSides => ValueKind::Bool,
            GetFreerelRelcount | GetRenumberPrimecount | GetSieverRelcount | GetDup1Relcount
            | GetUniqueRelcount => ValueKind::Count,
            GetSieverFilenames | GetDup1Filenames | GetUniqueFilenames => ValueKind::Files,
            GetWuResult => ValueKind::Result,
            GetPolynomialFilename | GetFactorbaseFilename | GetFreerelFilename
            | GetRenumberFilename | GetPurgedFilename | GetMergedFilename | GetIndexFilename
            | GetDenseFilename | GetDependencyFilename | GetKernelFilename => ValueKind::File,
        }
    }

    /// Keys the mediator answers without consulting a task.
    pub fn is_builtin(self) -> bool {
        matches!(
            self,
            RequestKey::GetWuResult | RequestKey::GetWorkdirJobname | RequestKey::GetWorkdirPath
        )
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| format!("{self:?}"));
        f.write_str(&name)
    }
}

/// A request in flight.
#[derive(Debug, Clone)]
pub struct Request {
    pub sender: String,
    pub key: RequestKey,
    pub value: Option<Value>,
}

// ── Values ───────────────────────────────────────────────────────────

/// Payload of a request or an answer.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Count(u64),
    Text(String),
    File(FileRef),
    Files(Vec<FileRef>),
    /// A WU result returned to the task that owns it.
    Result(Box<CommandResult>),
    /// A WU result was handed to its owning task instead of the caller.
    Delivered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Bool,
    Count,
    Text,
    File,
    Files,
    Result,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Bool(_) => ValueKind::Bool,
            Value::Count(_) => ValueKind::Count,
            Value::Text(_) => ValueKind::Text,
            Value::File(_) => ValueKind::File,
            Value::Files(_) => ValueKind::Files,
            Value::Result(_) | Value::Delivered => ValueKind::Result,
        }
    }

    /// Version stamp used for input tracking; the newest file wins for lists.
    pub fn version(&self) -> Option<u64> {
        match self {
            Value::File(f) => f.version,
            Value::Files(files) => files.iter().filter_map(|f| f.version).max(),
            _ => None,
        }
    }

    /// Form used on a program command line.
    pub fn to_arg(&self) -> String {
        match self {
            Value::Bool(b) => b.to_string(),
            Value::Count(n) => n.to_string(),
            Value::Text(s) => s.clone(),
            Value::File(f) => f.to_string(),
            Value::Files(files) => files
                .iter()
                .map(|f| f.to_string())
                .collect::<Vec<_>>()
                .join(","),
            Value::Result(r) => r.wuid.clone(),
            Value::Delivered => String::new(),
        }
    }

    /// Paths of the files this value refers to.
    pub fn paths(&self) -> Vec<PathBuf> {
        match self {
            Value::File(f) => vec![f.path()],
            Value::Files(files) => files.iter().map(FileRef::path).collect(),
            _ => Vec::new(),
        }
    }
}

// ── Notifications ────────────────────────────────────────────────────

/// Every event a task can announce, with its payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// The sender needs this many relations in total from its upstream producer.
    WantMoreRelations(u64),
    HaveEnoughRelations,
    /// File name -> path mappings a worker must be able to download.
    RegisterFilename(BTreeMap<String, PathBuf>),
    UnregisterFilename(String),
    WantToRun,
    SubscribeWuNotifications,
}

impl Notification {
    pub fn key(&self) -> &'static str {
        match self {
            Notification::WantMoreRelations(_) => "want_more_relations",
            Notification::HaveEnoughRelations => "have_enough_relations",
            Notification::RegisterFilename(_) => "register_filename",
            Notification::UnregisterFilename(_) => "unregister_filename",
            Notification::WantToRun => "want_to_run",
            Notification::SubscribeWuNotifications => "subscribe_wu_notifications",
        }
    }
}

/// A notification in flight.
#[derive(Debug, Clone)]
pub struct Notice {
    pub sender: String,
    pub notification: Notification,
}

// ── Bus ──────────────────────────────────────────────────────────────

/// What a running task may do to the rest of the pipeline.
pub trait Bus {
    /// Ask whichever task answers `key`. `Ok(None)` means the answerer has
    /// nothing to give yet.
    fn request(
        &mut self,
        sender: &str,
        key: RequestKey,
        value: Option<Value>,
    ) -> Result<Option<Value>, FlowError>;

    fn notify(&mut self, sender: &str, notification: Notification) -> Result<(), FlowError>;

    /// Whether the operator asked the pipeline to stop.
    fn interrupted(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_keys_use_snake_case_names() {
        assert_eq!(RequestKey::GetPolynomialFilename.to_string(), "get_polynomial_filename");
        let key: RequestKey = serde_json::from_str("\"get_siever_relcount\"").unwrap();
        assert_eq!(key, RequestKey::GetSieverRelcount);
    }

    #[test]
    fn payload_types_are_fixed_per_key() {
        assert_eq!(RequestKey::GetSieverFilenames.expects(), ValueKind::Files);
        assert_eq!(RequestKey::GetUniqueRelcount.expects(), ValueKind::Count);
        assert_eq!(RequestKey::GetKernelFilename.expects(), ValueKind::File);
        assert!(RequestKey::GetWuResult.is_builtin());
        assert!(!RequestKey::GetPolynomial.is_builtin());
    }

    #[test]
    fn files_version_is_the_newest() {
        let v = Value::Files(vec![
            FileRef::new("/w", "a").with_version(3),
            FileRef::new("/w", "b"),
            FileRef::new("/w", "c").with_version(5),
        ]);
        assert_eq!(v.version(), Some(5));
        assert_eq!(v.to_arg(), "/w/a,/w/b,/w/c");
        assert_eq!(Value::Count(4).version(), None);
    }
}
