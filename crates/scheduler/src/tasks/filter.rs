use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};

use serde::Deserialize;
use tracing::{info, warn};

use factorflow_core::{FileRef, FlowError};

use crate::message::{Bus, Notification, RequestKey, Value};
use crate::task::{Task, TaskContext, TaskCore};

const UNIQUE_FILE: &str = "uniquefile";
const NUNIQUE: &str = "nunique";
const PROCESSED_VERSION: &str = "processed_version";
const OUTPUT_VERSION: &str = "output_version";

/// `[tasks.<name>]` parameters of a [`FilterTask`].
#[derive(Debug, Clone, Deserialize)]
pub struct FilterParams {
    /// Unique relations needed before the pipeline can go on.
    pub required_unique: u64,

    /// Fraction of the unique relations asked for on top when short.
    #[serde(default = "default_add_ratio")]
    pub add_ratio: f64,

    /// Lower bound of any request for more relations.
    #[serde(default = "default_min_additional")]
    pub min_additional: u64,
}

fn default_add_ratio() -> f64 {
    0.01
}

fn default_min_additional() -> u64 {
    10000
}

/// Removes duplicate relations from the siever output and decides whether
/// there are enough of them. When short it asks the upstream producer for
/// more and queues itself to run again.
pub struct FilterTask {
    core: TaskCore,
    params: FilterParams,
}

impl FilterTask {
    pub fn new(name: &str, ctx: &TaskContext) -> Result<Self, FlowError> {
        let core = TaskCore::new(name, "Filtering - Duplicate removal", ctx)?;
        let params: FilterParams = core.myparams()?;
        if params.add_ratio < 0.0 {
            return Err(FlowError::Config(format!("task {name}: add_ratio must not be negative")));
        }
        Ok(Self { core, params })
    }

    pub fn nunique(&self) -> Result<Option<u64>, FlowError> {
        self.core.state().get(NUNIQUE)
    }

    fn request_files(&self, bus: &mut dyn Bus) -> Result<(Vec<FileRef>, u64), FlowError> {
        let missing = |key: RequestKey| FlowError::MissingInput {
            task: self.core.name().to_string(),
            key: key.to_string(),
        };
        let files = match bus.request(self.core.name(), RequestKey::GetSieverFilenames, None)? {
            Some(Value::Files(files)) => files,
            _ => return Err(missing(RequestKey::GetSieverFilenames)),
        };
        let relcount = match bus.request(self.core.name(), RequestKey::GetSieverRelcount, None)? {
            Some(Value::Count(n)) => n,
            _ => return Err(missing(RequestKey::GetSieverRelcount)),
        };
        Ok((files, relcount))
    }

    /// Write every relation whose `a,b` pair was not seen before to `output`.
    /// Comment lines are dropped. Returns the number of unique relations.
    fn remove_duplicates(&self, inputs: &[FileRef], output: &FileRef) -> Result<u64, FlowError> {
        let mut seen = HashSet::new();
        let mut duplicates = 0u64;
        let mut out = BufWriter::new(File::create(output.path())?);
        for input in inputs {
            let reader = BufReader::new(File::open(input.path())?);
            for line in reader.lines() {
                let line = line?;
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                let key = line.split(':').next().unwrap_or(&line).to_string();
                if seen.insert(key) {
                    writeln!(out, "{line}")?;
                } else {
                    duplicates += 1;
                }
            }
        }
        out.flush()?;
        info!(
            task = %self.name(),
            unique = seen.len(),
            duplicates,
            "Duplicate removal done"
        );
        Ok(seen.len() as u64)
    }

    /// How many raw relations to ask for given `nunique` unique ones.
    fn additional_relations(&self, nunique: u64) -> u64 {
        let by_ratio = (nunique as f64 * self.params.add_ratio) as u64;
        let missing = self.params.required_unique.saturating_sub(nunique);
        by_ratio.max(missing).max(self.params.min_additional).max(1)
    }
}

impl Task for FilterTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut TaskCore {
        &mut self.core
    }

    fn run(&mut self, bus: &mut dyn Bus) -> Result<bool, FlowError> {
        self.core.prepare(bus)?;
        let (inputs, relcount) = self.request_files(bus)?;
        let version = Value::Files(inputs.clone()).version().unwrap_or(0);

        let state = self.core.state();
        let processed = state.get::<u64>(PROCESSED_VERSION)?;
        let output = self.core.workdir().make_filename("unique");
        let nunique = match (processed, self.nunique()?) {
            (Some(p), Some(n)) if p == version && output.exists() => {
                info!(task = %self.name(), "No new relation files, reusing previous result");
                n
            }
            (Some(p), _) if p > version => {
                return Err(FlowError::VersionRegressed {
                    key: PROCESSED_VERSION.into(),
                    recorded: p,
                    current: version,
                })
            }
            _ => {
                info!(task = %self.name(), files = inputs.len(), "Reading relation files");
                let n = self.remove_duplicates(&inputs, &output)?;
                let out_version = state.get_or(OUTPUT_VERSION, 0u64)? + 1;
                state.update(
                    [
                        (UNIQUE_FILE.to_string(), serde_json::Value::from(output.relative.clone())),
                        (NUNIQUE.to_string(), serde_json::Value::from(n)),
                        (PROCESSED_VERSION.to_string(), serde_json::Value::from(version)),
                        (OUTPUT_VERSION.to_string(), serde_json::Value::from(out_version)),
                    ],
                    true,
                )?;
                n
            }
        };

        let required = self.params.required_unique;
        if nunique >= required {
            info!(task = %self.name(), "Have enough relations: {nunique} unique, {required} required");
            bus.notify(self.name(), Notification::HaveEnoughRelations)?;
        } else {
            let additional = self.additional_relations(nunique);
            warn!(
                task = %self.name(),
                "Not enough relations: {nunique} unique, {required} required. Requesting {additional} additional relations"
            );
            bus.notify(self.name(), Notification::WantMoreRelations(relcount + additional))?;
            bus.notify(self.name(), Notification::WantToRun)?;
        }
        Ok(true)
    }

    fn answers(&self) -> Vec<RequestKey> {
        vec![RequestKey::GetUniqueFilenames, RequestKey::GetUniqueRelcount]
    }

    fn answer(&mut self, key: RequestKey, _value: Option<&Value>) -> Result<Option<Value>, FlowError> {
        match key {
            RequestKey::GetUniqueFilenames => Ok(self
                .core
                .state_file(UNIQUE_FILE)?
                .map(|f| Value::Files(vec![f]))),
            RequestKey::GetUniqueRelcount => Ok(self.nunique()?.map(Value::Count)),
            _ => Ok(None),
        }
    }
}
