use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tracing::{debug, error, info, warn};

use factorflow_core::{
    make_wuname, CommandResult, FileRef, FlowError, Invocation, Parameters, StatRule, Statistics,
    WorkDir,
};
use factorflow_state::{StateDict, StateStore};

use crate::exec::ProgramRunner;
use crate::message::{Bus, RequestKey, Value};
use crate::types::TaskParams;

/// Shared handles every task is constructed from.
#[derive(Clone)]
pub struct TaskContext {
    pub params: Arc<Parameters>,
    pub store: StateStore,
    pub workdir: WorkDir,
    pub runner: Arc<dyn ProgramRunner>,
}

/// An external program a task may run.
#[derive(Debug, Clone)]
pub struct ProgramSpec {
    pub name: String,
    pub binary: PathBuf,
    /// Parameter names the program accepts on its command line.
    pub accepted: Vec<String>,
}

impl ProgramSpec {
    pub fn new(name: &str, binary: impl Into<PathBuf>, accepted: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            binary: binary.into(),
            accepted: accepted.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// A program together with how its parameters are filled.
#[derive(Debug, Clone)]
pub struct ProgramSlot {
    pub spec: ProgramSpec,
    /// Parameters the task computes itself.
    pub overrides: BTreeSet<String>,
    /// Parameters filled from the answer to a request.
    pub inputs: BTreeMap<String, RequestKey>,
    /// Parameters taken from the configuration.
    pub params: BTreeMap<String, String>,
}

/// How [`TaskCore::submit_command`] treats a non-zero exit code.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Log stderr of a failed run.
    pub log_errors: bool,
    /// Return the result instead of failing.
    pub tolerate_failure: bool,
}

/// State, parameters and programs shared by every task kind.
pub struct TaskCore {
    name: String,
    title: String,
    params: TaskParams,
    parameters: Arc<Parameters>,
    state: StateDict,
    workdir: WorkDir,
    programs: Vec<ProgramSlot>,
    runner: Arc<dyn ProgramRunner>,
    stats: Statistics,
    stat_formats: Vec<String>,
    input_files: Vec<BTreeMap<String, Value>>,
    /// Per program: configured parameters plus resolved inputs. Rebuilt on
    /// every run, so concrete tasks may add to it freely.
    pub merged_args: Vec<BTreeMap<String, String>>,
}

impl TaskCore {
    pub fn new(name: &str, title: &str, ctx: &TaskContext) -> Result<Self, FlowError> {
        let params: TaskParams = ctx.params.myparams(&["tasks", name])?;
        debug!(task = name, run = params.run, "Task created");
        Ok(Self {
            name: name.to_string(),
            title: title.to_string(),
            params,
            parameters: Arc::clone(&ctx.params),
            state: ctx.store.dict(name),
            workdir: ctx.workdir.for_task(name),
            programs: Vec::new(),
            runner: Arc::clone(&ctx.runner),
            stats: Statistics::default(),
            stat_formats: Vec::new(),
            input_files: Vec::new(),
            merged_args: Vec::new(),
        })
    }

    /// Install statistics rules and restore their running values from state.
    pub fn with_statistics(
        mut self,
        rules: Vec<StatRule>,
        formats: &[&str],
    ) -> Result<Self, FlowError> {
        let mut stats = Statistics::new(rules);
        if let Some(saved) = self.state.get::<BTreeMap<String, String>>(STATS_KEY)? {
            stats.from_dict(&saved)?;
        }
        self.stats = stats;
        self.stat_formats = formats.iter().map(|s| s.to_string()).collect();
        Ok(self)
    }

    /// Declare a program. Parameters listed as overrides or inputs are
    /// dropped from the configured set; the task fills them at run time.
    pub fn add_program(
        &mut self,
        spec: ProgramSpec,
        overrides: &[&str],
        inputs: &[(&str, RequestKey)],
    ) {
        let overrides: BTreeSet<String> = overrides.iter().map(|s| s.to_string()).collect();
        let inputs: BTreeMap<String, RequestKey> =
            inputs.iter().map(|(k, v)| (k.to_string(), *v)).collect();

        for key in overrides.iter().filter(|k| inputs.contains_key(*k)) {
            warn!(
                task = %self.name,
                program = %spec.name,
                param = %key,
                "Parameter listed both as override and as input, only one is needed"
            );
        }

        let path = ["tasks", self.name.as_str(), spec.name.as_str()];
        let mut params = self.parameters.program_params(&path, &spec.accepted);
        for key in overrides.iter().chain(inputs.keys()) {
            if params.remove(key).is_some() {
                warn!(
                    task = %self.name,
                    program = %spec.name,
                    param = %key,
                    "Parameter is generated at run time and cannot be supplied through the parameter file, ignoring it"
                );
            }
        }

        self.programs.push(ProgramSlot {
            spec,
            overrides,
            inputs,
            params,
        });
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn params(&self) -> &TaskParams {
        &self.params
    }

    /// Typed view of this task's parameter scope.
    pub fn myparams<T: DeserializeOwned>(&self) -> Result<T, FlowError> {
        self.parameters.myparams(&["tasks", self.name.as_str()])
    }

    pub fn state(&self) -> &StateDict {
        &self.state
    }

    pub fn workdir(&self) -> &WorkDir {
        &self.workdir
    }

    pub fn programs(&self) -> &[ProgramSlot] {
        &self.programs
    }

    pub fn runner(&self) -> &Arc<dyn ProgramRunner> {
        &self.runner
    }

    pub fn stats(&self) -> &Statistics {
        &self.stats
    }

    /// Resolved inputs of program `index` from the last [`TaskCore::prepare`].
    pub fn input_files(&self, index: usize) -> Option<&BTreeMap<String, Value>> {
        self.input_files.get(index)
    }

    /// First step of every `run()`: check the task is enabled, resolve every
    /// declared input through the bus and build the merged arguments.
    pub fn prepare(&mut self, bus: &mut dyn Bus) -> Result<(), FlowError> {
        if !self.params.run {
            info!(task = %self.name, "Stopping at disabled task");
            return Err(FlowError::TaskDisabled(self.name.clone()));
        }
        info!(task = %self.name, "Starting");

        let keys: BTreeSet<RequestKey> = self
            .programs
            .iter()
            .flat_map(|p| p.inputs.values().copied())
            .collect();
        let mut answers = BTreeMap::new();
        for key in keys {
            match bus.request(&self.name, key, None)? {
                Some(value) => {
                    answers.insert(key, value);
                }
                None => {
                    return Err(FlowError::MissingInput {
                        task: self.name.clone(),
                        key: key.to_string(),
                    })
                }
            }
        }

        self.input_files = self
            .programs
            .iter()
            .map(|p| {
                p.inputs
                    .iter()
                    .filter_map(|(param, key)| answers.get(key).map(|v| (param.clone(), v.clone())))
                    .collect()
            })
            .collect();
        self.merged_args = self
            .programs
            .iter()
            .zip(&self.input_files)
            .map(|(p, inputs)| {
                let mut merged = p.params.clone();
                merged.extend(inputs.iter().map(|(k, v)| (k.clone(), v.to_arg())));
                merged
            })
            .collect();
        Ok(())
    }

    fn version_key(index: usize, param: &str) -> String {
        format!("processed_version_{index}_{param}")
    }

    /// Whether any versioned input is unseen or newer than when last processed.
    pub fn have_new_input_files(&self) -> Result<bool, FlowError> {
        let mut result = false;
        for (index, inputs) in self.input_files.iter().enumerate() {
            for (param, value) in inputs {
                let Some(version) = value.version() else {
                    continue;
                };
                let key = Self::version_key(index, param);
                match self.state.get::<u64>(&key)? {
                    None => {
                        debug!(task = %self.name, input = %value.to_arg(), "Input was not processed before");
                        result = true;
                    }
                    Some(recorded) if recorded < version => {
                        debug!(task = %self.name, input = %value.to_arg(), "Input is newer than last time");
                        result = true;
                    }
                    Some(recorded) if recorded == version => {}
                    Some(recorded) => {
                        return Err(FlowError::VersionRegressed {
                            key,
                            recorded,
                            current: version,
                        })
                    }
                }
            }
        }
        if !result {
            debug!(task = %self.name, "Inputs unchanged since last time");
        }
        Ok(result)
    }

    /// Record the version of every versioned input in one update.
    pub fn remember_input_versions(&self, commit: bool) -> Result<(), FlowError> {
        let mut update = Vec::new();
        for (index, inputs) in self.input_files.iter().enumerate() {
            for (param, value) in inputs {
                if let Some(version) = value.version() {
                    update.push((Self::version_key(index, param), serde_json::Value::from(version)));
                }
            }
        }
        self.state.update(update, commit)
    }

    /// Run a program synchronously and account its time.
    pub fn submit_command(
        &self,
        invocation: &Invocation,
        identifier: &str,
        opts: RunOptions,
    ) -> Result<CommandResult, FlowError> {
        let wuid = make_wuname(self.workdir.jobname(), &self.name, identifier, None)?;
        let output = self.runner.run(invocation)?;
        self.update_cpu_real_time(&invocation.program, output.cpu_time, output.real_time, true)?;
        let result = output.into_result(&wuid, invocation, "server");
        if !result.succeeded() {
            if opts.log_errors {
                self.log_failed_command(&result);
            }
            if !opts.tolerate_failure {
                return Err(FlowError::CommandFailed {
                    program: result.program,
                    code: result.rc,
                });
            }
        }
        Ok(result)
    }

    /// Log everything known about a failed run.
    pub fn log_failed_command(&self, result: &CommandResult) {
        error!(
            task = %self.name,
            wuid = %result.wuid,
            host = %result.host,
            rc = result.rc,
            command = %result.command_line,
            "Program run failed"
        );
        match result.stderr.read() {
            Ok(text) if !text.is_empty() => error!(task = %self.name, "Stderr output follows:\n{text}"),
            Ok(_) => {}
            Err(e) => warn!(task = %self.name, error = %e, "Cannot read stderr of failed run"),
        }
    }

    // ── Time and statistics ──────────────────────────────────────────

    /// Add seconds to the cpu and real time totals of `program`.
    pub fn update_cpu_real_time(
        &self,
        program: &str,
        cpu: f64,
        real: f64,
        commit: bool,
    ) -> Result<(), FlowError> {
        let cpu_key = format!("cputime_{program}");
        let real_key = format!("realtime_{program}");
        let cpu_total = self.state.get_or(&cpu_key, 0.0f64)? + cpu;
        let real_total = self.state.get_or(&real_key, 0.0f64)? + real;
        self.state.update(
            [
                (cpu_key, serde_json::Value::from(cpu_total)),
                (real_key, serde_json::Value::from(real_total)),
            ],
            commit,
        )
    }

    /// `(cpu, real)` seconds spent by all programs of this task.
    pub fn cpu_real_time(&self) -> Result<(f64, f64), FlowError> {
        let mut cpu = 0.0;
        let mut real = 0.0;
        for p in &self.programs {
            cpu += self.state.get_or(&format!("cputime_{}", p.spec.name), 0.0f64)?;
            real += self.state.get_or(&format!("realtime_{}", p.spec.name), 0.0f64)?;
        }
        Ok((cpu, real))
    }

    /// Fold one program output into the statistics and persist them.
    pub fn parse_stats(&mut self, text: &str, commit: bool) -> Result<(), FlowError> {
        self.stats.parse_output(text)?;
        self.state.set(STATS_KEY, self.stats.as_dict(), commit)
    }

    pub fn print_stats(&self) -> Result<(), FlowError> {
        for p in &self.programs {
            let cpu = self.state.get_or(&format!("cputime_{}", p.spec.name), 0.0f64)?;
            let real = self.state.get_or(&format!("realtime_{}", p.spec.name), 0.0f64)?;
            if cpu > 0.0 || real > 0.0 {
                info!(task = %self.name, program = %p.spec.name, "Total cpu/real time: {cpu:.2}/{real:.2}");
            }
        }
        let formats: Vec<&str> = self.stat_formats.iter().map(String::as_str).collect();
        let lines = self.stats.as_strings(&formats);
        if !lines.is_empty() {
            info!(task = %self.name, "Aggregate statistics:");
            for line in lines {
                info!(task = %self.name, "{line}");
            }
        }
        Ok(())
    }

    // ── Files ────────────────────────────────────────────────────────

    /// A file name stored in state under `key`, stamped with `output_version`.
    pub fn state_file(&self, key: &str) -> Result<Option<FileRef>, FlowError> {
        let Some(relative) = self.state.get::<String>(key)? else {
            return Ok(None);
        };
        let mut file = FileRef::new(self.workdir.root(), relative);
        file.version = self.state.get::<u64>("output_version")?;
        Ok(Some(file))
    }

    /// Fresh stdout/stderr file names for one run of `program`, skipping
    /// indices whose files already exist.
    pub fn make_std_paths(&self, program: &str) -> Result<(FileRef, FileRef), FlowError> {
        let mut count = self.state.get_or("stdiocount", 0u64)? + 1;
        loop {
            let stdout = self.workdir.make_filename(&format!("{program}.stdout.{count}"));
            let stderr = self.workdir.make_filename(&format!("{program}.stderr.{count}"));
            if !stdout.exists() && !stderr.exists() {
                self.state.set("stdiocount", count, true)?;
                return Ok((stdout, stderr));
            }
            warn!(task = %self.name, index = count, "Stdout or stderr files with this index already exist");
            count += 1;
        }
    }

    /// Fail unless every file's existence matches `should_exist`.
    pub fn check_files_exist(
        files: &[FileRef],
        description: &str,
        should_exist: bool,
    ) -> Result<(), FlowError> {
        for f in files {
            match (should_exist, f.exists()) {
                (true, false) => {
                    return Err(FlowError::Io(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("{description} file {f} does not exist"),
                    )))
                }
                (false, true) => {
                    return Err(FlowError::Io(std::io::Error::new(
                        std::io::ErrorKind::AlreadyExists,
                        format!("{description} file {f} already exists"),
                    )))
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// State key holding the persisted statistics.
pub const STATS_KEY: &str = "stats";
