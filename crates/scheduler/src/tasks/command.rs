use std::path::PathBuf;

use serde::Deserialize;
use tracing::info;

use factorflow_core::{FlowError, Invocation};

use crate::message::{Bus, RequestKey, Value, ValueKind};
use crate::task::{ProgramSpec, RunOptions, Task, TaskContext, TaskCore};

const OUTPUT_KEY: &str = "outputfile";
const OUTPUT_VERSION: &str = "output_version";

/// `[tasks.<name>]` parameters of a [`CommandTask`].
#[derive(Debug, Clone, Deserialize)]
pub struct CommandParams {
    pub binary: PathBuf,

    /// Fixed leading arguments.
    #[serde(default)]
    pub args: Vec<String>,

    /// Parameter names passed to the program as `-name value`.
    #[serde(default)]
    pub params: Vec<String>,

    /// Request whose answer is passed as `input_param`.
    #[serde(default)]
    pub input: Option<RequestKey>,

    #[serde(default = "default_input_param")]
    pub input_param: String,

    /// Request this task answers with its output file.
    #[serde(default)]
    pub provides: Option<RequestKey>,

    /// Output file suffix; stdout of the program goes there.
    #[serde(default = "default_output")]
    pub output: String,
}

fn default_input_param() -> String {
    "in".into()
}

fn default_output() -> String {
    "out".into()
}

/// Runs one program and keeps its stdout as the task output. The program
/// runs again only when the output is gone or an input has a newer version.
pub struct CommandTask {
    core: TaskCore,
    params: CommandParams,
}

impl CommandTask {
    pub fn new(name: &str, ctx: &TaskContext) -> Result<Self, FlowError> {
        let mut core = TaskCore::new(name, name, ctx)?;
        let params: CommandParams = core.myparams()?;
        if let Some(key) = params.provides {
            if key.expects() != ValueKind::File {
                return Err(FlowError::Config(format!(
                    "task {name} cannot provide {key}, only file requests are supported"
                )));
            }
        }

        let accepted: Vec<&str> = params.params.iter().map(String::as_str).collect();
        let inputs: Vec<(&str, RequestKey)> = params
            .input
            .map(|key| (params.input_param.as_str(), key))
            .into_iter()
            .collect();
        core.add_program(
            ProgramSpec::new(name, &params.binary, &accepted),
            &[],
            &inputs,
        );
        Ok(Self { core, params })
    }

    fn have_output(&self) -> Result<bool, FlowError> {
        Ok(self.core.state_file(OUTPUT_KEY)?.is_some_and(|f| f.exists()))
    }
}

impl Task for CommandTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut TaskCore {
        &mut self.core
    }

    fn run(&mut self, bus: &mut dyn Bus) -> Result<bool, FlowError> {
        self.core.prepare(bus)?;

        if self.have_output()? && !self.core.have_new_input_files()? {
            info!(task = %self.name(), "Output exists and inputs are unchanged, nothing to do");
            return Ok(true);
        }

        let output = self.core.workdir().make_filename(&self.params.output);
        let (_, stderr) = self.core.make_std_paths(self.core.name())?;
        let mut invocation = Invocation::new(self.core.name(), &self.params.binary);
        for arg in &self.params.args {
            invocation = invocation.arg(arg);
        }
        let invocation = invocation
            .params(&self.core.merged_args[0])
            .stdout(output.path())
            .stderr(stderr.path())
            .output_file(output.path());

        self.core.submit_command(
            &invocation,
            "run",
            RunOptions {
                log_errors: true,
                tolerate_failure: false,
            },
        )?;

        let state = self.core.state();
        let version = state.get_or(OUTPUT_VERSION, 0u64)? + 1;
        state.update(
            [
                (OUTPUT_KEY.to_string(), serde_json::Value::from(output.relative.clone())),
                (OUTPUT_VERSION.to_string(), serde_json::Value::from(version)),
            ],
            false,
        )?;
        self.core.remember_input_versions(true)?;
        info!(task = %self.name(), output = %output, version, "Output written");
        Ok(true)
    }

    fn answers(&self) -> Vec<RequestKey> {
        self.params.provides.into_iter().collect()
    }

    fn answer(&mut self, key: RequestKey, _value: Option<&Value>) -> Result<Option<Value>, FlowError> {
        if Some(key) != self.params.provides {
            return Ok(None);
        }
        Ok(self.core.state_file(OUTPUT_KEY)?.map(Value::File))
    }
}
