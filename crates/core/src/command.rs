//! Program invocations and their results.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// One external program run: argument list, redirections, optional host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invocation {
    /// Short program name, used for time accounting keys.
    pub program: String,
    pub binary: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub stdin: Option<PathBuf>,
    #[serde(default)]
    pub stdout: Option<PathBuf>,
    #[serde(default)]
    pub stderr: Option<PathBuf>,
    /// Run through ssh on this host instead of locally.
    #[serde(default)]
    pub host: Option<String>,
    /// Files a worker needs before it can run the command.
    #[serde(default)]
    pub input_files: Vec<PathBuf>,
    /// Files the command produces.
    #[serde(default)]
    pub output_files: Vec<PathBuf>,
}

impl Invocation {
    pub fn new(program: impl Into<String>, binary: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            binary: binary.into(),
            args: Vec::new(),
            stdin: None,
            stdout: None,
            stderr: None,
            host: None,
            input_files: Vec::new(),
            output_files: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append `-key value`, or a bare `-key` for an empty value.
    pub fn param(mut self, key: &str, value: &str) -> Self {
        self.args.push(format!("-{key}"));
        if !value.is_empty() {
            self.args.push(value.to_string());
        }
        self
    }

    pub fn params(self, params: &BTreeMap<String, String>) -> Self {
        params.iter().fold(self, |inv, (k, v)| inv.param(k, v))
    }

    pub fn stdin(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdin = Some(path.into());
        self
    }

    pub fn stdout(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout = Some(path.into());
        self
    }

    pub fn stderr(mut self, path: impl Into<PathBuf>) -> Self {
        self.stderr = Some(path.into());
        self
    }

    pub fn on_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn input_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.input_files.push(path.into());
        self
    }

    pub fn output_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_files.push(path.into());
        self
    }

    /// Shell-quoted command line including redirections, for logs.
    pub fn command_line(&self) -> String {
        let mut words = vec![shellquote(&self.binary.display().to_string())];
        words.extend(self.args.iter().map(|a| shellquote(a)));
        let redirect = |op: &str, p: &Path| format!("{op} {}", shellquote(&p.display().to_string()));
        if let Some(p) = &self.stdin {
            words.push(redirect("<", p));
        }
        if let Some(p) = &self.stdout {
            words.push(redirect(">", p));
        }
        if let Some(p) = &self.stderr {
            words.push(redirect("2>", p));
        }
        words.join(" ")
    }
}

/// Quote a word for a POSIX shell if it contains anything beyond a safe set.
pub fn shellquote(word: &str) -> String {
    let safe = |c: char| c.is_ascii_alphanumeric() || "-_+=./:,@%".contains(c);
    if !word.is_empty() && word.chars().all(safe) {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

/// Program output stream, captured by value or redirected to a file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Output {
    #[default]
    Empty,
    Text(String),
    File(PathBuf),
}

impl Output {
    /// Text content, reading the file if the stream was redirected.
    pub fn read(&self) -> std::io::Result<String> {
        match self {
            Output::Empty => Ok(String::new()),
            Output::Text(s) => Ok(s.clone()),
            Output::File(p) => std::fs::read_to_string(p),
        }
    }
}

/// Uniform result of a program run, synchronous or through a work unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    /// WU id, or `<task>_<identifier>` for synchronous runs.
    pub wuid: String,
    pub program: String,
    pub rc: i32,
    pub stdout: Output,
    pub stderr: Output,
    pub output_files: Vec<PathBuf>,
    pub command_line: String,
    /// Host or client that ran the command.
    pub host: String,
    #[serde(default)]
    pub real_time: f64,
    #[serde(default)]
    pub cpu_time: f64,
}

impl CommandResult {
    pub fn succeeded(&self) -> bool {
        self.rc == 0
    }
}
