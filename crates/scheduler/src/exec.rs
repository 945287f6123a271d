//! Running external programs.

use std::fs::File;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use factorflow_core::{CommandResult, FlowError, Invocation, Output};

use crate::context::ProcessContext;

/// Raw outcome of one program run.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgramOutput {
    pub rc: i32,
    pub stdout: Output,
    pub stderr: Output,
    /// Wall clock seconds.
    pub real_time: f64,
    /// CPU seconds of the child (user + system).
    pub cpu_time: f64,
}

impl ProgramOutput {
    /// Attach identity and command line to make the uniform result object.
    pub fn into_result(self, wuid: &str, invocation: &Invocation, host: &str) -> CommandResult {
        CommandResult {
            wuid: wuid.to_string(),
            program: invocation.program.clone(),
            rc: self.rc,
            stdout: self.stdout,
            stderr: self.stderr,
            output_files: invocation.output_files.clone(),
            command_line: invocation.command_line(),
            host: host.to_string(),
            real_time: self.real_time,
            cpu_time: self.cpu_time,
        }
    }
}

/// Executes an [`Invocation`]. Implementations must be usable from worker threads.
pub trait ProgramRunner: Send + Sync {
    fn run(&self, invocation: &Invocation) -> Result<ProgramOutput, FlowError>;
}

/// Runs programs as local child processes, or through `ssh` when the
/// invocation names a host.
#[derive(Debug, Clone)]
pub struct LocalRunner {
    ctx: Arc<ProcessContext>,
}

impl LocalRunner {
    pub fn new(ctx: Arc<ProcessContext>) -> Self {
        Self { ctx }
    }

    fn build(&self, inv: &Invocation) -> Result<Command, FlowError> {
        let launch_err = |path: &std::path::Path, e: std::io::Error| FlowError::Launch {
            program: inv.program.clone(),
            reason: format!("{}: {e}", path.display()),
        };

        if let Some(host) = &inv.host {
            self.ctx.warn_missing_ssh_agent();
            // The remote shell applies the redirections.
            let mut cmd = Command::new("ssh");
            cmd.arg(host).arg(inv.command_line());
            cmd.stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
            return Ok(cmd);
        }

        let mut cmd = Command::new(&inv.binary);
        cmd.args(&inv.args);
        match &inv.stdin {
            Some(p) => cmd.stdin(File::open(p).map_err(|e| launch_err(p, e))?),
            None => cmd.stdin(Stdio::null()),
        };
        match &inv.stdout {
            Some(p) => cmd.stdout(File::create(p).map_err(|e| launch_err(p, e))?),
            None => cmd.stdout(Stdio::piped()),
        };
        match &inv.stderr {
            Some(p) => cmd.stderr(File::create(p).map_err(|e| launch_err(p, e))?),
            None => cmd.stderr(Stdio::piped()),
        };
        Ok(cmd)
    }
}

impl ProgramRunner for LocalRunner {
    fn run(&self, inv: &Invocation) -> Result<ProgramOutput, FlowError> {
        let mut cmd = self.build(inv)?;
        debug!(program = %inv.program, command = %inv.command_line(), "Running program");

        let cpu_before = children_cpu_time();
        let started = Instant::now();
        let output = cmd.output().map_err(|e| FlowError::Launch {
            program: inv.program.clone(),
            reason: e.to_string(),
        })?;
        let real_time = started.elapsed().as_secs_f64();
        let cpu_time = (children_cpu_time() - cpu_before).max(0.0);

        let capture = |redirect: &Option<std::path::PathBuf>, bytes: Vec<u8>| match redirect {
            Some(p) if inv.host.is_none() => Output::File(p.clone()),
            _ if bytes.is_empty() => Output::Empty,
            _ => Output::Text(String::from_utf8_lossy(&bytes).into_owned()),
        };

        Ok(ProgramOutput {
            rc: output.status.code().unwrap_or(-1),
            stdout: capture(&inv.stdout, output.stdout),
            stderr: capture(&inv.stderr, output.stderr),
            real_time,
            cpu_time,
        })
    }
}

/// Accumulated CPU time of all waited-for children of this process.
#[cfg(unix)]
fn children_cpu_time() -> f64 {
    // SAFETY: rusage is plain old data, all-zero is a valid value.
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    // SAFETY: the pointer refers to a live, writable rusage.
    let rc = unsafe { libc::getrusage(libc::RUSAGE_CHILDREN, &mut usage) };
    if rc != 0 {
        return 0.0;
    }
    let secs = |t: libc::timeval| t.tv_sec as f64 + t.tv_usec as f64 / 1e6;
    secs(usage.ru_utime) + secs(usage.ru_stime)
}

#[cfg(not(unix))]
fn children_cpu_time() -> f64 {
    0.0
}
