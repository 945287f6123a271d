use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Parameters every task reads from its `[tasks.<name>]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskParams {
    /// A task with `run = false` aborts the job when the driver reaches it.
    #[serde(default = "default_run")]
    pub run: bool,
}

fn default_run() -> bool {
    true
}

impl Default for TaskParams {
    fn default() -> Self {
        Self { run: default_run() }
    }
}

/// Work unit limits of a client-server task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientServerParams {
    /// Maximum number of `AVAILABLE` work units before submission blocks.
    #[serde(default = "default_maxwu")]
    pub maxwu: usize,

    /// Seconds after assignment before a WU counts as timed out.
    #[serde(default = "default_wutimeout")]
    pub wutimeout: u64,

    /// Highest attempt number a timed-out WU is resubmitted with.
    #[serde(default = "default_maxresubmit")]
    pub maxresubmit: u32,

    /// Timed-out WUs tolerated before the job fails.
    #[serde(default = "default_maxtimedout")]
    pub maxtimedout: u64,

    /// Failed WUs tolerated before the job fails.
    #[serde(default = "default_maxfailed")]
    pub maxfailed: u64,

    /// Seconds between two timeout sweeps.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: u64,

    /// Sleep of one `wait()` round when no result is pending.
    #[serde(default = "default_wait_sleep_ms")]
    pub wait_sleep_ms: u64,
}

fn default_maxwu() -> usize {
    10
}

fn default_wutimeout() -> u64 {
    10800
}

fn default_maxresubmit() -> u32 {
    5
}

fn default_maxtimedout() -> u64 {
    100
}

fn default_maxfailed() -> u64 {
    100
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_wait_sleep_ms() -> u64 {
    1000
}

impl Default for ClientServerParams {
    fn default() -> Self {
        Self {
            maxwu: default_maxwu(),
            wutimeout: default_wutimeout(),
            maxresubmit: default_maxresubmit(),
            maxtimedout: default_maxtimedout(),
            maxfailed: default_maxfailed(),
            sweep_interval: default_sweep_interval(),
            wait_sleep_ms: default_wait_sleep_ms(),
        }
    }
}

impl ClientServerParams {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval)
    }

    pub fn wait_sleep(&self) -> Duration {
        Duration::from_millis(self.wait_sleep_ms)
    }
}
