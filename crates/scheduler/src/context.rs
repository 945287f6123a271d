use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::warn;

/// Process-wide flags shared by the driver, the tasks and the runners.
#[derive(Debug, Default)]
pub struct ProcessContext {
    interrupt: AtomicBool,
    ssh_agent_warned: AtomicBool,
}

impl ProcessContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Ask the pipeline to stop at the next check.
    pub fn interrupt(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    /// Warn once per process when a remote command runs without an ssh agent.
    pub fn warn_missing_ssh_agent(&self) {
        if std::env::var_os("SSH_AUTH_SOCK").is_some() {
            return;
        }
        if !self.ssh_agent_warned.swap(true, Ordering::SeqCst) {
            warn!("SSH_AUTH_SOCK is not set; remote commands may prompt for a password");
        }
    }
}
