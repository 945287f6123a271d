//! The unit of the pipeline.
//!
//! - `core`: [`TaskCore`], the state, parameters and programs every task owns
//!
//! Concrete tasks own a [`TaskCore`] and implement [`Task`]; tasks that hand
//! out work units also implement [`crate::ClientServerTask`].

mod core;

pub use self::core::{ProgramSlot, ProgramSpec, RunOptions, TaskContext, TaskCore, STATS_KEY};

use factorflow_core::{CommandResult, FlowError};

use crate::message::{Bus, Notification, RequestKey, Value};

/// A pipeline stage. Tasks never reference each other; everything they
/// need from the rest of the pipeline goes through the [`Bus`].
pub trait Task: Send {
    fn core(&self) -> &TaskCore;

    fn core_mut(&mut self) -> &mut TaskCore;

    /// Do as much work as possible. `Ok(false)` stops the pipeline.
    fn run(&mut self, bus: &mut dyn Bus) -> Result<bool, FlowError>;

    fn name(&self) -> &str {
        self.core().name()
    }

    fn title(&self) -> &str {
        self.core().title()
    }

    /// Request keys this task answers.
    fn answers(&self) -> Vec<RequestKey> {
        Vec::new()
    }

    /// Answer a request for one of the keys in [`Task::answers`].
    fn answer(&mut self, key: RequestKey, _value: Option<&Value>) -> Result<Option<Value>, FlowError> {
        Err(FlowError::UnansweredRequest(format!(
            "{key} (task {} has no answer for it)",
            self.name()
        )))
    }

    /// Called once when the pipeline is assembled.
    fn attach(&mut self, bus: &mut dyn Bus) -> Result<(), FlowError> {
        bus.notify(self.name(), Notification::WantToRun)
    }

    /// Whether this task hands out work units.
    fn is_client_server(&self) -> bool {
        false
    }

    /// Whether this task produces relations and should stop when enough were found.
    fn produces_relations(&self) -> bool {
        false
    }

    /// Raise the relation target to at least `target`.
    fn request_more_relations(&mut self, target: u64, _bus: &mut dyn Bus) -> Result<(), FlowError> {
        Err(FlowError::Config(format!(
            "task {} cannot produce more relations (asked for {target})",
            self.name()
        )))
    }

    /// A work unit result owned by this task arrived while another task was waiting.
    fn on_wu_result(&mut self, result: CommandResult, _bus: &mut dyn Bus) -> Result<(), FlowError> {
        Err(FlowError::WorkUnit(format!(
            "task {} does not take work unit results, got {}",
            self.name(),
            result.wuid
        )))
    }

    /// Cancel every unclaimed work unit of this task.
    fn cancel_available_wus(&mut self) -> Result<usize, FlowError> {
        Ok(0)
    }

    fn print_stats(&self) -> Result<(), FlowError> {
        self.core().print_stats()
    }

    /// `(cpu, real)` seconds spent by this task's programs.
    fn cpu_real_time(&self) -> Result<(f64, f64), FlowError> {
        self.core().cpu_real_time()
    }
}
