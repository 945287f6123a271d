//! Concrete pipeline stages.
//!
//! - `command`: one program run synchronously, output cached across restarts
//! - `sieving`: relation production through work units
//! - `filter`: duplicate removal, asks for more relations when short

mod command;
mod filter;
mod sieving;

pub use self::command::{CommandParams, CommandTask};
pub use self::filter::{FilterParams, FilterTask};
pub use self::sieving::{SievingParams, SievingTask};

use factorflow_core::{FlowError, TaskKind};

use crate::task::{Task, TaskContext};

/// Build the task configured as `[tasks.<name>]` with the given kind.
pub fn create_task(
    kind: TaskKind,
    name: &str,
    ctx: &TaskContext,
) -> Result<Box<dyn Task>, FlowError> {
    Ok(match kind {
        TaskKind::Command => Box::new(CommandTask::new(name, ctx)?),
        TaskKind::Sieving => Box::new(SievingTask::new(name, ctx)?),
        TaskKind::Filter => Box::new(FilterTask::new(name, ctx)?),
    })
}
