use std::fmt;
use std::sync::Arc;

use tracing::{error, info};

use factorflow_core::FlowError;
use factorflow_state::StateDict;

use crate::context::ProcessContext;
use crate::mediator::Mediator;
use crate::metrics::PipelineMetrics;

/// State table of the driver itself.
pub const DRIVER_TABLE: &str = "_driver";

/// How a call to [`Pipeline::run`] ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// No task is ready any more.
    Completed,
    /// A task returned `false` or failed.
    Failed { task: String, reason: String },
    /// The operator interrupt was raised.
    Interrupted,
}

impl PipelineOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl fmt::Display for PipelineOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Failed { task, reason } => write!(f, "failed in {task}: {reason}"),
            Self::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// The pipeline driver. Owns the mediator (and through it every task) and
/// the fixed order in which ready tasks are picked.
pub struct Pipeline {
    pub(super) mediator: Mediator,
    pub(super) order: Vec<String>,
    /// Start time and accumulated elapsed time.
    pub(super) state: StateDict,
    pub(super) metrics: PipelineMetrics,
    pub(super) ctx: Arc<ProcessContext>,
}

impl Pipeline {
    /// Check the order against the mediator's tasks and let every task attach.
    pub fn new(mut mediator: Mediator, order: Vec<String>) -> Result<Self, FlowError> {
        for name in &order {
            if !mediator.has_task(name) {
                return Err(FlowError::UnknownTask(name.clone()));
            }
        }
        for name in mediator.task_names() {
            if !order.contains(&name) {
                return Err(FlowError::Config(format!(
                    "task {name} is missing from the pipeline order"
                )));
            }
        }
        mediator.attach_all()?;

        let state = mediator.store().dict(DRIVER_TABLE);
        let ctx = Arc::clone(mediator.context());
        info!(tasks = order.len(), order = ?order, "Pipeline assembled");
        Ok(Self {
            mediator,
            order,
            state,
            metrics: PipelineMetrics::default(),
            ctx,
        })
    }

    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn mediator(&self) -> &Mediator {
        &self.mediator
    }

    pub fn mediator_mut(&mut self) -> &mut Mediator {
        &mut self.mediator
    }

    /// Get a snapshot of the driver metrics.
    pub fn metrics(&self) -> PipelineMetrics {
        self.metrics.clone()
    }

    pub fn context(&self) -> &Arc<ProcessContext> {
        &self.ctx
    }

    /// Signal the driver to stop before the next task.
    pub fn interrupt(&self) {
        info!("Pipeline interrupt requested");
        self.ctx.interrupt();
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if let Err(e) = self.mediator.teardown() {
            error!(error = %e, "Teardown on drop failed");
        }
    }
}
