use std::time::Instant;

use tracing::{debug, error, info, warn};

use factorflow_core::FlowError;

use super::{Pipeline, PipelineOutcome};

impl Pipeline {
    /// Run ready tasks until none is left, one fails, or the interrupt is
    /// raised. Workers and the server are stopped before this returns,
    /// whatever the outcome.
    pub fn run(&mut self) -> Result<PipelineOutcome, FlowError> {
        self.start_bookkeeping()?;

        let outcome = match self.mediator.start_services() {
            Ok(()) => self.drive(),
            Err(e) => Err(e),
        };
        let teardown = self.mediator.teardown();
        let bookkeeping = self.end_bookkeeping();

        let outcome = outcome?;
        teardown?;
        bookkeeping?;

        match &outcome {
            PipelineOutcome::Completed => {
                self.print_stats()?;
                info!("Pipeline completed");
            }
            PipelineOutcome::Failed { task, reason } => {
                error!(task = %task, reason = %reason, "Pipeline stopped");
            }
            PipelineOutcome::Interrupted => warn!("Pipeline interrupted"),
        }
        Ok(outcome)
    }

    fn drive(&mut self) -> Result<PipelineOutcome, FlowError> {
        loop {
            if self.ctx.is_interrupted() {
                return Ok(PipelineOutcome::Interrupted);
            }
            if let Some(outcome) = self.run_next_task()? {
                return Ok(outcome);
            }
        }
    }

    /// Run the first ready task in pipeline order. `None` means the loop
    /// should go on; `Completed` is returned once nothing is ready.
    pub fn run_next_task(&mut self) -> Result<Option<PipelineOutcome>, FlowError> {
        let Some(name) = self.mediator.take_ready(&self.order) else {
            debug!("No task is ready");
            return Ok(Some(PipelineOutcome::Completed));
        };

        debug!(task = %name, "Running task");
        let started = Instant::now();
        let result = self.mediator.with_task(&name, |task, bus| task.run(bus));
        self.metrics.record_execution(&name, started.elapsed());

        match result {
            Ok(true) => Ok(None),
            Ok(false) => {
                self.metrics.record_failure();
                Ok(Some(PipelineOutcome::Failed {
                    reason: format!("premature exit within {name}"),
                    task: name,
                }))
            }
            Err(e) if e.is_interrupt() => Ok(Some(PipelineOutcome::Interrupted)),
            Err(e) => {
                self.metrics.record_failure();
                let task = e.failing_task().map_or(name.clone(), str::to_string);
                error!(task = %task, running = %name, error = %e, "Premature exit within task");
                Ok(Some(PipelineOutcome::Failed {
                    task,
                    reason: e.to_string(),
                }))
            }
        }
    }
}
