use chrono::{DateTime, Utc};
use tracing::{info, warn};

use factorflow_core::FlowError;

use super::Pipeline;

const STARTTIME: &str = "starttime";
const ELAPSED: &str = "elapsed";

impl Pipeline {
    pub(super) fn start_bookkeeping(&self) -> Result<(), FlowError> {
        if let Some(previous) = self.state.get::<DateTime<Utc>>(STARTTIME)? {
            warn!(
                starttime = %previous,
                "Previous run did not finish cleanly, its run time is not counted"
            );
        }
        self.state.set(STARTTIME, Utc::now(), true)
    }

    pub(super) fn end_bookkeeping(&self) -> Result<(), FlowError> {
        let Some(started) = self.state.get::<DateTime<Utc>>(STARTTIME)? else {
            return Ok(());
        };
        let run = (Utc::now() - started).num_milliseconds().max(0) as f64 / 1000.0;
        let elapsed = self.elapsed()? + run;
        self.state
            .update([(ELAPSED.to_string(), serde_json::Value::from(elapsed))], false)?;
        self.state.delete(STARTTIME, true)
    }

    /// Wall time of all finished runs, in seconds.
    pub fn elapsed(&self) -> Result<f64, FlowError> {
        self.state.get_or(ELAPSED, 0.0f64)
    }

    /// CPU seconds spent by all tasks.
    pub fn total_cpu_time(&self) -> Result<f64, FlowError> {
        let mut total = 0.0;
        for task in self.mediator.tasks() {
            total += task.cpu_real_time()?.0;
        }
        Ok(total)
    }

    /// Per-task statistics followed by the totals of the whole job.
    pub fn print_stats(&self) -> Result<(), FlowError> {
        for task in self.mediator.tasks() {
            task.print_stats()?;
        }
        let cpu = self.total_cpu_time()?;
        let elapsed = self.elapsed()?;
        info!("Total cpu/elapsed time for entire job: {cpu:.2}/{elapsed:.2}");
        Ok(())
    }
}
