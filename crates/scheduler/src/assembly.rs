//! Building a runnable pipeline from configuration.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use factorflow_core::{FlowConfig, FlowError, Parameters, WorkDir};
use factorflow_state::StateStore;

use crate::context::ProcessContext;
use crate::exec::{LocalRunner, ProgramRunner};
use crate::mediator::{Mediator, Services};
use crate::runner::Pipeline;
use crate::server::LocalWorkServer;
use crate::task::{Task, TaskContext};
use crate::tasks::create_task;
use crate::workers::ThreadWorkers;

/// Create every configured task, the local server and worker pool, and the
/// mediator routes, then hand them to a [`Pipeline`] in the configured order.
pub fn build_pipeline(
    config: &FlowConfig,
    params: Arc<Parameters>,
    store: StateStore,
    ctx: Arc<ProcessContext>,
) -> Result<Pipeline, FlowError> {
    std::fs::create_dir_all(&config.workdir)?;

    let runner: Arc<dyn ProgramRunner> = Arc::new(LocalRunner::new(Arc::clone(&ctx)));
    let task_ctx = TaskContext {
        params,
        store: store.clone(),
        workdir: WorkDir::new(&config.workdir, &config.name),
        runner: Arc::clone(&runner),
    };

    let tasks = config
        .tasks
        .iter()
        .map(|(name, entry)| create_task(entry.kind, name, &task_ctx))
        .collect::<Result<Vec<Box<dyn Task>>, FlowError>>()?;

    let services = Services {
        server: Box::new(LocalWorkServer::new(store.clone())),
        workers: Box::new(ThreadWorkers::new(
            config.workers.threads,
            Duration::from_millis(config.workers.poll_interval_ms),
            store.clone(),
            runner,
        )),
    };

    let mut mediator = Mediator::new(tasks, services, store, task_ctx.workdir, ctx)?;
    for (sender, target) in &config.pipeline.routes {
        mediator.add_route(sender, target)?;
    }
    info!(
        job = %config.name,
        workdir = %config.workdir.display(),
        workers = config.workers.threads,
        "Pipeline built"
    );
    Pipeline::new(mediator, config.pipeline.order.clone())
}
