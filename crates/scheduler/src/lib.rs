//! Task-dependency and work-unit scheduling engine.
//!
//! A [`Pipeline`] runs [`Task`]s in a fixed order whenever they announce
//! readiness. Tasks talk only through the [`Mediator`]: requests pull data
//! from the task that answers a key, notifications push events. Tasks that
//! distribute work implement [`ClientServerTask`] and hand work units to a
//! pool of workers through the shared state store.

pub mod assembly;
pub mod client_server;
pub mod context;
pub mod exec;
pub mod mediator;
pub mod message;
pub mod metrics;
pub mod runner;
pub mod server;
pub mod task;
pub mod tasks;
pub mod types;
pub mod workers;

#[cfg(test)]
mod test_support;

pub use assembly::build_pipeline;
pub use client_server::{ClientServerCore, ClientServerTask, Eta};
pub use context::ProcessContext;
pub use exec::{LocalRunner, ProgramOutput, ProgramRunner};
pub use mediator::{Mediator, Services};
pub use message::{Bus, Notice, Notification, Request, RequestKey, Value, ValueKind};
pub use metrics::PipelineMetrics;
pub use runner::{Pipeline, PipelineOutcome, DRIVER_TABLE};
pub use server::{LocalWorkServer, WorkServer};
pub use tasks::{create_task, CommandTask, FilterTask, SievingTask};
pub use task::{ProgramSlot, ProgramSpec, RunOptions, Task, TaskContext, TaskCore};
pub use types::{ClientServerParams, TaskParams};
pub use workers::{ThreadWorkers, WorkerLauncher};
