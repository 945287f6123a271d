//! Pipeline configuration.
//!
//! Split into focused submodules:
//! - `types`: the `FlowConfig` tree and its serde defaults
//! - `loading`: TOML parsing, `.env` loading and environment overrides
//! - `validation`: cross-reference checks on task order and routes

mod loading;
mod types;
mod validation;

pub use loading::load_dotenv;
pub use types::{FlowConfig, PipelineSection, TaskEntry, TaskKind, WorkerSection};
