//! Pipeline driver -- runs ready tasks in a fixed order.
//!
//! Split into focused submodules:
//! - `core`: Pipeline struct, constructor, accessors and teardown on drop
//! - `execution`: the main loop and the handling of one task run
//! - `bookkeeping`: start time, accumulated elapsed time and end-of-run summary

mod bookkeeping;
mod core;
mod execution;
#[cfg(test)]
mod tests;

pub use self::core::{Pipeline, PipelineOutcome, DRIVER_TABLE};
