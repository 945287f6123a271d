//! Durable state for factorflow tasks and work units.
//!
//! A single [`StateStore`] is shared by every task. Each task sees only its
//! own partition through a [`StateDict`]; work units live in one global
//! table reached through [`WuTable`].

pub mod dict;
pub mod store;
pub mod wu;

pub use dict::StateDict;
pub use store::StateStore;
pub use wu::{WuRecord, WuStatus, WuTable};
