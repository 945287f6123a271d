pub mod command;
pub mod config;
pub mod error;
pub mod params;
pub mod stats;
pub mod workdir;
pub mod wuname;

pub use command::{CommandResult, Invocation, Output};
pub use config::{load_dotenv, FlowConfig, TaskKind};
pub use error::{FlowError, FlowResult};
pub use params::Parameters;
pub use stats::{Combine, StatRule, StatValue, Statistics, ValueType};
pub use workdir::{FileRef, WorkDir};
pub use wuname::{make_wuname, split_wuname, WuName};
