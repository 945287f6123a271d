use thiserror::Error;

/// Errors raised by the factorflow scheduling engine.
///
/// Everything except [`FlowError::Interrupted`] is fatal for the pipeline:
/// the driver stops and reports the task that was active.
#[derive(Error, Debug)]
pub enum FlowError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("invalid work unit name: {0}")]
    WuName(String),

    #[error("no task answers request {0}")]
    UnansweredRequest(String),

    #[error("request {key} answered with {got}, expected {expected}")]
    AnswerType {
        key: String,
        expected: String,
        got: String,
    },

    #[error("no route for {notification} from task {sender}")]
    Unroutable { notification: String, sender: String },

    #[error("task {task} did not receive required input {key}")]
    MissingInput { task: String, key: String },

    #[error("unknown task: {0}")]
    UnknownTask(String),

    #[error("task {0} is currently running and cannot be re-entered")]
    TaskBusy(String),

    #[error("task {0} is already in the ready queue")]
    AlreadyQueued(String),

    #[error("job aborted because of a forcibly disabled task: {0}")]
    TaskDisabled(String),

    #[error("previously processed version {recorded} of {key} is newer than current {current}")]
    VersionRegressed {
        key: String,
        recorded: u64,
        current: u64,
    },

    #[error("{0}")]
    BudgetExceeded(String),

    #[error("work unit error: {0}")]
    WorkUnit(String),

    #[error("program {program} exited with code {code}")]
    CommandFailed { program: String, code: i32 },

    #[error("cannot launch program {program}: {reason}")]
    Launch { program: String, reason: String },

    #[error("statistics error: {0}")]
    Statistics(String),

    #[error("state store error: {0}")]
    Store(String),

    #[error("lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("interrupted by operator")]
    Interrupted,

    /// A failure inside a task other than the one that was running, such as
    /// the owner of a delivered WU result.
    #[error("in task {task}: {source}")]
    InTask {
        task: String,
        source: Box<FlowError>,
    },
}

impl FlowError {
    /// Whether this error is the operator interrupt rather than a failure.
    pub fn is_interrupt(&self) -> bool {
        match self {
            FlowError::Interrupted => true,
            FlowError::InTask { source, .. } => source.is_interrupt(),
            _ => false,
        }
    }

    /// Attribute this error to `task`. An error that already names its
    /// task keeps the innermost one.
    pub fn in_task(self, task: &str) -> Self {
        match self {
            FlowError::InTask { .. } => self,
            other => FlowError::InTask {
                task: task.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// The task an [`FlowError::InTask`] error is attributed to.
    pub fn failing_task(&self) -> Option<&str> {
        match self {
            FlowError::InTask { task, .. } => Some(task),
            _ => None,
        }
    }
}

pub type FlowResult<T> = Result<T, FlowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attribution_keeps_the_innermost_task() {
        let err = FlowError::BudgetExceeded("too many failed work units".into())
            .in_task("sieving")
            .in_task("filter");
        assert_eq!(err.failing_task(), Some("sieving"));
        assert_eq!(err.to_string(), "in task sieving: too many failed work units");
        assert!(!err.is_interrupt());
        assert!(FlowError::Interrupted.in_task("sieving").is_interrupt());
    }
}
