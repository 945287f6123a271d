use crate::error::FlowError;
use crate::wuname::PASTE;

use super::types::FlowConfig;

impl FlowConfig {
    /// Validate the config: task names, run order and notification routes.
    pub fn validate(&self) -> Result<(), FlowError> {
        self.validate_name()?;
        self.validate_task_names()?;
        self.validate_order()?;
        self.validate_routes()?;
        Ok(())
    }

    fn validate_name(&self) -> Result<(), FlowError> {
        if self.name.is_empty() {
            return Err(FlowError::Config("job name must not be empty".into()));
        }
        Ok(())
    }

    /// Task names end up inside WU ids and must not contain the separator.
    fn validate_task_names(&self) -> Result<(), FlowError> {
        for name in self.tasks.keys() {
            if name.is_empty() || name.contains(PASTE) {
                return Err(FlowError::Config(format!(
                    "task name '{name}' must be non-empty and must not contain '{PASTE}'"
                )));
            }
        }
        Ok(())
    }

    /// Every ordered name is a declared task, appears once, and every task is ordered.
    fn validate_order(&self) -> Result<(), FlowError> {
        for (i, name) in self.pipeline.order.iter().enumerate() {
            if !self.tasks.contains_key(name) {
                return Err(FlowError::Config(format!(
                    "pipeline order references unknown task '{name}'"
                )));
            }
            if self.pipeline.order[..i].contains(name) {
                return Err(FlowError::Config(format!(
                    "task '{name}' appears twice in pipeline order"
                )));
            }
        }
        for name in self.tasks.keys() {
            if !self.pipeline.order.contains(name) {
                return Err(FlowError::Config(format!(
                    "task '{name}' is missing from pipeline order"
                )));
            }
        }
        Ok(())
    }

    /// Routes point from a task to a different task that runs before it.
    fn validate_routes(&self) -> Result<(), FlowError> {
        let position = |name: &str| self.pipeline.order.iter().position(|n| n == name);
        for (sender, target) in &self.pipeline.routes {
            let (Some(s), Some(t)) = (position(sender), position(target)) else {
                return Err(FlowError::Config(format!(
                    "route '{sender}' -> '{target}' references an unknown task"
                )));
            };
            if t >= s {
                return Err(FlowError::Config(format!(
                    "route '{sender}' -> '{target}' must point to an upstream task"
                )));
            }
        }
        Ok(())
    }
}
