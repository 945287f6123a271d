use std::path::{Path, PathBuf};

use crate::error::FlowError;

use super::types::FlowConfig;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.is_empty())
}

impl FlowConfig {
    /// Parse config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, FlowError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.fill_default_order();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, FlowError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Resolved state snapshot path.
    pub fn database_path(&self) -> PathBuf {
        match &self.database {
            Some(p) if p.is_absolute() => p.clone(),
            Some(p) => self.workdir.join(p),
            None => self.workdir.join(format!("{}.state.json", self.name)),
        }
    }

    /// The run order, as task name slices.
    pub fn order(&self) -> Vec<&str> {
        self.pipeline.order.iter().map(String::as_str).collect()
    }

    fn fill_default_order(&mut self) {
        if self.pipeline.order.is_empty() {
            self.pipeline.order = self.tasks.keys().cloned().collect();
        }
    }

    // ── Environment variable overrides ──────────────────────────────

    /// Apply environment variable overrides.
    ///
    /// - `FACTORFLOW_NAME` -> `name`
    /// - `FACTORFLOW_WORKDIR` -> `workdir`
    /// - `FACTORFLOW_DATABASE` -> `database`
    /// - `FACTORFLOW_WORKER_THREADS` -> `workers.threads`
    pub(crate) fn apply_env_overrides(&mut self) {
        if let Some(v) = env_opt("FACTORFLOW_NAME") {
            self.name = v;
        }
        if let Some(v) = env_opt("FACTORFLOW_WORKDIR") {
            self.workdir = PathBuf::from(v);
        }
        if let Some(v) = env_opt("FACTORFLOW_DATABASE") {
            self.database = Some(PathBuf::from(v));
        }
        if let Some(v) = env_opt("FACTORFLOW_WORKER_THREADS") {
            if let Ok(n) = v.parse::<usize>() {
                self.workers.threads = n;
            }
        }
    }
}
