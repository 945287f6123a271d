//! Hierarchical task parameters.
//!
//! Parameters come from the same TOML tree as the pipeline config. A scalar
//! defined at `tasks` is visible to `tasks.sieving` and to
//! `tasks.sieving.las`, and a deeper definition overrides a shallower one.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use toml::{Table, Value};

use crate::error::FlowError;

#[derive(Debug, Clone, Default)]
pub struct Parameters {
    root: Table,
}

impl Parameters {
    pub fn new(root: Table) -> Self {
        Self { root }
    }

    pub fn from_toml(toml_str: &str) -> Result<Self, FlowError> {
        Ok(Self::new(toml_str.parse::<Table>()?))
    }

    /// All scalar (non-table) values visible at `path`.
    pub fn scope(&self, path: &[&str]) -> Table {
        let mut out = Table::new();
        collect_scalars(&self.root, &mut out);
        let mut node = &self.root;
        for segment in path {
            match node.get(*segment).and_then(Value::as_table) {
                Some(child) => {
                    collect_scalars(child, &mut out);
                    node = child;
                }
                None => break,
            }
        }
        out
    }

    /// Deserialize the parameters visible at `path` into a typed struct.
    ///
    /// Missing fields fall back to the struct's serde defaults.
    pub fn myparams<T: DeserializeOwned>(&self, path: &[&str]) -> Result<T, FlowError> {
        Ok(Value::Table(self.scope(path)).try_into()?)
    }

    /// String form of the accepted keys visible at `path`, for program command lines.
    pub fn program_params(&self, path: &[&str], accepted: &[String]) -> BTreeMap<String, String> {
        self.scope(path)
            .into_iter()
            .filter(|(k, _)| accepted.iter().any(|a| a == k))
            .map(|(k, v)| (k, value_to_string(&v)))
            .collect()
    }

    /// Look up one scalar visible at `path`.
    pub fn get(&self, path: &[&str], key: &str) -> Option<Value> {
        self.scope(path).remove(key)
    }
}

fn collect_scalars(table: &Table, out: &mut Table) {
    for (k, v) in table {
        if !v.is_table() {
            out.insert(k.clone(), v.clone());
        }
    }
}

/// Render a TOML scalar the way it appears on a program command line.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Integer(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Datetime(d) => d.to_string(),
        Value::Array(items) => items
            .iter()
            .map(value_to_string)
            .collect::<Vec<_>>()
            .join(","),
        Value::Table(_) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    const TREE: &str = r#"
name = "c60"
maxwu = 4

[tasks]
wutimeout = 100

[tasks.sieving]
wutimeout = 50
I = 11

[tasks.sieving.las]
I = 12
threads = 2
"#;

    #[derive(Debug, Deserialize)]
    struct Limits {
        #[serde(default)]
        maxwu: u64,
        wutimeout: u64,
        #[serde(default = "default_run")]
        run: bool,
    }

    fn default_run() -> bool {
        true
    }

    #[test]
    fn deeper_levels_override_shallower() {
        let p = Parameters::from_toml(TREE).unwrap();
        let scope = p.scope(&["tasks", "sieving", "las"]);
        assert_eq!(scope["I"].as_integer(), Some(12));
        assert_eq!(scope["wutimeout"].as_integer(), Some(50));
        assert_eq!(scope["name"].as_str(), Some("c60"));
    }

    #[test]
    fn myparams_applies_defaults() {
        let p = Parameters::from_toml(TREE).unwrap();
        let limits: Limits = p.myparams(&["tasks", "sieving"]).unwrap();
        assert_eq!(limits.maxwu, 4);
        assert_eq!(limits.wutimeout, 50);
        assert!(limits.run);
    }

    #[test]
    fn missing_path_segments_stop_descent() {
        let p = Parameters::from_toml(TREE).unwrap();
        let scope = p.scope(&["tasks", "filter"]);
        assert_eq!(scope["wutimeout"].as_integer(), Some(100));
        assert!(scope.get("I").is_none());
    }

    #[test]
    fn program_params_filters_accepted_keys() {
        let p = Parameters::from_toml(TREE).unwrap();
        let accepted = vec!["I".to_string(), "threads".to_string()];
        let args = p.program_params(&["tasks", "sieving", "las"], &accepted);
        assert_eq!(args.len(), 2);
        assert_eq!(args["I"], "12");
        assert_eq!(args["threads"], "2");
    }
}
