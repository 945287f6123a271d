use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use factorflow_core::FlowError;

use crate::store::StateStore;

/// One task's partition of the [`StateStore`].
///
/// Every mutating call takes a `commit` flag; pass `false` to group several
/// writes into the transaction closed by the next committing write.
#[derive(Debug, Clone)]
pub struct StateDict {
    store: StateStore,
    table: String,
}

impl StateDict {
    pub(crate) fn new(store: StateStore, table: &str) -> Self {
        Self {
            store,
            table: table.to_string(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, FlowError> {
        let inner = self.store.lock()?;
        match inner.snapshot.tables.get(&self.table).and_then(|t| t.get(key)) {
            Some(v) => Ok(Some(serde_json::from_value(v.clone())?)),
            None => Ok(None),
        }
    }

    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T, FlowError> {
        Ok(self.get(key)?.unwrap_or(default))
    }

    pub fn contains(&self, key: &str) -> Result<bool, FlowError> {
        let inner = self.store.lock()?;
        Ok(inner
            .snapshot
            .tables
            .get(&self.table)
            .is_some_and(|t| t.contains_key(key)))
    }

    pub fn set<T: Serialize>(&self, key: &str, value: T, commit: bool) -> Result<(), FlowError> {
        let value = serde_json::to_value(value)?;
        self.update([(key.to_string(), value)], commit)
    }

    /// Set several keys in one step.
    pub fn update(
        &self,
        entries: impl IntoIterator<Item = (String, Value)>,
        commit: bool,
    ) -> Result<(), FlowError> {
        let table = self.table.clone();
        self.store.write(commit, move |inner| {
            let t = inner.snapshot.tables.entry(table).or_default();
            t.extend(entries);
            Ok(())
        })
    }

    /// Add `by` to an integer counter, returning the new value.
    pub fn incr(&self, key: &str, by: u64, commit: bool) -> Result<u64, FlowError> {
        let table = self.table.clone();
        let key = key.to_string();
        self.store.write(commit, move |inner| {
            let t = inner.snapshot.tables.entry(table).or_default();
            let current = t.get(&key).and_then(Value::as_u64).unwrap_or(0);
            let next = current + by;
            t.insert(key, Value::from(next));
            Ok(next)
        })
    }

    pub fn delete(&self, key: &str, commit: bool) -> Result<(), FlowError> {
        self.delete_many([key], commit)
    }

    /// Remove several keys in one step. Missing keys are ignored.
    pub fn delete_many<'a>(
        &self,
        keys: impl IntoIterator<Item = &'a str>,
        commit: bool,
    ) -> Result<(), FlowError> {
        let table = self.table.clone();
        let keys: Vec<String> = keys.into_iter().map(str::to_string).collect();
        self.store.write(commit, move |inner| {
            if let Some(t) = inner.snapshot.tables.get_mut(&table) {
                for k in &keys {
                    t.remove(k);
                }
            }
            Ok(())
        })
    }

    pub fn clear(&self, commit: bool) -> Result<(), FlowError> {
        let table = self.table.clone();
        self.store.write(commit, move |inner| {
            inner.snapshot.tables.remove(&table);
            Ok(())
        })
    }

    pub fn keys(&self) -> Result<Vec<String>, FlowError> {
        let inner = self.store.lock()?;
        Ok(inner
            .snapshot
            .tables
            .get(&self.table)
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default())
    }

    /// Copy of the whole partition.
    pub fn snapshot(&self) -> Result<BTreeMap<String, Value>, FlowError> {
        let inner = self.store.lock()?;
        Ok(inner.snapshot.tables.get(&self.table).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partitions_are_disjoint() {
        let store = StateStore::in_memory();
        let a = store.dict("a");
        let b = store.dict("b");
        a.set("k", 1u64, false).unwrap();
        assert_eq!(b.get::<u64>("k").unwrap(), None);
        assert!(a.contains("k").unwrap());
    }

    #[test]
    fn update_delete_and_clear() {
        let store = StateStore::in_memory();
        let d = store.dict("t");
        d.update(
            [
                ("x".to_string(), Value::from(1)),
                ("y".to_string(), Value::from("two")),
                ("z".to_string(), Value::from(3.5)),
            ],
            false,
        )
        .unwrap();
        assert_eq!(d.keys().unwrap(), vec!["x", "y", "z"]);

        d.delete_many(["x", "missing"], false).unwrap();
        assert_eq!(d.get::<String>("y").unwrap().as_deref(), Some("two"));
        assert!(!d.contains("x").unwrap());

        d.clear(false).unwrap();
        assert!(d.keys().unwrap().is_empty());
    }

    #[test]
    fn incr_counts_from_zero() {
        let store = StateStore::in_memory();
        let d = store.dict("cs");
        assert_eq!(d.incr("wu_submitted", 1, false).unwrap(), 1);
        assert_eq!(d.incr("wu_submitted", 2, false).unwrap(), 3);
        assert_eq!(d.get_or("wu_submitted", 0u64).unwrap(), 3);
        assert_eq!(d.get_or("wu_received", 0u64).unwrap(), 0);
    }
}
