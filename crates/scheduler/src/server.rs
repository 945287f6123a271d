use std::collections::BTreeMap;
use std::path::PathBuf;

use tracing::{info, warn};

use factorflow_core::FlowError;
use factorflow_state::{StateDict, StateStore};

/// The server workers fetch WUs and files from.
pub trait WorkServer: Send {
    /// Start handing out WUs.
    fn serve(&mut self) -> Result<(), FlowError>;

    /// Stop handing out WUs. Results of already assigned WUs are still accepted.
    fn stop_serving_wus(&mut self) -> Result<(), FlowError>;

    fn shutdown(&mut self) -> Result<(), FlowError>;

    /// Make files downloadable under the given names.
    fn register_filename(&mut self, files: &BTreeMap<String, PathBuf>) -> Result<(), FlowError>;

    fn unregister_filename(&mut self, name: &str) -> Result<(), FlowError>;
}

/// Table holding the file registry.
pub const FILES_TABLE: &str = "_server_files";

/// In-process server: WUs are served straight from the state store and the
/// file registry is persisted next to the task state.
#[derive(Debug)]
pub struct LocalWorkServer {
    store: StateStore,
    registered: StateDict,
}

impl LocalWorkServer {
    pub fn new(store: StateStore) -> Self {
        let registered = store.dict(FILES_TABLE);
        Self { store, registered }
    }

    /// Path registered under `name`, if any.
    pub fn lookup(&self, name: &str) -> Result<Option<PathBuf>, FlowError> {
        self.registered.get(name)
    }
}

impl WorkServer for LocalWorkServer {
    fn serve(&mut self) -> Result<(), FlowError> {
        self.store.set_serving(true)?;
        info!("Serving work units");
        Ok(())
    }

    fn stop_serving_wus(&mut self) -> Result<(), FlowError> {
        if self.store.is_serving()? {
            info!("No longer serving work units");
        }
        self.store.set_serving(false)
    }

    fn shutdown(&mut self) -> Result<(), FlowError> {
        self.store.set_serving(false)?;
        self.store.commit()?;
        info!("Work server shut down");
        Ok(())
    }

    fn register_filename(&mut self, files: &BTreeMap<String, PathBuf>) -> Result<(), FlowError> {
        let mut updates = Vec::new();
        for (name, path) in files {
            match self.registered.get::<PathBuf>(name)? {
                Some(old) if old == *path => continue,
                Some(old) => warn!(
                    name = %name,
                    old = %old.display(),
                    new = %path.display(),
                    "Filename registration overrides a different target"
                ),
                None => {}
            }
            updates.push((name.clone(), serde_json::to_value(path)?));
        }
        if !updates.is_empty() {
            self.registered.update(updates, true)?;
        }
        Ok(())
    }

    fn unregister_filename(&mut self, name: &str) -> Result<(), FlowError> {
        self.registered.delete(name, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serving_flag_follows_calls() {
        let store = StateStore::in_memory();
        let mut server = LocalWorkServer::new(store.clone());
        server.serve().unwrap();
        assert!(store.is_serving().unwrap());
        server.stop_serving_wus().unwrap();
        assert!(!store.is_serving().unwrap());
    }

    #[test]
    fn register_and_unregister() {
        let store = StateStore::in_memory();
        let mut server = LocalWorkServer::new(store);
        let mut files = BTreeMap::new();
        files.insert("c60.poly".to_string(), PathBuf::from("/w/c60.poly"));
        server.register_filename(&files).unwrap();
        assert_eq!(server.lookup("c60.poly").unwrap(), Some(PathBuf::from("/w/c60.poly")));

        files.insert("c60.poly".to_string(), PathBuf::from("/other/c60.poly"));
        server.register_filename(&files).unwrap();
        assert_eq!(
            server.lookup("c60.poly").unwrap(),
            Some(PathBuf::from("/other/c60.poly"))
        );

        server.unregister_filename("c60.poly").unwrap();
        assert_eq!(server.lookup("c60.poly").unwrap(), None);
    }
}
