use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use factorflow_core::FlowError;
use factorflow_state::{StateDict, StateStore, WuTable};

use crate::exec::ProgramRunner;

/// Starts and stops the processes or threads that compute WUs.
pub trait WorkerLauncher: Send {
    fn start_all(&mut self) -> Result<(), FlowError>;

    /// Stop every worker. Calling it again is a no-op.
    fn stop_all(&mut self) -> Result<(), FlowError>;
}

/// Table recording the clients started by this process.
pub const CLIENTS_TABLE: &str = "_clients";

/// Worker threads that claim WUs from the state store and run them locally.
pub struct ThreadWorkers {
    threads: usize,
    poll: Duration,
    store: StateStore,
    runner: Arc<dyn ProgramRunner>,
    stop: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
    clients: StateDict,
}

impl ThreadWorkers {
    pub fn new(
        threads: usize,
        poll: Duration,
        store: StateStore,
        runner: Arc<dyn ProgramRunner>,
    ) -> Self {
        let clients = store.dict(CLIENTS_TABLE);
        Self {
            threads,
            poll,
            store,
            runner,
            stop: Arc::new(AtomicBool::new(false)),
            handles: Vec::new(),
            clients,
        }
    }

    pub fn running(&self) -> usize {
        self.handles.len()
    }
}

impl WorkerLauncher for ThreadWorkers {
    fn start_all(&mut self) -> Result<(), FlowError> {
        let leftover = self.clients.keys()?;
        if !leftover.is_empty() {
            warn!(
                clients = ?leftover,
                "Client records from a previous run found, they were not shut down cleanly"
            );
            self.clients.clear(false)?;
        }

        self.stop.store(false, Ordering::SeqCst);
        for i in 0..self.threads {
            let client = format!("localhost.{i}");
            self.clients.set(&client, Utc::now(), false)?;

            let wus = self.store.workunits();
            let runner = Arc::clone(&self.runner);
            let stop = Arc::clone(&self.stop);
            let poll = self.poll;
            let name = client.clone();
            let handle = thread::Builder::new()
                .name(client.clone())
                .spawn(move || worker_loop(&name, &wus, runner.as_ref(), &stop, poll))?;
            self.handles.push(handle);
        }
        self.store.commit()?;
        info!(threads = self.threads, "Started local workers");
        Ok(())
    }

    fn stop_all(&mut self) -> Result<(), FlowError> {
        self.stop.store(true, Ordering::SeqCst);
        let count = self.handles.len();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                error!("A worker thread panicked");
            }
        }
        if count > 0 {
            info!(threads = count, "Stopped local workers");
        }
        self.clients.clear(true)
    }
}

impl Drop for ThreadWorkers {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

fn worker_loop(
    client: &str,
    wus: &WuTable,
    runner: &dyn ProgramRunner,
    stop: &AtomicBool,
    poll: Duration,
) {
    while !stop.load(Ordering::SeqCst) {
        let record = match wus.claim(client) {
            Ok(Some(record)) => record,
            Ok(None) => {
                thread::sleep(poll);
                continue;
            }
            Err(e) => {
                error!(client, error = %e, "Worker cannot claim work units, stopping");
                return;
            }
        };
        debug!(client, wuid = %record.wuid, "Claimed work unit");

        match runner.run(&record.invocation) {
            Ok(out) => {
                let result = out.into_result(&record.wuid, &record.invocation, client);
                if let Err(e) = wus.record_result(result) {
                    error!(client, wuid = %record.wuid, error = %e, "Cannot record result, stopping");
                    return;
                }
            }
            Err(e) => {
                warn!(
                    client,
                    wuid = %record.wuid,
                    error = %e,
                    "Work unit could not be run, flagging it for resubmission"
                );
                if let Err(e) = wus.need_resubmit(&record.wuid) {
                    error!(client, wuid = %record.wuid, error = %e, "Cannot flag work unit");
                    return;
                }
            }
        }
    }
}
