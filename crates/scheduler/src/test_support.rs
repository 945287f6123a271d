//! Mocks shared by the unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use factorflow_core::{FlowError, Invocation, Output, Parameters, WorkDir};
use factorflow_state::StateStore;

use crate::exec::{ProgramOutput, ProgramRunner};
use crate::message::{Bus, Notification, RequestKey, Value};
use crate::task::TaskContext;

/// Runner returning a fixed exit code and stdout, counting calls.
pub(crate) struct ScriptedRunner {
    pub rc: i32,
    pub stdout: String,
    pub cpu: f64,
    pub real: f64,
    pub calls: AtomicUsize,
    pub seen: Mutex<Vec<Invocation>>,
}

impl ScriptedRunner {
    pub fn ok(stdout: &str) -> Self {
        Self {
            rc: 0,
            stdout: stdout.to_string(),
            cpu: 1.5,
            real: 2.0,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(rc: i32) -> Self {
        Self {
            rc,
            ..Self::ok("")
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

impl ProgramRunner for ScriptedRunner {
    fn run(&self, invocation: &Invocation) -> Result<ProgramOutput, FlowError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.seen.lock().unwrap().push(invocation.clone());
        Ok(ProgramOutput {
            rc: self.rc,
            stdout: Output::Text(self.stdout.clone()),
            stderr: Output::Text("boom".into()),
            real_time: self.real,
            cpu_time: self.cpu,
        })
    }
}

/// Bus answering from a fixed table and recording everything it sees.
#[derive(Default)]
pub(crate) struct MapBus {
    pub answers: HashMap<RequestKey, Value>,
    pub requests: Vec<(String, RequestKey)>,
    pub notices: Vec<(String, Notification)>,
    pub interrupted: bool,
}

impl MapBus {
    pub fn with(mut self, key: RequestKey, value: Value) -> Self {
        self.answers.insert(key, value);
        self
    }
}

impl Bus for MapBus {
    fn request(
        &mut self,
        sender: &str,
        key: RequestKey,
        _value: Option<Value>,
    ) -> Result<Option<Value>, FlowError> {
        self.requests.push((sender.to_string(), key));
        Ok(self.answers.get(&key).cloned())
    }

    fn notify(&mut self, sender: &str, notification: Notification) -> Result<(), FlowError> {
        self.notices.push((sender.to_string(), notification));
        Ok(())
    }

    fn interrupted(&self) -> bool {
        self.interrupted
    }
}

pub(crate) fn context(params: &str, root: &std::path::Path, runner: Arc<dyn ProgramRunner>) -> TaskContext {
    TaskContext {
        params: Arc::new(Parameters::from_toml(params).unwrap()),
        store: StateStore::in_memory(),
        workdir: WorkDir::new(root, "c60"),
        runner,
    }
}

/// Task with scripted behaviour and shared observation handles.
pub(crate) struct MockTask {
    core: crate::task::TaskCore,
    answers: Vec<(RequestKey, Value)>,
    client_server: bool,
    produces: bool,
    outcome: bool,
    rejects_results: bool,
    hook: Option<Box<dyn FnMut(&mut dyn Bus) -> Result<bool, FlowError> + Send>>,
    pub runs: Arc<AtomicUsize>,
    pub log: Arc<Mutex<Vec<String>>>,
    pub more_relations: Arc<Mutex<Vec<u64>>>,
    pub cancelled: Arc<AtomicUsize>,
    pub delivered: Arc<Mutex<Vec<String>>>,
}

impl MockTask {
    pub fn new(name: &str, ctx: &TaskContext, log: &Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            core: crate::task::TaskCore::new(name, name, ctx).unwrap(),
            answers: Vec::new(),
            client_server: false,
            produces: false,
            outcome: true,
            rejects_results: false,
            hook: None,
            runs: Arc::new(AtomicUsize::new(0)),
            log: Arc::clone(log),
            more_relations: Arc::new(Mutex::new(Vec::new())),
            cancelled: Arc::new(AtomicUsize::new(0)),
            delivered: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn answering(mut self, key: RequestKey, value: Value) -> Self {
        self.answers.push((key, value));
        self
    }

    pub fn client_server(mut self) -> Self {
        self.client_server = true;
        self
    }

    pub fn producing(mut self) -> Self {
        self.produces = true;
        self.client_server = true;
        self
    }

    pub fn failing(mut self) -> Self {
        self.outcome = false;
        self
    }

    /// Fail on every delivered WU result, like a task out of failure budget.
    pub fn rejecting_results(mut self) -> Self {
        self.rejects_results = true;
        self.client_server = true;
        self
    }

    pub fn on_run(
        mut self,
        hook: impl FnMut(&mut dyn Bus) -> Result<bool, FlowError> + Send + 'static,
    ) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }
}

impl crate::task::Task for MockTask {
    fn core(&self) -> &crate::task::TaskCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut crate::task::TaskCore {
        &mut self.core
    }

    fn run(&mut self, bus: &mut dyn Bus) -> Result<bool, FlowError> {
        self.runs.fetch_add(1, Ordering::Relaxed);
        self.log.lock().unwrap().push(self.core.name().to_string());
        match self.hook.as_mut() {
            Some(hook) => hook(bus),
            None => Ok(self.outcome),
        }
    }

    fn answers(&self) -> Vec<RequestKey> {
        self.answers.iter().map(|(k, _)| *k).collect()
    }

    fn answer(&mut self, key: RequestKey, _value: Option<&Value>) -> Result<Option<Value>, FlowError> {
        Ok(self
            .answers
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.clone()))
    }

    fn attach(&mut self, bus: &mut dyn Bus) -> Result<(), FlowError> {
        bus.notify(self.core.name(), Notification::WantToRun)?;
        if self.client_server {
            bus.notify(self.core.name(), Notification::SubscribeWuNotifications)?;
        }
        Ok(())
    }

    fn is_client_server(&self) -> bool {
        self.client_server
    }

    fn produces_relations(&self) -> bool {
        self.produces
    }

    fn request_more_relations(&mut self, target: u64, _bus: &mut dyn Bus) -> Result<(), FlowError> {
        self.more_relations.lock().unwrap().push(target);
        Ok(())
    }

    fn on_wu_result(
        &mut self,
        result: factorflow_core::CommandResult,
        _bus: &mut dyn Bus,
    ) -> Result<(), FlowError> {
        if self.rejects_results {
            return Err(FlowError::BudgetExceeded("too many failed work units".into()));
        }
        self.delivered.lock().unwrap().push(result.wuid);
        Ok(())
    }

    fn cancel_available_wus(&mut self) -> Result<usize, FlowError> {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
        Ok(0)
    }
}

/// Call counters of [`MockServer`] and [`MockWorkers`].
#[derive(Default)]
pub(crate) struct ServiceCalls {
    pub serve: AtomicUsize,
    pub stop_serving: AtomicUsize,
    pub shutdown: AtomicUsize,
    pub start_workers: AtomicUsize,
    pub stop_workers: AtomicUsize,
    pub registered: Mutex<Vec<String>>,
}

impl ServiceCalls {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::Relaxed)
    }
}

pub(crate) struct MockServer(pub Arc<ServiceCalls>);

impl crate::server::WorkServer for MockServer {
    fn serve(&mut self) -> Result<(), FlowError> {
        self.0.serve.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
    fn stop_serving_wus(&mut self) -> Result<(), FlowError> {
        self.0.stop_serving.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
    fn shutdown(&mut self) -> Result<(), FlowError> {
        self.0.shutdown.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
    fn register_filename(
        &mut self,
        files: &std::collections::BTreeMap<String, std::path::PathBuf>,
    ) -> Result<(), FlowError> {
        self.0.registered.lock().unwrap().extend(files.keys().cloned());
        Ok(())
    }
    fn unregister_filename(&mut self, name: &str) -> Result<(), FlowError> {
        self.0.registered.lock().unwrap().retain(|n| n != name);
        Ok(())
    }
}

pub(crate) struct MockWorkers(pub Arc<ServiceCalls>);

impl crate::workers::WorkerLauncher for MockWorkers {
    fn start_all(&mut self) -> Result<(), FlowError> {
        self.0.start_workers.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
    fn stop_all(&mut self) -> Result<(), FlowError> {
        self.0.stop_workers.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

pub(crate) fn mock_services() -> (crate::mediator::Services, Arc<ServiceCalls>) {
    let calls = Arc::new(ServiceCalls::default());
    let services = crate::mediator::Services {
        server: Box::new(MockServer(Arc::clone(&calls))),
        workers: Box::new(MockWorkers(Arc::clone(&calls))),
    };
    (services, calls)
}
