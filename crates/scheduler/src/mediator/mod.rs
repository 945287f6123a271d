//! The message hub every task talks through.
//!
//! The mediator owns the tasks. While a task runs it is taken out of its
//! slot, so requests and notifications it sends can reach every other task
//! without aliasing. A task cannot receive messages while it is running.


use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use tracing::{debug, error, info};

use factorflow_core::{FlowError, WorkDir, WuName};
use factorflow_state::StateStore;

use crate::context::ProcessContext;
use crate::message::{Bus, Notice, Notification, Request, RequestKey, Value};
use crate::server::WorkServer;
use crate::task::Task;
use crate::workers::WorkerLauncher;

/// External collaborators the mediator drives.
pub struct Services {
    pub server: Box<dyn WorkServer>,
    pub workers: Box<dyn WorkerLauncher>,
}

struct Slot {
    name: String,
    /// `None` while the task is running.
    task: Option<Box<dyn Task>>,
    client_server: bool,
    produces_relations: bool,
}

pub struct Mediator {
    slots: Vec<Slot>,
    index: HashMap<String, usize>,
    /// Request key -> slot of the answering task, fixed at construction.
    answerers: BTreeMap<RequestKey, usize>,
    /// want-more-relations routing: sender -> upstream producer.
    routes: BTreeMap<String, String>,
    ready: VecDeque<String>,
    subscribers: BTreeSet<String>,
    services: Services,
    store: StateStore,
    workdir: WorkDir,
    ctx: Arc<ProcessContext>,
    torn_down: bool,
}

impl Mediator {
    /// Take ownership of the tasks and build the request table.
    pub fn new(
        tasks: Vec<Box<dyn Task>>,
        services: Services,
        store: StateStore,
        workdir: WorkDir,
        ctx: Arc<ProcessContext>,
    ) -> Result<Self, FlowError> {
        let mut slots = Vec::with_capacity(tasks.len());
        let mut index = HashMap::new();
        let mut answerers = BTreeMap::new();

        for task in tasks {
            let name = task.name().to_string();
            let pos = slots.len();
            if index.insert(name.clone(), pos).is_some() {
                return Err(FlowError::Config(format!("duplicate task name {name}")));
            }
            for key in task.answers() {
                if key.is_builtin() {
                    return Err(FlowError::Config(format!(
                        "task {name} cannot answer built-in request {key}"
                    )));
                }
                match answerers.get(&key) {
                    Some(&other) if other != pos => {
                        let other: &Slot = &slots[other];
                        return Err(FlowError::Config(format!(
                            "request {key} is answered by both {} and {name}",
                            other.name
                        )));
                    }
                    _ => {
                        answerers.insert(key, pos);
                    }
                }
            }
            slots.push(Slot {
                name,
                client_server: task.is_client_server(),
                produces_relations: task.produces_relations(),
                task: Some(task),
            });
        }
        debug!(tasks = slots.len(), requests = answerers.len(), "Mediator built");

        Ok(Self {
            slots,
            index,
            answerers,
            routes: BTreeMap::new(),
            ready: VecDeque::new(),
            subscribers: BTreeSet::new(),
            services,
            store,
            workdir,
            ctx,
            torn_down: false,
        })
    }

    /// Route want-more-relations notifications from `sender` to `target`.
    pub fn add_route(&mut self, sender: &str, target: &str) -> Result<(), FlowError> {
        for name in [sender, target] {
            if !self.index.contains_key(name) {
                return Err(FlowError::UnknownTask(name.to_string()));
            }
        }
        self.routes.insert(sender.to_string(), target.to_string());
        Ok(())
    }

    /// Let every task announce itself, in declaration order.
    pub fn attach_all(&mut self) -> Result<(), FlowError> {
        let names: Vec<String> = self.slots.iter().map(|s| s.name.clone()).collect();
        for name in names {
            self.with_task(&name, |task, bus| task.attach(bus))?;
        }
        Ok(())
    }

    pub fn task_names(&self) -> Vec<String> {
        self.slots.iter().map(|s| s.name.clone()).collect()
    }

    pub fn has_task(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Tasks currently in their slot (all of them, between runs).
    pub fn tasks(&self) -> impl Iterator<Item = &dyn Task> {
        self.slots.iter().filter_map(|s| s.task.as_deref())
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn context(&self) -> &Arc<ProcessContext> {
        &self.ctx
    }

    /// Take a task out of its slot, run `f` with the mediator as bus, put it back.
    pub fn with_task<R>(
        &mut self,
        name: &str,
        f: impl FnOnce(&mut dyn Task, &mut Self) -> Result<R, FlowError>,
    ) -> Result<R, FlowError> {
        let pos = *self
            .index
            .get(name)
            .ok_or_else(|| FlowError::UnknownTask(name.to_string()))?;
        let mut task = self.slots[pos]
            .task
            .take()
            .ok_or_else(|| FlowError::TaskBusy(name.to_string()))?;
        let out = f(task.as_mut(), self);
        self.slots[pos].task = Some(task);
        out
    }

    fn is_idle(&self, name: &str) -> bool {
        self.index
            .get(name)
            .is_some_and(|&pos| self.slots[pos].task.is_some())
    }

    // ── Requests ─────────────────────────────────────────────────────

    /// Forward a request to the task answering its key.
    pub fn answer_request(&mut self, request: Request) -> Result<Option<Value>, FlowError> {
        let Request { sender, key, value } = request;
        let answer = match key {
            RequestKey::GetWuResult => self.poll_wu_result(&sender)?,
            RequestKey::GetWorkdirJobname => Some(Value::Text(self.workdir.jobname().to_string())),
            RequestKey::GetWorkdirPath => {
                Some(Value::Text(self.workdir.root().display().to_string()))
            }
            _ => {
                let pos = *self
                    .answerers
                    .get(&key)
                    .ok_or_else(|| FlowError::UnansweredRequest(key.to_string()))?;
                let name = self.slots[pos].name.clone();
                self.with_task(&name, |task, _| task.answer(key, value.as_ref()))?
            }
        };

        if let Some(v) = &answer {
            if v.kind() != key.expects() {
                return Err(FlowError::AnswerType {
                    key: key.to_string(),
                    expected: key.expects().to_string(),
                    got: v.kind().to_string(),
                });
            }
        }
        debug!(sender = %sender, key = %key, answered = answer.is_some(), "Request");
        Ok(answer)
    }

    /// Take one received WU result. The caller gets it if it owns the WU;
    /// otherwise it is delivered to the subscribed owner and the caller gets
    /// [`Value::Delivered`]. Results nobody owns are marked failed.
    pub fn poll_wu_result(&mut self, sender: &str) -> Result<Option<Value>, FlowError> {
        let wus = self.store.workunits();
        let Some(record) = wus.next_received()? else {
            return Ok(None);
        };

        let owner = WuName::parse(&record.wuid)
            .ok()
            .filter(|n| n.job == self.workdir.jobname())
            .map(|n| n.task);
        let (Some(owner), Some(result)) = (owner, record.result) else {
            error!(wuid = %record.wuid, "Received result of a work unit without owner, marking it as failed");
            wus.verify(&record.wuid, false, true)?;
            return Ok(Some(Value::Delivered));
        };

        if owner == sender {
            return Ok(Some(Value::Result(Box::new(result))));
        }
        if self.subscribers.contains(&owner) && self.is_idle(&owner) {
            debug!(wuid = %result.wuid, owner = %owner, "Delivering work unit result");
            self.with_task(&owner, |task, bus| task.on_wu_result(result, bus))
                .map_err(|e| e.in_task(&owner))?;
            return Ok(Some(Value::Delivered));
        }

        error!(
            wuid = %record.wuid,
            owner = %owner,
            "Received result of a work unit for an unsubscribed task, marking it as failed"
        );
        wus.verify(&record.wuid, false, true)?;
        Ok(Some(Value::Delivered))
    }

    // ── Notifications ────────────────────────────────────────────────

    pub fn relay_notification(&mut self, notice: Notice) -> Result<(), FlowError> {
        let Notice {
            sender,
            notification,
        } = notice;
        debug!(sender = %sender, notification = notification.key(), "Notification");

        match notification {
            Notification::WantMoreRelations(target) => {
                let upstream = self.routes.get(&sender).cloned().ok_or_else(|| {
                    FlowError::Unroutable {
                        notification: "want_more_relations".into(),
                        sender: sender.clone(),
                    }
                })?;
                info!(sender = %sender, upstream = %upstream, target, "More relations requested");
                self.with_task(&upstream, |task, bus| task.request_more_relations(target, bus))
            }
            Notification::HaveEnoughRelations => {
                info!(sender = %sender, "Enough relations, stopping work unit distribution");
                self.services.server.stop_serving_wus()?;
                let producers: Vec<String> = self
                    .slots
                    .iter()
                    .filter(|s| s.produces_relations && s.task.is_some())
                    .map(|s| s.name.clone())
                    .collect();
                for name in producers {
                    self.with_task(&name, |task, _| task.cancel_available_wus())?;
                }
                Ok(())
            }
            Notification::RegisterFilename(files) => {
                let allowed = self
                    .index
                    .get(&sender)
                    .is_some_and(|&pos| self.slots[pos].client_server);
                if !allowed {
                    return Err(FlowError::Unroutable {
                        notification: "register_filename".into(),
                        sender,
                    });
                }
                self.services.server.register_filename(&files)
            }
            Notification::UnregisterFilename(name) => {
                self.services.server.unregister_filename(&name)
            }
            Notification::WantToRun => {
                if !self.index.contains_key(&sender) {
                    return Err(FlowError::UnknownTask(sender));
                }
                if self.ready.contains(&sender) {
                    return Err(FlowError::AlreadyQueued(sender));
                }
                self.ready.push_back(sender);
                Ok(())
            }
            Notification::SubscribeWuNotifications => {
                self.subscribers.insert(sender);
                Ok(())
            }
        }
    }

    // ── Ready queue ──────────────────────────────────────────────────

    /// Remove and return the first task of `order` that is ready.
    pub fn take_ready(&mut self, order: &[String]) -> Option<String> {
        let name = order.iter().find(|n| self.ready.contains(n))?.clone();
        self.ready.retain(|n| *n != name);
        Some(name)
    }

    pub fn ready_tasks(&self) -> Vec<String> {
        self.ready.iter().cloned().collect()
    }

    // ── Services ─────────────────────────────────────────────────────

    pub fn start_services(&mut self) -> Result<(), FlowError> {
        self.services.server.serve()?;
        self.services.workers.start_all()
    }

    /// Stop the workers and shut the server down. Only the first call does anything.
    pub fn teardown(&mut self) -> Result<(), FlowError> {
        if self.torn_down {
            return Ok(());
        }
        self.torn_down = true;
        let workers = self.services.workers.stop_all();
        let server = self.services.server.shutdown();
        if let Err(e) = &workers {
            error!(error = %e, "Stopping workers failed");
        }
        if let Err(e) = &server {
            error!(error = %e, "Server shutdown failed");
        }
        workers.and(server)
    }
}

impl Bus for Mediator {
    fn request(
        &mut self,
        sender: &str,
        key: RequestKey,
        value: Option<Value>,
    ) -> Result<Option<Value>, FlowError> {
        self.answer_request(Request {
            sender: sender.to_string(),
            key,
            value,
        })
    }

    fn notify(&mut self, sender: &str, notification: Notification) -> Result<(), FlowError> {
        self.relay_notification(Notice {
            sender: sender.to_string(),
            notification,
        })
    }

    fn interrupted(&self) -> bool {
        self.ctx.is_interrupted()
    }
}
