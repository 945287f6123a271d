//! Tasks whose work is done by workers through work units.
//!
//! A [`ClientServerTask`] submits WUs into the shared WU table, polls for
//! results with [`ClientServerTask::wait`], and resubmits WUs that timed out
//! or failed, within the budgets of [`ClientServerParams`]. The counters
//! `wu_submitted`, `wu_received`, `wu_timedout` and `wu_failed` live in the
//! task's state.


use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use factorflow_core::{make_wuname, CommandResult, FileRef, FlowError, Invocation, WuName};
use factorflow_state::{WuRecord, WuStatus, WuTable};

use crate::message::{Bus, Notification, RequestKey, Value};
use crate::task::{Task, TaskCore};
use crate::types::ClientServerParams;

const WU_SUBMITTED: &str = "wu_submitted";
const WU_RECEIVED: &str = "wu_received";
const WU_TIMEDOUT: &str = "wu_timedout";
const WU_FAILED: &str = "wu_failed";
const START_REAL_TIME: &str = "start_real_time";
const START_ACHIEVEMENT: &str = "start_achievement";

/// Work unit bookkeeping owned by every client-server task.
#[derive(Debug)]
pub struct ClientServerCore {
    params: ClientServerParams,
    wus: WuTable,
    wucmd_file: FileRef,
    /// Not persisted: after a restart clients get a full interval to upload.
    last_timeout_check: Option<Instant>,
}

impl ClientServerCore {
    /// Read the WU limits and reset the per-run ETA reference.
    pub fn new(core: &TaskCore) -> Result<Self, FlowError> {
        let params: ClientServerParams = core.myparams()?;
        core.state().update(
            [
                (START_REAL_TIME.to_string(), serde_json::Value::from(0.0)),
                (START_ACHIEVEMENT.to_string(), serde_json::Value::from(-1.0)),
            ],
            true,
        )?;
        Ok(Self {
            params,
            wus: core.state().store().workunits(),
            wucmd_file: core.workdir().make_filename("wucmd"),
            last_timeout_check: None,
        })
    }

    pub fn params(&self) -> &ClientServerParams {
        &self.params
    }

    pub fn wus(&self) -> &WuTable {
        &self.wus
    }

    /// Log of every submitted WU command line.
    pub fn wucmd_file(&self) -> &FileRef {
        &self.wucmd_file
    }
}

/// Estimated completion time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Eta {
    Unknown,
    At(DateTime<Utc>),
}

impl fmt::Display for Eta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Eta::Unknown => f.write_str("Unknown"),
            Eta::At(t) => write!(f, "{}", t.format("%a %b %e %H:%M:%S %Y")),
        }
    }
}

fn now_secs() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1e6
}

/// A task that hands its work to workers as WUs.
pub trait ClientServerTask: Task {
    fn client_server(&self) -> &ClientServerCore;

    fn client_server_mut(&mut self) -> &mut ClientServerCore;

    /// Fraction of the task's work done, in `[0, 1]`.
    fn achievement(&self) -> Result<f64, FlowError>;

    /// Handle one result of this task's WUs. Implementations must end with
    /// [`ClientServerTask::verification`] (directly or through
    /// [`ClientServerTask::handle_error_result`]).
    fn process_result(&mut self, result: CommandResult, bus: &mut dyn Bus) -> Result<(), FlowError>;

    /// Readiness plus WU subscription, for use in [`Task::attach`].
    fn attach_client_server(&mut self, bus: &mut dyn Bus) -> Result<(), FlowError> {
        bus.notify(self.name(), Notification::WantToRun)?;
        bus.notify(self.name(), Notification::SubscribeWuNotifications)
    }

    /// `wu_submitted - wu_received - wu_timedout`. A negative value means
    /// corrupted state and is an error.
    fn outstanding_wus(&self) -> Result<u64, FlowError> {
        let state = self.core().state();
        let submitted = state.get_or(WU_SUBMITTED, 0u64)?;
        let received = state.get_or(WU_RECEIVED, 0u64)?;
        let timedout = state.get_or(WU_TIMEDOUT, 0u64)?;
        submitted
            .checked_sub(received)
            .and_then(|n| n.checked_sub(timedout))
            .ok_or_else(|| {
                FlowError::WorkUnit(format!(
                    "task {}: counters inconsistent (submitted {submitted}, received {received}, timed out {timedout})",
                    self.name()
                ))
            })
    }

    /// WUs waiting to be claimed, across all tasks.
    fn available_wus(&self) -> Result<usize, FlowError> {
        self.client_server().wus().count(WuStatus::Available)
    }

    /// Persist a WU as `AVAILABLE` and count it, in one commit.
    fn submit_wu(&mut self, wuid: &str, invocation: Invocation, commit: bool) -> Result<(), FlowError> {
        let state = self.core().state();
        if state.get_or(START_REAL_TIME, 0.0f64)? == 0.0 {
            state.set(START_REAL_TIME, now_secs(), false)?;
        }
        if state.get_or(START_ACHIEVEMENT, -1.0f64)? < 0.0 {
            state.set(START_ACHIEVEMENT, self.achievement()?, false)?;
        }
        self.client_server().wus().create(wuid, invocation, false)?;
        state.incr(WU_SUBMITTED, 1, commit)?;
        Ok(())
    }

    /// Submit a command as a WU, blocking while too many WUs are available.
    /// Returns the WU id.
    fn submit_command(
        &mut self,
        invocation: Invocation,
        identifier: &str,
        bus: &mut dyn Bus,
    ) -> Result<String, FlowError> {
        while self.available_wus()? >= self.client_server().params().maxwu {
            self.wait(bus)?;
        }

        let wuid = make_wuname(self.core().workdir().jobname(), self.name(), identifier, None)?;

        let files: BTreeMap<String, PathBuf> = std::iter::once(&invocation.binary)
            .chain(&invocation.input_files)
            .filter_map(|p| {
                p.file_name()
                    .map(|n| (n.to_string_lossy().into_owned(), p.clone()))
            })
            .collect();
        if !files.is_empty() {
            bus.notify(self.name(), Notification::RegisterFilename(files))?;
        }

        info!(task = %self.name(), wuid = %wuid, "Adding work unit to database");
        let command_line = invocation.command_line();
        self.submit_wu(&wuid, invocation, true)?;

        let mut log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.client_server().wucmd_file().path())?;
        writeln!(log, "# Command for work unit: {wuid}\n{command_line}")?;
        Ok(wuid)
    }

    /// One polling step: take a result if there is one, otherwise sweep for
    /// timed-out WUs and sleep.
    fn wait(&mut self, bus: &mut dyn Bus) -> Result<(), FlowError> {
        if bus.interrupted() {
            return Err(FlowError::Interrupted);
        }
        let name = self.name().to_string();
        match bus.request(&name, RequestKey::GetWuResult, None)? {
            Some(Value::Result(result)) => self.process_result(*result, bus),
            Some(_) => Ok(()),
            None => {
                self.resubmit_timed_out_wus()?;
                std::thread::sleep(self.client_server().params().wait_sleep());
                Ok(())
            }
        }
    }

    /// Count a received WU and mark it verified.
    fn verification(&mut self, wuid: &str, ok: bool, commit: bool) -> Result<(), FlowError> {
        if self.outstanding_wus()? < 1 {
            return Err(FlowError::WorkUnit(format!(
                "task {} verifies {wuid} with no outstanding work units",
                self.name()
            )));
        }
        let wus = self.client_server().wus();
        match wus.get(wuid)? {
            Some(r) if r.status.is_received() => {}
            Some(r) => {
                return Err(FlowError::WorkUnit(format!(
                    "{wuid} has status {:?}, cannot verify it",
                    r.status
                )))
            }
            None => return Err(FlowError::WorkUnit(format!("unknown work unit {wuid}"))),
        }

        self.core().state().incr(WU_RECEIVED, 1, false)?;
        let achievement = self.achievement()?;
        if achievement > 0.0 {
            let eta = self.eta()?;
            info!(
                task = %self.name(),
                "Marking work unit {wuid} as {} ({:.1}% => ETA {eta})",
                if ok { "ok" } else { "not ok" },
                100.0 * achievement
            );
        }
        self.client_server().wus().verify(wuid, ok, commit)?;
        Ok(())
    }

    /// Cancel a WU and count it as timed out. Returns whether the WU was
    /// still cancellable; only then is the counter raised.
    fn cancel_wu(&mut self, wuid: &str, commit: bool) -> Result<bool, FlowError> {
        debug!(task = %self.name(), wuid, "Cancelling work unit");
        let state = self.core().state();
        let wus = self.client_server().wus();
        let Some(record) = wus.get(wuid)? else {
            return Err(FlowError::WorkUnit(format!("unknown work unit {wuid}")));
        };
        if !record.status.is_cancellable() {
            debug!(task = %self.name(), wuid, status = ?record.status, "Work unit finished meanwhile, not cancelling");
            if commit {
                state.store().commit()?;
            }
            return Ok(false);
        }
        let maxtimedout = self.client_server().params().maxtimedout;
        if state.get_or(WU_TIMEDOUT, 0u64)? >= maxtimedout {
            error!(
                task = %self.name(),
                maxtimedout,
                "Exceeded maximum number of timed out work units"
            );
            return Err(FlowError::BudgetExceeded(format!(
                "too many timed out work units, please increase tasks.maxtimedout (current value is {maxtimedout})"
            )));
        }
        let cancelled = wus.cancel(wuid, false)?;
        if cancelled {
            state.incr(WU_TIMEDOUT, 1, commit)?;
        } else if commit {
            state.store().commit()?;
        }
        Ok(cancelled)
    }

    /// Submit `record` again with the next attempt number, unless that
    /// exceeds `cap` (default `maxresubmit`). Returns whether it was resubmitted.
    fn resubmit_one_wu(
        &mut self,
        record: &WuRecord,
        commit: bool,
        cap: Option<u32>,
    ) -> Result<bool, FlowError> {
        let next = WuName::parse(&record.wuid)?.next_attempt();
        let attempt = next.attempt.unwrap_or(2);
        let cap = cap.unwrap_or(self.client_server().params().maxresubmit);
        if attempt > cap {
            warn!(
                task = %self.name(),
                wuid = %record.wuid,
                "Not resubmitting work unit, failed {} times",
                attempt - 1
            );
            if commit {
                self.core().state().store().commit()?;
            }
            return Ok(false);
        }
        let new_wuid = next.to_string();
        info!(task = %self.name(), wuid = %record.wuid, new_wuid = %new_wuid, "Resubmitting work unit");
        self.submit_wu(&new_wuid, record.invocation.clone(), commit)?;
        Ok(true)
    }

    /// Cancel and resubmit this task's WUs that are flagged `NEED_RESUBMIT`
    /// or were assigned more than `wutimeout` seconds ago. The first call
    /// only starts the clock; later calls run at most once per sweep interval.
    fn resubmit_timed_out_wus(&mut self) -> Result<(), FlowError> {
        let now = Instant::now();
        let interval = self.client_server().params().sweep_interval();
        let cs = self.client_server_mut();
        match cs.last_timeout_check {
            None => {
                cs.last_timeout_check = Some(now);
                return Ok(());
            }
            Some(last) if now.duration_since(last) < interval => return Ok(()),
            Some(_) => cs.last_timeout_check = Some(now),
        }

        let name = self.name().to_string();
        let wus = self.client_server().wus().clone();
        let mine = |r: &WuRecord| r.task().is_ok_and(|t| t == name);

        let mut candidates: Vec<WuRecord> = wus
            .by_status(WuStatus::NeedResubmit)?
            .into_iter()
            .filter(|r| mine(r))
            .collect();
        let timeout = self.client_server().params().wutimeout;
        let cutoff = chrono::Duration::from_std(Duration::from_secs(timeout))
            .ok()
            .and_then(|d| Utc::now().checked_sub_signed(d));
        if let Some(cutoff) = cutoff {
            let mut seen: HashSet<String> = candidates.iter().map(|r| r.wuid.clone()).collect();
            for r in wus.assigned_before(cutoff)? {
                if mine(&r) && seen.insert(r.wuid.clone()) {
                    candidates.push(r);
                }
            }
        }

        for record in candidates {
            warn!(
                task = %name,
                wuid = %record.wuid,
                status = ?record.status,
                "Work unit timed out or needs resubmission"
            );
            if self.cancel_wu(&record.wuid, false)? {
                self.resubmit_one_wu(&record, true, None)?;
            }
        }
        Ok(())
    }

    /// Handle a result with non-zero exit code: log it, verify it as failed
    /// and resubmit it once. Returns `false` for a successful result.
    fn handle_error_result(&mut self, result: &CommandResult) -> Result<bool, FlowError> {
        if result.succeeded() {
            return Ok(false);
        }
        self.core().log_failed_command(result);

        let maxfailed = self.client_server().params().maxfailed;
        if self.core().state().get_or(WU_FAILED, 0u64)? >= maxfailed {
            error!(task = %self.name(), maxfailed, "Exceeded maximum number of failed work units");
            return Err(FlowError::BudgetExceeded(format!(
                "too many failed work units, please increase tasks.maxfailed (current value is {maxfailed})"
            )));
        }
        let record = match self.client_server().wus().get(&result.wuid)? {
            Some(r) if r.status == WuStatus::ReceivedError => r,
            Some(r) => {
                return Err(FlowError::WorkUnit(format!(
                    "{} has status {:?}, expected RECEIVED_ERROR",
                    result.wuid, r.status
                )))
            }
            None => return Err(FlowError::WorkUnit(format!("unknown work unit {}", result.wuid))),
        };

        self.core().state().incr(WU_FAILED, 1, false)?;
        self.verification(&result.wuid, false, false)?;
        self.resubmit_one_wu(&record, true, Some(2))?;
        Ok(true)
    }

    /// Cancel this task's unclaimed WUs. They count as timed out so that the
    /// outstanding count stays balanced; the timeout budget does not apply.
    fn cancel_own_available(&mut self) -> Result<usize, FlowError> {
        let name = self.name().to_string();
        let cancelled = self.client_server().wus().cancel_available(&name, false)?;
        let state = self.core().state();
        if cancelled.is_empty() {
            state.store().commit()?;
        } else {
            state.incr(WU_TIMEDOUT, cancelled.len() as u64, true)?;
            info!(task = %name, count = cancelled.len(), "Cancelled remaining work units");
        }
        Ok(cancelled.len())
    }

    /// Linear extrapolation from the first submission of this run.
    fn eta(&self) -> Result<Eta, FlowError> {
        let state = self.core().state();
        let start = state.get_or(START_REAL_TIME, 0.0f64)?;
        if start == 0.0 {
            return Ok(Eta::Unknown);
        }
        let elapsed = now_secs() - start;
        let a = self.achievement()?;
        let mut a0 = state.get_or(START_ACHIEVEMENT, -1.0f64)?;
        if a0 < 0.0 {
            state.set(START_ACHIEVEMENT, a, false)?;
            a0 = a;
        }
        let remaining = elapsed / (a - a0) * (1.0 - a);
        let eta = Duration::try_from_secs_f64(remaining)
            .ok()
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .and_then(|d| Utc::now().checked_add_signed(d))
            .map_or(Eta::Unknown, Eta::At);
        Ok(eta)
    }
}
