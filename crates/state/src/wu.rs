use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use factorflow_core::{CommandResult, FlowError, Invocation, WuName};

use crate::store::{Inner, StateStore};

const CANCELLABLE: &[WuStatus] = &[WuStatus::Available, WuStatus::Assigned, WuStatus::NeedResubmit];

/// Lifecycle of a work unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WuStatus {
    Available,
    Assigned,
    NeedResubmit,
    ReceivedOk,
    ReceivedError,
    VerifiedOk,
    VerifiedError,
    Cancelled,
}

impl WuStatus {
    pub fn is_received(self) -> bool {
        matches!(self, WuStatus::ReceivedOk | WuStatus::ReceivedError)
    }

    /// Not finished yet, so cancelling it still changes something.
    pub fn is_cancellable(self) -> bool {
        CANCELLABLE.contains(&self)
    }
}

/// One persisted work unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WuRecord {
    pub wuid: String,
    pub status: WuStatus,
    pub invocation: Invocation,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub timeassigned: Option<DateTime<Utc>>,
    #[serde(default)]
    pub assignedclient: Option<String>,
    #[serde(default)]
    pub result: Option<CommandResult>,
}

impl WuRecord {
    /// Name of the task that owns this WU.
    pub fn task(&self) -> Result<String, FlowError> {
        Ok(WuName::parse(&self.wuid)?.task)
    }
}

/// The global work unit table.
///
/// Status transitions are checked: each method names the states it may
/// move a WU out of, and reports whether a transition happened.
#[derive(Debug, Clone)]
pub struct WuTable {
    store: StateStore,
}

impl WuTable {
    pub(crate) fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Persist a new WU as `AVAILABLE`.
    pub fn create(&self, wuid: &str, invocation: Invocation, commit: bool) -> Result<(), FlowError> {
        let record = WuRecord {
            wuid: wuid.to_string(),
            status: WuStatus::Available,
            invocation,
            created: Utc::now(),
            timeassigned: None,
            assignedclient: None,
            result: None,
        };
        self.store.write(commit, move |inner| {
            if inner.snapshot.workunits.contains_key(&record.wuid) {
                return Err(FlowError::WorkUnit(format!("{} already exists", record.wuid)));
            }
            inner.snapshot.workunits.insert(record.wuid.clone(), record);
            Ok(())
        })
    }

    pub fn get(&self, wuid: &str) -> Result<Option<WuRecord>, FlowError> {
        Ok(self.store.lock()?.snapshot.workunits.get(wuid).cloned())
    }

    /// All WUs matching `pred`, in submission order.
    pub fn query(&self, pred: impl Fn(&WuRecord) -> bool) -> Result<Vec<WuRecord>, FlowError> {
        Ok(self
            .store
            .lock()?
            .snapshot
            .workunits
            .values()
            .filter(|r| pred(r))
            .cloned()
            .collect())
    }

    pub fn by_status(&self, status: WuStatus) -> Result<Vec<WuRecord>, FlowError> {
        self.query(|r| r.status == status)
    }

    /// `ASSIGNED` WUs claimed before `cutoff`.
    pub fn assigned_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<WuRecord>, FlowError> {
        self.query(|r| {
            r.status == WuStatus::Assigned && r.timeassigned.is_some_and(|t| t < cutoff)
        })
    }

    pub fn count(&self, status: WuStatus) -> Result<usize, FlowError> {
        Ok(self
            .store
            .lock()?
            .snapshot
            .workunits
            .values()
            .filter(|r| r.status == status)
            .count())
    }

    /// Move `wuid` to `to` if it is currently in one of `from`.
    pub fn transition(
        &self,
        wuid: &str,
        from: &[WuStatus],
        to: WuStatus,
        commit: bool,
    ) -> Result<bool, FlowError> {
        self.store
            .write(commit, |inner| apply_transition(inner, wuid, from, to))
    }

    /// Claim the oldest available WU for `client`. Returns `None` when
    /// nothing is available or serving has stopped.
    pub fn claim(&self, client: &str) -> Result<Option<WuRecord>, FlowError> {
        self.store.write_workunit(|inner| {
            if !inner.serving {
                return Ok((None, None));
            }
            let Some(record) = inner
                .snapshot
                .workunits
                .values_mut()
                .find(|r| r.status == WuStatus::Available)
            else {
                return Ok((None, None));
            };
            record.status = WuStatus::Assigned;
            record.timeassigned = Some(Utc::now());
            record.assignedclient = Some(client.to_string());
            Ok((Some(record.wuid.clone()), Some(record.clone())))
        })
    }

    /// Store an uploaded result. Results for WUs that are no longer
    /// `ASSIGNED` (cancelled or already resubmitted) are discarded.
    pub fn record_result(&self, result: CommandResult) -> Result<bool, FlowError> {
        self.store.write_workunit(|inner| {
            let Some(record) = inner.snapshot.workunits.get_mut(&result.wuid) else {
                warn!(wuid = %result.wuid, "Discarding result for unknown work unit");
                return Ok((None, false));
            };
            if record.status != WuStatus::Assigned {
                warn!(
                    wuid = %result.wuid,
                    status = ?record.status,
                    "Discarding result for work unit that is no longer assigned"
                );
                return Ok((None, false));
            }
            record.status = if result.succeeded() {
                WuStatus::ReceivedOk
            } else {
                WuStatus::ReceivedError
            };
            let wuid = result.wuid.clone();
            record.result = Some(result);
            Ok((Some(wuid), true))
        })
    }

    /// Oldest WU with a received but not yet verified result.
    pub fn next_received(&self) -> Result<Option<WuRecord>, FlowError> {
        Ok(self
            .store
            .lock()?
            .snapshot
            .workunits
            .values()
            .find(|r| r.status.is_received())
            .cloned())
    }

    /// Mark a received WU as verified.
    pub fn verify(&self, wuid: &str, ok: bool, commit: bool) -> Result<bool, FlowError> {
        let to = if ok {
            WuStatus::VerifiedOk
        } else {
            WuStatus::VerifiedError
        };
        self.transition(wuid, &[WuStatus::ReceivedOk, WuStatus::ReceivedError], to, commit)
    }

    /// Flag an assigned WU for resubmission.
    pub fn need_resubmit(&self, wuid: &str) -> Result<bool, FlowError> {
        self.store.write_workunit(|inner| {
            let moved = apply_transition(inner, wuid, &[WuStatus::Assigned], WuStatus::NeedResubmit)?;
            Ok((moved.then(|| wuid.to_string()), moved))
        })
    }

    /// Cancel a WU that has not produced a result.
    pub fn cancel(&self, wuid: &str, commit: bool) -> Result<bool, FlowError> {
        self.transition(wuid, CANCELLABLE, WuStatus::Cancelled, commit)
    }

    /// Cancel every unclaimed WU owned by `task`. Returns the cancelled ids.
    pub fn cancel_available(&self, task: &str, commit: bool) -> Result<Vec<String>, FlowError> {
        self.store.write(commit, |inner| {
            let mut cancelled = Vec::new();
            for record in inner.snapshot.workunits.values_mut() {
                if record.status != WuStatus::Available {
                    continue;
                }
                if WuName::parse(&record.wuid).is_ok_and(|n| n.task == task) {
                    record.status = WuStatus::Cancelled;
                    cancelled.push(record.wuid.clone());
                }
            }
            Ok(cancelled)
        })
    }
}

fn apply_transition(
    inner: &mut Inner,
    wuid: &str,
    from: &[WuStatus],
    to: WuStatus,
) -> Result<bool, FlowError> {
    let Some(record) = inner.snapshot.workunits.get_mut(wuid) else {
        return Err(FlowError::WorkUnit(format!("unknown work unit {wuid}")));
    };
    if !from.contains(&record.status) {
        return Ok(false);
    }
    debug!(wuid, from = ?record.status, to = ?to, "Work unit status change");
    record.status = to;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inv() -> Invocation {
        Invocation::new("las", "/bin/true")
    }

    fn result(wuid: &str, rc: i32) -> CommandResult {
        CommandResult {
            wuid: wuid.to_string(),
            program: "las".into(),
            rc,
            stdout: Default::default(),
            stderr: Default::default(),
            output_files: vec![],
            command_line: "/bin/true".into(),
            host: "localhost".into(),
            real_time: 0.0,
            cpu_time: 0.0,
        }
    }

    #[test]
    fn claim_respects_serving_flag_and_order() {
        let store = StateStore::in_memory();
        let wus = store.workunits();
        wus.create("j_s_1", inv(), false).unwrap();
        wus.create("j_s_2", inv(), false).unwrap();

        assert!(wus.claim("c1").unwrap().is_none());
        store.set_serving(true).unwrap();

        let first = wus.claim("c1").unwrap().unwrap();
        assert_eq!(first.wuid, "j_s_1");
        assert_eq!(first.status, WuStatus::Assigned);
        assert!(first.timeassigned.is_some());
        assert_eq!(wus.count(WuStatus::Available).unwrap(), 1);
    }

    #[test]
    fn duplicate_create_is_rejected() {
        let store = StateStore::in_memory();
        let wus = store.workunits();
        wus.create("j_s_1", inv(), false).unwrap();
        assert!(wus.create("j_s_1", inv(), false).is_err());
    }

    #[test]
    fn results_route_to_received_states() {
        let store = StateStore::in_memory();
        store.set_serving(true).unwrap();
        let wus = store.workunits();
        wus.create("j_s_1", inv(), false).unwrap();
        wus.create("j_s_2", inv(), false).unwrap();
        wus.claim("c").unwrap();
        wus.claim("c").unwrap();

        assert!(wus.record_result(result("j_s_1", 0)).unwrap());
        assert!(wus.record_result(result("j_s_2", 1)).unwrap());
        assert_eq!(wus.get("j_s_1").unwrap().unwrap().status, WuStatus::ReceivedOk);
        assert_eq!(wus.get("j_s_2").unwrap().unwrap().status, WuStatus::ReceivedError);

        let next = wus.next_received().unwrap().unwrap();
        assert_eq!(next.wuid, "j_s_1");
        assert!(wus.verify("j_s_1", true, false).unwrap());
        assert_eq!(wus.next_received().unwrap().unwrap().wuid, "j_s_2");
    }

    #[test]
    fn late_result_for_cancelled_wu_is_discarded() {
        let store = StateStore::in_memory();
        store.set_serving(true).unwrap();
        let wus = store.workunits();
        wus.create("j_s_1", inv(), false).unwrap();
        wus.claim("c").unwrap();
        assert!(wus.cancel("j_s_1", false).unwrap());
        assert!(!wus.record_result(result("j_s_1", 0)).unwrap());
        assert_eq!(wus.get("j_s_1").unwrap().unwrap().status, WuStatus::Cancelled);
        assert!(wus.next_received().unwrap().is_none());
    }

    #[test]
    fn cancel_is_not_repeated() {
        let store = StateStore::in_memory();
        let wus = store.workunits();
        wus.create("j_s_1", inv(), false).unwrap();
        assert!(wus.cancel("j_s_1", false).unwrap());
        assert!(!wus.cancel("j_s_1", false).unwrap());
    }

    #[test]
    fn cancel_available_only_touches_owner() {
        let store = StateStore::in_memory();
        let wus = store.workunits();
        wus.create("j_sieving_1", inv(), false).unwrap();
        wus.create("j_polyselect_1", inv(), false).unwrap();
        let cancelled = wus.cancel_available("sieving", false).unwrap();
        assert_eq!(cancelled, vec!["j_sieving_1".to_string()]);
        assert_eq!(
            wus.get("j_polyselect_1").unwrap().unwrap().status,
            WuStatus::Available
        );
    }

    #[test]
    fn assigned_before_filters_by_time() {
        let store = StateStore::in_memory();
        store.set_serving(true).unwrap();
        let wus = store.workunits();
        wus.create("j_s_1", inv(), false).unwrap();
        wus.claim("c").unwrap();
        let future = Utc::now() + chrono::Duration::seconds(60);
        let past = Utc::now() - chrono::Duration::seconds(60);
        assert_eq!(wus.assigned_before(future).unwrap().len(), 1);
        assert!(wus.assigned_before(past).unwrap().is_empty());
    }
}
