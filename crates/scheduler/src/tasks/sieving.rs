use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::Deserialize;
use tracing::{error, info, warn};

use factorflow_core::{
    CommandResult, Combine, FileRef, FlowError, Invocation, StatRule, ValueType,
};

use crate::client_server::{ClientServerCore, ClientServerTask};
use crate::message::{Bus, Notification, RequestKey, Value};
use crate::task::{ProgramSpec, Task, TaskContext, TaskCore};

const PROGRAM: &str = "las";
const QNEXT: &str = "qnext";
const RELS_FOUND: &str = "rels_found";
const RELS_WANTED: &str = "rels_wanted";
const FILES: &str = "files";

/// Siever parameters read from `[tasks.<name>.las]`.
const LAS_PARAMS: &[&str] = &[
    "I", "lim0", "lim1", "lpb0", "lpb1", "mfb0", "mfb1", "ncurves0", "ncurves1", "t",
];

const FORMATS: &[&str] = &[
    "Average J: {stats_avg_J[0]:.1} for {stats_avg_J[1]} special-q, max bucket fill: {stats_max_bucket_fill[0]}",
    "Total CPU time: {stats_total_cpu_time[0]:.1}s",
    "Total time: {stats_total_time[0]:.1}s",
];

/// `[tasks.<name>]` parameters of a [`SievingTask`].
#[derive(Debug, Clone, Deserialize)]
pub struct SievingParams {
    #[serde(default = "default_binary")]
    pub binary: PathBuf,
    /// First special-q.
    pub qmin: u64,
    /// Width of the special-q range of one work unit.
    pub qrange: u64,
    /// Initial relation target; downstream tasks may raise it.
    pub rels_wanted: u64,
}

fn default_binary() -> PathBuf {
    PathBuf::from("las")
}

fn stat_rules() -> Result<Vec<StatRule>, FlowError> {
    Ok(vec![
        StatRule::new(
            "stats_avg_J",
            &[ValueType::Float, ValueType::Int],
            Combine::WeightedMean,
            r"# Average J=\s*(\d+(?:\.\d+)?)\s*for (\d+) special-q's",
            false,
        )?
        .with_default("0 0"),
        StatRule::new(
            "stats_max_bucket_fill",
            &[ValueType::Float],
            Combine::Max,
            r"#.*max bucket fill\s*(\d+(?:\.\d+)?)",
            false,
        )?
        .with_default("0"),
        StatRule::new(
            "stats_total_cpu_time",
            &[ValueType::Float],
            Combine::Sum,
            r"# Total cpu time\s*(\d+(?:\.\d+)?)s",
            false,
        )?
        .with_default("0"),
        StatRule::new(
            "stats_total_time",
            &[ValueType::Float],
            Combine::Sum,
            r"# Total time\s*(\d+(?:\.\d+)?)s",
            false,
        )?
        .with_default("0"),
    ])
}

/// Produces relations by handing special-q ranges to workers. Keeps
/// submitting ranges until the relations found reach the target.
pub struct SievingTask {
    core: TaskCore,
    cs: ClientServerCore,
    params: SievingParams,
    reports: Regex,
}

impl SievingTask {
    pub fn new(name: &str, ctx: &TaskContext) -> Result<Self, FlowError> {
        let mut core = TaskCore::new(name, "Lattice Sieving", ctx)?.with_statistics(stat_rules()?, FORMATS)?;
        let params: SievingParams = core.myparams()?;
        if params.qrange == 0 {
            return Err(FlowError::Config(format!("task {name}: qrange must be positive")));
        }
        core.add_program(
            ProgramSpec::new(PROGRAM, &params.binary, LAS_PARAMS),
            &["q0", "q1", "out"],
            &[("poly", RequestKey::GetPolynomialFilename)],
        );
        let cs = ClientServerCore::new(&core)?;

        let state = core.state();
        let qnext = state
            .get::<u64>(QNEXT)?
            .map_or(params.qmin, |q| q.max(params.qmin));
        let wanted = state
            .get::<u64>(RELS_WANTED)?
            .map_or(params.rels_wanted, |w| w.max(params.rels_wanted));
        let found = state.get_or(RELS_FOUND, 0u64)?;
        state.update(
            [
                (QNEXT.to_string(), serde_json::Value::from(qnext)),
                (RELS_WANTED.to_string(), serde_json::Value::from(wanted)),
                (RELS_FOUND.to_string(), serde_json::Value::from(found)),
            ],
            true,
        )?;

        Ok(Self {
            core,
            cs,
            params,
            reports: Regex::new(r"^# Total (\d+) reports")?,
        })
    }

    pub fn rels_found(&self) -> Result<u64, FlowError> {
        self.core.state().get_or(RELS_FOUND, 0u64)
    }

    pub fn rels_wanted(&self) -> Result<u64, FlowError> {
        self.core.state().get_or(RELS_WANTED, 0u64)
    }

    /// Output files with their relation counts, relative to the work directory.
    pub fn files(&self) -> Result<BTreeMap<String, u64>, FlowError> {
        self.core.state().get_or(FILES, BTreeMap::new())
    }

    /// Special-q range of the next work unit; the end is aligned to `qrange`.
    fn next_range(&self) -> Result<(u64, u64), FlowError> {
        let q0 = self.core.state().get_or(QNEXT, self.params.qmin)?;
        let q1 = q0 + self.params.qrange;
        Ok((q0, q1 - q1 % self.params.qrange))
    }

    /// Count the relations of one output file. Returns whether the file was usable.
    fn add_file(&mut self, path: &Path) -> Result<bool, FlowError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => {
                error!(task = %self.name(), file = %path.display(), error = %e, "Cannot read relation file");
                return Ok(false);
            }
        };
        let Some(rels) = text
            .lines()
            .find_map(|l| self.reports.captures(l))
            .and_then(|c| c[1].parse::<u64>().ok())
        else {
            error!(task = %self.name(), file = %path.display(), "Number of relations not found in file");
            return Ok(false);
        };

        let relative = path
            .strip_prefix(self.core.workdir().root())
            .unwrap_or(path)
            .display()
            .to_string();
        let mut files = self.files()?;
        if files.contains_key(&relative) {
            warn!(task = %self.name(), file = %relative, "Relation file was already counted");
            return Ok(false);
        }
        files.insert(relative.clone(), rels);

        let found = self.rels_found()? + rels;
        self.core.state().update(
            [
                (RELS_FOUND.to_string(), serde_json::Value::from(found)),
                (FILES.to_string(), serde_json::to_value(&files)?),
            ],
            false,
        )?;
        self.core.parse_stats(&text, false)?;
        info!(
            task = %self.name(),
            file = %relative,
            "Found {rels} relations, total is now {found}/{}",
            self.rels_wanted()?
        );
        Ok(true)
    }
}

impl Task for SievingTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut TaskCore {
        &mut self.core
    }

    fn run(&mut self, bus: &mut dyn Bus) -> Result<bool, FlowError> {
        self.core.prepare(bus)?;
        let wanted = self.rels_wanted()?;
        info!(task = %self.name(), "We want {wanted} relations");

        let maxwu = self.cs.params().maxwu as u64;
        while self.rels_found()? < wanted {
            if self.outstanding_wus()? >= maxwu {
                self.wait(bus)?;
                continue;
            }
            let (q0, q1) = self.next_range()?;
            let output = self.core.workdir().make_filename(&format!("{q0}-{q1}"));
            TaskCore::check_files_exist(std::slice::from_ref(&output), "output", false)?;

            let out = output.path();
            let invocation = Invocation::new(PROGRAM, &self.params.binary)
                .params(&self.core.merged_args[0])
                .param("q0", &q0.to_string())
                .param("q1", &q1.to_string())
                .param("out", &out.display().to_string())
                .output_file(out);
            self.submit_command(invocation, &format!("{q0}-{q1}"), bus)?;
            self.core.state().set(QNEXT, q1, true)?;
        }

        info!(
            task = %self.name(),
            "Reached target of {wanted} relations, now have {}",
            self.rels_found()?
        );
        Ok(true)
    }

    fn answers(&self) -> Vec<RequestKey> {
        vec![RequestKey::GetSieverFilenames, RequestKey::GetSieverRelcount]
    }

    fn answer(&mut self, key: RequestKey, _value: Option<&Value>) -> Result<Option<Value>, FlowError> {
        match key {
            RequestKey::GetSieverFilenames => {
                let files = self.files()?;
                let version = files.len() as u64;
                let root = self.core.workdir().root();
                Ok(Some(Value::Files(
                    files
                        .into_keys()
                        .map(|f| FileRef::new(root, f).with_version(version))
                        .collect(),
                )))
            }
            RequestKey::GetSieverRelcount => Ok(Some(Value::Count(self.rels_found()?))),
            _ => Ok(None),
        }
    }

    fn attach(&mut self, bus: &mut dyn Bus) -> Result<(), FlowError> {
        self.attach_client_server(bus)
    }

    fn is_client_server(&self) -> bool {
        true
    }

    fn produces_relations(&self) -> bool {
        true
    }

    fn request_more_relations(&mut self, target: u64, bus: &mut dyn Bus) -> Result<(), FlowError> {
        let mut wanted = self.rels_wanted()?;
        if target > wanted {
            self.core.state().set(RELS_WANTED, target, true)?;
            wanted = target;
        }
        let found = self.rels_found()?;
        if wanted > found {
            info!(task = %self.name(), "New goal for number of relations is {wanted}, currently have {found}. Need to sieve more");
            bus.notify(self.name(), Notification::WantToRun)
        } else {
            info!(task = %self.name(), "New goal for number of relations is {wanted}, but already have {found}. No need to sieve more");
            Ok(())
        }
    }

    fn on_wu_result(&mut self, result: CommandResult, bus: &mut dyn Bus) -> Result<(), FlowError> {
        self.process_result(result, bus)
    }

    fn cancel_available_wus(&mut self) -> Result<usize, FlowError> {
        self.cancel_own_available()
    }

    fn print_stats(&self) -> Result<(), FlowError> {
        info!(task = %self.name(), "Total number of relations: {}", self.rels_found()?);
        self.core.print_stats()
    }
}

impl ClientServerTask for SievingTask {
    fn client_server(&self) -> &ClientServerCore {
        &self.cs
    }

    fn client_server_mut(&mut self) -> &mut ClientServerCore {
        &mut self.cs
    }

    fn achievement(&self) -> Result<f64, FlowError> {
        let wanted = self.rels_wanted()?;
        if wanted == 0 {
            return Ok(1.0);
        }
        Ok((self.rels_found()? as f64 / wanted as f64).min(1.0))
    }

    fn process_result(&mut self, result: CommandResult, _bus: &mut dyn Bus) -> Result<(), FlowError> {
        if self.handle_error_result(&result)? {
            return Ok(());
        }
        self.core
            .update_cpu_real_time(PROGRAM, result.cpu_time, result.real_time, false)?;
        let ok = match result.output_files.as_slice() {
            [file] => self.add_file(file)?,
            files => {
                warn!(
                    task = %self.name(),
                    wuid = %result.wuid,
                    "Received output with {} files, expected one",
                    files.len()
                );
                false
            }
        };
        self.verification(&result.wuid, ok, true)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use factorflow_core::Output;
    use factorflow_state::WuStatus;

    use super::*;
    use crate::test_support::{context, MapBus, ScriptedRunner};

    const PARAMS: &str = r#"
[tasks.sieving]
binary = "/opt/las"
qmin = 1500
qrange = 1000
rels_wanted = 100
maxwu = 2
wait_sleep_ms = 1

[tasks.sieving.las]
I = 11
"#;

    fn sieving(dir: &Path) -> SievingTask {
        let ctx = context(PARAMS, dir, Arc::new(ScriptedRunner::ok("")));
        SievingTask::new("sieving", &ctx).unwrap()
    }

    fn poly_bus() -> MapBus {
        MapBus {
            interrupted: true,
            ..MapBus::default().with(
                RequestKey::GetPolynomialFilename,
                Value::File(FileRef::new("/w", "c60.poly")),
            )
        }
    }

    fn result(wuid: &str, file: PathBuf) -> CommandResult {
        CommandResult {
            wuid: wuid.to_string(),
            program: PROGRAM.into(),
            rc: 0,
            stdout: Output::Empty,
            stderr: Output::Empty,
            output_files: vec![file],
            command_line: "las".into(),
            host: "localhost.0".into(),
            real_time: 3.0,
            cpu_time: 2.5,
        }
    }

    /// Let a worker finish the next available WU.
    fn complete_next(task: &SievingTask) -> CommandResult {
        let wus = task.cs.wus();
        task.core.state().store().set_serving(true).unwrap();
        let record = wus.claim("localhost.0").unwrap().unwrap();
        let file = record.invocation.output_files[0].clone();
        let r = result(&record.wuid, file);
        wus.record_result(r.clone()).unwrap();
        r
    }

    #[test]
    fn submits_aligned_ranges_up_to_maxwu() {
        let dir = tempfile::tempdir().unwrap();
        let mut task = sieving(dir.path());
        let mut bus = poly_bus();

        // Nothing comes back and the interrupt is raised, so the loop stops
        // in wait() once maxwu WUs are out.
        let err = task.run(&mut bus).unwrap_err();
        assert!(err.is_interrupt());
        assert_eq!(task.outstanding_wus().unwrap(), 2);
        assert_eq!(task.core.state().get::<u64>(QNEXT).unwrap(), Some(3000));

        let wus = task.cs.wus();
        let first = wus.get("c60_sieving_1500-2000").unwrap().unwrap();
        assert_eq!(first.status, WuStatus::Available);
        let args = first.invocation.args.join(" ");
        assert!(args.starts_with("-I 11 -poly /w/c60.poly -q0 1500 -q1 2000 -out "), "{args}");
        assert!(wus.get("c60_sieving_2000-3000").unwrap().is_some());
    }

    #[test]
    fn results_add_relations_and_statistics() {
        let dir = tempfile::tempdir().unwrap();
        let mut task = sieving(dir.path());
        let mut bus = poly_bus();
        let _ = task.run(&mut bus);

        let r = complete_next(&task);
        std::fs::write(
            &r.output_files[0],
            "1,2:3,4\n# Total cpu time 7.0s\n# Total 60 reports [0.1s/r]\n",
        )
        .unwrap();
        task.process_result(r.clone(), &mut bus).unwrap();

        assert_eq!(task.rels_found().unwrap(), 60);
        assert_eq!(task.files().unwrap().values().copied().collect::<Vec<_>>(), vec![60]);
        assert_eq!(
            task.cs.wus().get(&r.wuid).unwrap().unwrap().status,
            WuStatus::VerifiedOk
        );
        assert_eq!(task.core.cpu_real_time().unwrap(), (2.5, 3.0));
        assert_eq!(
            task.core.stats().get("stats_total_cpu_time").unwrap()[0].as_f64(),
            7.0
        );
        assert!((task.achievement().unwrap() - 0.6).abs() < 1e-9);

        match task.answer(RequestKey::GetSieverFilenames, None).unwrap() {
            Some(Value::Files(files)) => {
                assert_eq!(files.len(), 1);
                assert_eq!(files[0].path(), r.output_files[0]);
                assert_eq!(files[0].version, Some(1));
            }
            other => panic!("unexpected answer {other:?}"),
        }
    }

    #[test]
    fn unreadable_output_is_verified_as_failed() {
        let dir = tempfile::tempdir().unwrap();
        let mut task = sieving(dir.path());
        let mut bus = poly_bus();
        let _ = task.run(&mut bus);

        let r = complete_next(&task);
        task.process_result(r.clone(), &mut bus).unwrap();
        assert_eq!(task.rels_found().unwrap(), 0);
        assert_eq!(
            task.cs.wus().get(&r.wuid).unwrap().unwrap().status,
            WuStatus::VerifiedError
        );
    }

    #[test]
    fn more_relations_raise_the_target_and_requeue() {
        let dir = tempfile::tempdir().unwrap();
        let mut task = sieving(dir.path());
        let mut bus = MapBus::default();

        task.request_more_relations(50, &mut bus).unwrap();
        assert_eq!(task.rels_wanted().unwrap(), 100);
        assert_eq!(bus.notices.len(), 1);

        task.request_more_relations(250, &mut bus).unwrap();
        assert_eq!(task.rels_wanted().unwrap(), 250);
        assert_eq!(bus.notices[1].1, Notification::WantToRun);
    }

    #[test]
    fn state_survives_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(PARAMS, dir.path(), Arc::new(ScriptedRunner::ok("")));
        let task = SievingTask::new("sieving", &ctx).unwrap();
        task.core.state().set(QNEXT, 9000u64, true).unwrap();
        task.core.state().set(RELS_WANTED, 400u64, true).unwrap();
        drop(task);

        let again = SievingTask::new("sieving", &ctx).unwrap();
        assert_eq!(again.next_range().unwrap(), (9000, 10000));
        assert_eq!(again.rels_wanted().unwrap(), 400);
    }

    #[test]
    fn rejects_zero_qrange() {
        let dir = tempfile::tempdir().unwrap();
        let params = "[tasks.s]\nqmin = 1\nqrange = 0\nrels_wanted = 1\n";
        let ctx = context(params, dir.path(), Arc::new(ScriptedRunner::ok("")));
        assert!(matches!(SievingTask::new("s", &ctx), Err(FlowError::Config(_))));
    }
}
