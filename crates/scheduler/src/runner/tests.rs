#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use factorflow_core::{CommandResult, FlowError, Invocation, Output};

    use crate::context::ProcessContext;
    use crate::mediator::Mediator;
    use crate::message::{Notification, RequestKey};
    use crate::runner::{Pipeline, PipelineOutcome};
    use crate::task::{Task, TaskContext};
    use crate::test_support::{context, mock_services, MockTask, ScriptedRunner, ServiceCalls};

    fn ctx() -> TaskContext {
        context("", Path::new("/w"), Arc::new(ScriptedRunner::ok("")))
    }

    fn pipeline(
        tasks: Vec<Box<dyn Task>>,
        order: &[&str],
        ctx: &TaskContext,
        process: Arc<ProcessContext>,
    ) -> (Pipeline, Arc<ServiceCalls>) {
        let (services, calls) = mock_services();
        let mediator = Mediator::new(
            tasks,
            services,
            ctx.store.clone(),
            ctx.workdir.clone(),
            process,
        )
        .unwrap();
        let order = order.iter().map(|s| s.to_string()).collect();
        (Pipeline::new(mediator, order).unwrap(), calls)
    }

    fn log() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[test]
    fn ready_tasks_run_in_pipeline_order() {
        let ctx = ctx();
        let log = log();
        // Declared (and so announced) as task2, task1.
        let tasks: Vec<Box<dyn Task>> = vec![
            Box::new(MockTask::new("task2", &ctx, &log)),
            Box::new(MockTask::new("task1", &ctx, &log)),
        ];
        let (mut p, _) = pipeline(tasks, &["task1", "task2"], &ctx, ProcessContext::new());
        assert_eq!(p.mediator().ready_tasks(), vec!["task2", "task1"]);

        assert_eq!(p.run().unwrap(), PipelineOutcome::Completed);
        assert_eq!(*log.lock().unwrap(), vec!["task1", "task2"]);
        assert_eq!(p.metrics().runs("task1"), 1);
        assert_eq!(p.metrics().runs("task2"), 1);
    }

    #[test]
    fn services_start_and_stop_once() {
        let ctx = ctx();
        let tasks: Vec<Box<dyn Task>> = vec![Box::new(MockTask::new("a", &ctx, &log()))];
        let (mut p, calls) = pipeline(tasks, &["a"], &ctx, ProcessContext::new());
        p.run().unwrap();
        drop(p);
        assert_eq!(ServiceCalls::get(&calls.serve), 1);
        assert_eq!(ServiceCalls::get(&calls.start_workers), 1);
        assert_eq!(ServiceCalls::get(&calls.stop_workers), 1);
        assert_eq!(ServiceCalls::get(&calls.shutdown), 1);
    }

    #[test]
    fn interrupt_stops_the_loop_and_tears_down_once() {
        let ctx = ctx();
        let log = log();
        let process = ProcessContext::new();
        let flag = Arc::clone(&process);
        let first = MockTask::new("first", &ctx, &log).on_run(move |_| {
            flag.interrupt();
            Ok(true)
        });
        let second = MockTask::new("second", &ctx, &log);
        let second_runs = Arc::clone(&second.runs);
        let (mut p, calls) = pipeline(
            vec![Box::new(first), Box::new(second)],
            &["first", "second"],
            &ctx,
            process,
        );

        assert_eq!(p.run().unwrap(), PipelineOutcome::Interrupted);
        assert_eq!(second_runs.load(Ordering::Relaxed), 0);
        drop(p);
        assert_eq!(ServiceCalls::get(&calls.stop_workers), 1);
        assert_eq!(ServiceCalls::get(&calls.shutdown), 1);
    }

    #[test]
    fn interrupt_error_inside_a_task_is_an_interrupt() {
        let ctx = ctx();
        let task = MockTask::new("a", &ctx, &log()).on_run(|_| Err(FlowError::Interrupted));
        let (mut p, calls) = pipeline(vec![Box::new(task)], &["a"], &ctx, ProcessContext::new());
        assert_eq!(p.run().unwrap(), PipelineOutcome::Interrupted);
        assert_eq!(ServiceCalls::get(&calls.shutdown), 1);
    }

    #[test]
    fn false_from_run_fails_the_pipeline() {
        let ctx = ctx();
        let log = log();
        let tasks: Vec<Box<dyn Task>> = vec![
            Box::new(MockTask::new("polyselect", &ctx, &log).failing()),
            Box::new(MockTask::new("sieve", &ctx, &log)),
        ];
        let (mut p, calls) = pipeline(tasks, &["polyselect", "sieve"], &ctx, ProcessContext::new());

        let outcome = p.run().unwrap();
        assert_eq!(
            outcome,
            PipelineOutcome::Failed {
                task: "polyselect".into(),
                reason: "premature exit within polyselect".into(),
            }
        );
        assert!(!outcome.is_success());
        assert_eq!(*log.lock().unwrap(), vec!["polyselect"]);
        assert_eq!(p.metrics().failures, 1);
        assert_eq!(ServiceCalls::get(&calls.shutdown), 1);
    }

    #[test]
    fn task_error_names_the_task() {
        let ctx = ctx();
        let task = MockTask::new("filter", &ctx, &log()).on_run(|_| {
            Err(FlowError::MissingInput {
                task: "filter".into(),
                key: "get_siever_filenames".into(),
            })
        });
        let (mut p, _) = pipeline(vec![Box::new(task)], &["filter"], &ctx, ProcessContext::new());
        match p.run().unwrap() {
            PipelineOutcome::Failed { task, reason } => {
                assert_eq!(task, "filter");
                assert!(reason.contains("get_siever_filenames"), "{reason}");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn failure_of_a_result_owner_names_the_owner() {
        let ctx = ctx();
        let log = log();
        let sieve = MockTask::new("sieve", &ctx, &log).rejecting_results();
        let filter = MockTask::new("filter", &ctx, &log).on_run(|bus| {
            bus.request("filter", RequestKey::GetWuResult, None)?;
            Ok(true)
        });
        let wus = ctx.store.workunits();
        ctx.store.set_serving(true).unwrap();
        wus.create("c60_sieve_1", Invocation::new("las", "las"), false).unwrap();
        wus.claim("c").unwrap();
        wus.record_result(CommandResult {
            wuid: "c60_sieve_1".into(),
            program: "las".into(),
            rc: 0,
            stdout: Output::Empty,
            stderr: Output::Empty,
            output_files: vec![],
            command_line: "las".into(),
            host: "localhost.0".into(),
            real_time: 0.0,
            cpu_time: 0.0,
        })
        .unwrap();

        let tasks: Vec<Box<dyn Task>> = vec![Box::new(sieve), Box::new(filter)];
        let (mut p, _) = pipeline(tasks, &["filter", "sieve"], &ctx, ProcessContext::new());
        match p.run().unwrap() {
            PipelineOutcome::Failed { task, reason } => {
                assert_eq!(task, "sieve");
                assert!(reason.contains("too many failed work units"), "{reason}");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn task_runs_again_after_announcing_readiness() {
        let ctx = ctx();
        let log = log();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let task = MockTask::new("sieve", &ctx, &log).on_run(move |bus| {
            if counter.fetch_add(1, Ordering::Relaxed) == 0 {
                bus.notify("sieve", Notification::WantToRun)?;
            }
            Ok(true)
        });
        let (mut p, _) = pipeline(vec![Box::new(task)], &["sieve"], &ctx, ProcessContext::new());
        assert_eq!(p.run().unwrap(), PipelineOutcome::Completed);
        assert_eq!(calls.load(Ordering::Relaxed), 2);
        assert_eq!(p.metrics().runs("sieve"), 2);
    }

    #[test]
    fn elapsed_time_accumulates_across_runs() {
        let ctx = ctx();
        let (mut p, _) = pipeline(vec![], &[], &ctx, ProcessContext::new());
        p.state.set("elapsed", 5.0f64, true).unwrap();

        p.run().unwrap();
        let after_first = p.elapsed().unwrap();
        assert!((5.0..6.0).contains(&after_first), "{after_first}");
        assert!(!p.state.contains("starttime").unwrap());

        p.run().unwrap();
        assert!(p.elapsed().unwrap() >= after_first);
        assert_eq!(p.total_cpu_time().unwrap(), 0.0);
    }

    #[test]
    fn order_must_match_the_tasks() {
        let ctx = ctx();
        let (services, _) = mock_services();
        let tasks: Vec<Box<dyn Task>> = vec![Box::new(MockTask::new("a", &ctx, &log()))];
        let m = Mediator::new(
            tasks,
            services,
            ctx.store.clone(),
            ctx.workdir.clone(),
            ProcessContext::new(),
        )
        .unwrap();
        let err = Pipeline::new(m, vec!["a".into(), "ghost".into()]).err().unwrap();
        assert!(matches!(err, FlowError::UnknownTask(ref t) if t == "ghost"));

        let (services, _) = mock_services();
        let tasks: Vec<Box<dyn Task>> = vec![Box::new(MockTask::new("a", &ctx, &log()))];
        let m = Mediator::new(
            tasks,
            services,
            ctx.store.clone(),
            ctx.workdir.clone(),
            ProcessContext::new(),
        )
        .unwrap();
        let err = Pipeline::new(m, vec![]).err().unwrap();
        assert!(matches!(err, FlowError::Config(_)));
    }
}
