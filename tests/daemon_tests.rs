
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::json;
use tokio_util::sync::CancellationToken;

use procflow::broker::{BroadcastFilter, Broker, InMemoryBroker};
use procflow::config::{DaemonConfig, ProfileContext, SchedulerConfig, TransportConfig, TransportKind};
use procflow::daemon::{
    CalcJobInputs, CalcJobProcess, Checkpoint, DaemonWorker, InMemoryPersister, LoadContext,
    ObjectLoader,
    Persister, Process, ProcessContext, ProcessFactory, ProcessState, Runner, CALCJOB_PROCESS_TYPE,
};
use procflow::error::{DaemonError, DeliveryError, ProcessError};
use procflow::scheduler::{create_scheduler, JobTemplate, PollOptions, SchedulerKind};
use procflow::transport::{CommandOutput, Transport};
use test_harness::{recording_broadcast, wait_until, Behaviour, CountingBroker, MockTransport, TestProcess};

fn daemon_config(max_tasks: usize, grace_ms: u64) -> DaemonConfig {
    DaemonConfig::default()
        .with_max_concurrent_tasks(max_tasks)
        .with_shutdown_grace(Duration::from_millis(grace_ms))
}

fn spawn_test_process(runner: &Runner, pid: u64, behaviour: Behaviour) -> Result<u64, DaemonError> {
    runner.spawn_process(
        Box::new(TestProcess { pid, behaviour }),
        Checkpoint::new(pid, "test", json!({})),
    )
}

fn test_loader(behaviour: Behaviour) -> ObjectLoader {
    let factory: ProcessFactory = Arc::new(move |checkpoint: &Checkpoint, _context: &LoadContext| {
        Ok(Box::new(TestProcess {
            pid: checkpoint.pid,
            behaviour,
        }) as Box<dyn Process>)
    });
    ObjectLoader::new().with_factory("test", factory)
}

fn test_profile(max_tasks: usize) -> Arc<ProfileContext> {
    Arc::new(ProfileContext::new("test").with_daemon(daemon_config(max_tasks, 1_000)))
}

// =============================================================================
// Runner
// =============================================================================

/// Shutdown cancels every task and closes the broker once, even when tasks
/// fail or panic on the way out. Interrupted processes stay resumable.
#[tokio::test]
async fn test_shutdown_cancels_all_tasks_and_closes_once() {
    let broker = Arc::new(CountingBroker::new());
    let persister = Arc::new(InMemoryPersister::new());
    let runner = Runner::new(broker.clone(), persister.clone(), &daemon_config(10, 1_000)).unwrap();

    for pid in 1..=3 {
        spawn_test_process(&runner, pid, Behaviour::WaitForCancel).unwrap();
    }
    spawn_test_process(&runner, 4, Behaviour::FailOnCancel).unwrap();
    spawn_test_process(&runner, 5, Behaviour::PanicOnCancel).unwrap();
    assert_eq!(runner.task_count(), 5);

    runner.shutdown().await;

    assert_eq!(runner.task_count(), 0);
    assert!(runner.is_closed());
    assert!(broker.is_closed());
    assert_eq!(broker.close_count(), 1);
    for pid in 1..=3 {
        assert_eq!(persister.load_checkpoint(pid).unwrap().state, ProcessState::Waiting);
    }
    assert_eq!(persister.load_checkpoint(4).unwrap().state, ProcessState::Excepted);

    runner.shutdown().await;
    runner.close();
    assert_eq!(broker.close_count(), 1);
}

/// Tasks that ignore cancellation are aborted once the grace period is over.
#[tokio::test]
async fn test_shutdown_aborts_after_grace_period() {
    let broker = Arc::new(CountingBroker::new());
    let runner = Runner::new(
        broker.clone(),
        Arc::new(InMemoryPersister::new()),
        &daemon_config(10, 50),
    )
    .unwrap();
    spawn_test_process(&runner, 1, Behaviour::Stubborn(Duration::from_secs(60))).unwrap();

    let started = Instant::now();
    runner.shutdown().await;

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(broker.close_count(), 1);
}

#[tokio::test]
async fn test_runner_refuses_work_when_closed_or_full() {
    let broker = Arc::new(CountingBroker::new());
    let runner = Runner::new(broker, Arc::new(InMemoryPersister::new()), &daemon_config(2, 100)).unwrap();

    spawn_test_process(&runner, 1, Behaviour::WaitForCancel).unwrap();
    runner
        .spawn("plain", |token: CancellationToken| async move { token.cancelled().await })
        .unwrap();
    assert!(matches!(
        spawn_test_process(&runner, 3, Behaviour::WaitForCancel),
        Err(DaemonError::AtCapacity(2))
    ));

    runner.shutdown().await;
    assert!(matches!(
        spawn_test_process(&runner, 4, Behaviour::Finish),
        Err(DaemonError::RunnerClosed)
    ));
}

/// Finished tasks free their slot.
#[tokio::test]
async fn test_finished_tasks_are_reaped() {
    let runner = Runner::new(
        Arc::new(CountingBroker::new()),
        Arc::new(InMemoryPersister::new()),
        &daemon_config(1, 100),
    )
    .unwrap();

    spawn_test_process(&runner, 1, Behaviour::Finish).unwrap();
    assert!(wait_until(Duration::from_secs(2), || runner.task_count() == 0).await);
    spawn_test_process(&runner, 2, Behaviour::Finish).unwrap();

    runner.shutdown().await;
}

// =============================================================================
// Daemon worker and launcher
// =============================================================================

/// Launch over the broker, then kill over RPC.
#[tokio::test]
async fn test_launch_and_kill_through_broker() {
    let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new(&ProfileContext::new("test")));
    let persister = Arc::new(InMemoryPersister::new());
    let worker = DaemonWorker::start(
        test_profile(10),
        broker.clone(),
        persister.clone(),
        test_loader(Behaviour::WaitForCancel),
    )
    .unwrap();

    let killed = Arc::new(Mutex::new(Vec::new()));
    broker
        .coordinator()
        .add_broadcast_subscriber(
            recording_broadcast(&killed),
            BroadcastFilter::new().with_subject("state_changed.*.killed").unwrap(),
            None,
        )
        .unwrap();

    let controller = worker.controller();
    let ack = controller
        .launch_process("test", json!({"x": 1}), false)
        .unwrap()
        .unwrap()
        .await
        .unwrap();
    let pid = ack["pid"].as_u64().unwrap();
    assert_eq!(worker.runner().task_count(), 1);

    let status = controller.process_status(pid).unwrap().await.unwrap();
    assert_eq!(status["state"], "running");

    let result = controller.kill_process(pid, Some("enough".to_string())).unwrap().await;
    assert_eq!(result.unwrap(), json!(true));

    assert!(
        wait_until(Duration::from_secs(2), || {
            persister
                .load_checkpoint(pid)
                .map(|c| c.state == ProcessState::Killed)
                .unwrap_or(false)
        })
        .await
    );
    assert!(wait_until(Duration::from_secs(2), || killed.lock().unwrap().len() == 1).await);
    assert_eq!(killed.lock().unwrap()[0].sender.as_deref(), Some(pid.to_string().as_str()));

    worker.shutdown().await;
    assert!(broker.is_closed());
}

/// A full worker rejects the task, so the sender learns nobody took it.
#[tokio::test]
async fn test_launcher_rejects_when_full() {
    let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new(&ProfileContext::new("test")));
    let worker = DaemonWorker::start(
        test_profile(1),
        broker.clone(),
        Arc::new(InMemoryPersister::new()),
        test_loader(Behaviour::WaitForCancel),
    )
    .unwrap();
    let controller = worker.controller();

    controller
        .launch_process("test", json!({}), false)
        .unwrap()
        .unwrap()
        .await
        .unwrap();
    let second = controller
        .launch_process("test", json!({}), false)
        .unwrap()
        .unwrap()
        .await;

    assert!(matches!(
        second,
        Err(DeliveryError::NoTaker {
            subscribers: 1,
            rejected: 1
        })
    ));
    worker.shutdown().await;
}

/// A launch whose process cannot be built leaves no checkpoint behind.
#[tokio::test]
async fn test_failed_launch_removes_checkpoint() {
    let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new(&ProfileContext::new("test")));
    let persister = Arc::new(InMemoryPersister::new());
    let worker = DaemonWorker::start(
        test_profile(10),
        broker,
        persister.clone(),
        ObjectLoader::with_builtin(),
    )
    .unwrap();

    let result = worker
        .controller()
        .launch_process(CALCJOB_PROCESS_TYPE, json!({}), false)
        .unwrap()
        .unwrap()
        .await;

    assert!(matches!(result, Err(DeliveryError::SubscriberFailed { .. })));
    assert!(persister.is_empty());
    worker.shutdown().await;
}

#[tokio::test]
async fn test_launcher_fails_on_unknown_pid_and_type() {
    let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new(&ProfileContext::new("test")));
    let worker = DaemonWorker::start(
        test_profile(10),
        broker,
        Arc::new(InMemoryPersister::new()),
        test_loader(Behaviour::Finish),
    )
    .unwrap();
    let controller = worker.controller();

    let unknown_pid = controller
        .continue_process(999, false, false)
        .unwrap()
        .unwrap()
        .await;
    let unknown_type = controller
        .launch_process("nope", json!({}), false)
        .unwrap()
        .unwrap()
        .await;

    assert!(matches!(unknown_pid, Err(DeliveryError::SubscriberFailed { .. })));
    assert!(matches!(unknown_type, Err(DeliveryError::SubscriberFailed { .. })));
    worker.shutdown().await;
}

/// Continuing an already terminated process does not run it again.
#[tokio::test]
async fn test_continue_terminated_process_is_acknowledged() {
    let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new(&ProfileContext::new("test")));
    let persister = Arc::new(InMemoryPersister::new());
    let mut checkpoint = Checkpoint::new(persister.next_pid(), "test", json!({}));
    checkpoint.transition(ProcessState::Finished);
    persister.save_checkpoint(&checkpoint).unwrap();
    let worker = DaemonWorker::start(
        test_profile(10),
        broker,
        persister,
        test_loader(Behaviour::WaitForCancel),
    )
    .unwrap();

    let ack = worker
        .controller()
        .continue_process(checkpoint.pid, true, false)
        .unwrap()
        .unwrap()
        .await
        .unwrap();

    assert_eq!(ack["state"], "finished");
    assert_eq!(worker.runner().task_count(), 0);
    worker.shutdown().await;
}

/// The worker serves until its shutdown token is cancelled.
#[tokio::test]
async fn test_worker_run_stops_on_shutdown_signal() {
    let broker = Arc::new(CountingBroker::new());
    let worker = DaemonWorker::start(
        test_profile(10),
        broker.clone(),
        Arc::new(InMemoryPersister::new()),
        test_loader(Behaviour::WaitForCancel),
    )
    .unwrap();
    worker
        .controller()
        .launch_process("test", json!({}), true)
        .unwrap();
    let shutdown = CancellationToken::new();

    let handle = tokio::spawn(worker.run(shutdown.clone()));
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(broker.close_count(), 1);
}

#[tokio::test]
async fn test_worker_start_failure_is_reported() {
    let profile = ProfileContext::new("broken").with_transport(TransportConfig {
        kind: TransportKind::Ssh,
        ..Default::default()
    });

    let result = DaemonWorker::start(
        Arc::new(profile),
        Arc::new(CountingBroker::new()),
        Arc::new(InMemoryPersister::new()),
        ObjectLoader::with_builtin(),
    );

    assert!(matches!(result, Err(DaemonError::Startup(_))));
}

// =============================================================================
// Calculation jobs
// =============================================================================

fn calcjob_context(pid: u64, cancel: CancellationToken, kill: CancellationToken) -> ProcessContext {
    let broker = InMemoryBroker::new(&ProfileContext::new("test"));
    ProcessContext {
        pid,
        cancel,
        kill,
        controller: broker.controller(),
    }
}

fn torque_profile() -> Arc<ProfileContext> {
    Arc::new(
        ProfileContext::new("cluster").with_scheduler(
            SchedulerConfig::new(SchedulerKind::Torque).with_poll_interval(Duration::from_millis(10)),
        ),
    )
}

fn calcjob(transport: Arc<MockTransport>, kind: SchedulerKind) -> Box<CalcJobProcess> {
    let inputs = CalcJobInputs {
        working_directory: "/work".to_string(),
        filename: "job.sh".to_string(),
        scheduler: Some(kind),
        template: None,
    };
    Box::new(CalcJobProcess::new(
        7,
        inputs,
        create_scheduler(kind, transport as Arc<dyn Transport>),
        PollOptions::default().with_interval(Duration::from_millis(10)),
    ))
}

#[tokio::test]
async fn test_calcjob_submits_and_waits_for_completion() {
    let transport = Arc::new(
        MockTransport::new()
            .with_output("qsub ", CommandOutput::new(0, "5.server\n", ""))
            .with_outputs(
                "qstat",
                vec![
                    CommandOutput::new(0, "Job Id: 5.server\n    job_state = R\n", ""),
                    CommandOutput::new(0, "Job Id: 5.server\n    job_state = C\n", ""),
                ],
            ),
    );

    let outputs = calcjob(transport.clone(), SchedulerKind::Torque)
        .step_until_terminated(calcjob_context(7, CancellationToken::new(), CancellationToken::new()))
        .await
        .unwrap();

    assert_eq!(outputs["job_id"], "5.server");
    assert_eq!(outputs["job_state"], "done");
    assert_eq!(transport.depth(), 0);
}

/// Killing a calculation kills the batch job.
#[tokio::test]
async fn test_calcjob_kills_job_on_cancellation() {
    let transport = Arc::new(
        MockTransport::new()
            .with_output("qsub ", CommandOutput::new(0, "5.server\n", ""))
            .with_output("qstat", CommandOutput::new(0, "Job Id: 5.server\n    job_state = Q\n", ""))
            .with_output("qdel ", CommandOutput::new(0, "", "")),
    );
    let cancel = CancellationToken::new();
    let kill = CancellationToken::new();
    let (canceller, killer) = (cancel.clone(), kill.clone());
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        killer.cancel();
        canceller.cancel();
    });

    let err = calcjob(transport.clone(), SchedulerKind::Pbspro)
        .step_until_terminated(calcjob_context(7, cancel, kill))
        .await
        .unwrap_err();

    assert!(matches!(err, ProcessError::Killed(_)));
    assert_eq!(transport.commands().last().unwrap(), "qdel '5.server'");
    assert_eq!(transport.depth(), 0);
}

#[tokio::test]
async fn test_calcjob_submission_failure_excepts() {
    let transport = Arc::new(MockTransport::new().with_output("qsub ", CommandOutput::new(1, "", "qsub: bad")));

    let err = calcjob(transport, SchedulerKind::Pbspro)
        .step_until_terminated(calcjob_context(7, CancellationToken::new(), CancellationToken::new()))
        .await
        .unwrap_err();

    assert!(matches!(err, ProcessError::Scheduler(_)));
}

/// A daemon shutdown leaves the batch job alone and the process can be
/// continued later without submitting again.
#[tokio::test]
async fn test_shutdown_leaves_job_running_and_resumes_polling() {
    let transport = Arc::new(
        MockTransport::new()
            .with_output("qsub ", CommandOutput::new(0, "5.server\n", ""))
            .with_output("qstat", CommandOutput::new(0, "Job Id: 5.server\n    job_state = R\n", ""))
            .with_output("qdel ", CommandOutput::new(0, "", "")),
    );
    let persister = Arc::new(InMemoryPersister::new());
    let runner = Runner::new(
        Arc::new(CountingBroker::new()),
        persister.clone(),
        &daemon_config(10, 1_000),
    )
    .unwrap();
    runner
        .spawn_process(
            calcjob(transport.clone(), SchedulerKind::Torque),
            Checkpoint::new(7, CALCJOB_PROCESS_TYPE, json!({})),
        )
        .unwrap();
    assert!(
        wait_until(Duration::from_secs(2), || {
            transport.commands().iter().any(|c| c.starts_with("qstat"))
        })
        .await
    );

    runner.shutdown().await;

    assert!(!transport.commands().iter().any(|c| c.starts_with("qdel")));
    let checkpoint = persister.load_checkpoint(7).unwrap();
    assert_eq!(checkpoint.state, ProcessState::Waiting);
    assert_eq!(checkpoint.resume.as_ref().unwrap()["job_id"], "5.server");

    let resumed_transport = Arc::new(MockTransport::new().with_output(
        "qstat",
        CommandOutput::new(0, "Job Id: 5.server\n    job_state = C\n", ""),
    ));
    let mut checkpoint = checkpoint;
    checkpoint.inputs = json!({ "working_directory": "/work", "filename": "job.sh" });
    let context = LoadContext {
        profile: torque_profile(),
        transport: resumed_transport.clone() as Arc<dyn Transport>,
    };
    let process = (CalcJobProcess::factory())(&checkpoint, &context).unwrap();
    let outputs = process
        .step_until_terminated(calcjob_context(7, CancellationToken::new(), CancellationToken::new()))
        .await
        .unwrap();

    assert_eq!(outputs["job_id"], "5.server");
    assert!(!resumed_transport.commands().iter().any(|c| c.starts_with("qsub")));
}

/// Stopping during a hung script upload neither submits nor waits for the upload.
#[tokio::test]
async fn test_calcjob_stops_during_hung_upload() {
    let transport = Arc::new(MockTransport::new().with_stall("printf"));
    let inputs = CalcJobInputs {
        working_directory: "/work".to_string(),
        filename: "job.sh".to_string(),
        scheduler: Some(SchedulerKind::Direct),
        template: Some(JobTemplate::new(vec!["true".to_string()])),
    };
    let process = Box::new(CalcJobProcess::new(
        7,
        inputs,
        create_scheduler(SchedulerKind::Direct, transport.clone() as Arc<dyn Transport>),
        PollOptions::default(),
    ));
    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        canceller.cancel();
    });

    let err = tokio::time::timeout(
        Duration::from_secs(2),
        process.step_until_terminated(calcjob_context(7, cancel, CancellationToken::new())),
    )
    .await
    .expect("upload was not interrupted")
    .unwrap_err();

    assert!(matches!(err, ProcessError::Interrupted { resume: None, .. }));
    let commands = transport.commands();
    assert_eq!(commands.len(), 1);
    assert!(commands[0].starts_with("printf"));
    assert_eq!(transport.depth(), 0);
}

/// Full path on this machine: launch a calculation through the daemon, the
/// script is rendered from its template, run with the direct scheduler and
/// the process finishes.
#[tokio::test]
async fn test_daemon_runs_calcjob_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let profile = Arc::new(
        ProfileContext::new("local")
            .with_daemon(daemon_config(4, 1_000))
            .with_scheduler(
                SchedulerConfig::new(SchedulerKind::Direct)
                    .with_poll_interval(Duration::from_millis(20))
                    .with_poll_timeout(Duration::from_secs(10)),
            ),
    );
    let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new(&profile));
    let persister = Arc::new(InMemoryPersister::new());
    let worker = DaemonWorker::start(
        profile,
        broker,
        persister.clone(),
        ObjectLoader::with_builtin(),
    )
    .unwrap();

    let inputs = CalcJobInputs {
        working_directory: dir.path().to_str().unwrap().to_string(),
        filename: "job.sh".to_string(),
        scheduler: None,
        template: Some(JobTemplate::new(vec!["echo \"it's done\" > result.txt".to_string()])),
    };
    let ack = worker
        .controller()
        .launch_process(CALCJOB_PROCESS_TYPE, serde_json::to_value(&inputs).unwrap(), false)
        .unwrap()
        .unwrap()
        .await
        .unwrap();
    let pid = ack["pid"].as_u64().unwrap();

    assert!(
        wait_until(Duration::from_secs(10), || {
            persister
                .load_checkpoint(pid)
                .map(|c| c.state.is_terminal())
                .unwrap_or(false)
        })
        .await
    );
    let checkpoint = persister.load_checkpoint(pid).unwrap();
    assert_eq!(checkpoint.state, ProcessState::Finished, "{:?}", checkpoint.error);
    assert_eq!(checkpoint.outputs.unwrap()["job_state"], "done");
    let result = std::fs::read_to_string(dir.path().join("result.txt")).unwrap();
    assert_eq!(result, "it's done\n");

    worker.shutdown().await;
}
