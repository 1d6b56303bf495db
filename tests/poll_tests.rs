
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use procflow::error::SchedulerError;
use procflow::scheduler::{
    create_scheduler, poll_until_terminal, JobState, PollOptions, SchedulerKind,
};
use procflow::transport::{CommandOutput, Transport};
use test_harness::MockTransport;

fn fast() -> PollOptions {
    PollOptions::default().with_interval(Duration::from_millis(10))
}

fn qstat(state: &str) -> CommandOutput {
    CommandOutput::new(0, format!("Job Id: 9.server\n    job_state = {}\n", state), "")
}

/// A job that leaves the queue is reported done.
#[tokio::test]
async fn test_poll_until_job_leaves_queue() {
    let transport = Arc::new(MockTransport::new().with_outputs(
        "qstat",
        vec![
            qstat("Q"),
            qstat("R"),
            CommandOutput::new(153, "", "qstat: Unknown Job Id 9.server"),
        ],
    ));
    let scheduler = create_scheduler(SchedulerKind::Torque, transport.clone() as Arc<dyn Transport>);

    let job = poll_until_terminal(scheduler.as_ref(), "9.server", &fast(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(job.job_id, "9.server");
    assert_eq!(job.job_state, JobState::Done);
    assert_eq!(transport.commands().len(), 3);
}

/// Undetermined is not terminal: polling goes on until a real state shows up.
#[tokio::test]
async fn test_poll_continues_through_undetermined() {
    let transport = Arc::new(MockTransport::new().with_outputs(
        "ps -xo",
        vec![
            CommandOutput::new(0, "  55 ?    alice  00:00:01\n", ""),
            CommandOutput::new(0, "  55 R    alice  00:00:02\n", ""),
            CommandOutput::new(0, "  55 Z    alice  00:00:03\n", ""),
        ],
    ));
    let scheduler = create_scheduler(SchedulerKind::Direct, transport.clone() as Arc<dyn Transport>);

    let job = poll_until_terminal(scheduler.as_ref(), "55", &fast(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(job.job_state, JobState::Done);
    assert_eq!(job.wallclock_time_seconds, Some(3));
    assert_eq!(transport.commands().len(), 3);
}

#[tokio::test]
async fn test_poll_times_out() {
    let transport = Arc::new(MockTransport::new().with_output("qstat", qstat("R")));
    let scheduler = create_scheduler(SchedulerKind::Pbspro, transport as Arc<dyn Transport>);
    let options = fast().with_timeout(Duration::from_millis(50));

    let err = poll_until_terminal(scheduler.as_ref(), "9.server", &options, &CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        SchedulerError::PollTimeout { job_id, elapsed } => {
            assert_eq!(job_id, "9.server");
            assert!(elapsed >= Duration::from_millis(50));
        }
        other => panic!("expected timeout, got {:?}", other),
    }
}

#[tokio::test]
async fn test_poll_observes_cancellation() {
    let transport = Arc::new(MockTransport::new().with_output("qstat", qstat("R")));
    let scheduler = create_scheduler(SchedulerKind::Pbspro, transport as Arc<dyn Transport>);
    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        canceller.cancel();
    });

    let options = PollOptions::default().with_interval(Duration::from_secs(60));
    let err = poll_until_terminal(scheduler.as_ref(), "9.server", &options, &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, SchedulerError::Cancelled(id) if id == "9.server"));
}

/// Listing failures end the poll instead of being retried.
#[tokio::test]
async fn test_poll_propagates_listing_errors() {
    let scheduler = create_scheduler(
        SchedulerKind::Direct,
        Arc::new(MockTransport::broken()) as Arc<dyn Transport>,
    );

    let err = poll_until_terminal(scheduler.as_ref(), "1", &fast(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, SchedulerError::Transport(_)));
}

/// A listing command that never answers does not hold up cancellation.
#[tokio::test]
async fn test_poll_cancels_hung_listing() {
    let transport = Arc::new(MockTransport::new().with_stall("qstat"));
    let scheduler = create_scheduler(SchedulerKind::Torque, transport.clone() as Arc<dyn Transport>);
    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        canceller.cancel();
    });

    let result = tokio::time::timeout(
        Duration::from_secs(2),
        poll_until_terminal(scheduler.as_ref(), "9.server", &fast(), &cancel),
    )
    .await
    .expect("poll did not observe cancellation");

    assert!(matches!(result, Err(SchedulerError::Cancelled(id)) if id == "9.server"));
    assert_eq!(transport.commands().len(), 1);
}
