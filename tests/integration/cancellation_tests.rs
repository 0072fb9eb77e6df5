//! Integration tests for cancellation and the run timeout.
//!
//! Validates:
//! - Cancelling a live execution yields terminal events and status `error`
//! - Cancelling a suspended execution cancels its approval request
//! - Cancelling a resumable session with no live execution finalizes it
//! - Cancelling a terminal session is a no-op
//! - Cancelling after a timeout or shutdown was requested still ends in `error`
//! - The run timeout ends active runs as `error` and leaves suspended ones waiting

use std::sync::Arc;

use agent_session_runtime::config::RuntimeConfig;
use agent_session_runtime::models::approval::{ApprovalStatus, Decision};
use agent_session_runtime::models::event::{EndReason, EventPayload};
use agent_session_runtime::models::session::SessionStatus;
use agent_session_runtime::orchestrator::{CancelOutcome, RunOutcome, StopRequest};
use agent_session_runtime::persistence::approval_repo::ApprovalRepo;
use agent_session_runtime::stream::FeedItem;
use agent_session_runtime::AppError;

use super::test_helpers::{
    drain, events, kinds, new_session, read_until, test_runtime, test_runtime_with,
    wait_released, ScriptedAgent, Step,
};

#[tokio::test]
async fn cancel_live_execution() {
    let (runtime, _agent) = test_runtime(ScriptedAgent::new(vec![Step::Hang])).await;
    let session = new_session(&runtime, "hi").await;

    let run = runtime.run(&session.id, None).await.expect("run");
    let outcome = runtime
        .cancel(&session.id, "operator request")
        .await
        .expect("cancel");
    let CancelOutcome::Signalled(handle) = outcome else {
        panic!("live execution must be signalled");
    };
    assert_eq!(handle.wait().await, RunOutcome::Cancelled);

    let items = drain(run.feed).await;
    assert_eq!(kinds(&items), vec!["status_changed", "error", "stream_ended"]);
    assert_eq!(
        events(&items)[1].payload,
        EventPayload::Error {
            message: "cancelled: operator request".into()
        }
    );
    assert_eq!(
        items.last(),
        Some(&FeedItem::End {
            status: SessionStatus::Error
        })
    );
    assert_eq!(runtime.supervisor().live_count(), 0);
}

#[tokio::test]
async fn cancel_suspended_execution() {
    let agent = ScriptedAgent::new(vec![Step::Calls(vec!["deploy"])]).gate("deploy");
    let (runtime, agent) = test_runtime(agent).await;
    let session = new_session(&runtime, "ship it").await;

    let mut run = runtime.run(&session.id, None).await.expect("run");
    read_until(&mut run.feed, "status_changed").await;
    let marker = runtime
        .session(&session.id)
        .await
        .expect("session")
        .pending_approval
        .expect("marker");

    runtime.cancel(&session.id, "abandoned").await.expect("cancel");
    let items = drain(run.feed).await;
    assert_eq!(kinds(&items), vec!["status_changed", "error", "stream_ended"]);

    let stored = runtime.session(&session.id).await.expect("session");
    assert_eq!(stored.status, SessionStatus::Error);
    assert!(stored.pending_approval.is_none());
    let request = ApprovalRepo::new(Arc::clone(runtime.db()))
        .get_by_id(&marker.approval_id)
        .await
        .expect("query")
        .expect("exists");
    assert_eq!(request.status, ApprovalStatus::Cancelled);

    let late = runtime.submit_decision(&session.id, Decision::Approve).await;
    assert!(matches!(late, Err(AppError::NoPendingApproval(_))));
    assert!(agent.invocations().is_empty());
}

#[tokio::test]
async fn cancel_without_live_execution_finalizes() {
    let (runtime, _agent) = test_runtime(ScriptedAgent::new(vec![Step::Hang])).await;
    let session = new_session(&runtime, "never run").await;

    let outcome = runtime.cancel(&session.id, "cleanup").await.expect("cancel");
    let CancelOutcome::Signalled(handle) = outcome else {
        panic!("resumable session must be finalized");
    };
    assert_eq!(handle.wait().await, RunOutcome::Cancelled);
    wait_released(&runtime, &session.id).await;

    let stored = runtime.session(&session.id).await.expect("session");
    assert_eq!(stored.status, SessionStatus::Error);
    let log = runtime.events(&session.id).await.expect("events");
    assert_eq!(
        log.last().map(|e| e.payload.clone()),
        Some(EventPayload::StreamEnded {
            reason: EndReason::Cancelled
        })
    );
}

#[tokio::test]
async fn cancel_terminal_session_is_a_noop() {
    let (runtime, _agent) = test_runtime(ScriptedAgent::new(vec![])).await;
    let session = new_session(&runtime, "hi").await;
    drain(runtime.run(&session.id, None).await.expect("run").feed).await;
    let before = runtime.events(&session.id).await.expect("events").len();

    let outcome = runtime.cancel(&session.id, "late").await.expect("cancel");
    assert!(matches!(
        outcome,
        CancelOutcome::Terminal(SessionStatus::Completed)
    ));
    assert_eq!(
        runtime.events(&session.id).await.expect("events").len(),
        before
    );
}

#[tokio::test]
async fn run_timeout_fails_active_run() {
    let config = RuntimeConfig {
        run_timeout_seconds: 1,
        ..RuntimeConfig::default()
    };
    let (runtime, _agent) = test_runtime_with(config, ScriptedAgent::new(vec![Step::Hang])).await;
    let session = new_session(&runtime, "hi").await;

    let run = runtime.run(&session.id, None).await.expect("run");
    let handle = run.outcome.handle().cloned().expect("started");
    let items = drain(run.feed).await;

    assert_eq!(handle.wait().await, RunOutcome::TimedOut);
    assert_eq!(
        events(&items).last().map(|e| e.payload.clone()),
        Some(EventPayload::StreamEnded {
            reason: EndReason::TimedOut
        })
    );
    assert_eq!(
        runtime.session(&session.id).await.expect("session").status,
        SessionStatus::Error
    );
}

#[tokio::test]
async fn run_timeout_keeps_suspended_session_waiting() {
    let config = RuntimeConfig {
        run_timeout_seconds: 1,
        ..RuntimeConfig::default()
    };
    let agent = ScriptedAgent::new(vec![Step::Calls(vec!["deploy"])]).gate("deploy");
    let (runtime, _agent) = test_runtime_with(config, agent).await;
    let session = new_session(&runtime, "ship it").await;

    let run = runtime.run(&session.id, None).await.expect("run");
    let handle = run.outcome.handle().cloned().expect("started");
    let items = drain(run.feed).await;

    assert_eq!(handle.wait().await, RunOutcome::TimedOut);
    assert_eq!(
        items.last(),
        Some(&FeedItem::End {
            status: SessionStatus::WaitingApproval
        })
    );
    let stored = runtime.session(&session.id).await.expect("session");
    assert_eq!(stored.status, SessionStatus::WaitingApproval);
    assert!(stored.pending_approval.is_some());
}

#[tokio::test]
async fn cancel_overrides_pending_timeout() {
    let agent = ScriptedAgent::new(vec![Step::Calls(vec!["deploy"])]).gate("deploy");
    let (runtime, agent) = test_runtime(agent).await;
    let session = new_session(&runtime, "ship it").await;

    let mut run = runtime.run(&session.id, None).await.expect("run");
    let first = run.outcome.handle().cloned().expect("started");
    read_until(&mut run.feed, "status_changed").await;

    assert!(first.request_stop(StopRequest::TimedOut));
    let outcome = runtime.cancel(&session.id, "operator request").await.expect("cancel");
    let CancelOutcome::Signalled(handle) = outcome else {
        panic!("suspended session must be signalled");
    };
    assert_eq!(handle.wait().await, RunOutcome::Cancelled);
    wait_released(&runtime, &session.id).await;

    let stored = runtime.session(&session.id).await.expect("session");
    assert_eq!(stored.status, SessionStatus::Error);
    assert!(stored.pending_approval.is_none());
    let log = runtime.events(&session.id).await.expect("events");
    assert_eq!(
        log.last().map(|e| e.payload.clone()),
        Some(EventPayload::StreamEnded {
            reason: EndReason::Cancelled
        })
    );
    assert!(agent.invocations().is_empty());
}

#[tokio::test]
async fn cancel_after_shutdown_stop_finalizes_session() {
    let agent = ScriptedAgent::new(vec![Step::Calls(vec!["deploy"])]).gate("deploy");
    let (runtime, _agent) = test_runtime(agent).await;
    let session = new_session(&runtime, "ship it").await;

    let mut run = runtime.run(&session.id, None).await.expect("run");
    let first = run.outcome.handle().cloned().expect("started");
    read_until(&mut run.feed, "status_changed").await;

    assert!(first.request_stop(StopRequest::Shutdown));
    assert_eq!(first.wait().await, RunOutcome::Shutdown);
    assert!(!first.request_stop(StopRequest::Cancel {
        reason: "too late".into()
    }));

    let outcome = runtime.cancel(&session.id, "abandoned").await.expect("cancel");
    let CancelOutcome::Signalled(handle) = outcome else {
        panic!("resumable session must be finalized");
    };
    assert_eq!(handle.wait().await, RunOutcome::Cancelled);
    assert_eq!(
        runtime.session(&session.id).await.expect("session").status,
        SessionStatus::Error
    );
}
