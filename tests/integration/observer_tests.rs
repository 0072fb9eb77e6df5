//! Integration tests for observer fan-out and replay.
//!
//! Validates:
//! - A feed attached mid-run sees exactly the stored log, with no gap or
//!   duplicate at the replay/live seam
//! - Detaching some observers does not change delivery to the others
//! - A slow observer is told how many events it missed and never blocks
//!   the execution
//! - Replay-only feeds end with the current status

use std::sync::Arc;

use agent_session_runtime::config::RuntimeConfig;
use agent_session_runtime::models::approval::Decision;
use agent_session_runtime::models::event::Event;
use agent_session_runtime::models::session::SessionStatus;
use agent_session_runtime::stream::FeedItem;

use super::test_helpers::{
    drain, events, new_session, next_item, test_runtime, test_runtime_with, wait_for_status,
    wait_released, ScriptedAgent, Step,
};

/// Gated first call holds the execution; the rest produce a burst of events.
fn burst_agent() -> ScriptedAgent {
    ScriptedAgent::new(vec![Step::Calls(vec![
        "deploy", "t1", "t2", "t3", "t4", "t5", "t6",
    ])])
    .gate("deploy")
}

fn owned(items: &[FeedItem]) -> Vec<Event> {
    events(items).into_iter().cloned().collect()
}

#[tokio::test]
async fn attached_feed_matches_stored_log() {
    let (runtime, _agent) = test_runtime(burst_agent()).await;
    let session = new_session(&runtime, "go").await;

    runtime.start(&session.id).await.expect("start");
    wait_for_status(&runtime, &session.id, SessionStatus::WaitingApproval).await;

    let feed = runtime.attach(&session.id, 0).await.expect("attach");
    assert!(feed.is_live());
    runtime
        .submit_decision(&session.id, Decision::Approve)
        .await
        .expect("decision");

    let items = drain(feed).await;
    let observed = owned(&items);
    let stored = runtime.events(&session.id).await.expect("events");
    assert_eq!(observed, stored);
    let seqs: Vec<u64> = observed.iter().map(|e| e.seq).collect();
    let count = u64::try_from(seqs.len()).unwrap();
    assert_eq!(seqs, (0..count).collect::<Vec<_>>());
}

#[tokio::test]
async fn attach_from_offset_skips_earlier_events() {
    let (runtime, _agent) = test_runtime(burst_agent()).await;
    let session = new_session(&runtime, "go").await;
    runtime.start(&session.id).await.expect("start");
    wait_for_status(&runtime, &session.id, SessionStatus::WaitingApproval).await;

    let feed = runtime.attach(&session.id, 3).await.expect("attach");
    runtime
        .submit_decision(&session.id, Decision::Approve)
        .await
        .expect("decision");
    let observed = owned(&drain(feed).await);

    let stored = runtime.events(&session.id).await.expect("events");
    assert_eq!(observed.first().map(|e| e.seq), Some(3));
    assert_eq!(observed, stored[3..].to_vec());
}

#[tokio::test]
async fn detaching_some_observers_leaves_others_intact() {
    let (runtime, _agent) = test_runtime(burst_agent()).await;
    let session = new_session(&runtime, "go").await;
    runtime.start(&session.id).await.expect("start");
    wait_for_status(&runtime, &session.id, SessionStatus::WaitingApproval).await;

    let mut feeds = Vec::new();
    for _ in 0..5 {
        feeds.push(runtime.attach(&session.id, 0).await.expect("attach"));
    }
    let hub = Arc::clone(
        runtime
            .supervisor()
            .live(&session.id)
            .expect("live")
            .hub(),
    );
    assert_eq!(hub.observer_count(), 5);

    // Two observers read a little, then leave; one detaches twice.
    let mut leaving: Vec<_> = feeds.drain(..2).collect();
    for feed in &mut leaving {
        assert!(matches!(next_item(feed).await, Some(FeedItem::Event(_))));
    }
    leaving[0].detach();
    leaving[0].detach();
    assert!(leaving[0].next().await.is_none());
    drop(leaving);
    assert_eq!(hub.observer_count(), 3);

    runtime
        .submit_decision(&session.id, Decision::Approve)
        .await
        .expect("decision");

    let mut drained = Vec::new();
    for feed in feeds {
        drained.push(drain(feed).await);
    }
    wait_released(&runtime, &session.id).await;

    let stored = runtime.events(&session.id).await.expect("events");
    for items in drained {
        assert_eq!(owned(&items), stored);
        assert_eq!(
            items.last(),
            Some(&FeedItem::End {
                status: SessionStatus::Completed
            })
        );
    }
}

#[tokio::test]
async fn slow_observer_gets_overflow_notice() {
    let config = RuntimeConfig {
        observer_buffer_size: 2,
        ..RuntimeConfig::default()
    };
    let (runtime, _agent) = test_runtime_with(config, burst_agent()).await;
    let session = new_session(&runtime, "go").await;
    runtime.start(&session.id).await.expect("start");
    wait_for_status(&runtime, &session.id, SessionStatus::WaitingApproval).await;

    let slow = runtime.attach(&session.id, 0).await.expect("attach");
    runtime
        .submit_decision(&session.id, Decision::Approve)
        .await
        .expect("decision");

    // The execution finishes while the observer reads nothing.
    wait_for_status(&runtime, &session.id, SessionStatus::Completed).await;
    wait_released(&runtime, &session.id).await;

    let items = drain(slow).await;
    let missed: u64 = items
        .iter()
        .filter_map(|item| match item {
            FeedItem::Overflow { missed } => Some(*missed),
            _ => None,
        })
        .sum();
    assert!(missed > 0, "expected an overflow notice: {items:?}");
    assert_eq!(
        items.last(),
        Some(&FeedItem::End {
            status: SessionStatus::Completed
        })
    );

    let stored = runtime.events(&session.id).await.expect("events");
    let delivered = u64::try_from(events(&items).len()).unwrap();
    assert_eq!(delivered + missed, u64::try_from(stored.len()).unwrap());

    let seqs: Vec<u64> = events(&items).iter().map(|e| e.seq).collect();
    assert!(seqs.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
async fn replay_only_feed_ends_with_status() {
    let (runtime, _agent) = test_runtime(ScriptedAgent::new(vec![Step::Reply("done")])).await;
    let session = new_session(&runtime, "go").await;
    drain(runtime.run(&session.id, None).await.expect("run").feed).await;
    wait_released(&runtime, &session.id).await;

    let feed = runtime.attach(&session.id, 0).await.expect("attach");
    assert!(!feed.is_live());
    let items = drain(feed).await;
    assert_eq!(
        owned(&items),
        runtime.events(&session.id).await.expect("events")
    );
    assert_eq!(
        items.last(),
        Some(&FeedItem::End {
            status: SessionStatus::Completed
        })
    );

    let past_end = runtime.attach(&session.id, 1_000).await.expect("attach");
    assert_eq!(
        drain(past_end).await,
        vec![FeedItem::End {
            status: SessionStatus::Completed
        }]
    );
}
