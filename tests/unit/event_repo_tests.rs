//! Unit tests for the event log: sequencing, projection and replay.

use std::sync::Arc;

use serde_json::json;

use agent_session_runtime::models::approval::Decision;
use agent_session_runtime::models::event::{reconstruct, EventPayload};
use agent_session_runtime::models::message::{Message, ToolCall};
use agent_session_runtime::models::session::{PendingApproval, Session, SessionStatus};
use agent_session_runtime::persistence::db::{self, Database};
use agent_session_runtime::persistence::{
    approval_repo::ApprovalRepo, event_repo::EventRepo, session_repo::SessionRepo,
};
use agent_session_runtime::AppError;

async fn setup() -> (Arc<Database>, SessionRepo, EventRepo, String) {
    let db = Arc::new(db::connect_memory().await.expect("db"));
    let sessions = SessionRepo::new(Arc::clone(&db));
    let events = EventRepo::new(Arc::clone(&db));
    let session = sessions.create(&Session::new(None)).await.expect("create");
    (db, sessions, events, session.id)
}

fn status(status: SessionStatus) -> EventPayload {
    EventPayload::StatusChanged {
        status,
        pending_approval: None,
    }
}

#[tokio::test]
async fn sequence_numbers_are_gapless_from_zero() {
    let (_db, _sessions, events, id) = setup().await;

    for n in 0..5 {
        let event = events
            .append(
                &id,
                EventPayload::MessageAppended {
                    message: Message::user(format!("m{n}")),
                },
            )
            .await
            .expect("append");
        assert_eq!(event.seq, n + 1);
    }

    let seqs: Vec<u64> = events.list(&id).await.expect("list").iter().map(|e| e.seq).collect();
    assert_eq!(seqs, (0..6).collect::<Vec<_>>());
    assert_eq!(events.last_seq(&id).await.expect("last"), Some(5));
}

#[tokio::test]
async fn sequences_are_per_session() {
    let (db, sessions, events, first) = setup().await;
    let second = sessions.create(&Session::new(None)).await.expect("create").id;
    drop(db);

    events
        .append(&first, EventPayload::Error { message: "x".into() })
        .await
        .expect("append");
    let event = events
        .append(&second, EventPayload::Error { message: "y".into() })
        .await
        .expect("append");
    assert_eq!(event.seq, 1);
}

#[tokio::test]
async fn append_to_unknown_session_is_not_found() {
    let (_db, _sessions, events, _id) = setup().await;
    let result = events
        .append("missing", EventPayload::Error { message: "x".into() })
        .await;
    assert!(matches!(result, Err(AppError::NotFound(_))));
    assert_eq!(events.last_seq("missing").await.expect("last"), None);
}

#[tokio::test]
async fn invalid_transition_rolls_back_append() {
    let (_db, sessions, events, id) = setup().await;
    events
        .append(&id, status(SessionStatus::Completed))
        .await
        .expect("complete");

    let result = events.append(&id, status(SessionStatus::Active)).await;
    assert!(matches!(result, Err(AppError::InvalidTransition(_))));
    assert_eq!(events.last_seq(&id).await.expect("last"), Some(1));
    assert_eq!(
        sessions.get_status(&id).await.expect("status"),
        Some(SessionStatus::Completed)
    );
}

#[tokio::test]
async fn waiting_without_marker_is_rejected() {
    let (_db, _sessions, events, id) = setup().await;
    let result = events
        .append(&id, status(SessionStatus::WaitingApproval))
        .await;
    assert!(matches!(result, Err(AppError::InvalidTransition(_))));
}

#[tokio::test]
async fn decision_is_applied_once() {
    let (db, sessions, events, id) = setup().await;
    let call = ToolCall::new("drop_table", json!({"table": "users"}));
    let marker = PendingApproval::new(call.clone());
    events
        .append(
            &id,
            EventPayload::StatusChanged {
                status: SessionStatus::WaitingApproval,
                pending_approval: Some(marker.clone()),
            },
        )
        .await
        .expect("suspend");

    let decided = EventPayload::ApprovalDecided {
        approval_id: marker.approval_id.clone(),
        tool_call: call.clone(),
        decision: Decision::Approve,
        message: Message::user("approve: drop_table"),
    };

    // The request is still pending: nothing to apply yet.
    let early = events.append(&id, decided.clone()).await;
    assert!(matches!(early, Err(AppError::InvalidTransition(_))));

    ApprovalRepo::new(db)
        .record_decision(&marker.approval_id, Decision::Approve)
        .await
        .expect("record");
    events.append(&id, decided.clone()).await.expect("apply");
    assert_eq!(
        sessions.get_status(&id).await.expect("status"),
        Some(SessionStatus::Active)
    );

    // The session is active again, so a replayed decision is recorded as a
    // fresh approval and collides with the applied one.
    let again = events.append(&id, decided).await;
    assert!(again.is_err());
    assert_eq!(
        sessions.messages(&id).await.expect("messages").len(),
        1
    );
}

#[tokio::test]
async fn replay_pages_through_history() {
    let (_db, _sessions, events, id) = setup().await;
    for n in 0..9 {
        events
            .append(
                &id,
                EventPayload::MessageAppended {
                    message: Message::user(format!("m{n}")),
                },
            )
            .await
            .expect("append");
    }

    let mut replay = events.replay(&id, 3).page_size(2);
    let mut seqs = Vec::new();
    while let Some(event) = replay.next().await.expect("replay") {
        seqs.push(event.seq);
    }
    assert_eq!(seqs, (3..10).collect::<Vec<_>>());
    assert_eq!(replay.position(), 10);

    // Each replay is an independent read.
    let mut bounded = events.replay(&id, 0).until(Some(1));
    assert_eq!(bounded.next().await.expect("replay").map(|e| e.seq), Some(0));
    assert_eq!(bounded.next().await.expect("replay").map(|e| e.seq), Some(1));
    assert!(bounded.next().await.expect("replay").is_none());
}

#[tokio::test]
async fn projection_matches_reconstruction() {
    let (_db, sessions, events, id) = setup().await;
    let call = ToolCall::new("ls", json!({}));
    events
        .append(
            &id,
            EventPayload::MessageAppended {
                message: Message::assistant_with_calls("listing", vec![call.clone()]),
            },
        )
        .await
        .expect("append");
    events
        .append(
            &id,
            EventPayload::ToolResult {
                message: Message::tool_result(&call.id, "a b c"),
            },
        )
        .await
        .expect("append");
    events
        .append(&id, status(SessionStatus::Completed))
        .await
        .expect("append");

    let session = sessions.get_by_id(&id).await.expect("get").expect("exists");
    let rebuilt = reconstruct(&events.list(&id).await.expect("list"));
    assert_eq!(rebuilt.status, session.status);
    assert_eq!(rebuilt.messages, session.messages);
}

#[tokio::test]
async fn closed_pool_is_store_unavailable() {
    let (db, _sessions, events, id) = setup().await;
    db.close().await;

    let result = events
        .append(&id, EventPayload::Error { message: "x".into() })
        .await;
    assert!(matches!(result, Err(AppError::StoreUnavailable(_))));

    let mut replay = events.replay(&id, 0);
    assert!(matches!(
        replay.next().await,
        Err(AppError::StoreUnavailable(_))
    ));
}
