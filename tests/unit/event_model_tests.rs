//! Unit tests for event payload encoding and history reconstruction.

use chrono::Utc;
use serde_json::json;

use agent_session_runtime::models::approval::Decision;
use agent_session_runtime::models::event::{reconstruct, EndReason, Event, EventPayload};
use agent_session_runtime::models::message::{Message, Role, ToolCall};
use agent_session_runtime::models::session::{PendingApproval, SessionStatus};

fn event(seq: u64, payload: EventPayload) -> Event {
    Event {
        session_id: "sess-1".into(),
        seq,
        payload,
        created_at: Utc::now(),
    }
}

#[test]
fn payload_is_tagged_by_type() {
    let payload = EventPayload::StreamEnded {
        reason: EndReason::TimedOut,
    };
    let encoded = serde_json::to_value(&payload).expect("encode");
    assert_eq!(encoded, json!({"type": "stream_ended", "reason": "timed_out"}));
    assert_eq!(payload.kind(), "stream_ended");
}

#[test]
fn status_change_omits_absent_marker() {
    let payload = EventPayload::StatusChanged {
        status: SessionStatus::Completed,
        pending_approval: None,
    };
    let encoded = serde_json::to_value(&payload).expect("encode");
    assert_eq!(encoded, json!({"type": "status_changed", "status": "completed"}));
}

#[test]
fn message_carried_by_history_payloads_only() {
    let message = Message::assistant("hi");
    assert!(EventPayload::MessageAppended {
        message: message.clone()
    }
    .message()
    .is_some());
    assert!(EventPayload::ToolResult { message }.message().is_some());
    assert!(EventPayload::Error {
        message: "x".into()
    }
    .message()
    .is_none());
}

#[test]
fn reconstruct_empty_log_is_active() {
    let state = reconstruct(&[]);
    assert_eq!(state.status, SessionStatus::Active);
    assert!(state.messages.is_empty());
    assert!(state.pending_approval.is_none());
}

#[test]
fn reconstruct_follows_approval_cycle() {
    let call = ToolCall::new("delete_branch", json!({"name": "old"}));
    let marker = PendingApproval::new(call.clone());
    let decision = Message {
        tool_call_id: Some(call.id.clone()),
        ..Message::user("approve: delete_branch")
    };

    let mut events = vec![
        event(0, EventPayload::SessionCreated { title: None }),
        event(
            1,
            EventPayload::MessageAppended {
                message: Message::user("clean up"),
            },
        ),
        event(
            2,
            EventPayload::MessageAppended {
                message: Message::assistant_with_calls("", vec![call.clone()]),
            },
        ),
        event(
            3,
            EventPayload::ToolCallRequested {
                call: call.clone(),
                requires_approval: true,
            },
        ),
        event(
            4,
            EventPayload::StatusChanged {
                status: SessionStatus::WaitingApproval,
                pending_approval: Some(marker.clone()),
            },
        ),
    ];

    let waiting = reconstruct(&events);
    assert_eq!(waiting.status, SessionStatus::WaitingApproval);
    assert_eq!(waiting.pending_approval, Some(marker.clone()));

    events.push(event(
        5,
        EventPayload::ApprovalDecided {
            approval_id: marker.approval_id.clone(),
            tool_call: call.clone(),
            decision: Decision::Approve,
            message: decision,
        },
    ));
    events.push(event(
        6,
        EventPayload::ToolResult {
            message: Message::tool_result(&call.id, "deleted"),
        },
    ));
    events.push(event(
        7,
        EventPayload::StatusChanged {
            status: SessionStatus::Completed,
            pending_approval: None,
        },
    ));

    let done = reconstruct(&events);
    assert_eq!(done.status, SessionStatus::Completed);
    assert!(done.pending_approval.is_none());
    let roles: Vec<Role> = done.messages.iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![Role::User, Role::Assistant, Role::User, Role::Tool]
    );
}

#[test]
fn event_round_trips_through_json() {
    let original = event(
        3,
        EventPayload::Error {
            message: "cancelled: operator".into(),
        },
    );
    let encoded = serde_json::to_string(&original).expect("encode");
    let decoded: Event = serde_json::from_str(&encoded).expect("decode");
    assert_eq!(decoded, original);
}
