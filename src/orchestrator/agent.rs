//! Seam between the runtime and the agent logic that decides what to do next.
//!
//! The runtime owns scheduling, persistence and approval; an [`AgentLogic`]
//! implementation only turns a session snapshot into the next turn and runs
//! tool calls it is asked to run.

use std::future::Future;
use std::pin::Pin;

use crate::models::message::ToolCall;
use crate::models::session::Session;
use crate::Result;

/// Boxed future returned by [`AgentLogic`] methods.
pub type AgentFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Outcome of one model turn.
#[derive(Debug, Clone, PartialEq)]
pub enum Turn {
    /// Plain assistant message; the session continues.
    Reply {
        /// Message text.
        content: String,
    },
    /// Assistant message requesting tool invocations, processed in order.
    ToolCalls {
        /// Accompanying message text.
        content: String,
        /// Requested calls.
        calls: Vec<ToolCall>,
    },
    /// Nothing left to do; the session completes.
    Finished,
}

/// Agent behaviour driven by an execution.
pub trait AgentLogic: Send + Sync {
    /// Produce the next turn for the session's current history.
    ///
    /// # Errors
    ///
    /// Any error is fatal for the execution and moves the session to `error`.
    fn next_turn<'a>(&'a self, session: &'a Session) -> AgentFuture<'a, Turn>;

    /// Whether `call` must pass the approval gate before it runs.
    fn requires_approval(&self, call: &ToolCall) -> bool;

    /// Run an approved or ungated tool call and return its textual result.
    ///
    /// # Errors
    ///
    /// Any error is fatal for the execution and moves the session to `error`.
    fn invoke_tool<'a>(&'a self, session_id: &'a str, call: &'a ToolCall)
        -> AgentFuture<'a, String>;
}
