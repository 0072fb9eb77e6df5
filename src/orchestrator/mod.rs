//! Execution orchestration: agent seam, approval gate, executions and their supervisor.

pub mod agent;
pub mod approval_gate;
pub mod execution;
pub mod supervisor;

pub use agent::{AgentFuture, AgentLogic, Turn};
pub use approval_gate::{ApprovalGate, DecisionOutcome};
pub use execution::{ExecutionHandle, RunOutcome, StopRequest};
pub use supervisor::{CancelOutcome, RecoveryReport, StartOutcome, Supervisor};
