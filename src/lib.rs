/// casegate: approval gates and next-step orchestration for case-management workflows
///
/// This library provides the approval state machine that walks a workflow
/// from submission through manager approval and optional panel authorisation,
/// and the orchestrator that fires each workflow's next steps exactly once.

// Core configuration and setup
pub mod config;

// Caller-facing errors and their HTTP mapping
pub mod error;

// Workflow model, derived approval state, persistence and next-step catalog
pub mod workflow;

// Approval transitions, next-step evaluation and downstream side effects
pub mod runtime;

// HTTP API layer - lifecycle and approval endpoints
pub mod api;

// Server setup and initialization
pub mod server;

#[cfg(test)]
mod testing;

// Re-export commonly used types for external consumers
pub use error::ApprovalError;
pub use runtime::{ApprovalStateMachine, EvaluationReport, NextStepOrchestrator};
pub use server::start_server;
pub use workflow::{Workflow, WorkflowStatus, WorkflowStore};
