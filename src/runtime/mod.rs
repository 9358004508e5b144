/// Runtime layer
///
/// This module drives workflows through approval and fires what follows.
/// It handles:
/// - Capability-checked approval transitions with conditioned commits
/// - Concurrent, at-most-once next-step evaluation
/// - Notification and case-record delivery with bounded timeouts

// Approval transitions and their post-commit side effects
pub mod approval;

// Downstream notification and case-record services
pub mod effects;

// Fan-out evaluation of pending next steps
pub mod next_steps;

// Re-export main types
pub use approval::{ApprovalOutcome, ApprovalRequest, ApprovalStateMachine, Decision};
pub use effects::{CaseRecordService, NotificationService};
pub use next_steps::{EvaluationReport, NextStepOrchestrator, StepOutcome};
