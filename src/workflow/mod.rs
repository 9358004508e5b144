/// Workflow Management Layer
///
/// This module holds the case-management workflow model and its persistence:
/// - Type definitions (Workflow, Revision, Comment, NextStepRecord, NextStepOption)
/// - Approval state derived from lifecycle timestamps
/// - SQLite persistence with conditioned updates
/// - The read-only next-step option catalog

// Core workflow type definitions
pub mod types;

// Tagged approval state and legal transitions
pub mod state;

// SQLite persistence layer for workflows, audit trail and next steps
pub mod storage;

// Static next-step option catalog
pub mod catalog;

// Re-export commonly used types
pub use catalog::NextStepCatalog;
pub use state::{ApprovalState, Operation, TransitionError, WorkflowStatus};
pub use storage::{SqliteWorkflowStore, StoreError, WorkflowStore};
pub use types::{Action, Actor, Creator, NextStepOption, NextStepRecord, Team, Workflow, WorkflowType};
