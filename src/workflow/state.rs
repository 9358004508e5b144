/// Approval state derived from workflow timestamps
///
/// Workflows persist only lifecycle timestamps. This module turns them into a
/// tagged state, and decides which operations are legal from each state
/// without looking at anything else.

use crate::workflow::types::Workflow;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Position of a workflow on the approval ladder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum ApprovalState {
    Draft,
    Submitted,
    ManagerApproved {
        #[serde(rename = "needsPanel")]
        needs_panel: bool,
    },
    PanelApproved,
}

impl ApprovalState {
    /// No further approval is possible from here
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ApprovalState::PanelApproved | ApprovalState::ManagerApproved { needs_panel: false }
        )
    }
}

/// Approval state plus the hold and discard overlays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStatus {
    pub approval: ApprovalState,
    pub held: bool,
    pub discarded: bool,
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.approval {
            ApprovalState::Draft => write!(f, "draft")?,
            ApprovalState::Submitted => write!(f, "submitted")?,
            ApprovalState::ManagerApproved { needs_panel: true } => {
                write!(f, "manager approved, awaiting panel")?
            }
            ApprovalState::ManagerApproved { needs_panel: false } => write!(f, "manager approved")?,
            ApprovalState::PanelApproved => write!(f, "panel approved")?,
        }
        if self.held {
            write!(f, " (held)")?;
        }
        if self.discarded {
            write!(f, " (discarded)")?;
        }
        Ok(())
    }
}

/// Operations that move a workflow between states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Operation {
    Submit,
    ApproveAsManager { needs_panel: bool },
    AuthoriseAsPanel,
    ReturnForEdits,
    Discard,
    Hold,
    Release,
    /// Next steps only fire on later transitions, so the ladder must still be open
    AttachNextStep,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Submit => "submit",
            Operation::ApproveAsManager { .. } => "manager approval",
            Operation::AuthoriseAsPanel => "panel authorisation",
            Operation::ReturnForEdits => "return for edits",
            Operation::Discard => "discard",
            Operation::Hold => "hold",
            Operation::Release => "release",
            Operation::AttachNextStep => "attach a next step to",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    /// Timestamps break the ladder (panel approval without manager approval)
    #[error("workflow {workflow_id} is in an inconsistent state: panel approved without manager approval")]
    Inconsistent { workflow_id: String },

    #[error("cannot {operation} a workflow that is {status}")]
    Illegal {
        status: WorkflowStatus,
        operation: Operation,
    },
}

impl WorkflowStatus {
    /// Derive the status from the raw lifecycle timestamps
    pub fn from_timestamps(
        workflow_id: &str,
        submitted_at: Option<DateTime<Utc>>,
        manager_approved_at: Option<DateTime<Utc>>,
        needs_panel_approval: bool,
        panel_approved_at: Option<DateTime<Utc>>,
        held_at: Option<DateTime<Utc>>,
        discarded_at: Option<DateTime<Utc>>,
    ) -> Result<Self, TransitionError> {
        let approval = match (submitted_at, manager_approved_at, panel_approved_at) {
            (_, None, Some(_)) => {
                return Err(TransitionError::Inconsistent {
                    workflow_id: workflow_id.to_string(),
                })
            }
            (_, Some(_), Some(_)) => ApprovalState::PanelApproved,
            (_, Some(_), None) => ApprovalState::ManagerApproved {
                needs_panel: needs_panel_approval,
            },
            (Some(_), None, None) => ApprovalState::Submitted,
            (None, None, None) => ApprovalState::Draft,
        };

        Ok(Self {
            approval,
            held: held_at.is_some(),
            discarded: discarded_at.is_some(),
        })
    }

    /// Check `operation` against this status and return the status it leads to
    pub fn apply(&self, operation: Operation) -> Result<WorkflowStatus, TransitionError> {
        let illegal = || TransitionError::Illegal {
            status: *self,
            operation,
        };

        if self.discarded {
            return Err(illegal());
        }

        let mut next = *self;
        match (operation, self.approval) {
            (Operation::Submit, ApprovalState::Draft) => {
                next.approval = ApprovalState::Submitted;
            }
            (Operation::ApproveAsManager { needs_panel }, ApprovalState::Submitted) => {
                next.approval = ApprovalState::ManagerApproved { needs_panel };
            }
            (Operation::AuthoriseAsPanel, ApprovalState::ManagerApproved { needs_panel: true }) => {
                next.approval = ApprovalState::PanelApproved;
            }
            // Clearing submittedAt alongside managerApprovedAt lands back in draft
            (
                Operation::ReturnForEdits,
                ApprovalState::Submitted | ApprovalState::ManagerApproved { .. },
            ) => {
                next.approval = ApprovalState::Draft;
            }
            (Operation::Discard, approval) if !approval.is_terminal() => {
                next.discarded = true;
            }
            (Operation::Hold, approval) if !approval.is_terminal() && !self.held => {
                next.held = true;
            }
            (Operation::Release, _) if self.held => {
                next.held = false;
            }
            (Operation::AttachNextStep, approval) if !approval.is_terminal() => {}
            _ => return Err(illegal()),
        }

        Ok(next)
    }
}

impl Workflow {
    /// Derived approval status of this workflow
    pub fn status(&self) -> Result<WorkflowStatus, TransitionError> {
        WorkflowStatus::from_timestamps(
            &self.id,
            self.submitted_at,
            self.manager_approved_at,
            self.needs_panel_approval,
            self.panel_approved_at,
            self.held_at,
            self.discarded_at,
        )
    }
}
