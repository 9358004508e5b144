/// Core workflow type definitions
///
/// Defines workflows, their audit trail (revisions and comments), next-step
/// records and the shared next-step option definitions. These types are
/// serialized with camelCase keys for the HTTP layer and mapped row-by-row
/// in storage.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Current time truncated to the precision timestamps are stored at
///
/// Keeps in-memory values equal to what a later read returns, which the
/// conditioned updates in storage rely on.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// A case-management workflow moving through the approval gates
///
/// The approval state is not stored as a tag. It is derived from the
/// lifecycle timestamps by [`Workflow::status`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: String,
    #[serde(rename = "type")]
    pub workflow_type: WorkflowType,
    /// Form this workflow is filling in (e.g., "review-of-care-plan")
    pub form_id: String,
    /// Subject of the workflow in the social care system
    pub social_care_id: String,
    /// Answers given so far, keyed by step then question
    pub answers: Value,
    /// Workflow this one reviews, if any
    pub review_of: Option<String>,
    pub creator: Creator,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    pub submitted_at: Option<DateTime<Utc>>,
    pub submitted_by: Option<String>,
    pub manager_approved_at: Option<DateTime<Utc>>,
    pub manager_approved_by: Option<String>,
    pub needs_panel_approval: bool,
    pub panel_approved_at: Option<DateTime<Utc>>,
    pub panel_approved_by: Option<String>,
    pub discarded_at: Option<DateTime<Utc>>,
    pub discarded_by: Option<String>,
    pub held_at: Option<DateTime<Utc>>,

    pub assigned_to: Option<String>,
    pub team_assigned_to: Option<Team>,

    /// Next steps attached to this workflow, in creation order
    #[serde(default)]
    pub next_steps: Vec<NextStepRecord>,
}

impl Workflow {
    /// Next steps that have not fired yet, in creation order
    pub fn pending_next_steps(&self) -> impl Iterator<Item = &NextStepRecord> {
        self.next_steps.iter().filter(|step| step.triggered_at.is_none())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum WorkflowType {
    #[default]
    Assessment,
    Reassessment,
    Review,
}

impl WorkflowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowType::Assessment => "Assessment",
            WorkflowType::Reassessment => "Reassessment",
            WorkflowType::Review => "Review",
        }
    }
}

impl FromStr for WorkflowType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Assessment" => Ok(WorkflowType::Assessment),
            "Reassessment" => Ok(WorkflowType::Reassessment),
            "Review" => Ok(WorkflowType::Review),
            other => Err(format!("unknown workflow type: {}", other)),
        }
    }
}

/// Teams a workflow can be assigned to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Team {
    Access,
    Care,
    Review,
}

impl Team {
    pub fn as_str(&self) -> &'static str {
        match self {
            Team::Access => "Access",
            Team::Care => "Care",
            Team::Review => "Review",
        }
    }
}

impl FromStr for Team {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Access" => Ok(Team::Access),
            "Care" => Ok(Team::Care),
            "Review" => Ok(Team::Review),
            other => Err(format!("unknown team: {}", other)),
        }
    }
}

impl fmt::Display for Team {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The user who started a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Creator {
    pub email: String,
    pub team: Option<Team>,
}

/// The authenticated user performing an operation
///
/// Populated from the session forwarded by the authentication gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    pub email: String,
    pub team: Option<Team>,
    /// May grant manager approval
    pub approver: bool,
    /// May grant panel (QAM) authorisation
    pub panel_approver: bool,
}

/// Audit action taxonomy shared by revisions and comments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    Submitted,
    Approved,
    ReturnedForEdits,
    Authorised,
    Discarded,
    Held,
    Released,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Submitted => "Submitted",
            Action::Approved => "Approved",
            Action::ReturnedForEdits => "ReturnedForEdits",
            Action::Authorised => "Authorised",
            Action::Discarded => "Discarded",
            Action::Held => "Held",
            Action::Released => "Released",
        }
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Submitted" => Ok(Action::Submitted),
            "Approved" => Ok(Action::Approved),
            "ReturnedForEdits" => Ok(Action::ReturnedForEdits),
            "Authorised" => Ok(Action::Authorised),
            "Discarded" => Ok(Action::Discarded),
            "Held" => Ok(Action::Held),
            "Released" => Ok(Action::Released),
            other => Err(format!("unknown action: {}", other)),
        }
    }
}

/// Immutable audit entry appended on every transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Revision {
    pub id: String,
    pub workflow_id: String,
    pub action: Action,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    /// Answer deltas captured with the transition (often empty)
    pub answers: Value,
}

/// Free-text note attached to a transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: String,
    pub workflow_id: String,
    pub text: String,
    pub action: Action,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

/// A next step attached to a workflow
///
/// `triggered_at` is set at most once. After that the record is retired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextStepRecord {
    pub id: String,
    pub workflow_id: String,
    /// Key into the next-step catalog (may no longer resolve)
    pub next_step_option_id: String,
    pub triggered_at: Option<DateTime<Utc>>,
    /// Subject to start the follow-on workflow for, instead of the parent's
    pub alt_social_care_id: Option<String>,
    /// Handover note passed along with the notification
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Shared, read-only definition of a next step
///
/// Loaded from static configuration at startup. Records refer to it by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextStepOption {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Address to notify when the step fires
    #[serde(default)]
    pub email: Option<String>,
    /// Forms this option is offered on
    #[serde(default)]
    pub form_ids: Vec<String>,
    /// Form to start a new workflow with when the step fires
    #[serde(default)]
    pub workflow_to_start: Option<String>,
    /// Hold the step until the manager has approved
    #[serde(default)]
    pub wait_for_approval: bool,
    /// Hold the step until the panel has authorised
    #[serde(default)]
    pub wait_for_qam_authorisation: bool,
    /// Allow the spawned workflow to target a different subject
    #[serde(default)]
    pub create_for_different_person: bool,
    /// Allow a handover note on the record
    #[serde(default)]
    pub handover_note: bool,
}

/// Input for creating a workflow
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewWorkflow {
    pub form_id: String,
    pub social_care_id: String,
    #[serde(default, rename = "type")]
    pub workflow_type: WorkflowType,
    #[serde(default)]
    pub review_of: Option<String>,
    #[serde(default)]
    pub answers: Option<Value>,
}

/// Input for attaching a next step to a workflow
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewNextStep {
    pub next_step_option_id: String,
    #[serde(default)]
    pub alt_social_care_id: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
}
