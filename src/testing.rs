/// Shared fixtures and recording fakes for unit tests

use crate::runtime::effects::{
    CaseRecordService, DeliveryError, Notification, NotificationKind, NotificationService,
};
use crate::workflow::{
    catalog::NextStepCatalog,
    storage::{SqliteWorkflowStore, WorkflowStore},
    types::{now, Actor, Creator, NewWorkflow, NextStepOption, Team, Workflow, WorkflowType},
};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Mutex;

pub fn creator() -> Creator {
    Creator {
        email: "foo.bar@hackney.gov.uk".to_string(),
        team: Some(Team::Access),
    }
}

/// A draft workflow that was never stored
pub fn workflow(id: &str) -> Workflow {
    let created_at = now();
    Workflow {
        id: id.to_string(),
        workflow_type: WorkflowType::Assessment,
        form_id: "mock-form".to_string(),
        social_care_id: "123".to_string(),
        answers: json!({}),
        review_of: None,
        creator: creator(),
        created_at,
        updated_at: created_at,
        submitted_at: None,
        submitted_by: None,
        manager_approved_at: None,
        manager_approved_by: None,
        needs_panel_approval: false,
        panel_approved_at: None,
        panel_approved_by: None,
        discarded_at: None,
        discarded_by: None,
        held_at: None,
        assigned_to: Some("foo.bar@hackney.gov.uk".to_string()),
        team_assigned_to: Some(Team::Access),
        next_steps: Vec::new(),
    }
}

pub fn new_workflow() -> NewWorkflow {
    NewWorkflow {
        form_id: "mock-form".to_string(),
        social_care_id: "123".to_string(),
        workflow_type: WorkflowType::Assessment,
        review_of: None,
        answers: None,
    }
}

pub async fn stored_workflow(store: &SqliteWorkflowStore) -> Workflow {
    store.create(new_workflow(), &creator()).await.unwrap()
}

pub fn worker() -> Actor {
    Actor {
        email: "foo.bar@hackney.gov.uk".to_string(),
        team: Some(Team::Access),
        approver: false,
        panel_approver: false,
    }
}

pub fn manager() -> Actor {
    Actor {
        email: "manager@hackney.gov.uk".to_string(),
        team: Some(Team::Access),
        approver: true,
        panel_approver: false,
    }
}

pub fn panel_member() -> Actor {
    Actor {
        email: "reviewer@x.org".to_string(),
        team: Some(Team::Review),
        approver: false,
        panel_approver: true,
    }
}

pub fn option(id: &str) -> NextStepOption {
    NextStepOption {
        id: id.to_string(),
        title: String::new(),
        description: String::new(),
        email: None,
        form_ids: vec!["mock-form".to_string()],
        workflow_to_start: None,
        wait_for_approval: false,
        wait_for_qam_authorisation: false,
        create_for_different_person: false,
        handover_note: false,
    }
}

/// Catalog mirroring the options used across the tests
pub fn catalog() -> NextStepCatalog {
    NextStepCatalog::from_options(vec![
        NextStepOption {
            email: Some("example@email.com".to_string()),
            workflow_to_start: Some("mock-form".to_string()),
            create_for_different_person: true,
            handover_note: true,
            wait_for_approval: true,
            ..option("email-and-workflow-on-approval")
        },
        option("on-approval-only"),
        NextStepOption {
            email: Some("example@email.com".to_string()),
            create_for_different_person: true,
            handover_note: true,
            ..option("email-only")
        },
        NextStepOption {
            workflow_to_start: Some("form-x".to_string()),
            wait_for_approval: true,
            ..option("start-form-x-on-approval")
        },
        NextStepOption {
            workflow_to_start: Some("form-x".to_string()),
            ..option("start-form-x")
        },
        NextStepOption {
            email: Some("panel-follow-up@hackney.gov.uk".to_string()),
            wait_for_qam_authorisation: true,
            ..option("email-on-authorisation")
        },
        NextStepOption {
            email: Some("broken@hackney.gov.uk".to_string()),
            ..option("email-to-broken-inbox")
        },
        NextStepOption {
            workflow_to_start: Some("form-x".to_string()),
            create_for_different_person: true,
            ..option("start-form-x-for-someone-else")
        },
    ])
    .unwrap()
}

/// A notification as seen by [`RecordingNotifier`]
#[derive(Debug, Clone, PartialEq)]
pub struct SentNotification {
    pub kind: NotificationKind,
    pub workflow_id: String,
    pub to: String,
    pub note: Option<String>,
}

/// Records every notification and fails for listed recipients
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<SentNotification>>,
    pub failing_recipients: Vec<String>,
}

impl RecordingNotifier {
    pub fn failing_for(recipient: &str) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            failing_recipients: vec![recipient.to_string()],
        }
    }

    pub fn sent(&self) -> Vec<SentNotification> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self, recipient: &str) -> usize {
        self.sent().iter().filter(|n| n.to == recipient).count()
    }
}

#[async_trait]
impl NotificationService for RecordingNotifier {
    async fn send(&self, notification: Notification<'_>) -> Result<(), DeliveryError> {
        if self.failing_recipients.iter().any(|r| r == notification.to) {
            return Err(DeliveryError::Rejected { status: 500 });
        }
        self.sent.lock().unwrap().push(SentNotification {
            kind: notification.kind,
            workflow_id: notification.workflow.id.clone(),
            to: notification.to.to_string(),
            note: notification.note.map(str::to_string),
        });
        Ok(())
    }
}

/// Records every case record write, optionally failing all of them
#[derive(Debug, Default)]
pub struct RecordingCaseRecorder {
    pub recorded: Mutex<Vec<String>>,
    pub fail: bool,
}

impl RecordingCaseRecorder {
    pub fn failing() -> Self {
        Self {
            recorded: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn calls(&self) -> usize {
        self.recorded.lock().unwrap().len()
    }
}

#[async_trait]
impl CaseRecordService for RecordingCaseRecorder {
    async fn record(&self, workflow: &Workflow) -> Result<(), DeliveryError> {
        self.recorded.lock().unwrap().push(workflow.id.clone());
        if self.fail {
            return Err(DeliveryError::Transport("case API unavailable".to_string()));
        }
        Ok(())
    }
}
