/// Approval state machine
///
/// Validates the actor's capability, checks the transition against the
/// derived workflow state, commits the change with its audit trail through a
/// conditioned store update, and only then runs the side effects the
/// transition unlocks: case records, notifications and next-step evaluation.
/// Side-effect failures are logged and never undo the committed transition.

use crate::error::{ApprovalError, Capability};
use crate::runtime::effects::{
    with_timeout, CaseRecordService, Notification, NotificationKind, NotificationService,
};
use crate::runtime::next_steps::{EvaluationReport, NextStepOrchestrator};
use crate::workflow::{
    state::{ApprovalState, Operation, TransitionError},
    storage::{
        Audit, NewComment, NewRevision, Patch, StateGuard, StoreError, WorkflowChanges, WorkflowStore,
    },
    types::{now, Action, Actor, Team, Workflow},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{sync::Arc, time::Duration};

/// Attempts at a conditioned update before a conflict is reported
const MAX_COMMIT_ATTEMPTS: usize = 3;

/// Manager's decision on a submitted workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    /// Approve with no panel review
    Approve,
    /// Approve and send on to a panel (QAM) approver
    ApproveWithQam,
}

/// Body of an approval request
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    #[serde(default, alias = "decision")]
    pub action: Option<Decision>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub panel_approver_email: Option<String>,
}

/// A committed transition and what the next-step evaluation did with it
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalOutcome {
    pub workflow: Workflow,
    /// None when the transition does not evaluate next steps
    pub next_steps: Option<EvaluationReport>,
}

pub struct ApprovalStateMachine {
    store: Arc<dyn WorkflowStore>,
    notifier: Arc<dyn NotificationService>,
    case_records: Arc<dyn CaseRecordService>,
    orchestrator: Arc<NextStepOrchestrator>,
    base_url: String,
    effect_timeout: Duration,
}

fn non_empty(text: Option<&str>) -> Option<String> {
    text.map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

fn revision(action: Action, actor: &Actor) -> Option<NewRevision> {
    Some(NewRevision {
        action,
        created_by: actor.email.clone(),
        answers: json!({}),
    })
}

fn comment(action: Action, actor: &Actor, text: Option<String>) -> Option<NewComment> {
    text.map(|text| NewComment {
        action,
        created_by: actor.email.clone(),
        text,
    })
}

impl ApprovalStateMachine {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        notifier: Arc<dyn NotificationService>,
        case_records: Arc<dyn CaseRecordService>,
        orchestrator: Arc<NextStepOrchestrator>,
        base_url: String,
        effect_timeout: Duration,
    ) -> Self {
        Self {
            store,
            notifier,
            case_records,
            orchestrator,
            base_url,
            effect_timeout,
        }
    }

    /// Single-endpoint approval
    ///
    /// Dispatches on the workflow's current state: a submitted workflow gets
    /// manager approval, a manager-approved one awaiting panel review gets
    /// panel authorisation. Anything else is an illegal transition.
    pub async fn request_approval(
        &self,
        workflow_id: &str,
        actor: &Actor,
        request: ApprovalRequest,
    ) -> Result<ApprovalOutcome, ApprovalError> {
        let workflow = self.store.get(workflow_id).await?;

        // The gate the caller is aiming at decides which capability is checked first
        let (capable, capability) = if workflow.manager_approved_at.is_some() {
            (actor.panel_approver, Capability::PanelApprover)
        } else {
            (actor.approver, Capability::Approver)
        };
        if !capable {
            return Err(ApprovalError::Unauthorized(capability));
        }

        let status = workflow.status()?;
        match status.approval {
            ApprovalState::ManagerApproved { needs_panel: true } => {
                self.authorise_as_panel(workflow_id, actor, request.comment).await
            }
            ApprovalState::Submitted => self.approve_as_manager(workflow_id, actor, request).await,
            _ => {
                let operation = if workflow.manager_approved_at.is_some() {
                    Operation::AuthoriseAsPanel
                } else {
                    Operation::ApproveAsManager { needs_panel: false }
                };
                Err(TransitionError::Illegal { status, operation }.into())
            }
        }
    }

    /// Manager approval of a submitted workflow
    pub async fn approve_as_manager(
        &self,
        workflow_id: &str,
        actor: &Actor,
        request: ApprovalRequest,
    ) -> Result<ApprovalOutcome, ApprovalError> {
        if !actor.approver {
            return Err(ApprovalError::Unauthorized(Capability::Approver));
        }

        // No action means a plain approval
        let needs_panel = request.action == Some(Decision::ApproveWithQam);
        let panel_approver = non_empty(request.panel_approver_email.as_deref());
        if needs_panel && panel_approver.is_none() {
            return Err(ApprovalError::Validation(
                "a panel approver is required when approving with QAM".to_string(),
            ));
        }
        let panel_approver = panel_approver.filter(|_| needs_panel);
        let note = non_empty(request.comment.as_deref());

        let workflow = self
            .commit(workflow_id, Operation::ApproveAsManager { needs_panel }, |_| {
                (
                    WorkflowChanges {
                        manager_approved_at: Patch::Set(now()),
                        manager_approved_by: Patch::Set(actor.email.clone()),
                        needs_panel_approval: Some(needs_panel),
                        assigned_to: Patch::from_option(panel_approver.clone()),
                        ..Default::default()
                    },
                    Audit {
                        revision: revision(Action::Approved, actor),
                        comment: comment(Action::Approved, actor, note.clone()),
                    },
                )
            })
            .await?;

        tracing::info!(
            "👍 Workflow {} approved by manager {} (panel review: {})",
            workflow.id,
            actor.email,
            needs_panel
        );

        if !workflow.needs_panel_approval {
            self.record_case(&workflow).await;
        }

        if let Some(panel_approver) = &panel_approver {
            self.notify(NotificationKind::ApprovalRequested, &workflow, panel_approver, None)
                .await;
        }

        let report = self.orchestrator.evaluate(&workflow).await;
        self.finish(workflow, Some(report)).await
    }

    /// Panel (QAM) authorisation of a manager-approved workflow
    pub async fn authorise_as_panel(
        &self,
        workflow_id: &str,
        actor: &Actor,
        comment_text: Option<String>,
    ) -> Result<ApprovalOutcome, ApprovalError> {
        if !actor.panel_approver {
            return Err(ApprovalError::Unauthorized(Capability::PanelApprover));
        }

        let note = non_empty(comment_text.as_deref());

        let workflow = self
            .commit(workflow_id, Operation::AuthoriseAsPanel, |_| {
                (
                    WorkflowChanges {
                        panel_approved_at: Patch::Set(now()),
                        panel_approved_by: Patch::Set(actor.email.clone()),
                        assigned_to: Patch::Clear,
                        team_assigned_to: Patch::Set(Team::Review),
                        ..Default::default()
                    },
                    Audit {
                        revision: revision(Action::Authorised, actor),
                        comment: comment(Action::Authorised, actor, note.clone()),
                    },
                )
            })
            .await?;

        tracing::info!("🏛️ Workflow {} authorised by panel approver {}", workflow.id, actor.email);

        // Reaching this point completes the approval ladder
        self.record_case(&workflow).await;

        let report = self.orchestrator.evaluate(&workflow).await;
        self.finish(workflow, Some(report)).await
    }

    /// Send a workflow back to its submitter
    ///
    /// Clears manager approval and submission so the workflow is editable
    /// again. Nothing becomes newly eligible, so next steps are not evaluated.
    pub async fn return_for_edits(
        &self,
        workflow_id: &str,
        actor: &Actor,
        comment_text: Option<String>,
    ) -> Result<ApprovalOutcome, ApprovalError> {
        if !actor.approver && !actor.panel_approver {
            return Err(ApprovalError::Unauthorized(Capability::ApproverOrPanelApprover));
        }

        let reason = non_empty(comment_text.as_deref()).ok_or_else(|| {
            ApprovalError::Validation("a comment is required when returning for edits".to_string())
        })?;

        let workflow = self
            .commit(workflow_id, Operation::ReturnForEdits, |current| {
                (
                    WorkflowChanges {
                        manager_approved_at: Patch::Clear,
                        submitted_at: Patch::Clear,
                        assigned_to: Patch::from_option(current.submitted_by.clone()),
                        ..Default::default()
                    },
                    Audit {
                        revision: revision(Action::ReturnedForEdits, actor),
                        comment: comment(Action::ReturnedForEdits, actor, Some(reason.clone())),
                    },
                )
            })
            .await?;

        tracing::info!("↩️ Workflow {} returned for edits by {}", workflow.id, actor.email);

        match workflow.assigned_to.clone() {
            Some(submitter) => {
                self.notify(
                    NotificationKind::ReturnedForEdits,
                    &workflow,
                    &submitter,
                    Some(&reason),
                )
                .await;
            }
            None => tracing::warn!("⚠️ Workflow {} has no submitter to notify", workflow.id),
        }

        self.finish(workflow, None).await
    }

    /// Submit a draft for manager approval
    pub async fn submit(
        &self,
        workflow_id: &str,
        actor: &Actor,
        approver_email: Option<String>,
    ) -> Result<ApprovalOutcome, ApprovalError> {
        let approver = non_empty(approver_email.as_deref());

        let workflow = self
            .commit(workflow_id, Operation::Submit, |_| {
                (
                    WorkflowChanges {
                        submitted_at: Patch::Set(now()),
                        submitted_by: Patch::Set(actor.email.clone()),
                        assigned_to: Patch::from_option(approver.clone()),
                        ..Default::default()
                    },
                    Audit {
                        revision: revision(Action::Submitted, actor),
                        comment: None,
                    },
                )
            })
            .await?;

        tracing::info!("📨 Workflow {} submitted by {}", workflow.id, actor.email);

        if let Some(approver) = &approver {
            self.notify(NotificationKind::ApprovalRequested, &workflow, approver, None)
                .await;
        }

        let report = self.orchestrator.evaluate(&workflow).await;
        self.finish(workflow, Some(report)).await
    }

    /// Discard a workflow. Only its creator or an approver may do this.
    pub async fn discard(&self, workflow_id: &str, actor: &Actor) -> Result<ApprovalOutcome, ApprovalError> {
        let current = self.store.get(workflow_id).await?;
        if !actor.approver && current.creator.email != actor.email {
            return Err(ApprovalError::Unauthorized(Capability::CreatorOrApprover));
        }

        let workflow = self
            .commit(workflow_id, Operation::Discard, |_| {
                (
                    WorkflowChanges {
                        discarded_at: Patch::Set(now()),
                        discarded_by: Patch::Set(actor.email.clone()),
                        ..Default::default()
                    },
                    Audit {
                        revision: revision(Action::Discarded, actor),
                        comment: None,
                    },
                )
            })
            .await?;

        tracing::info!("🗑️ Workflow {} discarded by {}", workflow.id, actor.email);
        self.finish(workflow, None).await
    }

    /// Put a workflow on hold
    pub async fn hold(&self, workflow_id: &str, actor: &Actor) -> Result<ApprovalOutcome, ApprovalError> {
        self.toggle_hold(workflow_id, actor, Operation::Hold).await
    }

    /// Take a workflow off hold
    pub async fn release(&self, workflow_id: &str, actor: &Actor) -> Result<ApprovalOutcome, ApprovalError> {
        self.toggle_hold(workflow_id, actor, Operation::Release).await
    }

    async fn toggle_hold(
        &self,
        workflow_id: &str,
        actor: &Actor,
        operation: Operation,
    ) -> Result<ApprovalOutcome, ApprovalError> {
        if !actor.approver {
            return Err(ApprovalError::Unauthorized(Capability::Approver));
        }

        let (held_at, action) = match operation {
            Operation::Hold => (Patch::Set(now()), Action::Held),
            _ => (Patch::Clear, Action::Released),
        };

        let workflow = self
            .commit(workflow_id, operation, |_| {
                (
                    WorkflowChanges {
                        held_at: held_at.clone(),
                        ..Default::default()
                    },
                    Audit {
                        revision: revision(action, actor),
                        comment: None,
                    },
                )
            })
            .await?;

        tracing::info!("✋ Workflow {}: {} by {}", workflow.id, operation, actor.email);
        self.finish(workflow, None).await
    }

    /// Validate `operation` against the latest state and apply it with a guarded update
    ///
    /// A lost race re-reads the workflow and validates again, so a transition
    /// that became illegal meanwhile is rejected instead of overwriting.
    async fn commit<F>(
        &self,
        workflow_id: &str,
        operation: Operation,
        build: F,
    ) -> Result<Workflow, ApprovalError>
    where
        F: Fn(&Workflow) -> (WorkflowChanges, Audit),
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let current = self.store.get(workflow_id).await?;
            let status = current.status()?;
            let next = status.apply(operation)?;

            let (changes, audit) = build(&current);
            match self
                .store
                .update(workflow_id, &StateGuard::of(&current), changes, audit)
                .await
            {
                Ok(updated) => {
                    tracing::debug!("💾 Workflow {}: {} -> {}", workflow_id, status, next);
                    return Ok(updated);
                }
                Err(StoreError::Conflict(_)) if attempt < MAX_COMMIT_ATTEMPTS => {
                    tracing::warn!(
                        "🔁 Workflow {} changed during {} (attempt {}), re-reading",
                        workflow_id,
                        operation,
                        attempt
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn notify(&self, kind: NotificationKind, workflow: &Workflow, to: &str, note: Option<&str>) {
        let notification = Notification {
            kind,
            workflow,
            to,
            base_url: &self.base_url,
            note,
        };
        match with_timeout(self.effect_timeout, self.notifier.send(notification)).await {
            Ok(()) => tracing::info!("📧 Sent {:?} notification for workflow {} to {}", kind, workflow.id, to),
            Err(e) => tracing::error!(
                "❌ Failed to send {:?} notification for workflow {} to {}: {}",
                kind,
                workflow.id,
                to,
                e
            ),
        }
    }

    async fn record_case(&self, workflow: &Workflow) {
        match with_timeout(self.effect_timeout, self.case_records.record(workflow)).await {
            Ok(()) => tracing::info!("🗂️ Added workflow {} to case {}", workflow.id, workflow.social_care_id),
            Err(e) => tracing::error!("❌ Failed to add workflow {} to case record: {}", workflow.id, e),
        }
    }

    /// Respond with the workflow as it stands after side effects
    async fn finish(
        &self,
        workflow: Workflow,
        next_steps: Option<EvaluationReport>,
    ) -> Result<ApprovalOutcome, ApprovalError> {
        // Next-step evaluation retires records, so reload when it ran
        let workflow = match &next_steps {
            Some(report) if !report.steps.is_empty() => match self.store.get(&workflow.id).await {
                Ok(reloaded) => reloaded,
                Err(e) => {
                    tracing::warn!("⚠️ Could not reload workflow {} after next steps: {}", workflow.id, e);
                    workflow
                }
            },
            _ => workflow,
        };

        Ok(ApprovalOutcome { workflow, next_steps })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, RecordingCaseRecorder, RecordingNotifier};
    use crate::workflow::{
        storage::SqliteWorkflowStore,
        types::NewNextStep,
    };

    struct Fixture {
        store: Arc<SqliteWorkflowStore>,
        notifier: Arc<RecordingNotifier>,
        case_records: Arc<RecordingCaseRecorder>,
        machine: ApprovalStateMachine,
    }

    async fn fixture_with(notifier: RecordingNotifier, case_records: RecordingCaseRecorder) -> Fixture {
        let store = Arc::new(SqliteWorkflowStore::in_memory().await.unwrap());
        let notifier = Arc::new(notifier);
        let case_records = Arc::new(case_records);
        let orchestrator = Arc::new(NextStepOrchestrator::new(
            Arc::new(testing::catalog()),
            store.clone(),
            notifier.clone(),
            "http://localhost:3000".to_string(),
            10,
            Duration::from_secs(5),
        ));
        let machine = ApprovalStateMachine::new(
            store.clone(),
            notifier.clone(),
            case_records.clone(),
            orchestrator,
            "http://localhost:3000".to_string(),
            Duration::from_secs(5),
        );
        Fixture {
            store,
            notifier,
            case_records,
            machine,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(RecordingNotifier::default(), RecordingCaseRecorder::default()).await
    }

    fn approve_with_qam(panel_approver: &str) -> ApprovalRequest {
        ApprovalRequest {
            action: Some(Decision::ApproveWithQam),
            comment: None,
            panel_approver_email: Some(panel_approver.to_string()),
        }
    }

    fn approve() -> ApprovalRequest {
        ApprovalRequest {
            action: Some(Decision::Approve),
            ..Default::default()
        }
    }

    /// A stored workflow already submitted by its creator
    async fn submitted(f: &Fixture) -> Workflow {
        let workflow = testing::stored_workflow(&f.store).await;
        f.machine
            .submit(&workflow.id, &testing::worker(), Some("manager@hackney.gov.uk".to_string()))
            .await
            .unwrap()
            .workflow
    }

    #[tokio::test]
    async fn manager_approval_with_panel_review_assigns_the_panel_approver() {
        let f = fixture().await;
        let workflow = submitted(&f).await;

        let outcome = f
            .machine
            .request_approval(&workflow.id, &testing::manager(), approve_with_qam("reviewer@x.org"))
            .await
            .unwrap();

        let approved = outcome.workflow;
        assert!(approved.manager_approved_at.is_some());
        assert_eq!(approved.manager_approved_by.as_deref(), Some("manager@hackney.gov.uk"));
        assert!(approved.needs_panel_approval);
        assert_eq!(approved.assigned_to.as_deref(), Some("reviewer@x.org"));
        assert_eq!(f.case_records.calls(), 0);
        assert_eq!(f.notifier.sent_to("reviewer@x.org"), 1);

        let revisions = f.store.revisions(&workflow.id).await.unwrap();
        assert_eq!(revisions.last().map(|r| r.action), Some(Action::Approved));
    }

    #[tokio::test]
    async fn manager_approval_without_panel_writes_the_case_record() {
        let f = fixture().await;
        let workflow = submitted(&f).await;

        let outcome = f
            .machine
            .approve_as_manager(&workflow.id, &testing::manager(), approve())
            .await
            .unwrap();

        assert!(!outcome.workflow.needs_panel_approval);
        assert_eq!(outcome.workflow.assigned_to, None);
        assert_eq!(f.case_records.calls(), 1);
        assert_eq!(f.notifier.sent_to("reviewer@x.org"), 0);
    }

    #[tokio::test]
    async fn panel_authorisation_completes_the_ladder() {
        let f = fixture().await;
        let workflow = submitted(&f).await;
        f.machine
            .request_approval(&workflow.id, &testing::manager(), approve_with_qam("reviewer@x.org"))
            .await
            .unwrap();

        let outcome = f
            .machine
            .request_approval(&workflow.id, &testing::panel_member(), ApprovalRequest::default())
            .await
            .unwrap();

        let authorised = outcome.workflow;
        assert!(authorised.panel_approved_at.is_some());
        assert_eq!(authorised.panel_approved_by.as_deref(), Some("reviewer@x.org"));
        assert_eq!(authorised.assigned_to, None);
        assert_eq!(authorised.team_assigned_to, Some(Team::Review));
        assert_eq!(f.case_records.calls(), 1);
        assert_eq!(
            authorised.status().unwrap().approval,
            ApprovalState::PanelApproved
        );
    }

    #[tokio::test]
    async fn missing_capability_is_rejected_without_mutation() {
        let f = fixture().await;
        let workflow = submitted(&f).await;
        let revisions_before = f.store.revisions(&workflow.id).await.unwrap().len();

        let err = f
            .machine
            .request_approval(&workflow.id, &testing::worker(), approve())
            .await
            .unwrap_err();
        assert!(matches!(err, ApprovalError::Unauthorized(Capability::Approver)));

        let err = f
            .machine
            .authorise_as_panel(&workflow.id, &testing::manager(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ApprovalError::Unauthorized(Capability::PanelApprover)));

        let unchanged = f.store.get(&workflow.id).await.unwrap();
        assert_eq!(unchanged.manager_approved_at, None);
        assert_eq!(f.store.revisions(&workflow.id).await.unwrap().len(), revisions_before);
        assert_eq!(f.case_records.calls(), 0);
    }

    #[tokio::test]
    async fn panel_authorisation_needs_manager_approval_first() {
        let f = fixture().await;
        let workflow = submitted(&f).await;

        let err = f
            .machine
            .authorise_as_panel(&workflow.id, &testing::panel_member(), None)
            .await
            .unwrap_err();

        assert!(matches!(err, ApprovalError::InvalidTransition(_)));
        let unchanged = f.store.get(&workflow.id).await.unwrap();
        assert_eq!(unchanged.panel_approved_at, None);
    }

    #[tokio::test]
    async fn panel_authorisation_is_refused_when_no_panel_was_requested() {
        let f = fixture().await;
        let workflow = submitted(&f).await;
        f.machine
            .approve_as_manager(&workflow.id, &testing::manager(), approve())
            .await
            .unwrap();

        let err = f
            .machine
            .request_approval(&workflow.id, &testing::panel_member(), ApprovalRequest::default())
            .await
            .unwrap_err();

        assert!(matches!(err, ApprovalError::InvalidTransition(_)));
        assert_eq!(f.case_records.calls(), 1);
    }

    #[tokio::test]
    async fn approve_with_qam_requires_a_panel_approver() {
        let f = fixture().await;
        let workflow = submitted(&f).await;

        let err = f
            .machine
            .approve_as_manager(
                &workflow.id,
                &testing::manager(),
                ApprovalRequest {
                    action: Some(Decision::ApproveWithQam),
                    panel_approver_email: Some("  ".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ApprovalError::Validation(_)));
    }

    #[tokio::test]
    async fn case_record_failure_does_not_undo_the_approval() {
        let f = fixture_with(RecordingNotifier::default(), RecordingCaseRecorder::failing()).await;
        let workflow = submitted(&f).await;

        let outcome = f
            .machine
            .approve_as_manager(&workflow.id, &testing::manager(), approve())
            .await
            .unwrap();

        assert!(outcome.workflow.manager_approved_at.is_some());
        assert_eq!(f.case_records.calls(), 1);
        let stored = f.store.get(&workflow.id).await.unwrap();
        assert!(stored.manager_approved_at.is_some());
    }

    #[tokio::test]
    async fn panel_approver_notification_failure_does_not_undo_the_approval() {
        let f = fixture_with(
            RecordingNotifier::failing_for("reviewer@x.org"),
            RecordingCaseRecorder::default(),
        )
        .await;
        let workflow = submitted(&f).await;

        let outcome = f
            .machine
            .request_approval(&workflow.id, &testing::manager(), approve_with_qam("reviewer@x.org"))
            .await;

        assert!(outcome.is_ok());
        assert_eq!(f.notifier.sent_to("reviewer@x.org"), 0);
        let stored = f.store.get(&workflow.id).await.unwrap();
        assert!(stored.manager_approved_at.is_some());
        assert_eq!(stored.assigned_to.as_deref(), Some("reviewer@x.org"));
    }

    #[tokio::test]
    async fn missing_action_is_a_plain_approval() {
        let f = fixture().await;
        let workflow = submitted(&f).await;

        let outcome = f
            .machine
            .request_approval(&workflow.id, &testing::manager(), ApprovalRequest::default())
            .await
            .unwrap();

        assert!(outcome.workflow.manager_approved_at.is_some());
        assert!(!outcome.workflow.needs_panel_approval);
        assert_eq!(f.case_records.calls(), 1);
    }

    #[tokio::test]
    async fn capability_is_checked_before_the_state() {
        let f = fixture().await;
        let draft = testing::stored_workflow(&f.store).await;

        let err = f
            .machine
            .request_approval(&draft.id, &testing::worker(), approve())
            .await
            .unwrap_err();
        assert!(matches!(err, ApprovalError::Unauthorized(Capability::Approver)));

        let approved = submitted(&f).await;
        f.machine
            .approve_as_manager(&approved.id, &testing::manager(), approve())
            .await
            .unwrap();
        let err = f
            .machine
            .request_approval(&approved.id, &testing::manager(), ApprovalRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ApprovalError::Unauthorized(Capability::PanelApprover)));

        // With the right capability the illegal state is what gets reported
        let err = f
            .machine
            .request_approval(&draft.id, &testing::manager(), approve())
            .await
            .unwrap_err();
        assert!(matches!(err, ApprovalError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn deferred_next_step_fires_once_approval_is_granted() {
        let f = fixture().await;
        let workflow = testing::stored_workflow(&f.store).await;
        let step = f
            .store
            .add_next_step(
                &workflow.id,
                NewNextStep {
                    next_step_option_id: "start-form-x-on-approval".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let outcome = f
            .machine
            .submit(&workflow.id, &testing::worker(), None)
            .await
            .unwrap();
        let report = outcome.next_steps.unwrap();
        assert_eq!(
            report.outcome_of(&step.id),
            Some(&crate::runtime::next_steps::StepOutcome::AwaitingManagerApproval)
        );
        assert_eq!(f.store.count_workflows_with_form("form-x").await.unwrap(), 0);

        let outcome = f
            .machine
            .approve_as_manager(&workflow.id, &testing::manager(), approve())
            .await
            .unwrap();

        assert_eq!(outcome.next_steps.map(|r| r.triggered()), Some(1));
        assert_eq!(f.store.count_workflows_with_form("form-x").await.unwrap(), 1);
        assert!(outcome.workflow.next_steps[0].triggered_at.is_some());
    }

    #[tokio::test]
    async fn return_for_edits_sends_the_workflow_back_to_its_submitter() {
        let f = fixture().await;
        let workflow = submitted(&f).await;
        f.machine
            .request_approval(&workflow.id, &testing::manager(), approve_with_qam("reviewer@x.org"))
            .await
            .unwrap();

        let outcome = f
            .machine
            .return_for_edits(
                &workflow.id,
                &testing::panel_member(),
                Some("Please add the carer's details".to_string()),
            )
            .await
            .unwrap();

        let returned = outcome.workflow;
        assert!(outcome.next_steps.is_none());
        assert_eq!(returned.manager_approved_at, None);
        assert_eq!(returned.submitted_at, None);
        assert_eq!(returned.assigned_to.as_deref(), Some("foo.bar@hackney.gov.uk"));
        assert_eq!(returned.status().unwrap().approval, ApprovalState::Draft);

        let comments = f.store.comments(&workflow.id).await.unwrap();
        assert_eq!(comments.last().map(|c| c.action), Some(Action::ReturnedForEdits));

        let sent = f.notifier.sent();
        let last = sent.last().unwrap();
        assert_eq!(last.kind, NotificationKind::ReturnedForEdits);
        assert_eq!(last.to, "foo.bar@hackney.gov.uk");
        assert_eq!(last.note.as_deref(), Some("Please add the carer's details"));
    }

    #[tokio::test]
    async fn return_for_edits_needs_a_reason_and_a_capability() {
        let f = fixture().await;
        let workflow = submitted(&f).await;

        let err = f
            .machine
            .return_for_edits(&workflow.id, &testing::worker(), Some("no".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, ApprovalError::Unauthorized(_)));

        let err = f
            .machine
            .return_for_edits(&workflow.id, &testing::manager(), Some(" ".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, ApprovalError::Validation(_)));

        assert!(f.store.get(&workflow.id).await.unwrap().submitted_at.is_some());
    }

    #[tokio::test]
    async fn discarded_workflows_cannot_be_approved() {
        let f = fixture().await;
        let workflow = submitted(&f).await;

        f.machine.discard(&workflow.id, &testing::worker()).await.unwrap();
        let err = f
            .machine
            .approve_as_manager(&workflow.id, &testing::manager(), approve())
            .await
            .unwrap_err();

        assert!(matches!(err, ApprovalError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn only_the_creator_or_an_approver_may_discard() {
        let f = fixture().await;
        let workflow = testing::stored_workflow(&f.store).await;
        let stranger = Actor {
            email: "someone.else@hackney.gov.uk".to_string(),
            ..testing::worker()
        };

        let err = f.machine.discard(&workflow.id, &stranger).await.unwrap_err();
        assert!(matches!(err, ApprovalError::Unauthorized(Capability::CreatorOrApprover)));

        let outcome = f.machine.discard(&workflow.id, &testing::manager()).await.unwrap();
        assert!(outcome.workflow.discarded_at.is_some());
        assert_eq!(outcome.workflow.discarded_by.as_deref(), Some("manager@hackney.gov.uk"));
    }

    #[tokio::test]
    async fn hold_and_release_round_trip() {
        let f = fixture().await;
        let workflow = submitted(&f).await;

        let held = f.machine.hold(&workflow.id, &testing::manager()).await.unwrap().workflow;
        assert!(held.held_at.is_some());
        assert!(f.machine.hold(&workflow.id, &testing::manager()).await.is_err());

        let released = f.machine.release(&workflow.id, &testing::manager()).await.unwrap().workflow;
        assert_eq!(released.held_at, None);

        let err = f.machine.hold(&workflow.id, &testing::worker()).await.unwrap_err();
        assert!(matches!(err, ApprovalError::Unauthorized(Capability::Approver)));
    }

    #[tokio::test]
    async fn racing_approvals_commit_only_once() {
        let f = fixture().await;
        let workflow = submitted(&f).await;
        let machine = Arc::new(f.machine);

        let first = {
            let machine = Arc::clone(&machine);
            let id = workflow.id.clone();
            tokio::spawn(async move { machine.approve_as_manager(&id, &testing::manager(), approve()).await })
        };
        let second = {
            let machine = Arc::clone(&machine);
            let id = workflow.id.clone();
            tokio::spawn(async move { machine.approve_as_manager(&id, &testing::manager(), approve()).await })
        };

        let results = [first.await.unwrap(), second.await.unwrap()];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(ApprovalError::InvalidTransition(_)))));

        let approvals = f
            .store
            .revisions(&workflow.id)
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.action == Action::Approved)
            .count();
        assert_eq!(approvals, 1);
        assert_eq!(f.case_records.calls(), 1);
    }
}
