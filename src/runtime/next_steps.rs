/// Next-step orchestration
///
/// After an approval transition commits, every pending next step on the
/// workflow is evaluated against the catalog and the workflow's approval
/// state. Eligible steps notify, start follow-on workflows, and are then
/// retired with a guarded update so that no step fires twice.

use crate::runtime::effects::{with_timeout, Notification, NotificationKind, NotificationService};
use crate::workflow::{
    catalog::NextStepCatalog,
    storage::WorkflowStore,
    types::{NextStepOption, NextStepRecord, Workflow},
};
use serde::Serialize;
use std::{sync::Arc, time::Duration};

/// What happened to one next step during an evaluation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum StepOutcome {
    /// All actions ran and the step was retired
    #[serde(rename_all = "camelCase")]
    Triggered { spawned_workflow_id: Option<String> },
    /// Another evaluation retired the step first
    AlreadyTriggered,
    /// Waiting for manager approval
    AwaitingManagerApproval,
    /// Waiting for panel authorisation
    AwaitingPanelAuthorisation,
    /// The option no longer exists in the catalog; never retried
    Orphaned,
    NotificationFailed { reason: String },
    SpawnFailed { reason: String },
    MarkFailed { reason: String },
    /// The evaluation task panicked or was cancelled
    Aborted { reason: String },
}

impl StepOutcome {
    /// The step stays pending and will be evaluated again on the next transition
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            StepOutcome::Triggered { .. } | StepOutcome::AlreadyTriggered | StepOutcome::Orphaned
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepReport {
    pub next_step_id: String,
    pub next_step_option_id: String,
    #[serde(flatten)]
    pub outcome: StepOutcome,
}

/// Result of one evaluation pass, in the steps' creation order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationReport {
    pub steps: Vec<StepReport>,
    /// Pending steps left out by the batch limit
    pub deferred_by_limit: usize,
}

impl EvaluationReport {
    fn count(&self, predicate: impl Fn(&StepOutcome) -> bool) -> usize {
        self.steps.iter().filter(|step| predicate(&step.outcome)).count()
    }

    pub fn triggered(&self) -> usize {
        self.count(|outcome| matches!(outcome, StepOutcome::Triggered { .. }))
    }

    pub fn orphaned(&self) -> usize {
        self.count(|outcome| matches!(outcome, StepOutcome::Orphaned))
    }

    /// Notification or workflow-spawn failures
    pub fn delivery_failures(&self) -> usize {
        self.count(|outcome| {
            matches!(
                outcome,
                StepOutcome::NotificationFailed { .. } | StepOutcome::SpawnFailed { .. }
            )
        })
    }

    /// Steps held back by an approval gate
    pub fn deferred(&self) -> usize {
        self.count(|outcome| {
            matches!(
                outcome,
                StepOutcome::AwaitingManagerApproval | StepOutcome::AwaitingPanelAuthorisation
            )
        })
    }

    pub fn outcome_of(&self, next_step_id: &str) -> Option<&StepOutcome> {
        self.steps
            .iter()
            .find(|step| step.next_step_id == next_step_id)
            .map(|step| &step.outcome)
    }
}

/// Everything a single step evaluation needs, shared across spawned tasks
struct StepRunner {
    catalog: Arc<NextStepCatalog>,
    store: Arc<dyn WorkflowStore>,
    notifier: Arc<dyn NotificationService>,
    base_url: String,
    effect_timeout: Duration,
}

impl StepRunner {
    async fn run(&self, workflow: &Workflow, step: &NextStepRecord) -> StepOutcome {
        // A copy of the workflow can be stale; the guarded mark is what counts
        if step.triggered_at.is_some() {
            return StepOutcome::AlreadyTriggered;
        }

        let Some(option) = self.catalog.lookup(&step.next_step_option_id) else {
            tracing::error!(
                "🧩 Orphaned next step {}: option '{}' is not in the catalog",
                step.id,
                step.next_step_option_id
            );
            return StepOutcome::Orphaned;
        };

        if option.wait_for_approval && workflow.manager_approved_at.is_none() {
            tracing::debug!("⏳ Next step {} needs manager approval", step.id);
            return StepOutcome::AwaitingManagerApproval;
        }

        if option.wait_for_qam_authorisation && workflow.panel_approved_at.is_none() {
            tracing::debug!("⏳ Next step {} needs panel authorisation", step.id);
            return StepOutcome::AwaitingPanelAuthorisation;
        }

        if let Some(email) = &option.email {
            let notification = Notification {
                kind: NotificationKind::NextStep,
                workflow,
                to: email.as_str(),
                base_url: &self.base_url,
                note: step.note.as_deref(),
            };
            if let Err(e) = with_timeout(self.effect_timeout, self.notifier.send(notification)).await {
                tracing::error!("❌ Error sending notification for next step {}: {}", step.id, e);
                return StepOutcome::NotificationFailed {
                    reason: e.to_string(),
                };
            }
        }

        let mut spawned_workflow_id = None;
        if let Some(form_id) = &option.workflow_to_start {
            let subject_id = subject_for(workflow, step, option);
            match self
                .store
                .create_child(&workflow.creator, form_id, subject_id)
                .await
            {
                Ok(child) => {
                    tracing::info!(
                        "🌱 Next step {} started workflow {} ({}) for {}",
                        step.id,
                        child.id,
                        form_id,
                        subject_id
                    );
                    spawned_workflow_id = Some(child.id);
                }
                Err(e) => {
                    tracing::error!("❌ Error creating new workflow for next step {}: {}", step.id, e);
                    return StepOutcome::SpawnFailed {
                        reason: e.to_string(),
                    };
                }
            }
        }

        match self.store.mark_next_step_triggered(&step.id).await {
            Ok(true) => {
                tracing::info!("✅ Next step {} triggered", step.id);
                StepOutcome::Triggered { spawned_workflow_id }
            }
            Ok(false) => {
                tracing::warn!("🏁 Next step {} was triggered by a concurrent evaluation", step.id);
                StepOutcome::AlreadyTriggered
            }
            Err(e) => {
                tracing::error!("❌ Failed to mark next step {} as triggered: {}", step.id, e);
                StepOutcome::MarkFailed {
                    reason: e.to_string(),
                }
            }
        }
    }
}

/// Subject a spawned workflow targets
///
/// The record's override only applies when the option allows a different person.
fn subject_for<'a>(workflow: &'a Workflow, step: &'a NextStepRecord, option: &NextStepOption) -> &'a str {
    match step.alt_social_care_id.as_deref() {
        Some(alt) if option.create_for_different_person && !alt.trim().is_empty() => alt,
        _ => &workflow.social_care_id,
    }
}

/// Fans out over a workflow's pending next steps and fires the eligible ones
pub struct NextStepOrchestrator {
    runner: Arc<StepRunner>,
    batch_limit: usize,
}

impl NextStepOrchestrator {
    pub fn new(
        catalog: Arc<NextStepCatalog>,
        store: Arc<dyn WorkflowStore>,
        notifier: Arc<dyn NotificationService>,
        base_url: String,
        batch_limit: usize,
        effect_timeout: Duration,
    ) -> Self {
        Self {
            runner: Arc::new(StepRunner {
                catalog,
                store,
                notifier,
                base_url,
                effect_timeout,
            }),
            batch_limit,
        }
    }

    /// Evaluate the first `batch_limit` pending next steps of `workflow`
    ///
    /// Steps run concurrently and independently. This returns once every one
    /// of them has settled; no step failure is propagated.
    pub async fn evaluate(&self, workflow: &Workflow) -> EvaluationReport {
        let pending: Vec<NextStepRecord> = workflow.pending_next_steps().cloned().collect();
        let deferred_by_limit = pending.len().saturating_sub(self.batch_limit);

        if pending.is_empty() {
            return EvaluationReport::default();
        }

        tracing::info!(
            "🔄 Evaluating {} of {} pending next steps for workflow {}",
            pending.len().min(self.batch_limit),
            pending.len(),
            workflow.id
        );

        // Orphaned steps are never retired, so they keep taking slots here
        let shared = Arc::new(workflow.clone());
        let tasks: Vec<_> = pending
            .into_iter()
            .take(self.batch_limit)
            .map(|step| {
                let runner = Arc::clone(&self.runner);
                let workflow = Arc::clone(&shared);
                let next_step_id = step.id.clone();
                let next_step_option_id = step.next_step_option_id.clone();
                let handle = tokio::spawn(async move { runner.run(&workflow, &step).await });
                (next_step_id, next_step_option_id, handle)
            })
            .collect();

        let mut steps = Vec::with_capacity(tasks.len());
        for (next_step_id, next_step_option_id, handle) in tasks {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!("💥 Evaluation of next step {} aborted: {}", next_step_id, e);
                    StepOutcome::Aborted {
                        reason: e.to_string(),
                    }
                }
            };
            steps.push(StepReport {
                next_step_id,
                next_step_option_id,
                outcome,
            });
        }

        let report = EvaluationReport {
            steps,
            deferred_by_limit,
        };

        tracing::info!(
            "📊 Next steps for workflow {}: {} triggered, {} deferred, {} orphaned, {} failed, {} over limit",
            workflow.id,
            report.triggered(),
            report.deferred(),
            report.orphaned(),
            report.delivery_failures(),
            report.deferred_by_limit
        );

        report
    }
}
