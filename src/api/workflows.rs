/// Workflow lifecycle REST API endpoints
///
/// Creation, lookup, submission, discard, hold and next-step attachment.
/// Approval itself lives in [`crate::api::approval`].

use crate::{
    api::parse_body,
    error::ApprovalError,
    runtime::approval::{ApprovalOutcome, ApprovalStateMachine},
    workflow::{
        catalog::NextStepCatalog,
        state::Operation,
        storage::WorkflowStore,
        types::{Actor, Comment, Creator, NewNextStep, NewWorkflow, NextStepRecord, Revision, Workflow},
    },
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    /// Workflow persistence
    pub store: Arc<dyn WorkflowStore>,
    /// Next-step options loaded at startup
    pub catalog: Arc<NextStepCatalog>,
    /// Approval transitions and their side effects
    pub machine: Arc<ApprovalStateMachine>,
}

/// Workflow with its audit trail
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDetail {
    #[serde(flatten)]
    pub workflow: Workflow,
    pub revisions: Vec<Revision>,
    pub comments: Vec<Comment>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitRequest {
    #[serde(default)]
    approver_email: Option<String>,
}

/// Create workflow lifecycle routes
pub fn create_workflow_routes() -> Router<AppState> {
    Router::new()
        .route("/api/workflows", post(create_workflow))
        .route("/api/workflows/{id}", get(get_workflow))
        .route("/api/workflows/{id}/submit", post(submit_workflow))
        .route("/api/workflows/{id}/discard", post(discard_workflow))
        .route("/api/workflows/{id}/hold", post(hold_workflow).delete(release_workflow))
        .route("/api/workflows/{id}/next-steps", post(add_next_step))
}

/// Create a new draft workflow owned by the caller
///
/// POST /api/workflows
/// Body: { "formId": "...", "socialCareId": "...", "type"?: "...", "reviewOf"?: "..." }
async fn create_workflow(
    State(state): State<AppState>,
    actor: Actor,
    body: String,
) -> Result<(StatusCode, Json<Workflow>), ApprovalError> {
    let new: NewWorkflow = parse_body(&body)?;

    if new.form_id.trim().is_empty() || new.social_care_id.trim().is_empty() {
        return Err(ApprovalError::Validation(
            "formId and socialCareId are required".to_string(),
        ));
    }

    let creator = Creator {
        email: actor.email.clone(),
        team: actor.team,
    };
    let workflow = state.store.create(new, &creator).await?;

    tracing::info!("🔥 Created workflow {} ({}) for {}", workflow.id, workflow.form_id, actor.email);

    Ok((StatusCode::CREATED, Json(workflow)))
}

/// Get a workflow with its next steps, revisions and comments
///
/// GET /api/workflows/{id}
async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    _actor: Actor,
) -> Result<Json<WorkflowDetail>, ApprovalError> {
    let workflow = state.store.get(&id).await?;
    let revisions = state.store.revisions(&id).await?;
    let comments = state.store.comments(&id).await?;

    Ok(Json(WorkflowDetail {
        workflow,
        revisions,
        comments,
    }))
}

/// POST /api/workflows/{id}/submit
/// Body: { "approverEmail"?: "..." }
async fn submit_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    actor: Actor,
    body: String,
) -> Result<Json<ApprovalOutcome>, ApprovalError> {
    let request: SubmitRequest = parse_body(&body)?;
    let outcome = state.machine.submit(&id, &actor, request.approver_email).await?;
    Ok(Json(outcome))
}

/// POST /api/workflows/{id}/discard
async fn discard_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    actor: Actor,
) -> Result<Json<ApprovalOutcome>, ApprovalError> {
    Ok(Json(state.machine.discard(&id, &actor).await?))
}

/// POST /api/workflows/{id}/hold
async fn hold_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    actor: Actor,
) -> Result<Json<ApprovalOutcome>, ApprovalError> {
    Ok(Json(state.machine.hold(&id, &actor).await?))
}

/// DELETE /api/workflows/{id}/hold
async fn release_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    actor: Actor,
) -> Result<Json<ApprovalOutcome>, ApprovalError> {
    Ok(Json(state.machine.release(&id, &actor).await?))
}

/// Check a requested next step against its catalog option
fn validate_next_step(
    catalog: &NextStepCatalog,
    workflow: &Workflow,
    step: &NewNextStep,
) -> Result<(), ApprovalError> {
    let option = catalog.lookup(&step.next_step_option_id).ok_or_else(|| {
        ApprovalError::Validation(format!("Unknown next step option: {}", step.next_step_option_id))
    })?;

    if !option.form_ids.is_empty() && !option.form_ids.contains(&workflow.form_id) {
        return Err(ApprovalError::Validation(format!(
            "Next step {} is not offered on form {}",
            option.id, workflow.form_id
        )));
    }

    let has_alt_subject = step
        .alt_social_care_id
        .as_deref()
        .is_some_and(|id| !id.trim().is_empty());
    if has_alt_subject && !option.create_for_different_person {
        return Err(ApprovalError::Validation(format!(
            "Next step {} cannot start a workflow for a different person",
            option.id
        )));
    }

    let has_note = step.note.as_deref().is_some_and(|note| !note.trim().is_empty());
    if has_note && !option.handover_note {
        return Err(ApprovalError::Validation(format!(
            "Next step {} does not take a handover note",
            option.id
        )));
    }

    Ok(())
}

/// Attach a next step to a workflow
///
/// POST /api/workflows/{id}/next-steps
/// Body: { "nextStepOptionId": "...", "altSocialCareId"?: "...", "note"?: "..." }
async fn add_next_step(
    State(state): State<AppState>,
    Path(id): Path<String>,
    actor: Actor,
    body: String,
) -> Result<(StatusCode, Json<NextStepRecord>), ApprovalError> {
    let step: NewNextStep = parse_body(&body)?;
    let workflow = state.store.get(&id).await?;

    workflow.status()?.apply(Operation::AttachNextStep)?;
    validate_next_step(&state.catalog, &workflow, &step)?;

    let record = state.store.add_next_step(&id, step).await?;
    tracing::info!(
        "➕ {} attached next step {} ({}) to workflow {}",
        actor.email,
        record.id,
        record.next_step_option_id,
        id
    );

    Ok((StatusCode::CREATED, Json(record)))
}
