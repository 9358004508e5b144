/// Approval endpoints
///
/// POST   /api/workflows/{id}/approval          approve at whichever stage is next
/// POST   /api/workflows/{id}/approval/manager  manager approval only
/// POST   /api/workflows/{id}/approval/panel    panel authorisation only
/// DELETE /api/workflows/{id}/approval          return for edits

use crate::{
    api::{parse_body, workflows::AppState},
    error::ApprovalError,
    runtime::approval::{ApprovalOutcome, ApprovalRequest},
    workflow::types::Actor,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::post,
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

/// Body of a return-for-edits request
#[derive(Debug, Default, Deserialize)]
struct ReturnRequest {
    #[serde(default)]
    comment: Option<String>,
}

/// Body of a panel authorisation request
#[derive(Debug, Default, Deserialize)]
struct AuthoriseRequest {
    #[serde(default)]
    comment: Option<String>,
}

pub fn create_approval_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/api/workflows/{id}/approval",
            post(request_approval)
                .delete(return_for_edits)
                .fallback(method_not_supported),
        )
        .route("/api/workflows/{id}/approval/manager", post(approve_as_manager))
        .route("/api/workflows/{id}/approval/panel", post(authorise_as_panel))
}

/// POST /api/workflows/{id}/approval
/// Body: { "action": "Approve" | "ApproveWithQam", "comment"?: "...", "panelApproverEmail"?: "..." }
async fn request_approval(
    State(state): State<AppState>,
    Path(id): Path<String>,
    actor: Actor,
    body: String,
) -> Result<Json<ApprovalOutcome>, ApprovalError> {
    tracing::info!("📥 Approval request for workflow {} from {}", id, actor.email);
    let request: ApprovalRequest = parse_body(&body)?;
    let outcome = state.machine.request_approval(&id, &actor, request).await?;
    Ok(Json(outcome))
}

async fn approve_as_manager(
    State(state): State<AppState>,
    Path(id): Path<String>,
    actor: Actor,
    body: String,
) -> Result<Json<ApprovalOutcome>, ApprovalError> {
    let request: ApprovalRequest = parse_body(&body)?;
    let outcome = state.machine.approve_as_manager(&id, &actor, request).await?;
    Ok(Json(outcome))
}

async fn authorise_as_panel(
    State(state): State<AppState>,
    Path(id): Path<String>,
    actor: Actor,
    body: String,
) -> Result<Json<ApprovalOutcome>, ApprovalError> {
    let request: AuthoriseRequest = parse_body(&body)?;
    let outcome = state.machine.authorise_as_panel(&id, &actor, request.comment).await?;
    Ok(Json(outcome))
}

/// DELETE /api/workflows/{id}/approval
/// Body: { "comment": "..." }
async fn return_for_edits(
    State(state): State<AppState>,
    Path(id): Path<String>,
    actor: Actor,
    body: String,
) -> Result<Json<ApprovalOutcome>, ApprovalError> {
    let request: ReturnRequest = parse_body(&body)?;
    let outcome = state.machine.return_for_edits(&id, &actor, request.comment).await?;
    Ok(Json(outcome))
}

async fn method_not_supported() -> (StatusCode, Json<Value>) {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        Json(json!({ "error": "Method not supported on this endpoint" })),
    )
}
