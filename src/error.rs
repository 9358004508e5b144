/// Errors surfaced to callers of approval operations
///
/// Side-effect failures never show up here; they are logged and reported in
/// the next-step evaluation instead.

use crate::workflow::{state::TransitionError, storage::StoreError};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use std::fmt;

/// Capability an operation demanded of the actor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Approver,
    PanelApprover,
    ApproverOrPanelApprover,
    CreatorOrApprover,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Capability::Approver => "approver",
            Capability::PanelApprover => "panel approver",
            Capability::ApproverOrPanelApprover => "approver or panel approver",
            Capability::CreatorOrApprover => "workflow creator or approver",
        };
        f.write_str(text)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    #[error("Not authenticated")]
    Unauthenticated,

    #[error("You're not authorised to do this: {0} capability required")]
    Unauthorized(Capability),

    #[error("Workflow not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    /// Another request kept winning the conditioned update
    #[error("Workflow {0} was changed by another request, try again")]
    Conflict(String),

    #[error("{0}")]
    Validation(String),

    #[error("storage failure: {0}")]
    Store(StoreError),
}

impl From<StoreError> for ApprovalError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => ApprovalError::NotFound(id),
            StoreError::Conflict(id) => ApprovalError::Conflict(id),
            other => ApprovalError::Store(other),
        }
    }
}

impl ApprovalError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApprovalError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ApprovalError::Unauthorized(_) => StatusCode::BAD_REQUEST,
            ApprovalError::NotFound(_) => StatusCode::NOT_FOUND,
            ApprovalError::InvalidTransition(_) | ApprovalError::Conflict(_) => StatusCode::CONFLICT,
            ApprovalError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApprovalError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApprovalError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("❌ {}", self);
        } else {
            tracing::warn!("⚠️ Request rejected ({}): {}", status.as_u16(), self);
        }

        // Storage internals stay in the logs
        let message = match &self {
            ApprovalError::Store(_) => "Internal server error".to_string(),
            other => other.to_string(),
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}
