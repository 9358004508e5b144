/// HTTP API Layer
///
/// This module provides the REST endpoints around the approval engine.
/// It handles:
/// - Session-derived actors
/// - Workflow creation, lookup and lifecycle operations
/// - Manager approval, panel authorisation and return for edits

// Actor extractor built from forwarded session headers
pub mod actor;

// Approval and return-for-edits endpoints
pub mod approval;

// Workflow lifecycle and next-step endpoints
pub mod workflows;

use crate::error::ApprovalError;
use serde::de::DeserializeOwned;

// Re-export router builders
pub use approval::create_approval_routes;
pub use workflows::{create_workflow_routes, AppState};

/// Parse a JSON request body, treating an empty body as `{}`
pub(crate) fn parse_body<T: DeserializeOwned>(body: &str) -> Result<T, ApprovalError> {
    let body = if body.trim().is_empty() { "{}" } else { body };
    serde_json::from_str(body).map_err(|e| {
        tracing::debug!("❌ Invalid JSON payload: {}", e);
        ApprovalError::Validation(format!("Invalid request body: {}", e))
    })
}
