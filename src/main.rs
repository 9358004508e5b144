/// casegate: approval gates and next-step orchestration for case-management workflows
///
/// Main entry point. Reads configuration from the environment and starts the
/// HTTP server.

use casegate::{config::Config, server::start_server};

/// Application entry point
///
/// The server provides:
/// - Workflow lifecycle API at /api/workflows/*
/// - Approval and return-for-edits at /api/workflows/{id}/approval
/// - Health check at /healthz
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration (defaults to 0.0.0.0:3004 and data/casegate.db)
    let config = Config::default();

    start_server(config).await?;

    Ok(())
}
