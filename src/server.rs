/// Server setup and initialization
///
/// Wires together all components: storage, catalog, side-effect services,
/// next-step orchestrator, approval machine and HTTP routes.
/// Provides the main application factory function for creating the Axum app.

use crate::{
    api::{create_approval_routes, create_workflow_routes, AppState},
    config::Config,
    runtime::{
        approval::ApprovalStateMachine,
        effects::{case_recorder_from_config, notifier_from_config},
        next_steps::NextStepOrchestrator,
    },
    workflow::{catalog::NextStepCatalog, storage::SqliteWorkflowStore, WorkflowStore},
};
use anyhow::Result;
use axum::{routing::get, Router};
use std::{path::Path, sync::Arc};
use tokio::net::TcpListener;

/// Directory holding a `sqlite://` database file, if the URL names one
fn database_dir(url: &str) -> Option<&Path> {
    let path = url.strip_prefix("sqlite://").or_else(|| url.strip_prefix("sqlite:"))?;
    let path = path.split('?').next()?;
    if path.is_empty() || path.starts_with(':') {
        return None;
    }
    Path::new(path).parent().filter(|dir| !dir.as_os_str().is_empty())
}

/// Create the main Axum application with all routes
///
/// Opens the workflow database, loads the next-step catalog and builds the
/// approval engine around them.
pub async fn create_app(config: Config) -> Result<Router> {
    if let Some(dir) = database_dir(&config.database.url) {
        tracing::info!("📁 Ensuring data directory exists: {}", dir.display());
        std::fs::create_dir_all(dir)
            .map_err(|e| anyhow::anyhow!("Failed to create data directory: {}", e))?;
    }

    tracing::info!("📋 Opening workflow store");
    let store: Arc<dyn WorkflowStore> = Arc::new(
        SqliteWorkflowStore::connect(&config.database.url)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to open workflow database: {}", e))?,
    );

    tracing::info!("📚 Loading next-step catalog from {}", config.next_steps.options_path);
    let catalog = Arc::new(
        NextStepCatalog::load(&config.next_steps.options_path)
            .map_err(|e| anyhow::anyhow!("Failed to load next-step catalog: {}", e))?,
    );

    tracing::info!("📧 Initializing notification and case-record services");
    let notifier = notifier_from_config(&config.services)?;
    let case_records = case_recorder_from_config(&config.services)?;

    tracing::info!(
        "⚙️ Initializing next-step orchestrator (batch limit {})",
        config.next_steps.batch_limit
    );
    let orchestrator = Arc::new(NextStepOrchestrator::new(
        Arc::clone(&catalog),
        Arc::clone(&store),
        Arc::clone(&notifier),
        config.services.base_url.clone(),
        config.next_steps.batch_limit,
        config.services.timeout(),
    ));

    let machine = Arc::new(ApprovalStateMachine::new(
        Arc::clone(&store),
        notifier,
        case_records,
        orchestrator,
        config.services.base_url.clone(),
        config.services.timeout(),
    ));

    let app_state = AppState {
        store,
        catalog,
        machine,
    };

    tracing::info!("📡 Creating HTTP router with all endpoints");
    let app = Router::new()
        // Health check endpoint
        .route("/healthz", get(health_check))
        .merge(create_workflow_routes())
        .merge(create_approval_routes())
        .with_state(app_state);

    tracing::info!("✅ Application initialized successfully");

    Ok(app)
}

/// Start the HTTP server with the given configuration
pub async fn start_server(config: Config) -> Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting casegate server...");

    let app = create_app(config.clone()).await?;

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;

    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}

async fn health_check() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_directory_comes_from_file_urls_only() {
        assert_eq!(database_dir("sqlite://data/casegate.db"), Some(Path::new("data")));
        assert_eq!(
            database_dir("sqlite:///var/lib/casegate/db.sqlite?mode=rwc"),
            Some(Path::new("/var/lib/casegate"))
        );
        assert_eq!(database_dir("sqlite::memory:"), None);
        assert_eq!(database_dir("sqlite://casegate.db"), None);
    }
}
