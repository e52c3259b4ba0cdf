//! SadGuard webhook server.

use std::sync::Arc;

use sadguard::container::DockerRuntime;
use sadguard::llm::GeminiClient;
use sadguard::server::{self, AppState};
use sadguard::{Config, GitHubClient, Orchestrator, SqlStore};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    if let Err(e) = run().await {
        eprintln!("sadguard failed: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> sadguard::Result<()> {
    let config = Config::from_env()?;

    let store = SqlStore::connect(&config.database_url).await?;
    store.ensure_schema().await?;

    let platform = GitHubClient::new(&config.github_app_id, &config.github_private_key)?;
    let runtime = DockerRuntime::connect()?;
    let llm = GeminiClient::new(&config.llm_api_key, config.llm_timeout)?;

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::new(platform),
        Arc::new(runtime),
        Arc::new(llm),
        Arc::new(store),
        config.image_name.clone(),
        config.sandbox_timeout,
    ));

    let state = AppState {
        orchestrator,
        webhook_secret: config.webhook_secret.clone(),
    };

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "sadguard listening");
    axum::serve(listener, server::router(state)).await?;
    Ok(())
}
