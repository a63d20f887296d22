mod brain;
mod face;
mod hands;
mod notify;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use seek_agent::{Cli, Collaborators, Notifier, Orchestrator};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,seek_agent=debug")),
        )
        .init();

    let cli = Cli::parse();
    let settings = cli.settings();
    info!(bridge = %cli.bridge_url, model = %cli.planner_model, "starting agent");

    let client = reqwest::Client::builder()
        .timeout(cli.request_timeout())
        .build()
        .context("building HTTP client")?;

    if cli.planner_api_key.is_none() {
        warn!("OPENAI_API_KEY not set; every task will run the fallback plan");
    }
    let planner = Arc::new(brain::LlmPlanner::new(
        client.clone(),
        &cli.planner_url,
        &cli.planner_model,
        cli.planner_api_key.clone(),
    ));
    let bridge = Arc::new(hands::AutomationBridge::new(
        client.clone(),
        &cli.bridge_url,
        cli.request_timeout(),
    ));
    let notifier = cli.notify_url.as_deref().map(|url| {
        Arc::new(notify::WebhookNotifier::new(
            client.clone(),
            url,
            cli.notify_recipient.clone(),
        )) as Arc<dyn Notifier>
    });
    if notifier.is_none() {
        info!("NOTIFY_URL not set; alerts are disabled");
    }

    let orchestrator = Arc::new(Orchestrator::new(
        settings,
        Collaborators {
            planner,
            executor: bridge.clone(),
            resolver: Some(bridge.clone()),
            sampler: bridge.clone(),
            notifier,
            indicator: Some(bridge),
        },
    ));

    let listener = face::bind(&cli.bind).await?;
    info!(addr = %listener.local_addr()?, "HTTP/SSE server listening");

    axum::serve(listener, face::router(orchestrator.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    let stopped = orchestrator.shutdown();
    info!(stopped, "shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "could not listen for ctrl-c");
    }
}
