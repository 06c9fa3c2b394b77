use anyhow::{bail, Context, Result};
use axum::Router;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use agentloop_core::CiPolicy;
use agentloop_server::agent::{LlmAgent, LlmClient};
use agentloop_server::artifacts::{Artifacts, FsArtifactSink};
use agentloop_server::config::Config;
use agentloop_server::dashboard::dashboard_router;
use agentloop_server::git::{GitIdentity, GitOps};
use agentloop_server::github::GitHubClient;
use agentloop_server::handlers::{handler_table, HandlerSettings, Services};
use agentloop_server::ingest::{signature_header, Ingestor};
use agentloop_server::store::Store;
use agentloop_server::webhook::webhook_router;
use agentloop_server::worker::{default_worker_id, Worker, WorkerSettings};
use agentloop_server::AppState;

#[derive(Parser)]
#[command(name = "agentloop", version, about = "Issue-to-PR agent orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Accept webhooks and serve the dashboard
    Serve {
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        /// Defaults to PORT
        #[arg(long)]
        port: Option<u16>,
        /// Also run a worker in this process
        #[arg(long)]
        with_worker: bool,
    },
    /// Process jobs from the shared store
    Worker {
        #[arg(long)]
        worker_id: Option<String>,
    },
    /// Send a signed webhook delivery to a running server
    Simulate {
        /// Value of X-GitHub-Event
        #[arg(long)]
        event: String,
        /// JSON payload
        #[arg(long)]
        file: PathBuf,
        #[arg(long, default_value = "http://localhost:3000/webhook")]
        url: String,
        #[arg(long, env = "GITHUB_WEBHOOK_SECRET")]
        secret: String,
    },
}

fn build_worker(config: &Config, store: &Store, artifacts: &Artifacts, worker_id: String) -> Worker {
    let github_client = Arc::new(GitHubClient::new(
        config.github_app_id,
        config.github_private_key.clone(),
        config.github_api_base.clone(),
    ));
    let llm = LlmClient::new(
        config.llm_api_key.clone(),
        config.llm_base_url.clone(),
        config.llm_model.clone(),
        config.llm_max_tokens,
        config.llm_timeout,
    );
    let services = Arc::new(Services {
        store: store.clone(),
        artifacts: artifacts.clone(),
        repo_host: github_client.clone(),
        agent: Arc::new(LlmAgent::new(Arc::new(llm), config.agent_max_steps)),
        git: GitOps::new(
            GitIdentity {
                name: config.git_user_name.clone(),
                email: config.git_user_email.clone(),
            },
            config.job_timeout,
        ),
        settings: HandlerSettings {
            workdir_root: config.workdir_root.clone(),
            max_iterations: config.max_iterations,
            ci_policy: CiPolicy::new(config.required_checks.clone()),
            max_tool_output_chars: config.agent_max_tool_output_chars,
        },
    });
    Worker::new(
        store.clone(),
        handler_table(services),
        artifacts.clone(),
        github_client,
        WorkerSettings::from_config(config, worker_id),
    )
}

fn open_store(config: &Config) -> Result<(Store, Artifacts)> {
    let db_path = config.database_path();
    info!("Using state database: {}", db_path.display());
    let store = Store::open(&db_path).context("Failed to open the state database")?;
    let artifacts = Artifacts::new(
        Arc::new(FsArtifactSink::new(config.artifacts_dir.clone())),
        store.clone(),
    );
    Ok((store, artifacts))
}

/// Flips the channel on Ctrl-C.
fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            // Keep the sender alive so nothing shuts down by accident.
            std::future::pending::<()>().await;
        }
        info!("Shutdown requested");
        let _ = tx.send(true);
    });
    rx
}

async fn serve(host: String, port: Option<u16>, with_worker: bool) -> Result<()> {
    let config = Config::from_env().context("Failed to load configuration from environment")?;
    let (store, artifacts) = open_store(&config)?;
    let shutdown = shutdown_signal();

    let worker_handle = if with_worker {
        let worker = build_worker(&config, &store, &artifacts, default_worker_id());
        let rx = shutdown.clone();
        Some(tokio::spawn(async move { worker.run(rx).await }))
    } else {
        None
    };

    let app_state = Arc::new(AppState {
        store: store.clone(),
        ingestor: Ingestor::new(
            store,
            config.webhook_secrets.clone(),
            config.trigger_label.clone(),
        ),
        artifacts,
    });
    let app = Router::new()
        .merge(webhook_router())
        .merge(dashboard_router())
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(app_state);

    let addr = format!("{}:{}", host, port.unwrap_or(config.port));
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("agentloop {} listening on {}", agentloop_server::get_version(), addr);

    let mut server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = server_shutdown.wait_for(|stop| *stop).await;
        })
        .await?;

    if let Some(handle) = worker_handle {
        if let Err(e) = handle.await {
            error!("Worker task panicked: {}", e);
        }
    }
    Ok(())
}

async fn run_worker(worker_id: Option<String>) -> Result<()> {
    let config = Config::from_env().context("Failed to load configuration from environment")?;
    let (store, artifacts) = open_store(&config)?;
    let worker_id = worker_id.unwrap_or_else(default_worker_id);
    info!("agentloop {} worker {}", agentloop_server::get_version(), worker_id);

    let worker = build_worker(&config, &store, &artifacts, worker_id);
    worker.run(shutdown_signal()).await;
    Ok(())
}

async fn simulate(event: String, file: PathBuf, url: String, secret: String) -> Result<()> {
    let body = tokio::fs::read(&file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    serde_json::from_slice::<serde_json::Value>(&body)
        .with_context(|| format!("{} is not valid JSON", file.display()))?;
    let Some(signature) = signature_header(&secret, &body) else {
        bail!("Cannot sign with the given secret");
    };
    let delivery_id = uuid::Uuid::new_v4().to_string();

    let response = reqwest::Client::new()
        .post(&url)
        .header("Content-Type", "application/json")
        .header("X-GitHub-Event", &event)
        .header("X-GitHub-Delivery", &delivery_id)
        .header("X-Hub-Signature-256", signature)
        .body(body)
        .send()
        .await
        .with_context(|| format!("Failed to POST to {}", url))?;

    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    println!("{} (delivery {})", status, delivery_id);
    println!("{}", text);
    if !status.is_success() {
        bail!("Server rejected the delivery with {}", status);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Command::Serve {
            host,
            port,
            with_worker,
        } => serve(host, port, with_worker).await,
        Command::Worker { worker_id } => run_worker(worker_id).await,
        Command::Simulate {
            event,
            file,
            url,
            secret,
        } => simulate(event, file, url, secret).await,
    }
}
