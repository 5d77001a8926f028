use crate::controller::KubeDiscovery;
use crate::notifier::NtfyNotifier;
use crate::oci_registry::OciRegistryClient;
use crate::run::Engine;
use crate::webserver::AppState;
use anyhow::Context;
use std::env;
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod config;
mod controller;
mod error;
mod gitops;
mod image_reference;
mod notification_gate;
mod notifier;
mod oci_registry;
mod run;
mod secret_string;
mod snapshot_store;
mod state;
mod update_candidates;
mod version_policy;
mod webserver;
mod workload_kind;

#[cfg(target_env = "musl")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

static DEFAULT_CONFIG_PATH: &str = "/app/config/config.yaml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    info!("Starting kube-tagwatch {}", env!("CARGO_PKG_VERSION"));

    let config_path =
        env::var("KUBE_TAGWATCH_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = Arc::new(config::load_config(&config_path)?);

    let client = controller::create_client().await?;
    let http_client = oci_registry::create_client(&config.timeouts)?;
    let cancel = CancellationToken::new();
    let engine = Arc::new(Engine::new(
        config.clone(),
        Arc::new(KubeDiscovery::new(client, config.timeouts.kubernetes())),
        Arc::new(OciRegistryClient::new(http_client.clone())),
        Arc::new(NtfyNotifier::new(http_client, &config.notifications.ntfy)),
        cancel.clone(),
    ));
    info!("Snapshots are stored in {}", engine.store().dir().display());

    info!(
        "Executing job scheduler at cron schedule {}",
        config.system.schedule
    );
    let mut scheduler = JobScheduler::new().await?;
    let job_engine = engine.clone();
    let job = Job::new_async(config.system.schedule.clone(), move |_uuid, _l| {
        let engine = job_engine.clone();
        Box::pin(async move {
            engine.trigger("schedule");
        })
    })
    .with_context(|| format!("Invalid cron schedule {}", config.system.schedule))?;
    scheduler.add(job).await?;
    scheduler.start().await?;

    if config.system.run_at_startup {
        engine.trigger("startup");
    }

    let app = webserver::create_app(AppState {
        engine: engine.clone(),
    });
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.webserver.port));
    info!("Starting webserver on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel))
        .await?;

    info!("Waiting for the reconciliation run in progress to finish");
    engine.wait_idle().await;
    scheduler.shutdown().await?;
    info!("Shut down");
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
    cancel.cancel();
}
