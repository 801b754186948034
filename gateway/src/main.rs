use std::{sync::Arc, time::Duration};

use gateway::{
    config::Config,
    ledger::{CallLedger, DelimitedOwnerResolver, LedgerSweeper},
    manifest::WorkerManifest,
    secrets::{FileSecretStore, NoSecrets, SecretSource},
    webhook::external::ExternalResults,
    worker::WorkerRegistry,
    AppState,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gateway=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!(port = config.port, "gateway starting");

    // Call ledger + periodic sweep
    let ledger = CallLedger::new(
        config.ledger_settings(),
        Arc::new(DelimitedOwnerResolver::new(config.owner_delimiter.clone())),
    );
    let sweeper = LedgerSweeper::start(Arc::clone(&ledger));

    // Secret store used by setEnv
    let secrets: Arc<dyn SecretSource> = match &config.secrets_file {
        Some(path) => {
            info!(path = %path.display(), "using file secret store");
            Arc::new(FileSecretStore::new(path))
        }
        None => Arc::new(NoSecrets),
    };

    // Worker registry
    let workers = WorkerRegistry::new(config.supervisor_settings(), Arc::clone(&ledger), secrets)?;

    if let Some(path) = &config.workers_file {
        let manifest = WorkerManifest::load(path).await?;
        let ready = manifest.launch(&workers).await;
        info!(
            ready,
            listed = manifest.workers.len(),
            "boot workers launched"
        );
    }

    let state = Arc::new(AppState {
        ledger,
        workers: Arc::clone(&workers),
        external_results: ExternalResults::new(),
    });
    let app = gateway::router(state);

    let addr = format!("{}:{}", config.bind, config.port);
    info!("listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down");
    sweeper.stop().await;
    workers.shutdown(Duration::from_secs(15)).await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
