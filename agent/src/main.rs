//! hostwall agent: per-host firewall reconciliation
//!
//! Responsibilities:
//! - Load configuration from /etc/hostwall/config.toml
//! - Bootstrap the managed iptables chains and keep them fail-closed
//! - Recompute the desired rule sets on every tick, membership change and
//!   policy feed update, and commit them through a single apply worker
//! - Publish the local policy feed into the store while leading

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use hostwall_engine::sources::{initial_rules, EndpointSupplement};
use hostwall_engine::{
    run_worker, ApplyQueue, ChainReconciler, ClusterMembership, FeedPublisher, Orchestrator,
    PacketFilter, PolicyStore, Role, StatusBoard, SyncScheduler,
};

mod config;
mod feed_file;
mod host_api;
mod iptables;
mod kv_store;

use config::ConfigSource;
use feed_file::FileFeedOrigin;
use host_api::HostApiClient;
use iptables::IptablesFilter;
use kv_store::KvStoreClient;

fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("Invalid log level '{level}'"))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .compact()
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to set tracing subscriber: {e}"))
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for SIGINT: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

/// The bootstrap rules depend on the local role, so wait until it is known
async fn wait_for_role(
    membership: &dyn ClusterMembership,
    retry_every: Duration,
    cancel: &CancellationToken,
) -> Option<Role> {
    loop {
        match membership.local_role().await {
            Ok(role) => return Some(role),
            Err(e) => warn!("Local role unknown yet: {e}; retrying in {retry_every:?}"),
        }
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(retry_every) => {}
        }
    }
}

async fn log_status(status: StatusBoard, every: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        for (chain, chain_status) in status.snapshot().await {
            info!(
                chain = %chain,
                protected = chain_status.protected,
                applies = chain_status.applies,
                failures = chain_status.failures,
                "Status: last applied {}{}",
                chain_status
                    .last_applied_at
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "never".into()),
                chain_status
                    .last_error
                    .map(|e| format!(", last error: {e}"))
                    .unwrap_or_default()
            );
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let (config, source) = config::load_config()?;
    init_logging(&config.agent.log_level)?;

    info!("hostwall agent v{} starting", env!("CARGO_PKG_VERSION"));
    match &source {
        ConfigSource::File(path) => info!("Configuration loaded from {}", path.display()),
        ConfigSource::Defaults(path) => {
            warn!("Config file not found at {}, using defaults", path.display())
        }
    }

    let settings = config
        .engine_settings()
        .context("Invalid configuration")?;
    info!(
        "Managing chains on {} (bridge {}), sync every {:?}",
        settings.private_interface, settings.bridge_interface, settings.sync_interval
    );

    let host_api = Arc::new(HostApiClient::new(
        &config.collaborators.host_api_url,
        config.request_timeout(),
        config.watch_interval(),
    ));
    let store: Arc<dyn PolicyStore> = Arc::new(KvStoreClient::new(
        &config.collaborators.store_url,
        config.request_timeout(),
        config.watch_interval(),
    ));
    let filter: Arc<dyn PacketFilter> = Arc::new(
        IptablesFilter::new(
            &config.collaborators.iptables_binary,
            &config.collaborators.iptables_restore_binary,
        )
        .dry_run(config.collaborators.dry_run),
    );
    if config.collaborators.dry_run {
        warn!("Dry-run mode: iptables commands are logged, not executed");
    }

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_cancel.cancel();
    });

    let Some(role) = wait_for_role(host_api.as_ref(), config.watch_interval(), &cancel).await else {
        info!("Shutdown before the local role was known");
        return Ok(());
    };
    info!("Local role: {role}");

    let orchestrator: Option<Arc<dyn Orchestrator>> = settings
        .backend
        .needs_discovery()
        .then(|| host_api.clone() as Arc<dyn Orchestrator>);

    let status = StatusBoard::new();
    let bootstrap_settings = settings.clone();
    let mut reconciler = ChainReconciler::new(
        filter,
        settings.bootstrap.clone(),
        role,
        move |role| initial_rules(&bootstrap_settings, role),
        status.clone(),
    );
    if let (Some(orchestrator), Some(_)) = (&orchestrator, &settings.backend.overlay_interface) {
        reconciler = reconciler.with_supplement(Arc::new(EndpointSupplement::new(
            settings.clone(),
            orchestrator.clone(),
        )));
    }

    let queue = ApplyQueue::new();
    let worker = tokio::spawn(run_worker(reconciler, queue.clone(), cancel.clone()));

    let mut scheduler = SyncScheduler::new(
        settings.clone(),
        host_api.clone(),
        store.clone(),
        orchestrator,
        queue,
    );
    if let Some(path) = &config.sync.feed_file {
        info!("Leader feed source: {}", path.display());
        scheduler = scheduler.with_publisher(FeedPublisher::new(
            Arc::new(FileFeedOrigin::new(path)),
            store,
            settings.policy_feed_key.clone(),
        ));
    }

    let forwarders = scheduler.spawn_event_forwarders(cancel.clone());
    let scheduler_task = tokio::spawn(scheduler.run(cancel.clone()));
    let status_task = tokio::spawn(log_status(status, config.status_interval(), cancel.clone()));

    info!("hostwall agent running");
    cancel.cancelled().await;
    info!("Shutting down");

    scheduler_task.await.context("Scheduler task panicked")?;
    worker.await.context("Apply worker panicked")?;
    status_task.await.context("Status task panicked")?;
    for forwarder in forwarders {
        forwarder.await.context("Event forwarder panicked")?;
    }

    info!("hostwall agent stopped");
    Ok(())
}
