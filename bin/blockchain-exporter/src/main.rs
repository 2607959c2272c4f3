#![warn(unused_extern_crates)]
#![warn(unused_imports)]

//! A Prometheus exporter polling EVM JSON-RPC endpoints.

use std::{future::IntoFuture, path::Path, sync::Arc};

use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use client::ConnectionPool;
use collector::TokenClassCache;
use config::Settings;
use metrics::{ChainHealth, MetricsBundle};
use poller::{PollerContext, PollerManager, Reloader};

use cli::{Args, Command};
use error::Error;

mod cli;
mod error;

#[tokio::main]
async fn main() {
    let _sentry_guard = vlog::init();

    let args = Args::parse();

    if let Err(error) = run(args).await {
        tracing::error!(%error, "exporter failed");
        std::process::exit(error.exit_code());
    }
}

async fn run(args: Args) -> Result<(), Error> {
    let settings = Settings::from_env()?;

    let config_path = args
        .config_path
        .clone()
        .unwrap_or_else(|| settings.resolve_config_path());

    match args.command {
        Some(Command::PrintConfig) => print_config(&settings, &config_path),
        Some(Command::ValidateConfig) => validate_config(&config_path),
        None => serve(settings, config_path).await,
    }
}

fn print_config(settings: &Settings, config_path: &Path) -> Result<(), Error> {
    let chains = config::load_chains(config_path)?;

    println!("config path: {}", config_path.display());
    println!("{settings:#?}");
    println!("{}", serde_json::to_string_pretty(&chains)?);

    Ok(())
}

fn validate_config(config_path: &Path) -> Result<(), Error> {
    let chains = config::load_chains(config_path)?;
    println!("configuration OK: {} chain(s)", chains.len());
    Ok(())
}

async fn serve(settings: Settings, config_path: std::path::PathBuf) -> Result<(), Error> {
    let chains = config::load_chains(&config_path)?;

    tracing::info!(
        config_path = %config_path.display(),
        chains = chains.len(),
        "starting blockchain exporter",
    );

    let bundle = Arc::new(MetricsBundle::new()?);
    let health = Arc::new(ChainHealth::new(settings.readiness_stale_threshold()));
    let pool = Arc::new(ConnectionPool::new(settings.rpc_request_timeout())?);

    let ctx = Arc::new(PollerContext {
        bundle: bundle.clone(),
        health: health.clone(),
        classes: Arc::new(TokenClassCache::new()),
        rpc_factory: poller::http_rpc_factory(pool.clone(), settings.rpc_request_timeout()),
        pool: Some(pool),
        default_poll_interval: settings.default_poll_interval(),
        max_failure_backoff: settings.max_failure_backoff(),
    });

    let manager = Arc::new(PollerManager::new(ctx));
    let reloader = Arc::new(Reloader::new(manager.clone(), config_path));

    // Bind both listeners before any polling starts so a port conflict
    // fails fast with its own exit code.
    let health_listener = TcpListener::bind(("0.0.0.0", settings.health_port))
        .await
        .map_err(|source| Error::Bind {
            listener: "health",
            port: settings.health_port,
            source,
        })?;
    let metrics_listener = TcpListener::bind(("0.0.0.0", settings.metrics_port))
        .await
        .map_err(|source| Error::Bind {
            listener: "metrics",
            port: settings.metrics_port,
            source,
        })?;

    bundle.exporter.up.set(1);
    manager.start(chains).await;

    if settings.warm_poll_enabled.0 {
        tracing::info!("warm poll enabled, waiting for the first tick of every chain");
        manager.await_first_ticks(settings.warm_poll_timeout()).await;
    }

    let state = api::ApiState {
        bundle: bundle.clone(),
        health,
        reloader: reloader.clone(),
    };

    let reload_monitor = tokio::spawn(sighup_monitor(reloader));

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            wait_for_shutdown_signal().await;
            shutdown.cancel();
        }
    });

    tracing::info!(
        health_port = settings.health_port,
        metrics_port = settings.metrics_port,
        "exporter listening",
    );

    let health_server = axum::serve(health_listener, api::health_router(state.clone()))
        .with_graceful_shutdown({
            let shutdown = shutdown.clone();
            async move { shutdown.cancelled().await }
        })
        .into_future();
    let metrics_server = axum::serve(metrics_listener, api::metrics_router(state))
        .with_graceful_shutdown({
            let shutdown = shutdown.clone();
            async move { shutdown.cancelled().await }
        })
        .into_future();

    let (health_result, metrics_result) = tokio::join!(health_server, metrics_server);

    reload_monitor.abort();
    bundle.exporter.up.set(0);
    manager.stop_all(settings.shutdown_grace()).await;

    health_result.map_err(|source| Error::Serve {
        listener: "health",
        source,
    })?;
    metrics_result.map_err(|source| Error::Serve {
        listener: "metrics",
        source,
    })?;

    tracing::info!("exporter stopped");
    Ok(())
}

/// `SIGHUP` drives the same reload path as `POST /health/reload`.
async fn sighup_monitor(reloader: Arc<Reloader>) {
    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(error) => {
            tracing::error!(%error, "failed to install SIGHUP handler");
            return;
        }
    };

    while hangup.recv().await.is_some() {
        tracing::info!("SIGHUP received, reloading configuration");
        match reloader.try_reload().await {
            Ok(summary) => tracing::info!(
                added = summary.added,
                removed = summary.removed,
                replaced = summary.replaced,
                total = summary.total,
                "configuration reloaded",
            ),
            Err(error) => tracing::error!(%error, "configuration reload failed"),
        }
    }
}

async fn wait_for_shutdown_signal() {
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(error) => {
                tracing::error!(%error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await
            }
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate => {}
    }

    tracing::info!("shutdown signal received");
}
