//! Main command — starts the execution core's HTTP server

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use tee_core::builder::EnvironmentBuilder;
use tee_core::config::Configuration;
use tee_core::cron::CronRegistry;
use tee_core::engine::ExecutionEngine;
use tee_core::governor::Governor;
use tee_core::http::{self, AppState};
use tee_core::reaper::Reaper;
use tee_core::runtime::DockerRuntime;
use tee_core::store::Store;

pub async fn run(config: Configuration) -> Result<()> {
    let config = Arc::new(config);

    info!("configuration loaded");
    info!("  api: {}:{}", config.api.host, config.api.port);
    info!("  store: {}", config.store.database_path);
    info!(
        "  governor: setup={} execution={}",
        config.governor.setup_concurrency, config.governor.execution_concurrency
    );

    if config.auth.disabled {
        warn!("bearer token authentication is DISABLED");
    }

    let isolation = if config.runtime.relaxed_isolation {
        warn!("relaxed isolation mode enabled: kernel-level sandboxing (no-new-privileges, capability drops) is weakened. Do not use in production.");
        tee_core::runtime::Isolation::Relaxed
    } else {
        tee_core::runtime::Isolation::Hard
    };

    let store = Arc::new(Store::open(&config.store.database_path)?);

    let runtime: Arc<DockerRuntime> =
        Arc::new(DockerRuntime::connect(config.runtime.docker_socket.as_deref())?);
    let runtime_dyn: Arc<dyn tee_core::runtime::ContainerRuntime> = runtime.clone();

    let governor = Arc::new(Governor::new(
        config.governor.setup_concurrency,
        config.governor.execution_concurrency,
    ));

    let builder = Arc::new(EnvironmentBuilder::new(
        runtime_dyn.clone(),
        store.clone(),
        governor.clone(),
        config.runtime.image_deno.clone(),
        config.runtime.image_node.clone(),
        isolation,
    ));

    let engine = Arc::new(ExecutionEngine::new(
        runtime_dyn.clone(),
        store.clone(),
        governor.clone(),
        config.limits.default_timeout_ms,
        config.limits.default_memory_mb,
        config.limits.max_timeout_ms,
        config.limits.max_memory_mb,
        config.runtime.image_deno.clone(),
        config.runtime.image_node.clone(),
        isolation,
    ));

    let reaper = Arc::new(Reaper::new(runtime_dyn.clone(), store.clone(), governor.clone()));

    info!("reconciling environment store against the runtime's volumes");
    reaper.reconcile().await;

    let cron = Arc::new(CronRegistry::new(reaper.clone()));
    cron.start(Duration::from_secs(config.reaper.interval_secs)).await;
    info!("reaper sweep scheduled every {}s", config.reaper.interval_secs);

    let state = AppState {
        builder,
        engine,
        runtime: runtime_dyn,
        store,
        config: config.clone(),
    };
    let app = http::build_router(state);

    let bind_addr: SocketAddr = format!("{}:{}", config.api.host, config.api.port)
        .parse()
        .expect("invalid bind address");

    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();
    let shutdown_cron = cron.clone();

    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C handler");
        warn!("received shutdown signal, stopping server...");
        shutdown_cron.stop().await;
        shutdown_handle.graceful_shutdown(Some(Duration::from_secs(10)));
    });

    info!("starting HTTP server on {}", bind_addr);
    axum_server::bind(bind_addr)
        .handle(handle)
        .serve(app.into_make_service())
        .await?;

    info!("execution core stopped");
    Ok(())
}
