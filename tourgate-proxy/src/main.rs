//! TourGate: chat gateway for the tourism website assistant.
//!
//! Serves `POST /chat` on the chat port and `/health`, `/ready`,
//! `/metrics` on the admin port.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use clap::Parser;
use prometheus_client::registry::Registry;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tourgate_core::config::GatewayDefaults;
use tourgate_core::telemetry::GatewayMetrics;
use tourgate_core::upstream::{RetryPolicy, UpstreamConfig};
use tourgate_proxy::admin::{AdminServer, AdminServerConfig};
use tourgate_proxy::chat::{ChatState, serve_chat};
use tourgate_proxy::lifecycle::{DrainResult, LifecycleConfig, LifecycleManager};
use tourgate_proxy::ports::{admin_port, chat_port};
use tourgate_proxy::startup::{Gateway, build_upstream, load_template_table, open_history_store};
use tracing::{error, info, warn};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Bind address of the chat listener
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    /// Bind address of the admin listener
    #[arg(long, default_value = "127.0.0.1")]
    admin_bind: String,

    /// Chat port (overrides TOURGATE_CHAT_PORT)
    #[arg(long)]
    chat_port: Option<u16>,

    /// Admin port (overrides TOURGATE_ADMIN_PORT)
    #[arg(long)]
    admin_port: Option<u16>,

    /// YAML template table; the built-in table is used when unset
    #[arg(long, env = "TOURGATE_TEMPLATES")]
    templates: Option<PathBuf>,

    /// JSON Lines history file; history is kept in memory when unset
    #[arg(long, env = "TOURGATE_HISTORY_FILE")]
    history_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // The guard must live until exit so buffered logs are flushed
    let (non_blocking, _guard) = tracing_appender::non_blocking(std::io::stdout());
    tracing_subscriber::fmt()
        .json()
        .with_writer(non_blocking)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    // Phase 1: configuration
    let defaults = GatewayDefaults::from_env();
    if let Err(e) = defaults.validate() {
        error!(error = %e, "Invalid gateway configuration, refusing to start");
        return Err(e.into());
    }
    let upstream_config = UpstreamConfig::from_env()?;

    let lifecycle = Arc::new(LifecycleManager::new(LifecycleConfig::from_env()));
    let shutdown = lifecycle.shutdown_token();

    let mut registry = Registry::default();
    let metrics = Arc::new(GatewayMetrics::new(&mut registry));
    let registry = Arc::new(registry);

    // Phase 2: admin server first, so probes answer during startup
    let admin_config = AdminServerConfig {
        port: cli.admin_port.unwrap_or_else(admin_port),
        bind_addr: cli.admin_bind.clone(),
    };
    let admin = AdminServer::new(lifecycle.clone(), registry.clone(), admin_config.clone());
    let admin_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = admin.run(admin_shutdown).await {
            error!(error = %e, "Admin server error");
        }
    });

    // Phase 3: pipeline components
    let templates = load_template_table(cli.templates.as_deref())?;
    lifecycle.mark_templates_loaded();

    let history = open_history_store(
        cli.history_file.as_deref(),
        defaults.max_turns,
        defaults.history_max_sessions,
    )
    .await?;
    lifecycle.mark_history_ready();

    let upstream = build_upstream(
        upstream_config,
        RetryPolicy::from(&defaults),
        metrics.clone(),
    )?;
    lifecycle.set_upstream_configured(upstream.is_some());

    let gateway = Gateway::assemble(&defaults, templates, upstream, history, metrics.clone());
    gateway.admission.spawn_prune_task(shutdown.clone());
    gateway.cache.spawn_sweep_task(shutdown.clone());
    spawn_uptime_task(metrics.clone(), shutdown.clone());

    setup_signal_handlers(lifecycle.clone());

    // Phase 4: chat listener
    let chat_addr = format!("{}:{}", cli.bind, cli.chat_port.unwrap_or_else(chat_port));
    let chat_state = ChatState {
        orchestrator: gateway.orchestrator.clone(),
        max_turns: defaults.max_turns,
        max_body_bytes: defaults.max_body_bytes,
    };
    let chat_shutdown = shutdown.clone();
    let chat_addr_task = chat_addr.clone();
    let chat_task = tokio::spawn(async move {
        if let Err(e) = serve_chat(&chat_addr_task, chat_state, chat_shutdown).await {
            error!(error = %e, "Chat server error");
        }
    });

    info!(
        chat_addr = %chat_addr,
        admin_addr = %admin_config.bind_string(),
        offline = gateway.orchestrator.is_offline(),
        max_global_concurrency = defaults.max_global_concurrency,
        max_caller_concurrency = defaults.max_caller_concurrency,
        cache_capacity = defaults.cache_capacity,
        "TourGate starting"
    );
    lifecycle.mark_ready();

    // Phase 5: wait for a signal (or a listener failure), then drain
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = chat_task => {
            warn!("Chat server exited unexpectedly");
            lifecycle.begin_shutdown();
        }
    }

    info!(
        drain_timeout_secs = lifecycle.config().drain_timeout.as_secs(),
        "Waiting for in-flight requests to drain"
    );
    let drain_result = lifecycle.drain(&gateway.admission).await;
    lifecycle.mark_stopped();

    match drain_result {
        DrainResult::Complete => info!("All requests drained, shutting down cleanly"),
        DrainResult::Timeout { remaining } => {
            warn!(remaining, "Drain timeout, abandoning in-flight requests")
        }
    }

    Ok(())
}

/// Keep `tourgate_uptime_seconds` current until shutdown.
fn spawn_uptime_task(metrics: Arc<GatewayMetrics>, shutdown: CancellationToken) {
    let started = std::time::Instant::now();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(15));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    metrics.uptime_seconds.set(started.elapsed().as_secs() as i64);
                }
                _ = shutdown.cancelled() => break,
            }
        }
    });
}

/// SIGINT and SIGTERM both begin a graceful shutdown.
fn setup_signal_handlers(lifecycle: Arc<LifecycleManager>) {
    let lifecycle_sigint = lifecycle.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
                lifecycle_sigint.begin_shutdown();
            }
            Err(e) => error!(error = %e, "Failed to listen for SIGINT"),
        }
    });

    #[cfg(unix)]
    tokio::spawn(async move {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received SIGTERM, initiating graceful shutdown");
                lifecycle.begin_shutdown();
            }
            Err(e) => error!(error = %e, "Failed to listen for SIGTERM"),
        }
    });

    #[cfg(not(unix))]
    let _ = lifecycle;
}
