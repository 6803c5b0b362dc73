//! Hearth - family data cache server
//!
//! Serves the aggregated family dataset from an in-memory cache with:
//! - Stale-while-revalidate reads and periodic background refresh
//! - Change detection so unchanged data is never rewritten
//! - Prometheus metrics and a health endpoint

use anyhow::bail;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use clap::Parser;
use hearth::cache::{
    CacheConfig, DataCache, RefreshCoordinator, Scheduler, TokioScheduler, FAMILY_DATA_KEY,
};
use hearth::config::Config;
use hearth::error::HearthError;
use hearth::metrics::{create_metrics, SharedMetrics};
use hearth::services::family::{
    member_stats, FamilyDataSource, FileFamilySource, HttpFamilySource, MemberStats,
    MEMBER_STATS_KEY,
};
use hearth::utils::ascii::print_startup_banner;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Hearth - family data cache server
#[derive(Parser, Debug)]
#[command(name = "hearth")]
#[command(author, version, about = "Family data cache and refresh server", long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging output
    #[arg(long)]
    json_logs: bool,

    /// Enable debug logging for family source requests
    #[arg(long)]
    debug_requests: bool,

    /// Server port (overrides PORT env var)
    #[arg(short, long)]
    port: Option<u16>,

    /// URL serving the family dataset as JSON (overrides FAMILY_SOURCE_URL)
    #[arg(long)]
    source_url: Option<String>,

    /// Local JSON file with the family dataset (overrides FAMILY_SOURCE_FILE)
    #[arg(long)]
    source_file: Option<PathBuf>,
}

/// Application state shared across handlers
#[derive(Clone)]
struct AppState {
    coordinator: RefreshCoordinator,
    member_stats: DataCache<Vec<MemberStats>>,
    metrics: SharedMetrics,
    stale_threshold: Duration,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let boot_start = Instant::now();

    // Load .env file first (before parsing args, so env vars are available)
    dotenvy::dotenv().ok();

    let args = Args::parse();

    init_logging(&args.log_level, args.json_logs, args.debug_requests)?;

    print_startup_banner();

    info!("Starting Hearth v{}", env!("CARGO_PKG_VERSION"));

    // CLI flags override env vars
    let mut config = Config::from_env()?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(url) = args.source_url {
        config.source.url = Some(url);
    }
    if let Some(file) = args.source_file {
        config.source.file = Some(file);
    }
    config.validate()?;

    let metrics = create_metrics()?;

    let source: Arc<dyn FamilyDataSource> = match (&config.source.url, &config.source.file) {
        (Some(url), _) => Arc::new(HttpFamilySource::new(url)),
        (None, Some(path)) => Arc::new(FileFamilySource::new(path.clone())),
        (None, None) => bail!("no family data source configured"),
    };
    info!(source = source.name(), "Family data source configured");

    let scheduler: Arc<dyn Scheduler> = Arc::new(TokioScheduler);
    let cache_config: CacheConfig = config.to_cache_config();
    let refresh_config = config.to_refresh_config();
    let stale_threshold = refresh_config.stale_threshold;

    let family_cache = DataCache::new(cache_config.clone(), scheduler.clone());
    let member_cache: DataCache<Vec<MemberStats>> =
        DataCache::new(cache_config, scheduler.clone());

    // Both stores feed the same counters
    {
        let metrics = metrics.clone();
        family_cache.add_listener(move |event| {
            metrics.observe_cache_event(event);
            Ok(())
        });
    }
    {
        let metrics = metrics.clone();
        member_cache.add_listener(move |event| {
            metrics.observe_cache_event(event);
            Ok(())
        });
    }

    let coordinator = RefreshCoordinator::new(family_cache, source, scheduler, refresh_config);
    coordinator.register_dependent(Arc::new(member_cache.clone()));
    {
        let metrics = metrics.clone();
        coordinator.add_listener(move |event| {
            metrics.observe_refresh_event(event);
            Ok(())
        });
    }

    coordinator.start().await;
    info!(
        boot_ms = boot_start.elapsed().as_millis() as u64,
        cached = coordinator.cache().has(FAMILY_DATA_KEY),
        "Initial refresh finished"
    );

    // Gauge update loop
    let metrics_updater = {
        let coordinator = coordinator.clone();
        let member_cache = member_cache.clone();
        let metrics = metrics.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(5)).await;

                let mut stats = coordinator.cache().stats();
                let members = member_cache.stats();
                stats.size += members.size;
                metrics.update_cache_metrics(&stats);
                metrics.update_refresh_metrics(&coordinator.status());
                metrics
                    .uptime_seconds
                    .set(boot_start.elapsed().as_secs_f64());
            }
        })
    };

    let state = AppState {
        coordinator: coordinator.clone(),
        member_stats: member_cache.clone(),
        metrics: metrics.clone(),
        stale_threshold,
    };

    // Setup Router
    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/stats", get(stats_handler))
        .route("/family", get(family_handler))
        .route("/members", get(members_handler))
        .route("/refresh", post(refresh_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    info!(
        "Listening on http://{} (Family: /family, Metrics: /metrics, Health: /health)",
        addr
    );

    // Setup graceful shutdown
    let shutdown_signal = {
        let coordinator = coordinator.clone();
        let member_cache = member_cache.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for ctrl-c");
                return;
            }
            info!("Shutdown signal received, initiating graceful shutdown...");

            coordinator.stop();
            coordinator.cache().dispose();
            member_cache.dispose();
        }
    };

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    metrics_updater.abort();

    info!("Hearth shutdown complete");
    Ok(())
}

/// Health check endpoint
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.coordinator.status();
    let stale = status.is_stale(state.stale_threshold, Utc::now());
    let entry = state.coordinator.cache().entry_info(FAMILY_DATA_KEY);

    let health = if stale { "degraded" } else { "healthy" };

    Json(serde_json::json!({
        "status": health,
        "lastRefresh": status.last_refresh,
        "stale": stale,
        "entries": state.coordinator.cache().len(),
        "dataVersion": entry.map(|info| info.version),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Metrics endpoint handler
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let output = state.metrics.render();

    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        output,
    )
}

async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "cache": state.coordinator.cache().stats(),
        "memberStatsCache": state.member_stats.stats(),
        "refresh": state.coordinator.status(),
        "familyEntry": state.coordinator.cache().entry_info(FAMILY_DATA_KEY),
    }))
}

async fn family_handler(State(state): State<AppState>) -> Response {
    match state.coordinator.get_family_data(false).await {
        Some(data) => Json(data).into_response(),
        None => unavailable("family data unavailable"),
    }
}

async fn members_handler(State(state): State<AppState>) -> Response {
    let coordinator = state.coordinator.clone();
    let stats = state
        .member_stats
        .get_or_refresh(
            MEMBER_STATS_KEY,
            move || {
                let coordinator = coordinator.clone();
                async move {
                    let data = coordinator.get_family_data(false).await.ok_or_else(|| {
                        HearthError::Upstream("family data unavailable".to_string())
                    })?;
                    Ok(member_stats(&data, Utc::now()))
                }
            },
            None,
        )
        .await;

    match stats {
        Some(stats) => Json(stats).into_response(),
        None => unavailable("member statistics unavailable"),
    }
}

async fn refresh_handler(State(state): State<AppState>) -> Response {
    match state.coordinator.force_refresh().await {
        Some(data) => Json(serde_json::json!({
            "refreshed": true,
            "members": data.members.len(),
            "todos": data.todos.len(),
            "status": state.coordinator.status(),
        }))
        .into_response(),
        None => unavailable("refresh failed"),
    }
}

fn unavailable(message: &str) -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}

fn init_logging(level: &str, json: bool, debug_requests: bool) -> anyhow::Result<()> {
    let level = level.parse::<Level>().unwrap_or(Level::INFO);

    // Build filter: set hearth to requested level, and optionally enable request debugging
    let filter = if debug_requests {
        EnvFilter::new(format!(
            "hearth={},hearth::services::family::source=debug,tower_http=debug,hyper=warn",
            level
        ))
    } else {
        EnvFilter::new(format!("hearth={},tower_http=info,hyper=warn", level))
    };

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .init();
    }

    Ok(())
}
