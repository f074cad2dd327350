//! Edgeline - live prediction serving
//!
//! Resilient cache, streaming calibration, prediction API and live
//! websocket fan-out in one process.

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use edgeline_backend::api::{create_router, AppState};
use edgeline_backend::cache::{RemoteStore, ResilientCache};
use edgeline_backend::calibration::CalibrationTracker;
use edgeline_backend::config::{CacheConfig, ServerConfig, ServiceConfig};
use edgeline_backend::live::{BroadcastHub, LiveLoops, Revalidator};
use edgeline_backend::prediction::{
    FeatureProvider, HttpFeatureProvider, HttpOddsRepository, HttpPredictor,
    PredictionOrchestrator, Predictor, Repository, Unconfigured,
};

#[derive(Parser, Debug)]
#[command(name = "edgeline", about = "Live prediction serving core")]
struct Args {
    /// TOML config file
    #[arg(long, env = "EDGELINE_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overrides the config file
    #[arg(long, env = "BIND_ADDR")]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    let args = Args::parse();
    init_tracing();

    let mut config = match &args.config {
        Some(path) => ServiceConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => ServiceConfig::from_env(),
    };
    config.apply_env_overrides();
    if let Some(bind) = args.bind {
        config.server.bind_addr = bind;
    }

    info!("Edgeline starting");

    let prometheus = install_metrics();

    // Cache
    let remote = connect_remote(&config.cache);
    let cache = Arc::new(ResilientCache::new(remote, &config.cache));
    cache.log_startup();
    if cache.backend_enabled() {
        if cache.ping().await {
            info!("Connected to remote cache");
        } else {
            warn!("Remote cache unreachable at startup; serving from local fallback until it recovers");
        }
    }
    if config.cache.sweep_interval_secs > 0 {
        cache.spawn_sweeper(std::time::Duration::from_secs(config.cache.sweep_interval_secs));
    }

    // Calibration + prediction
    let calibration = Arc::new(CalibrationTracker::new(
        cache.clone(),
        config.calibration.clone(),
    ));
    let (predictor, features, repository) = build_collaborators(&config.server)?;
    let orchestrator = Arc::new(PredictionOrchestrator::new(
        cache.clone(),
        calibration.clone(),
        predictor,
        features,
        &config.prediction,
    ));

    // Live fan-out
    let revalidator = Revalidator::from_config(&config.live)?;
    if !revalidator.is_configured() {
        info!("Revalidation endpoint not configured; high-impact events broadcast only");
    }
    let loops = LiveLoops::new(
        cache.clone(),
        orchestrator.clone(),
        repository,
        revalidator,
        config.live.clone(),
    );
    let hub = BroadcastHub::with_driver(config.live.connection_buffer, Arc::new(loops));

    let app = create_router(AppState {
        cache,
        calibration,
        orchestrator,
        hub,
        prometheus,
    });

    let addr = config.server.bind_addr.clone();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("API server listening on {}", addr);

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}

#[cfg(feature = "redis")]
fn connect_remote(config: &CacheConfig) -> Option<Arc<dyn RemoteStore>> {
    let url = config.remote_url.as_deref()?;
    // Connects lazily, so an unreachable store is retried by the breaker
    match edgeline_backend::cache::RedisStore::new(url) {
        Ok(store) => Some(Arc::new(store)),
        Err(e) => {
            warn!(error = %e, "REDIS_URL unusable; running local-only");
            None
        }
    }
}

#[cfg(not(feature = "redis"))]
fn connect_remote(config: &CacheConfig) -> Option<Arc<dyn RemoteStore>> {
    if config.remote_url.is_some() {
        warn!("REDIS_URL set but built without the `redis` feature; running local-only");
    }
    None
}

type Collaborators = (Arc<dyn Predictor>, Arc<dyn FeatureProvider>, Arc<dyn Repository>);

fn build_collaborators(server: &ServerConfig) -> Result<Collaborators> {
    let timeout = std::time::Duration::from_millis(server.collaborator_timeout_ms);

    let predictor: Arc<dyn Predictor> = match &server.predictor_url {
        Some(url) => Arc::new(HttpPredictor::new(url, timeout)?),
        None => {
            warn!("PREDICTOR_URL not set; predictions will be unavailable");
            Arc::new(Unconfigured)
        }
    };
    let features: Arc<dyn FeatureProvider> = match &server.features_url {
        Some(url) => Arc::new(HttpFeatureProvider::new(url, timeout)?),
        None => Arc::new(Unconfigured),
    };
    let repository: Arc<dyn Repository> = match &server.odds_url {
        Some(url) => Arc::new(HttpOddsRepository::new(url, timeout)?),
        None => Arc::new(Unconfigured),
    };
    Ok((predictor, features, repository))
}

fn install_metrics() -> Option<PrometheusHandle> {
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "Prometheus recorder not installed");
            None
        }
    }
}

/// Initialize tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "edgeline_backend=debug,edgeline=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    // Standard dotenv search (cwd + parents), then the crate directory
    let _ = dotenv();

    let manifest_env = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if manifest_env.exists() {
        let _ = dotenv::from_path(&manifest_env);
    }
}
