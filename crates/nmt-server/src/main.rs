use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod state;

use nmt_core::ModelConfig;
use nmt_engine::{EngineConfig, TextPipeline, TranslationEngine};
use state::AppState;

#[derive(Parser, Debug)]
#[command(name = "nmt-server")]
#[command(about = "LinguaFlow neural machine translation server", long_about = None)]
struct Args {
    /// Path to model directory (config.json + model.safetensors).
    /// 缺省时用固定种子的演示权重启动
    #[arg(short, long, env = "MODEL_DIR")]
    model_dir: Option<PathBuf>,

    /// Path to a HuggingFace tokenizer.json（缺省用内置按词映射）
    #[arg(long, env = "TOKENIZER_PATH")]
    tokenizer: Option<PathBuf>,

    /// Server host
    #[arg(long, default_value = "0.0.0.0", env = "HOST")]
    host: String,

    /// Server port
    #[arg(short, long, default_value = "8000", env = "PORT")]
    port: u16,

    /// Cache TTL in seconds
    #[arg(long, default_value = "3600", env = "CACHE_TTL_SECS")]
    cache_ttl_secs: u64,

    /// Cache capacity (entries), 0 disables caching
    #[arg(long, default_value = "1000", env = "CACHE_CAPACITY")]
    cache_capacity: usize,

    /// Batch coalescing window in milliseconds
    #[arg(long, default_value = "5", env = "BATCH_WINDOW_MS")]
    batch_window_ms: u64,

    /// Maximum requests per batch
    #[arg(long, default_value = "8", env = "MAX_BATCH_SIZE")]
    max_batch_size: usize,

    /// Per-request wait limit in milliseconds
    #[arg(long, default_value = "30000", env = "REQUEST_TIMEOUT_MS")]
    request_timeout_ms: u64,

    /// Skip the startup warmup translation
    #[arg(long, env = "NO_WARMUP")]
    no_warmup: bool,

    /// Log level: trace, debug, info, warn, error
    #[arg(long, default_value = "info", env = "RUST_LOG")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let engine_config = EngineConfig {
        cache_ttl_secs: args.cache_ttl_secs,
        cache_capacity: args.cache_capacity,
        batch_window_ms: args.batch_window_ms,
        max_batch_size: args.max_batch_size,
        request_timeout_ms: args.request_timeout_ms,
        warmup: !args.no_warmup,
    };

    let pipeline = match &args.tokenizer {
        Some(path) => {
            tracing::info!("Loading tokenizer from {}...", path.display());
            TextPipeline::from_file(path)?
        }
        None => {
            tracing::info!("No tokenizer given, using built-in word-level mapping");
            TextPipeline::word_level()
        }
    };

    let engine = TranslationEngine::new(pipeline, engine_config)?;

    match &args.model_dir {
        Some(dir) => {
            tracing::info!("Loading model from {}...", dir.display());
            let version = engine.load_model_dir(dir).await?;
            tracing::info!(version, "Model loaded successfully!");
        }
        None => {
            tracing::warn!("No model directory given, starting with seeded demo weights");
            engine.install_seeded(demo_model_config(), 42)?;
        }
    }

    engine.warmup().await;

    let state = AppState {
        engine,
        model_dir: args.model_dir.clone(),
    };

    // Build router
    let app = Router::new()
        .route("/translate", post(api::translate::translate))
        .route("/languages", get(api::translate::languages))
        // Model management
        .route("/model/info", get(api::admin::model_info))
        .route("/model/reload", post(api::admin::reload_model))
        .route("/cache/clear", post(api::admin::clear_cache))
        // Health & status
        .route("/health", get(api::health::health_check))
        .route("/stats", get(api::health::stats))
        .with_state(state)
        // Middleware
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(tower_http::trace::TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    tracing::info!(
        "🌍 LinguaFlow server listening on http://{}:{}",
        args.host,
        args.port
    );

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// 无模型目录时的演示档位：小到能在 CPU 上即时初始化
fn demo_model_config() -> ModelConfig {
    ModelConfig {
        vocab_size: 8192,
        d_model: 128,
        num_heads: 4,
        num_layers: 2,
        d_ff: 512,
        max_source_len: 64,
        max_target_len: 64,
        pad_id: 0,
        bos_id: 1,
        eos_id: 2,
    }
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install CTRL+C signal handler");
    tracing::info!("Shutdown signal received, gracefully shutting down...");
}
