use anyhow::Context;
use shared_types::Capability;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use taskhub::actors::responder::Responder;
use taskhub::api;
use taskhub::builtin::{add_numbers_handler, add_numbers_manifest, ADD_NUMBERS};
use taskhub::channel::LocalChannel;
use taskhub::config::EngineConfig;
use taskhub::Engine;

const LOCAL_BANK: &str = "local";
const LOCAL_WORKERS: u32 = 4;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("TASKHUB_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn load_env_file() {
    let cwd = match std::env::current_dir() {
        Ok(dir) => dir,
        Err(e) => {
            tracing::warn!(error = %e, "Could not determine current directory for .env lookup");
            return;
        }
    };

    let mut current = cwd.clone();
    loop {
        let candidate = current.join(".env");
        if candidate.exists() {
            match dotenvy::from_path(&candidate) {
                Ok(_) => tracing::info!(path = %candidate.display(), "Loaded environment from .env"),
                Err(e) => tracing::warn!(
                    path = %candidate.display(),
                    error = %e,
                    "Failed to load .env file"
                ),
            }
            return;
        }
        if !current.pop() {
            break;
        }
    }

    tracing::debug!(cwd = %cwd.display(), "No .env file found; using process environment only");
}

/// Register the built-in `add-numbers` task on both strategies.
async fn install_builtins(engine: &Engine) -> anyhow::Result<()> {
    let dispatcher = engine.dispatcher();
    dispatcher.register_task(add_numbers_manifest()).await?;

    let workers: Vec<String> = (0..LOCAL_WORKERS)
        .map(|i| format!("{LOCAL_BANK}-{i}"))
        .collect();
    let channel = Arc::new(LocalChannel::new(LOCAL_BANK, add_numbers_handler()));
    dispatcher
        .register_bank(LOCAL_BANK, workers, channel)
        .await?;
    dispatcher
        .register_capability(Capability::new(LOCAL_BANK, ADD_NUMBERS, 1.0, LOCAL_WORKERS))
        .await?;

    let responder = Responder::new("responder-local").handle(ADD_NUMBERS, add_numbers_handler());
    // Detached only by process exit.
    engine.attach_responder(responder).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    load_env_file();

    let config = EngineConfig::load().context("loading engine config")?;
    let bind_addr = config.server.bind_addr();

    tracing::info!("Starting TaskHub");
    let engine = Engine::start(config).await?;
    install_builtins(&engine).await?;

    let app = api::router()
        .with_state(api::ApiState {
            engine: engine.clone(),
        })
        .layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding {bind_addr}"))?;
    tracing::info!(addr = %bind_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await?;

    engine.shutdown().await;
    Ok(())
}
