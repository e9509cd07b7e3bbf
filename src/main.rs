use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};

use llm_chat_gate::config::{Cli, Config};
use llm_chat_gate::gate::AdmissionGate;
use llm_chat_gate::inference::handle::SharedEngine;
use llm_chat_gate::inference::llama_ffi::LlamaFactory;
use llm_chat_gate::server::api::{build_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "llm_chat_gate=debug,tower_http=debug"
    } else {
        "llm_chat_gate=info,tower_http=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("llm-chat-gate v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let mut config = Config::load(&cli.config)?;
    config.apply_cli(&cli);

    info!(
        model = %config.model.model_path.display(),
        threads = config.model.n_threads,
        context_size = config.model.context_size,
        "Configuration loaded"
    );
    info!(
        max_concurrency = config.admission.max_concurrency,
        queue_timeout_secs = config.admission.queue_timeout_secs,
        "Admission gate"
    );

    let engine = SharedEngine::new(Arc::new(LlamaFactory::new(config.model.chat_format)));
    let engine_config = config.engine_config();

    // Warm the engine. A failure here is not fatal; requests will report it.
    let preload = {
        let engine = engine.clone();
        let engine_config = engine_config.clone();
        tokio::task::spawn_blocking(move || engine.preload(&engine_config))
    };
    match preload.await {
        Ok(Ok(())) => info!("Model preloaded"),
        Ok(Err(e)) => error!("Model preload failed: {e}"),
        Err(e) => error!("Model preload task failed: {e}"),
    }

    let gate = AdmissionGate::new(
        config.admission.max_concurrency,
        config.admission.queue_timeout(),
    );

    // Build application state.
    let state = Arc::new(AppState::new(engine, engine_config, gate.clone())?);

    // Build the HTTP router.
    let app = build_router(state, &config.server);

    // Start the server.
    let listen_addr = config.server.listen.clone();
    info!(addr = listen_addr, "Starting server");

    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Listening on {listen_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(gate))
        .await?;

    info!("Server stopped");
    Ok(())
}

/// Wait for Ctrl-C, then stop admitting so queued requests fail fast while
/// in-flight ones drain.
async fn shutdown_signal(gate: AdmissionGate) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    info!(in_use = gate.in_use(), "Shutdown signal received, closing admission gate");
    gate.close();
}
