//! Main Entrypoint for the Avatar Relay Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Loading the persona prompts and tool declarations.
//! 3. Building the Gemini Live connector and the session registry.
//! 4. Starting the idle-session sweeper.
//! 5. Constructing the Axum router and applying middleware.
//! 6. Starting the web server and handling graceful shutdown.

use anyhow::Context;
use avatar_api::{config::Config, router::create_router, state::AppState};
use avatar_core::{registry::SessionRegistry, sweeper::EvictionSweeper};
use gemini_realtime::{GeminiConnector, GeminiLiveConfig, VadSettings};
use serde_json::Value;
use std::{collections::HashMap, fs, net::SocketAddr, path::Path, sync::Arc};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal. Shutting down gracefully...");
}

/// A helper function to load prompts from a directory.
fn load_prompts(prompts_path: &Path) -> anyhow::Result<HashMap<String, String>> {
    let mut prompts = HashMap::new();
    let entries = fs::read_dir(prompts_path)
        .with_context(|| format!("Failed to read prompts directory {}", prompts_path.display()))?;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if path.is_file() && path.extension().and_then(|s| s.to_str()) == Some("md") {
            let prompt_key = path
                .file_stem()
                .and_then(|s| s.to_str())
                .context("Could not get file stem")?
                .to_string();
            let content = fs::read_to_string(&path)?;
            prompts.insert(prompt_key, content);
        }
    }
    Ok(prompts)
}

/// Loads `tools.json`: either a bare array of function declarations or an
/// object carrying them under `function_declarations`.
fn load_tools(prompts_path: &Path) -> anyhow::Result<Vec<Value>> {
    let path = prompts_path.join("tools.json");
    if !path.is_file() {
        return Ok(Vec::new());
    }
    let raw = fs::read_to_string(&path)?;
    let parsed: Value = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid JSON in {}", path.display()))?;
    let declarations = match parsed {
        Value::Array(items) => items,
        Value::Object(mut obj) => match obj.remove("function_declarations") {
            Some(Value::Array(items)) => items,
            _ => anyhow::bail!("{} has no function_declarations array", path.display()),
        },
        _ => anyhow::bail!("{} must be an array or an object", path.display()),
    };
    Ok(declarations)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing application state...");

    // --- 3. Load Prompts ---
    let mut prompts = load_prompts(&config.prompts_path)?;
    let system_prompt = prompts
        .remove("system_prompt")
        .context("system_prompt.md not found in prompts directory")?;
    let preamble = prompts
        .remove("initial_context")
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
        .map(Arc::new);
    let tools = load_tools(&config.prompts_path)?;
    info!(
        tools = tools.len(),
        preamble = preamble.is_some(),
        "Prompts loaded"
    );

    // --- 4. Initialize Shared Services ---
    let mut live_config = GeminiLiveConfig::new(
        config.gemini_api_key.clone(),
        config.gemini_model.clone(),
        config.gemini_voice.clone(),
    );
    live_config.system_instruction = Some(system_prompt);
    live_config.tools = tools;
    live_config.output_transcription = config.relay.captions_enabled;
    live_config.vad = config.automatic_vad.then(VadSettings::default);

    let registry = Arc::new(SessionRegistry::new(config.max_sessions));
    let sweeper = EvictionSweeper::new(
        registry.clone(),
        config.sweep_interval,
        config.session_timeout,
    )
    .spawn();

    let app_state = Arc::new(AppState {
        registry,
        connector: Arc::new(GeminiConnector::new(live_config)),
        relay: Arc::new(config.relay.clone()),
        preamble,
    });

    // --- 5. Create Router and Apply Middleware ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(app_state).layer(cors);

    // --- 6. Start Server ---
    info!(
        model = %config.gemini_model,
        voice = %config.gemini_voice,
        max_sessions = config.max_sessions,
        bind_address = %config.bind_address,
        "Service configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    sweeper.abort();
    info!("Server has shut down.");
    Ok(())
}
