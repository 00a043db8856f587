//! Main Entrypoint for the RxConnect API Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Loading the system prompt and the pharmacy dataset.
//! 3. Initializing the shared dialogue and speech clients.
//! 4. Constructing the Axum router and applying middleware.
//! 5. Starting the web server and handling graceful shutdown.

use anyhow::Context;
use async_openai::config::OpenAIConfig;
use rxconnect_api::{
    config::Config,
    router::create_router,
    state::AppState,
    ws::provider::{deepgram::DeepgramSynthesizer, transcriber_for},
};
use rxconnect_core::{llm_client::OpenAICompatibleClient, store::OrderStore};
use std::{collections::HashMap, fs, net::SocketAddr, sync::Arc};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("Received shutdown signal. Shutting down gracefully...");
}

/// A helper function to load prompts from a directory.
fn load_prompts(prompts_path: &std::path::Path) -> anyhow::Result<HashMap<String, String>> {
    let mut prompts = HashMap::new();
    for entry in fs::read_dir(prompts_path)
        .with_context(|| format!("Failed to read prompts directory {}", prompts_path.display()))?
    {
        let path = entry?.path();
        if path.is_file() && path.extension().and_then(|s| s.to_str()) == Some("md") {
            let prompt_key = path
                .file_stem()
                .and_then(|s| s.to_str())
                .context("Could not get file stem")?
                .to_string();
            prompts.insert(prompt_key, fs::read_to_string(&path)?);
        }
    }
    Ok(prompts)
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

    // --- 3. Load Prompt and Dataset ---
    let mut prompts = load_prompts(&config.prompts_path)?;
    let system_prompt = Arc::new(
        prompts
            .remove("system_prompt")
            .context("system_prompt.md not found in prompts directory")?,
    );

    let store = OrderStore::load(&config.data_path).with_context(|| {
        format!(
            "Failed to load pharmacy data from {}",
            config.data_path.display()
        )
    })?;
    info!(orders = store.len(), path = %config.data_path.display(), "Pharmacy data loaded.");

    // --- 4. Initialize Shared Clients ---
    let openai_config = OpenAIConfig::new()
        .with_api_key(&config.openai_api_key)
        .with_api_base(&config.openai_api_base);
    let dialogue = Arc::new(OpenAICompatibleClient::new(
        openai_config,
        config.chat_model.clone(),
    ));
    let transcriber = transcriber_for(&config)
        .await
        .context("Failed to initialize speech-to-text")?;
    let synthesizer = Arc::new(DeepgramSynthesizer::new(
        config.deepgram_api_key.clone(),
        config.deepgram_tts_url.clone(),
    ));

    let app_state = Arc::new(AppState {
        config: Arc::new(config.clone()),
        store: Arc::new(store),
        dialogue,
        transcriber,
        synthesizer,
        system_prompt,
    });

    // --- 5. Create Router and Apply Middleware ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(app_state).layer(cors);

    // --- 6. Start Server ---
    info!(
        model = %config.chat_model,
        stt_model = %config.stt_model,
        stt_mode = %config.stt_mode,
        voice = %config.tts_voice,
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

    info!("Server has shut down.");
    Ok(())
}
