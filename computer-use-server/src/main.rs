mod chat;
mod config;
mod desktop;
mod error;
mod llm;
mod openai;
mod prune;
mod sandbox;
#[cfg(test)]
mod testing;
mod tools;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    http::{
        header::{
            ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
            ACCESS_CONTROL_ALLOW_ORIGIN,
        },
        HeaderValue,
    },
    routing::{delete, get, post},
    Router,
};
use tower_http::{cors::CorsLayer, set_header::SetResponseHeaderLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::AppConfig;
use llm::{ChatProvider, LlmService};
use sandbox::{RemoteSandboxService, SandboxService};

#[derive(Clone)]
pub struct AppState {
    pub provider: Arc<dyn ChatProvider>,
    pub sandbox: Arc<dyn SandboxService>,
    /// Model id reported by the OpenAI-compatible surface.
    pub model: String,
    /// Cap on the work a handler does before its response starts.
    pub request_timeout: Duration,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::from_env()?;
    info!("Using model: {}", config.llm.model);
    info!("Sandbox service: {}", config.sandbox.api_url);

    let sandbox: Arc<dyn SandboxService> =
        Arc::new(RemoteSandboxService::new(config.sandbox.clone()));
    let provider = Arc::new(LlmService::new(config.llm.clone(), sandbox.clone()));

    let state = AppState {
        model: provider.model().to_string(),
        provider,
        sandbox,
        request_timeout: config.max_request_duration,
    };

    let app = app(state);

    info!("Server listening on {}", config.bind_addr);
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn app(state: AppState) -> Router {
    let native = Router::new()
        .route("/api/chat", post(chat::chat))
        .route("/api/desktop", post(desktop::create_desktop))
        .route("/api/desktop/:id", delete(desktop::destroy_desktop))
        .layer(CorsLayer::permissive());

    // Fixed CORS headers on every v1 response, preflight and errors included.
    let v1 = Router::new()
        .route(
            "/api/v1/chat/completions",
            post(openai::chat_completions).options(openai::preflight),
        )
        .route(
            "/api/v1/models",
            get(openai::list_models).options(openai::preflight),
        )
        .layer(SetResponseHeaderLayer::overriding(
            ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("GET, POST, PUT, DELETE, OPTIONS"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static("Content-Type, Authorization"),
        ));

    Router::new()
        .route("/health", get(health))
        .merge(native)
        .merge(v1)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn health() -> &'static str {
    "OK"
}
