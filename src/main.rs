//! StudyQuest · Study Assistant Backend
//!
//! - Axum HTTP API for the AI study assistant chat
//! - Per-learner conversation pipeline (queueing, rate-limit retries, titles, saving)
//! - OpenAI-compatible or Gemini generation, offline replies when no key is set
//!
//! Important env variables:
//!   PORT                   : u16 (default 3000)
//!   GENERATION_PROVIDER    : "openai" | "gemini" | "offline" (default: first provider with a key)
//!   OPENAI_API_KEY         : enables the OpenAI-compatible backend
//!   OPENAI_BASE_URL        : default "https://api.openai.com/v1"
//!   OPENAI_MODEL           : default "gpt-4o-mini"
//!   OPENAI_TITLE_MODEL     : default OPENAI_MODEL
//!   GEMINI_API_KEY         : enables the Gemini backend
//!   GEMINI_BASE_URL        : default "https://generativelanguage.googleapis.com/v1beta"
//!   GEMINI_MODEL           : default "gemini-2.0-flash"
//!   STUDYQUEST_CONFIG_PATH : path to TOML config ([prompts] + [pipeline])
//!   LOG_LEVEL              : tracing filter, e.g. "debug" or full directives
//!   LOG_FORMAT             : "pretty" (default), "compact" or "json"

mod backend;
mod config;
mod domain;
mod error;
mod pipeline;
mod protocol;
mod routes;
mod session;
mod state;
mod store;
mod telemetry;
#[cfg(test)]
mod testing;
mod title;
mod util;

use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tracing::{info, instrument};

use crate::routes::build_router;
use crate::state::AppState;

#[instrument(level = "info", skip_all)]
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  telemetry::init_tracing();

  // Config, generation backend, in-memory conversation store.
  let state = Arc::new(AppState::new());

  let app = build_router(state.clone());

  let addr: SocketAddr = std::env::var("PORT")
    .ok()
    .and_then(|p| p.parse::<u16>().ok())
    .map(|port| SocketAddr::from(([0, 0, 0, 0], port)))
    .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 3000)));

  let listener = TcpListener::bind(addr).await?;
  info!(target: "studyquest", %addr, backend = state.backend.name(), "HTTP server listening");
  axum::serve(listener, app)
    .with_graceful_shutdown(shutdown_signal())
    .await?;
  info!(target: "studyquest", "Server stopped");
  Ok(())
}

async fn shutdown_signal() {
  if let Err(e) = tokio::signal::ctrl_c().await {
    tracing::error!(target: "studyquest", error = %e, "Failed to listen for ctrl-c");
    std::future::pending::<()>().await;
  }
  info!(target: "studyquest", "Shutdown requested");
}
