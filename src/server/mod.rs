//! Narration server
//!
//! One axum application exposing the WebSocket control protocol at `/ws`
//! plus a handful of plain HTTP side-channel endpoints (health, voice list,
//! novel index lookups). All streaming happens over the WebSocket; the HTTP
//! routes never touch the audio pipeline.

pub mod http;
pub mod session;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::Config;
use crate::scraper::{ChapterLink, ChapterSource};
use crate::tts::TtsEngine;

/// A scraped novel index with its scrape time, kept per novel URL.
pub struct CachedIndex {
    pub fetched_at: Instant,
    pub chapters: Vec<ChapterLink>,
}

/// Shared server state
#[derive(Clone)]
pub struct ServerState {
    pub config: Arc<Config>,
    /// `None` when the engine failed to initialize; the server still runs so
    /// `/health` can report the condition.
    pub tts: Option<Arc<TtsEngine>>,
    pub source: Arc<ChapterSource>,
    pub index_cache: Arc<tokio::sync::Mutex<HashMap<String, CachedIndex>>>,
}

/// Start the narration server
pub async fn start(config: Config) -> Result<()> {
    info!("Initializing TTS engine...");
    let tts = match TtsEngine::from_settings(&config.tts.engine_settings()) {
        Ok(engine) => {
            info!("TTS engine initialized");
            Some(Arc::new(engine))
        }
        Err(e) => {
            error!("Failed to initialize TTS engine: {e:#}");
            None
        }
    };

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid listen address")?;

    let state = ServerState {
        config: Arc::new(config),
        tts,
        source: Arc::new(ChapterSource::new()),
        index_cache: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(http::health_handler))
        .route("/voices", get(http::voices_handler))
        .route("/novel_index", get(http::novel_index_handler))
        .route("/novel_meta", get(http::novel_meta_handler))
        .route("/novel_chapter", get(http::novel_chapter_handler))
        .route("/ws", get(session::ws_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("Listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    axum::serve(listener, app)
        .await
        .context("server terminated")?;
    Ok(())
}
