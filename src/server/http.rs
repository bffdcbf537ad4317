//! HTTP side-channel handlers
//!
//! Read-only endpoints the web frontend polls around the streaming session:
//! readiness, the voice list, and cached novel-index lookups.

use std::time::{Duration, Instant};

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::scraper::ChapterLink;
use crate::server::{CachedIndex, ServerState};

#[derive(Debug, Deserialize)]
pub struct NovelQuery {
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct ChapterQuery {
    #[serde(default)]
    pub url: String,
    pub n: usize,
}

/// `GET /health`
pub async fn health_handler(State(state): State<ServerState>) -> impl IntoResponse {
    Json(json!({ "ok": true, "tts_ready": state.tts.is_some() }))
}

/// `GET /voices`
pub async fn voices_handler(State(state): State<ServerState>) -> impl IntoResponse {
    let Some(engine) = state.tts.as_ref() else {
        return Json(json!({ "voices": [], "error": "TTS engine not initialized" }));
    };
    match engine.voices() {
        Ok(voices) => Json(json!({ "voices": voices })),
        Err(e) => Json(json!({ "voices": [], "error": e.to_string() })),
    }
}

/// `GET /novel_index?url=` — always scrapes fresh and refreshes the cache.
pub async fn novel_index_handler(
    State(state): State<ServerState>,
    Query(query): Query<NovelQuery>,
) -> impl IntoResponse {
    if query.url.is_empty() {
        return Json(json!({ "chapters": [], "error": "url is required" })).into_response();
    }
    match state.source.fetch_index(&query.url).await {
        Ok(chapters) => {
            remember_index(&state, &query.url, chapters.clone()).await;
            Json(json!({ "chapters": chapters })).into_response()
        }
        Err(e) => Json(json!({ "chapters": [], "error": e.to_string() })).into_response(),
    }
}

/// `GET /novel_meta?url=`
pub async fn novel_meta_handler(
    State(state): State<ServerState>,
    Query(query): Query<NovelQuery>,
) -> impl IntoResponse {
    match cached_index(&state, &query.url).await {
        Ok(chapters) => Json(json!({ "count": chapters.len() })).into_response(),
        Err(response) => response,
    }
}

/// `GET /novel_chapter?url=&n=` — one-based chapter lookup.
pub async fn novel_chapter_handler(
    State(state): State<ServerState>,
    Query(query): Query<ChapterQuery>,
) -> impl IntoResponse {
    let chapters = match cached_index(&state, &query.url).await {
        Ok(chapters) => chapters,
        Err(response) => return response,
    };

    if query.n < 1 || query.n > chapters.len() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": format!("chapter n must be between 1 and {}", chapters.len())
            })),
        )
            .into_response();
    }
    let item = &chapters[query.n - 1];
    Json(json!({ "n": query.n, "title": item.title, "url": item.url })).into_response()
}

/// Cached chapter list for a novel URL, scraping at most once per TTL.
async fn cached_index(
    state: &ServerState,
    novel_url: &str,
) -> Result<Vec<ChapterLink>, axum::response::Response> {
    if novel_url.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "url is required" })),
        )
            .into_response());
    }

    let ttl = Duration::from_secs(state.config.source.index_cache_ttl_secs);
    {
        let cache = state.index_cache.lock().await;
        if let Some(entry) = cache.get(novel_url) {
            if entry.fetched_at.elapsed() < ttl {
                debug!("Index cache hit for {}", novel_url);
                return Ok(entry.chapters.clone());
            }
        }
    }

    let chapters = state
        .source
        .fetch_index(novel_url)
        .await
        .map_err(|e| (StatusCode::BAD_GATEWAY, Json(json!({ "error": e.to_string() }))).into_response())?;
    remember_index(state, novel_url, chapters.clone()).await;
    Ok(chapters)
}

async fn remember_index(state: &ServerState, novel_url: &str, chapters: Vec<ChapterLink>) {
    let mut cache = state.index_cache.lock().await;
    cache.insert(
        novel_url.to_string(),
        CachedIndex {
            fetched_at: Instant::now(),
            chapters,
        },
    );
}
