//! HTTP surface: router assembly plus the read-only observer endpoints.
//!
//! `/health` and `/stats` only ever read the registry snapshot through the
//! hub's observer methods; routing is never blocked by them. Both sit behind
//! a small per-IP rate limiter.

use crate::config::Config;
use crate::hub::Hub;
use crate::limiter::IpRateLimiter;
use crate::ws;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Observer requests allowed per IP per minute.
pub const OBSERVER_RATE_LIMIT: u32 = 30;

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    pub hub: Hub,
    pub config: Arc<Config>,
    started_at: Instant,
    observer_limiter: Arc<Mutex<IpRateLimiter>>,
}

impl AppState {
    pub fn new(hub: Hub, config: Arc<Config>) -> AppState {
        AppState {
            hub,
            config,
            started_at: Instant::now(),
            observer_limiter: Arc::new(Mutex::new(IpRateLimiter::new(OBSERVER_RATE_LIMIT, 60))),
        }
    }

    fn allow_observer(&self, addr: &SocketAddr) -> bool {
        self.observer_limiter.lock().unwrap().check_and_record(addr.ip())
    }

    /// Periodic cleanup hook for the observer limiter.
    pub fn gc_limiter(&self) {
        self.observer_limiter.lock().unwrap().gc();
    }
}

/// Assemble the full route table.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws::upgrade))
        .route("/health", get(health))
        .route("/stats", get(stats))
        .with_state(state)
}

/// `GET /health`
async fn health(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    if !state.allow_observer(&addr) {
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }
    Json(json!({
        "status": "healthy",
        "clients": state.hub.client_count().await,
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
struct StatsQuery {
    page: Option<usize>,
    per_page: Option<usize>,
}

/// `GET /stats?page&per_page`
///
/// Out-of-range pagination values fall back to the defaults rather than
/// erroring; a page past the end comes back empty.
async fn stats(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<StatsQuery>,
) -> Response {
    if !state.allow_observer(&addr) {
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }

    let page = query.page.filter(|page| *page >= 1).unwrap_or(1);
    let per_page = query
        .per_page
        .filter(|per_page| (1..=100).contains(per_page))
        .unwrap_or(50);

    let ids = state.hub.client_ids().await;
    let total_clients = ids.len();
    let total_pages = ((total_clients + per_page - 1) / per_page).max(1);
    let start = page.saturating_sub(1).saturating_mul(per_page).min(total_clients);
    let end = start.saturating_add(per_page).min(total_clients);

    Json(json!({
        "total_clients": total_clients,
        "connected_clients": &ids[start..end],
        "page": page,
        "per_page": per_page,
        "total_pages": total_pages,
        "uptime": state.started_at.elapsed().as_secs(),
        "max_clients": state.config.max_clients,
    }))
    .into_response()
}
