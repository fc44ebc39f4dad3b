use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use clap::Parser;
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

mod admin_socket;
mod backend;
mod config;
mod database;
mod error;
mod events;
mod feed_cache;
mod feed_service;
mod keys;
mod lock;
mod pagination;
mod store;
mod types;

use crate::{
    admin_socket::AdminSocket,
    config::FeedCacheConfig,
    database::Database,
    error::FeedError,
    events::{FeedEvent, FeedEventHandler},
    feed_cache::FeedCache,
    feed_service::FeedService,
    pagination::Envelope,
    types::*,
};

/// Header set by the upstream auth layer with the signed-in user's id.
const VIEWER_HEADER: &str = "x-viewer-id";

#[derive(Parser)]
#[command(name = "timeline-cache")]
#[command(about = "Cached, paginated home and profile timelines")]
struct Args {
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite:./feed.db?mode=rwc")]
    database_url: String,

    #[arg(long, env = "PORT", default_value = "3000")]
    port: u16,

    #[arg(
        long,
        env = "ADMIN_SOCKET",
        default_value = "/var/run/timeline-cache.sock"
    )]
    admin_socket: String,

    #[command(flatten)]
    cache: FeedCacheConfig,
}

#[derive(Clone)]
struct AppState {
    feed: Arc<FeedService>,
    events: FeedEventHandler,
}

#[derive(Debug, Serialize)]
struct FeedResponse {
    #[serde(flatten)]
    feed: Envelope<Post>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct EventAccepted {
    invalidated: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    // Initialize database
    let db = Arc::new(Database::new(&args.database_url).await?);
    db.migrate().await?;

    info!(
        ttl_seconds = args.cache.ttl_seconds,
        per_page = args.cache.default_per_page,
        strategy = ?args.cache.invalidation_strategy,
        "Feed cache configured"
    );
    let cache = Arc::new(FeedCache::new(args.cache.clone()));
    let store: Arc<dyn store::PostStore> = db.clone();

    let app_state = AppState {
        feed: Arc::new(FeedService::new(Arc::clone(&cache), store)),
        events: FeedEventHandler::new(Arc::clone(&db), Arc::clone(&cache)),
    };

    // Start admin socket
    let admin_socket = AdminSocket::new(
        Arc::clone(&db),
        Arc::clone(&cache),
        args.admin_socket.clone(),
    );
    tokio::spawn(async move {
        if let Err(e) = admin_socket.start().await {
            warn!("Admin socket error: {}", e);
        }
    });

    // Start cache maintenance task
    let cache_maintenance = Arc::clone(&cache);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(60));
        loop {
            interval.tick().await;
            cache_maintenance.run_maintenance().await;
            let stats = cache_maintenance.stats();
            info!(
                entries = stats.entries,
                hits = stats.hits,
                misses = stats.misses,
                computes = stats.computes,
                coalesced = stats.coalesced,
                bypasses = stats.bypasses,
                "Feed cache stats"
            );
        }
    });

    let listener = TcpListener::bind(format!("0.0.0.0:{}", args.port)).await?;
    info!("Timeline cache listening on port {}", args.port);

    axum::serve(listener, router(app_state)).await?;
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/feed", get(home_feed))
        .route("/users/{id}/feed", get(profile_feed))
        .route("/events", post(ingest_event))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn root() -> &'static str {
    "Timeline Cache"
}

/// Anonymous when the header is missing or malformed.
fn viewer_from(headers: &HeaderMap) -> Option<UserId> {
    let raw = headers.get(VIEWER_HEADER)?;
    match raw.to_str().ok().and_then(|s| s.trim().parse().ok()) {
        Some(id) => Some(UserId(id)),
        None => {
            warn!("Ignoring malformed {} header", VIEWER_HEADER);
            None
        }
    }
}

async fn home_feed(
    headers: HeaderMap,
    Query(params): Query<FeedParams>,
    State(state): State<AppState>,
) -> Response {
    let scope = FeedScope::following(viewer_from(&headers));
    render_feed(&state, scope, &params).await
}

async fn profile_feed(
    Path(author): Path<i64>,
    headers: HeaderMap,
    Query(params): Query<FeedParams>,
    State(state): State<AppState>,
) -> Response {
    let scope = FeedScope::author(UserId(author), viewer_from(&headers));
    render_feed(&state, scope, &params).await
}

async fn render_feed(state: &AppState, scope: FeedScope, params: &FeedParams) -> Response {
    let request = match state
        .feed
        .page_request(scope, params.page, &params.filter_tokens())
    {
        Ok(request) => request,
        Err(e) => {
            return (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(ErrorResponse {
                    error: "InvalidPageRequest".to_string(),
                    message: e.to_string(),
                }),
            )
                .into_response();
        }
    };

    let result = if params.fresh && scope.is_own() {
        state.feed.fresh_page(&request).await
    } else {
        state.feed.page(&request).await
    };

    match result {
        Ok(feed) => Json(FeedResponse { feed, error: None }).into_response(),
        Err(e) => {
            // Render an empty feed with the error rather than failing the page.
            warn!(scope = %scope, error = %e, "Feed generation error");
            let message = match e {
                FeedError::ComputeFailure(_) | FeedError::HydrationFailure(_) => {
                    "Feed is temporarily unavailable".to_string()
                }
                other => other.to_string(),
            };
            Json(FeedResponse {
                feed: state.feed.empty_page(&request),
                error: Some(message),
            })
            .into_response()
        }
    }
}

async fn ingest_event(State(state): State<AppState>, Json(event): Json<FeedEvent>) -> Response {
    match state.events.handle(event).await {
        Ok(identities) => (
            StatusCode::ACCEPTED,
            Json(EventAccepted {
                invalidated: identities.iter().map(ToString::to_string).collect(),
            }),
        )
            .into_response(),
        Err(e) => {
            warn!("Failed to apply feed event: {:#}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "InternalServerError".to_string(),
                    message: format!("Failed to apply event: {}", e),
                }),
            )
                .into_response()
        }
    }
}
