use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, rejection::QueryRejection, Path, Query, State},
    http::{header, HeaderValue, Method},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use socialsync_core::{
    MessagesPull, MessagesPush, Post, PostCreated, PostIndex, PostsPage, PushAck,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::CacheServiceConfig;
use crate::error::{CacheError, CacheResult};
use crate::proxy::DirectProxy;
use crate::store::{CacheStore, StoreStats};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<CacheStore>,
    pub proxy: Arc<DirectProxy>,
    pub config: Arc<CacheServiceConfig>,
}

impl AppState {
    pub fn new(config: CacheServiceConfig) -> CacheResult<Self> {
        let proxy = DirectProxy::from_config(&config)?;
        Ok(Self::with_proxy(config, proxy))
    }

    pub fn with_proxy(config: CacheServiceConfig, proxy: DirectProxy) -> Self {
        Self {
            store: Arc::new(CacheStore::new()),
            proxy: Arc::new(proxy),
            config: Arc::new(config),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/messages", get(pull_messages).post(push_messages))
        .route("/posts", get(pull_posts).post(create_post))
        .route("/posts/index", get(get_post_index).post(set_post_index))
        .route("/ipfs/direct/{cid}", get(direct_content))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// Extractor rejections are mapped by hand so malformed requests still get
// the `{ "error" }` body.

fn bad_json(rejection: JsonRejection) -> CacheError {
    CacheError::BadRequest(rejection.body_text())
}

fn bad_query(rejection: QueryRejection) -> CacheError {
    CacheError::BadRequest(rejection.body_text())
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    #[serde(flatten)]
    stats: StoreStats,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        stats: state.store.stats(),
    })
}

// ═══════════════════════════════════════════════════════════════════════════
// Messages
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessagesQuery {
    user_address: Option<String>,
    #[serde(default)]
    since: i64,
}

async fn pull_messages(
    State(state): State<AppState>,
    query: Result<Query<MessagesQuery>, QueryRejection>,
) -> CacheResult<Json<MessagesPull>> {
    let Query(query) = query.map_err(bad_query)?;
    let user = query
        .user_address
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| CacheError::BadRequest("userAddress is required".into()))?;
    Ok(Json(state.store.pull_messages(&user, query.since)))
}

async fn push_messages(
    State(state): State<AppState>,
    body: Result<Json<MessagesPush>, JsonRejection>,
) -> CacheResult<Json<PushAck>> {
    let Json(push) = body.map_err(bad_json)?;
    Ok(Json(state.store.push_messages(push)?))
}

// ═══════════════════════════════════════════════════════════════════════════
// Posts
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Deserialize)]
struct PostsQuery {
    #[serde(default)]
    since: i64,
    #[serde(default)]
    offset: usize,
    limit: Option<usize>,
}

async fn pull_posts(
    State(state): State<AppState>,
    query: Result<Query<PostsQuery>, QueryRejection>,
) -> CacheResult<Json<PostsPage>> {
    let Query(query) = query.map_err(bad_query)?;
    let limit = match query.limit {
        Some(0) => return Err(CacheError::BadRequest("limit must be positive".into())),
        Some(limit) => limit.min(state.config.max_page_size),
        None => socialsync_core::config::DEFAULT_POSTS_PAGE_SIZE.min(state.config.max_page_size),
    };
    Ok(Json(state.store.pull_posts(query.since, query.offset, limit)))
}

async fn create_post(
    State(state): State<AppState>,
    body: Result<Json<Post>, JsonRejection>,
) -> CacheResult<Json<PostCreated>> {
    let Json(post) = body.map_err(bad_json)?;
    let post = state.store.create_post(post)?;
    Ok(Json(PostCreated {
        success: true,
        post,
    }))
}

async fn get_post_index(State(state): State<AppState>) -> Json<PostIndex> {
    Json(state.store.post_index())
}

async fn set_post_index(
    State(state): State<AppState>,
    body: Result<Json<PostIndex>, JsonRejection>,
) -> CacheResult<Json<PushAck>> {
    let Json(index) = body.map_err(bad_json)?;
    let cid = index
        .cid
        .filter(|c| !c.as_str().is_empty())
        .ok_or_else(|| CacheError::BadRequest("cid is required".into()))?;
    Ok(Json(state.store.set_post_index(cid)))
}

// ═══════════════════════════════════════════════════════════════════════════
// Direct content proxy
// ═══════════════════════════════════════════════════════════════════════════

async fn direct_content(
    State(state): State<AppState>,
    Path(cid): Path<String>,
) -> CacheResult<Response> {
    let content = state.proxy.fetch(&cid).await?;
    let content_type = HeaderValue::from_str(&content.content_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));

    Ok((
        [
            (header::CONTENT_TYPE, content_type),
            (
                header::CACHE_CONTROL,
                HeaderValue::from_static("public, max-age=31536000, immutable"),
            ),
        ],
        content.bytes,
    )
        .into_response())
}
