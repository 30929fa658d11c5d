//! HTTP API Server for the feed
//!
//! REST endpoints consumed by the mobile front door:
//!
//! - `POST {prefix}/search/total` — mixed feed (resumes + challenges)
//! - `POST {prefix}/search/discover` — resumes only
//! - `POST {prefix}/search/flow` — challenges only
//! - `POST {prefix}/search/reload` — atomically rebuild the catalog snapshot
//! - `GET /health` — liveness
//!
//! Request bodies are decoded leniently: the legacy field aliases
//! (`SELF_ID`, `LAST_IDS`, `videos_excluidos`) are honored and an
//! unparseable exclusion list degrades to empty rather than failing the
//! request.

use axum::extract::State;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::catalog::{CatalogHandle, CatalogSnapshot, Flow, Item};
use crate::config::Config;
use crate::database::Database;
use crate::error::{Error, Result};
use crate::recommendation::engine::{EntryKind, FeedEngine, FeedEntry};
use crate::tracking::ActivityTracker;

/// Version string reported by the health endpoint.
pub const API_VERSION: &str = "2.0";

const AVATAR_BASE: &str = "https://media.talentpitch.co/users";
const MAX_DISCOVER_SIZE: usize = 100;
const DEFAULT_DISCOVER_SIZE: usize = 20;

/// Shared application state
pub struct AppState {
    pub config: Arc<Config>,
    pub db: Database,
    pub catalog: CatalogHandle,
    pub engine: FeedEngine,
    pub tracker: ActivityTracker,
}

// ============================================================================
// Request decoding
// ============================================================================

/// Decoded feed request parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedParams {
    pub user_id: i64,
    pub session_id: Option<String>,
    pub excluded_ids: HashSet<i64>,
    pub size: Option<usize>,
}

/// Parse a request body. Malformed JSON, negative ids and unparseable
/// exclusion lists all recover to defaults; this never fails.
pub fn parse_feed_params(body: &str) -> FeedParams {
    let value: Value = serde_json::from_str(body).unwrap_or_else(|_| json!({}));

    let user_id = ["SELF_ID", "user_id"]
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_i64))
        .filter(|id| *id >= 0)
        .unwrap_or(0);

    let session_id = value
        .get("session_id")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    let excluded_ids = ["excluded_ids", "LAST_IDS", "videos_excluidos"]
        .iter()
        .find_map(|key| value.get(*key))
        .map(parse_excluded_ids)
        .unwrap_or_default();

    let size = ["MAX_SIZE", "size"]
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_u64))
        .map(|size| size as usize);

    FeedParams {
        user_id,
        session_id,
        excluded_ids,
        size,
    }
}

/// Exclusion list as an int array or a comma-separated string; anything
/// unparseable contributes nothing.
fn parse_excluded_ids(value: &Value) -> HashSet<i64> {
    match value {
        Value::Array(entries) => entries
            .iter()
            .filter_map(Value::as_i64)
            .filter(|id| *id >= 0)
            .collect(),
        Value::String(csv) => csv
            .split(',')
            .filter_map(|part| part.trim().parse::<i64>().ok())
            .filter(|id| *id >= 0)
            .collect(),
        _ => HashSet::new(),
    }
}

// ============================================================================
// Response shaping
// ============================================================================

/// Feed item shaped for the front door.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum FeedItem {
    Resume(ResumeItem),
    Challenge(ChallengeItem),
}

impl FeedItem {
    pub fn id(&self) -> i64 {
        match self {
            FeedItem::Resume(item) => item.id,
            FeedItem::Challenge(item) => item.id,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ResumeItem {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub id: i64,
    pub name: String,
    pub slug: String,
    pub description: String,
    pub video: String,
    pub image: String,
    pub user_id: i64,
    pub user_name: String,
    pub user_slug: String,
    pub avatar: String,
    pub main_objective: &'static str,
    pub type_audience: &'static str,
    pub type_audiences: Vec<&'static str>,
    pub interest_areas: Vec<String>,
    pub role_objectives: Vec<String>,
    pub connected: String,
}

#[derive(Debug, Serialize)]
pub struct ChallengeItem {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub id: i64,
    pub name: String,
    pub slug: String,
    pub description: String,
    pub video_url: String,
    pub image: String,
    pub user_id: i64,
    pub user_name: String,
    pub user_slug: String,
    pub user_avatar: String,
    pub talent_type: String,
    pub interest_areas: Vec<String>,
    pub type_objectives: Vec<String>,
    pub top: bool,
    pub created_at: String,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_at: Option<String>,
}

fn avatar_url(user_id: i64) -> String {
    format!("{}/{}/avatar-100.png", AVATAR_BASE, user_id)
}

fn resume_item(item: &Item) -> ResumeItem {
    let user_slug = crate::catalog::loader::slugify(&item.creator_name);
    ResumeItem {
        kind: "resume",
        id: item.id,
        name: item.creator_name.clone(),
        slug: format!("{}-{}", user_slug, item.id),
        description: item.description.clone(),
        video: item.video_url.clone(),
        image: item.video_url.clone(),
        user_id: item.creator_id,
        user_name: item.creator_name.clone(),
        user_slug,
        avatar: avatar_url(item.creator_id),
        main_objective: "be_discovered",
        type_audience: "innovators",
        type_audiences: vec!["innovators"],
        interest_areas: vec![],
        role_objectives: vec![],
        connected: String::new(),
    }
}

fn challenge_item(flow: &Flow) -> ChallengeItem {
    ChallengeItem {
        kind: "challenge",
        id: flow.id,
        name: flow.name.clone(),
        slug: flow.slug.clone(),
        description: flow.description.clone(),
        video_url: flow.video_url.clone(),
        image: flow.image.clone(),
        user_id: flow.creator_id,
        user_name: flow.creator_name.clone(),
        user_slug: flow.creator_slug.clone(),
        user_avatar: avatar_url(flow.creator_id),
        talent_type: flow.talent_type.clone(),
        interest_areas: flow.interest_areas.clone(),
        type_objectives: flow.type_objectives.clone(),
        top: true,
        created_at: flow.created_at.to_rfc3339(),
        updated_at: chrono::Utc::now().to_rfc3339(),
        status_at: flow.status_at.clone(),
    }
}

/// Turn assembled feed entries into front-door items, dropping entries whose
/// backing record disappeared from the snapshot.
fn shape_entries(snapshot: &CatalogSnapshot, feed: &[FeedEntry]) -> Vec<FeedItem> {
    feed.iter()
        .filter_map(|entry| match entry.kind {
            EntryKind::Resume => snapshot
                .item(entry.item_id)
                .map(|item| FeedItem::Resume(resume_item(item))),
            EntryKind::Challenge => snapshot
                .flow(entry.item_id)
                .map(|flow| FeedItem::Challenge(challenge_item(flow))),
        })
        .collect()
}

#[derive(Debug, Serialize)]
struct ApiResponse<B: Serialize> {
    #[serde(rename = "statusCode")]
    status_code: u16,
    body: B,
}

#[derive(Debug, Serialize)]
struct MixBody {
    mix_ids: Vec<String>,
    items: Vec<FeedItem>,
}

#[derive(Debug, Serialize)]
struct DiscoverBody {
    resume_ids: Vec<String>,
    items: Vec<FeedItem>,
}

#[derive(Debug, Serialize)]
struct FlowBody {
    challenge_ids: Vec<String>,
    items: Vec<FeedItem>,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

// ============================================================================
// Router
// ============================================================================

/// Build the application router with the configured prefix.
pub fn router(state: Arc<AppState>) -> Router {
    let cors_enabled = state.config.api.cors_enabled;
    let prefix = state.config.api.prefix().to_string();

    let search = Router::new()
        .route("/search/total", post(search_total))
        .route("/search/discover", post(search_discover))
        .route("/search/flow", post(search_flow))
        .route("/search/reload", post(search_reload));

    let mut app = Router::new()
        .route("/health", get(health_check))
        .nest(&prefix, search)
        .with_state(state);

    if cors_enabled {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
        app = app.layer(cors);
    }

    app.layer(TraceLayer::new_for_http())
}

/// Start the API server
pub async fn start_server(state: Arc<AppState>) -> Result<()> {
    let addr = format!("{}:{}", state.config.api.host, state.config.api.port);
    let app = router(state);

    info!("Starting feed API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| Error::config(format!("Failed to bind {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| Error::internal(e))?;

    Ok(())
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: API_VERSION,
    })
}

/// Mixed feed: resumes and challenges interleaved over the slot pattern.
async fn search_total(
    State(state): State<Arc<AppState>>,
    body: String,
) -> Result<Json<ApiResponse<MixBody>>> {
    let params = parse_feed_params(&body);
    let snapshot = current_snapshot(&state).await?;

    state
        .tracker
        .track_feed_request(
            params.user_id,
            "total",
            json!({ "excluded_count": params.excluded_ids.len() }),
            params.session_id.as_deref(),
        )
        .await;

    let mut rng = StdRng::from_entropy();
    let (feed, metrics) = state.engine.assemble_feed(
        &snapshot,
        params.user_id,
        &params.excluded_ids,
        true,
        &mut rng,
    );
    info!(
        "Mixed feed for user {}: {} entries, {:.1}% creator diversity",
        params.user_id, metrics.total_items, metrics.creator_diversity
    );

    for entry in &feed {
        state
            .tracker
            .track_video_view(
                params.user_id,
                entry.item_id,
                &entry.video_url,
                entry.position,
                entry.slot.as_str(),
                params.session_id.as_deref(),
            )
            .await;
    }

    let items = shape_entries(&snapshot, &feed);
    maybe_flush_inline(&state, params.user_id, items.len());

    let mix_ids = items.iter().map(|item| item.id().to_string()).collect();
    Ok(Json(ApiResponse {
        status_code: 200,
        body: MixBody { mix_ids, items },
    }))
}

/// Resumes only: a flow-free feed truncated to the requested size.
async fn search_discover(
    State(state): State<Arc<AppState>>,
    body: String,
) -> Result<Json<ApiResponse<DiscoverBody>>> {
    let params = parse_feed_params(&body);
    let size = params
        .size
        .unwrap_or(DEFAULT_DISCOVER_SIZE)
        .min(MAX_DISCOVER_SIZE);
    let snapshot = current_snapshot(&state).await?;

    state
        .tracker
        .track_feed_request(
            params.user_id,
            "discover",
            json!({ "size": size }),
            params.session_id.as_deref(),
        )
        .await;

    let mut rng = StdRng::from_entropy();
    let (feed, _metrics) = state.engine.assemble_feed(
        &snapshot,
        params.user_id,
        &params.excluded_ids,
        false,
        &mut rng,
    );

    let resumes: Vec<&FeedEntry> = feed
        .iter()
        .filter(|entry| entry.kind == EntryKind::Resume)
        .take(size)
        .collect();

    for entry in &resumes {
        state
            .tracker
            .track_video_view(
                params.user_id,
                entry.item_id,
                &entry.video_url,
                entry.position,
                entry.kind.as_str(),
                params.session_id.as_deref(),
            )
            .await;
    }

    let items: Vec<FeedItem> = resumes
        .iter()
        .filter_map(|entry| {
            snapshot
                .item(entry.item_id)
                .map(|item| FeedItem::Resume(resume_item(item)))
        })
        .collect();
    maybe_flush_inline(&state, params.user_id, items.len());

    let resume_ids = items.iter().map(|item| item.id().to_string()).collect();
    Ok(Json(ApiResponse {
        status_code: 200,
        body: DiscoverBody { resume_ids, items },
    }))
}

/// Challenges only, relevance-ranked, rotating through the user's unseen
/// flows.
async fn search_flow(
    State(state): State<Arc<AppState>>,
    body: String,
) -> Result<Json<ApiResponse<FlowBody>>> {
    let params = parse_feed_params(&body);
    let snapshot = current_snapshot(&state).await?;

    state
        .tracker
        .track_feed_request(
            params.user_id,
            "flow",
            json!({ "excluded_count": params.excluded_ids.len() }),
            params.session_id.as_deref(),
        )
        .await;

    let viewed_flows = load_viewed_flows(&state.db, params.user_id).await;

    let mut rng = StdRng::from_entropy();
    let (feed, metrics) = state.engine.flows_only_feed(
        &snapshot,
        params.user_id,
        &viewed_flows,
        &params.excluded_ids,
        crate::recommendation::FEED_SIZE,
        &mut rng,
    );
    info!(
        "Flows-only feed for user {}: {} flows",
        params.user_id, metrics.total_flows
    );

    for entry in &feed {
        state
            .tracker
            .track_video_view(
                params.user_id,
                entry.item_id,
                &entry.video_url,
                entry.position,
                "FW",
                params.session_id.as_deref(),
            )
            .await;
    }

    let items = shape_entries(&snapshot, &feed);
    maybe_flush_inline(&state, params.user_id, items.len());

    let challenge_ids = items.iter().map(|item| item.id().to_string()).collect();
    Ok(Json(ApiResponse {
        status_code: 200,
        body: FlowBody {
            challenge_ids,
            items,
        },
    }))
}

/// Rebuild the snapshot from the catalog store. On failure the previous
/// snapshot stays live and the endpoint reports the error.
async fn search_reload(State(state): State<Arc<AppState>>) -> Result<Json<Value>> {
    match state
        .catalog
        .reload(&state.db, &state.config.engine)
        .await
    {
        Ok(snapshot) => {
            info!(
                "Catalog reloaded: {} items, {} flows",
                snapshot.items.len(),
                snapshot.flows.len()
            );
            Ok(Json(json!({
                "statusCode": 200,
                "message": "Data reloaded successfully"
            })))
        }
        Err(e) => {
            error!("Catalog reload failed: {}", e);
            Err(e)
        }
    }
}

// ============================================================================
// Handler helpers
// ============================================================================

/// Current snapshot, initializing inline when the process has not loaded one
/// yet. Repeated failure surfaces as 503.
async fn current_snapshot(state: &Arc<AppState>) -> Result<Arc<CatalogSnapshot>> {
    state
        .catalog
        .get_or_load(&state.db, &state.config.engine)
        .await
}

/// Kick off a background flush of the user's buffered activity once a
/// response has tracked enough events.
fn maybe_flush_inline(state: &Arc<AppState>, user_id: i64, tracked: usize) {
    if tracked < state.config.flush.threshold_activities {
        return;
    }

    let tracker = state.tracker.clone();
    let pool = state.db.pool().clone();
    tokio::spawn(async move {
        match tracker.flush_user(&pool, user_id).await {
            Ok(count) => info!("Inline flush for user {}: {} activities", user_id, count),
            Err(e) => warn!("Inline flush failed for user {}: {}", user_id, e),
        }
    });
}

/// Flow ids the user has already viewed, read from the activity log. A
/// store failure degrades to an empty history.
async fn load_viewed_flows(db: &Database, user_id: i64) -> HashSet<i64> {
    let result: std::result::Result<Vec<i64>, sqlx::Error> = sqlx::query_scalar(
        r#"
        SELECT DISTINCT subject_id
        FROM activity_log
        WHERE causer_id = $1
          AND description LIKE '%#FW%'
          AND subject_id IS NOT NULL
        "#,
    )
    .bind(user_id)
    .fetch_all(db.pool())
    .await;

    match result {
        Ok(ids) => {
            info!("User {} has viewed {} flows", user_id, ids.len());
            ids.into_iter().collect()
        }
        Err(e) => {
            warn!("Error reading viewed flows for user {}: {}", user_id, e);
            HashSet::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_params_with_aliases() {
        let params = parse_feed_params(r#"{"SELF_ID": 7, "LAST_IDS": [1, 2, 3]}"#);
        assert_eq!(params.user_id, 7);
        assert_eq!(params.excluded_ids, HashSet::from([1, 2, 3]));

        let params = parse_feed_params(r#"{"user_id": 9, "videos_excluidos": "5,7,9"}"#);
        assert_eq!(params.user_id, 9);
        assert_eq!(params.excluded_ids, HashSet::from([5, 7, 9]));
    }

    #[test]
    fn test_parse_params_recovers_from_garbage() {
        let params = parse_feed_params("this is not json");
        assert_eq!(params.user_id, 0);
        assert!(params.excluded_ids.is_empty());

        // Unparseable list entries contribute nothing
        let params = parse_feed_params(r#"{"excluded_ids": "5,x,,9"}"#);
        assert_eq!(params.excluded_ids, HashSet::from([5, 9]));

        // Negative ids are dropped
        let params = parse_feed_params(r#"{"user_id": -4, "excluded_ids": [-1, 2]}"#);
        assert_eq!(params.user_id, 0);
        assert_eq!(params.excluded_ids, HashSet::from([2]));
    }

    #[test]
    fn test_parse_params_size_aliases() {
        assert_eq!(parse_feed_params(r#"{"MAX_SIZE": 48}"#).size, Some(48));
        assert_eq!(parse_feed_params(r#"{"size": 12}"#).size, Some(12));
        assert_eq!(parse_feed_params("{}").size, None);
    }

    #[test]
    fn test_avatar_and_slug_shape() {
        assert_eq!(
            avatar_url(31),
            "https://media.talentpitch.co/users/31/avatar-100.png"
        );

        let item = Item {
            id: 42,
            creator_id: 31,
            video_url: "https://cdn.example.com/42.mp4".to_string(),
            creator_name: "Ana Gómez".to_string(),
            description: "desc".to_string(),
            city: "Bogotá".to_string(),
            created_at: chrono::Utc::now(),
            days_since_creation: 1,
            views: 0,
            avg_rating: 0.0,
            rating_count: 0,
            has_rating: false,
            match_count: 0,
            like_count: 0,
            exhibited_count: 0,
            skills: vec![],
            knowledges: vec![],
            tools: vec![],
            languages: vec![],
        };
        let shaped = resume_item(&item);
        assert_eq!(shaped.slug, "ana-gómez-42");
        assert_eq!(shaped.user_slug, "ana-gómez");
        assert_eq!(shaped.main_objective, "be_discovered");
        assert_eq!(shaped.type_audiences, vec!["innovators"]);
    }
}
