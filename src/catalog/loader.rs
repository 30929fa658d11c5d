//! Catalog load pipeline
//!
//! Populates a snapshot from the relational store in a fixed order:
//! Users -> Items -> Interactions -> Connections -> Flows. Each step failing
//! is fatal to the whole load; the caller decides whether to keep a previous
//! snapshot (reload) or surface the failure (startup).
//!
//! All enrichment happens SQL-side where the store can do it cheaply
//! (aggregated ratings, matches, likes, views) and in `CatalogSnapshot::build`
//! where it must also hold for injected fixtures (rating clamp, day
//! arithmetic, flow dedup).

use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use tracing::{info, instrument};

use super::{
    normalize_city, Blacklist, CatalogSnapshot, Connection, Creator, Flow, Interaction,
    InteractionKind, Item,
};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::recommendation::metrics::PerformanceTimer;

/// Caps applied when decoding the JSON attribute columns.
const MAX_SKILLS: usize = 5;
const MAX_KNOWLEDGES: usize = 3;
const MAX_TOOLS: usize = 3;
const MAX_LANGUAGES: usize = 3;

/// Laravel-era polymorphic type tag still present in the store.
const RESUME_MODEL_TYPE: &str = r"App\Interacpedia\Resumes\Resume";

/// Load a complete snapshot from the relational store.
#[instrument(skip(pool, config))]
pub async fn load_snapshot(pool: &PgPool, config: &EngineConfig) -> Result<CatalogSnapshot> {
    let timer = PerformanceTimer::new("load_snapshot");
    let now = Utc::now();

    let blacklist = Blacklist::from_file(&config.blacklist_path);
    let blocked = blacklist.as_vec();

    let creators = load_users(pool).await?;
    let items = load_items(pool, &blocked, config.item_recency_days, now).await?;
    let interactions = load_interactions(pool).await?;
    let connections = load_connections(pool).await?;
    let flows = load_flows(pool, &blocked, config.flow_recency_days, now).await?;

    let snapshot = CatalogSnapshot::build(
        creators,
        items,
        interactions,
        connections,
        flows,
        blacklist,
        now,
    );

    timer.log_if_slow(30_000);
    Ok(snapshot)
}

// ============================================================================
// Users
// ============================================================================

#[derive(sqlx::FromRow)]
struct UserRow {
    id: i64,
    name: String,
    city: String,
    country: String,
    created_at: Option<DateTime<Utc>>,
}

async fn load_users(pool: &PgPool) -> Result<Vec<Creator>> {
    let rows: Vec<UserRow> = sqlx::query_as(
        r#"
        SELECT
            u.id,
            COALESCE(u.name, '') AS name,
            COALESCE(NULLIF(TRIM(u.city), ''), '') AS city,
            COALESCE(NULLIF(TRIM(u.country), ''), '') AS country,
            u.created_at
        FROM users u
        WHERE u.deleted_at IS NULL
        "#,
    )
    .fetch_all(pool)
    .await?;

    info!("Users loaded: {}", rows.len());

    Ok(rows
        .into_iter()
        .map(|row| Creator {
            id: row.id,
            name: row.name,
            city: row.city,
            country: row.country,
            created_at: row.created_at,
        })
        .collect())
}

// ============================================================================
// Items (resumes)
// ============================================================================

#[derive(sqlx::FromRow)]
struct ItemRow {
    id: i64,
    user_id: i64,
    video: String,
    video_skills: Option<String>,
    video_knowledges: Option<String>,
    video_tools: Option<String>,
    video_languages: Option<String>,
    created_at: DateTime<Utc>,
    description: String,
    creator_city: String,
    creator_country: String,
    creator_name: String,
    avg_rating: f64,
    rating_count: i64,
    match_count: i64,
    like_count: i64,
    exhibited_count: i64,
    actual_views: i64,
}

async fn load_items(
    pool: &PgPool,
    blocked: &[String],
    recency_days: i64,
    now: DateTime<Utc>,
) -> Result<Vec<Item>> {
    let oldest = now - Duration::days(recency_days);

    let query = format!(
        r#"
        SELECT
            r.id,
            r.user_id,
            r.video,
            r.skills::text AS video_skills,
            r.knowledges::text AS video_knowledges,
            r.tools::text AS video_tools,
            r.languages::text AS video_languages,
            r.created_at,
            COALESCE(r.description, '') AS description,
            COALESCE(NULLIF(TRIM(u.city), ''), '') AS creator_city,
            COALESCE(NULLIF(TRIM(u.country), ''), '') AS creator_country,
            COALESCE(u.name, '') AS creator_name,
            LEAST(COALESCE(tf.avg_rating, 0), 5)::float8 AS avg_rating,
            COALESCE(tf.rating_count, 0)::int8 AS rating_count,
            COALESCE(m.match_count, 0)::int8 AS match_count,
            COALESCE(l.like_count, 0)::int8 AS like_count,
            COALESCE(e.exhibited_count, 0)::int8 AS exhibited_count,
            COALESCE(v.view_count, 0)::int8 AS actual_views
        FROM resumes r
        JOIN users u ON r.user_id = u.id
        LEFT JOIN (
            SELECT model_id,
                   AVG(LEAST(value, 5)) AS avg_rating,
                   COUNT(*) AS rating_count
            FROM team_feedbacks
            WHERE type = 'ranking_resume' AND value > 0
            GROUP BY model_id
        ) tf ON tf.model_id = r.id
        LEFT JOIN (
            SELECT model_id, COUNT(*) AS match_count
            FROM matches
            WHERE status = 'accepted'
            GROUP BY model_id
        ) m ON m.model_id = r.id
        LEFT JOIN (
            SELECT model_id, COUNT(*) AS like_count
            FROM likes
            WHERE type = 'save'
            GROUP BY model_id
        ) l ON l.model_id = r.id
        LEFT JOIN (
            SELECT resume_id, COUNT(*) AS exhibited_count
            FROM resumes_exhibited
            GROUP BY resume_id
        ) e ON e.resume_id = r.id
        LEFT JOIN (
            SELECT model_id, COUNT(*) AS view_count
            FROM views
            WHERE model_type = '{model_type}'
            GROUP BY model_id
        ) v ON v.model_id = r.id
        WHERE r.deleted_at IS NULL
          AND r.status = 'send'
          AND r.video IS NOT NULL
          AND r.video <> ALL($1)
          AND COALESCE(r.description, '') NOT IN ('prueba', 'test')
          AND r.created_at >= $2
          AND u.deleted_at IS NULL
        "#,
        model_type = RESUME_MODEL_TYPE,
    );

    let rows: Vec<ItemRow> = sqlx::query_as(&query)
        .bind(blocked)
        .bind(oldest)
        .fetch_all(pool)
        .await?;

    info!("Items loaded: {}", rows.len());

    let items: Vec<Item> = rows
        .into_iter()
        .map(|row| {
            let city = normalize_city(&row.creator_city, &row.creator_country);
            Item {
                id: row.id,
                creator_id: row.user_id,
                video_url: row.video,
                creator_name: row.creator_name,
                description: row.description,
                city,
                created_at: row.created_at,
                days_since_creation: 0,
                views: row.actual_views,
                avg_rating: row.avg_rating,
                rating_count: row.rating_count,
                has_rating: row.rating_count > 0,
                match_count: row.match_count,
                like_count: row.like_count,
                exhibited_count: row.exhibited_count,
                skills: decode_attributes(row.video_skills.as_deref(), MAX_SKILLS),
                knowledges: decode_attributes(row.video_knowledges.as_deref(), MAX_KNOWLEDGES),
                tools: decode_attributes(row.video_tools.as_deref(), MAX_TOOLS),
                languages: decode_attributes(row.video_languages.as_deref(), MAX_LANGUAGES),
            }
        })
        .collect();

    let with_city = items.iter().filter(|i| i.city != "Unknown").count();
    info!("Items with a resolved city: {}", with_city);

    Ok(items)
}

// ============================================================================
// Interactions
// ============================================================================

#[derive(sqlx::FromRow)]
struct InteractionRow {
    user_id: i64,
    item_id: i64,
    rating: f64,
    created_at: Option<DateTime<Utc>>,
    kind: String,
}

async fn load_interactions(pool: &PgPool) -> Result<Vec<Interaction>> {
    let rows: Vec<InteractionRow> = sqlx::query_as(
        r#"
        SELECT
            user_id,
            model_id AS item_id,
            LEAST(value, 5)::float8 AS rating,
            created_at,
            'rating' AS kind
        FROM team_feedbacks
        WHERE type = 'ranking_resume' AND value > 0 AND user_id IS NOT NULL
        UNION ALL
        SELECT
            user_id,
            model_id AS item_id,
            3.0::float8 AS rating,
            created_at,
            'save' AS kind
        FROM likes
        WHERE type = 'save' AND user_id IS NOT NULL
        UNION ALL
        SELECT
            user_id,
            model_id AS item_id,
            4.0::float8 AS rating,
            created_at,
            'match' AS kind
        FROM matches
        WHERE status = 'accepted' AND user_id IS NOT NULL
        "#,
    )
    .fetch_all(pool)
    .await?;

    info!("Interactions loaded: {}", rows.len());

    Ok(rows
        .into_iter()
        .map(|row| Interaction {
            user_id: Some(row.user_id),
            item_id: row.item_id,
            rating: row.rating,
            kind: match row.kind.as_str() {
                "rating" => InteractionKind::Rating,
                "save" => InteractionKind::Save,
                "match" => InteractionKind::Match,
                _ => InteractionKind::View,
            },
            created_at: row.created_at,
        })
        .collect())
}

// ============================================================================
// Connections
// ============================================================================

#[derive(sqlx::FromRow)]
struct ConnectionRow {
    user_id: i64,
    connected_user_id: i64,
}

async fn load_connections(pool: &PgPool) -> Result<Vec<Connection>> {
    let rows: Vec<ConnectionRow> = sqlx::query_as(
        r#"
        SELECT
            from_id AS user_id,
            to_id AS connected_user_id
        FROM user_connections
        WHERE status = 'accepted'
        "#,
    )
    .fetch_all(pool)
    .await?;

    info!("Social connections loaded: {}", rows.len());

    Ok(rows
        .into_iter()
        .map(|row| Connection {
            from_user_id: row.user_id,
            to_user_id: row.connected_user_id,
        })
        .collect())
}

// ============================================================================
// Flows (challenges)
// ============================================================================

#[derive(sqlx::FromRow)]
struct FlowRow {
    id: i64,
    user_id: i64,
    video: String,
    name: String,
    slug: String,
    description: String,
    image: String,
    talent_type: String,
    interest_areas: Option<String>,
    type_objectives: Option<String>,
    status_at: Option<String>,
    created_at: DateTime<Utc>,
    creator_name: String,
    creator_city: String,
    creator_country: String,
}

async fn load_flows(
    pool: &PgPool,
    blocked: &[String],
    recency_days: i64,
    now: DateTime<Utc>,
) -> Result<Vec<Flow>> {
    let oldest = now - Duration::days(recency_days);

    // Latest flow per video URL wins; rows come out newest-first so the
    // in-memory dedup keeps the same winner.
    let rows: Vec<FlowRow> = sqlx::query_as(
        r#"
        SELECT
            c.id,
            c.user_id,
            c.video,
            COALESCE(c.name, '') AS name,
            COALESCE(c.slug, '') AS slug,
            COALESCE(c.description, '') AS description,
            COALESCE(c.image, c.video) AS image,
            COALESCE(c.talent_type, 'innovators') AS talent_type,
            c.interest_areas::text AS interest_areas,
            c.type_objectives::text AS type_objectives,
            c.status_at::text AS status_at,
            c.created_at,
            COALESCE(u.name, '') AS creator_name,
            COALESCE(NULLIF(TRIM(u.city), ''), '') AS creator_city,
            COALESCE(NULLIF(TRIM(u.country), ''), '') AS creator_country
        FROM (
            SELECT c2.*,
                   ROW_NUMBER() OVER (PARTITION BY c2.video ORDER BY c2.created_at DESC) AS rn
            FROM challenges c2
            WHERE c2.deleted_at IS NULL
              AND c2.status = 'published'
              AND c2.video IS NOT NULL
              AND c2.video <> ALL($1)
              AND (c2.created_at >= $2 OR c2.updated_at >= $2)
              AND c2.name NOT IN ('prueba', 'test')
              AND c2.description NOT IN ('prueba', 'test')
        ) c
        JOIN users u ON c.user_id = u.id
        WHERE c.rn = 1
        ORDER BY c.created_at DESC
        "#,
    )
    .bind(blocked)
    .bind(oldest)
    .fetch_all(pool)
    .await?;

    info!("Flows loaded: {}", rows.len());

    Ok(rows
        .into_iter()
        .map(|row| {
            let city = normalize_city(&row.creator_city, &row.creator_country);
            let creator_slug = slugify(&row.creator_name);
            let type_objectives = {
                let decoded = decode_attributes(row.type_objectives.as_deref(), usize::MAX);
                if decoded.is_empty() {
                    vec!["hire".to_string()]
                } else {
                    decoded
                }
            };
            Flow {
                id: row.id,
                creator_id: row.user_id,
                video_url: row.video,
                name: row.name,
                slug: row.slug,
                description: row.description,
                image: row.image,
                city,
                created_at: row.created_at,
                days_since_creation: 0,
                creator_name: row.creator_name,
                creator_slug,
                talent_type: row.talent_type,
                interest_areas: decode_attributes(row.interest_areas.as_deref(), usize::MAX),
                type_objectives,
                status_at: row.status_at,
            }
        })
        .collect())
}

// ============================================================================
// Helpers
// ============================================================================

/// Decode a JSON text column into a capped, deduplicated list of strings.
/// Anything unparseable becomes the empty list.
pub fn decode_attributes(raw: Option<&str>, cap: usize) -> Vec<String> {
    let Some(raw) = raw else {
        return Vec::new();
    };

    let Ok(value) = serde_json::from_str::<serde_json::Value>(raw) else {
        return Vec::new();
    };
    let Some(array) = value.as_array() else {
        return Vec::new();
    };

    let mut out: Vec<String> = Vec::new();
    for entry in array {
        if let Some(text) = entry.as_str() {
            if !out.iter().any(|existing| existing == text) {
                out.push(text.to_string());
                if out.len() >= cap {
                    break;
                }
            }
        }
    }
    out
}

/// Lowercase-hyphenated display name, matching the front-end slug scheme.
pub fn slugify(name: &str) -> String {
    name.to_lowercase().replace(' ', "-")
}
