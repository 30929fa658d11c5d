//! Activity tracking
//!
//! Write-buffered user activity: feed requests and per-video impressions go
//! into the key-value cache (per-user lists with a 24h TTL, per-session seen
//! sets with a 1h TTL) and drain periodically into the relational store's
//! append-only `activity_log` table.
//!
//! Tracking is strictly fire-and-forget from the request's point of view: a
//! cache or database failure is logged and swallowed, never surfaced to the
//! feed response.

use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::HashSet;
use tracing::{debug, error, info, warn};

use crate::config::CacheConfig;
use crate::error::{Error, Result};

const USER_ACTIVITY_PREFIX: &str = "user_activity:";
const LOG_NAME: &str = "app";
const CAUSER_TYPE: &str = r"App\User";
const RESUME_SUBJECT_TYPE: &str = r"App\Interacpedia\Resumes\Resume";

/// One buffered activity event, serialized into the per-user cache list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub event_type: String,
    pub user_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feed_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    pub timestamp: String,
    pub session_id: String,
}

impl ActivityEvent {
    /// Hash-tag description stored alongside the event in `activity_log`.
    fn description(&self) -> String {
        match self.event_type.as_str() {
            "video_view" => {
                let feed_type = self.feed_type.as_deref().unwrap_or("feed");
                format!("#video #view #{}", feed_type)
            }
            "feed_request" => {
                let endpoint = self.endpoint.as_deref().unwrap_or("feed");
                format!("#feed #request #{}", endpoint)
            }
            _ => "#activity".to_string(),
        }
    }

    fn url(&self) -> String {
        match self.event_type.as_str() {
            "video_view" => format!(
                "/api/search/feed/video/{}",
                self.video_id.unwrap_or_default()
            ),
            "feed_request" => format!(
                "/api/search/{}",
                self.endpoint.as_deref().unwrap_or("feed")
            ),
            _ => "/api/search".to_string(),
        }
    }

    fn subject_type(&self) -> Option<&'static str> {
        if self.event_type == "video_view" {
            Some(RESUME_SUBJECT_TYPE)
        } else {
            None
        }
    }
}

/// Buffered activity tracker over the cache connection manager.
///
/// Connection failure at startup degrades the tracker to a no-op rather than
/// failing the service; feeds keep serving without telemetry.
#[derive(Clone)]
pub struct ActivityTracker {
    conn: Option<ConnectionManager>,
    config: CacheConfig,
}

impl ActivityTracker {
    /// Connect to the cache. On failure the tracker is disabled and every
    /// tracking call becomes a cheap no-op.
    pub async fn connect(config: &CacheConfig) -> Self {
        let conn = match redis::Client::open(config.url.as_str()) {
            Ok(client) => match ConnectionManager::new(client).await {
                Ok(conn) => {
                    info!("Activity cache connected");
                    Some(conn)
                }
                Err(e) => {
                    error!("Activity cache unavailable, tracking disabled: {}", e);
                    None
                }
            },
            Err(e) => {
                error!("Invalid cache URL, tracking disabled: {}", e);
                None
            }
        };

        Self {
            conn,
            config: config.clone(),
        }
    }

    /// A tracker with no backing cache (fixtures and degraded mode).
    pub fn disabled(config: &CacheConfig) -> Self {
        Self {
            conn: None,
            config: config.clone(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.conn.is_some()
    }

    fn session_key(user_id: i64, session_id: Option<&str>) -> String {
        match session_id {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => format!("session:{}:{}", user_id, Utc::now().timestamp()),
        }
    }

    /// Record a video impression: pushed onto the user's activity list and
    /// added to the session's seen set.
    pub async fn track_video_view(
        &self,
        user_id: i64,
        video_id: i64,
        video_url: &str,
        position: usize,
        feed_type: &str,
        session_id: Option<&str>,
    ) -> bool {
        let Some(conn) = &self.conn else {
            return false;
        };
        let mut conn = conn.clone();

        let session_key = Self::session_key(user_id, session_id);
        let event = ActivityEvent {
            event_type: "video_view".to_string(),
            user_id,
            video_id: Some(video_id),
            video_url: Some(video_url.to_string()),
            position: Some(position),
            feed_type: Some(feed_type.to_string()),
            endpoint: None,
            params: None,
            timestamp: Utc::now().to_rfc3339(),
            session_id: session_key.clone(),
        };

        let payload = match serde_json::to_string(&event) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize activity event: {}", e);
                return false;
            }
        };

        let activity_key = format!("{}{}", USER_ACTIVITY_PREFIX, user_id);
        let session_videos_key = format!("{}:videos", session_key);
        let result: redis::RedisResult<()> = async {
            conn.lpush::<_, _, ()>(&activity_key, payload).await?;
            conn.expire::<_, ()>(&activity_key, self.config.activity_ttl.as_secs() as i64)
                .await?;
            conn.sadd::<_, _, ()>(&session_videos_key, video_id).await?;
            conn.expire::<_, ()>(
                &session_videos_key,
                self.config.session_ttl.as_secs() as i64,
            )
            .await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                debug!("Video view tracked: user={}, video={}", user_id, video_id);
                true
            }
            Err(e) => {
                warn!("Error tracking video view: {}", e);
                false
            }
        }
    }

    /// Record a feed request with its parameters.
    pub async fn track_feed_request(
        &self,
        user_id: i64,
        endpoint: &str,
        params: serde_json::Value,
        session_id: Option<&str>,
    ) -> bool {
        let Some(conn) = &self.conn else {
            return false;
        };
        let mut conn = conn.clone();

        let session_key = Self::session_key(user_id, session_id);
        let event = ActivityEvent {
            event_type: "feed_request".to_string(),
            user_id,
            video_id: None,
            video_url: None,
            position: None,
            feed_type: None,
            endpoint: Some(endpoint.to_string()),
            params: Some(params),
            timestamp: Utc::now().to_rfc3339(),
            session_id: session_key,
        };

        let payload = match serde_json::to_string(&event) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize activity event: {}", e);
                return false;
            }
        };

        let activity_key = format!("{}{}", USER_ACTIVITY_PREFIX, user_id);
        let result: redis::RedisResult<()> = async {
            conn.lpush::<_, _, ()>(&activity_key, payload).await?;
            conn.expire::<_, ()>(&activity_key, self.config.activity_ttl.as_secs() as i64)
                .await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                debug!("Feed request tracked: user={}, endpoint={}", user_id, endpoint);
                true
            }
            Err(e) => {
                warn!("Error tracking feed request: {}", e);
                false
            }
        }
    }

    /// Video ids already seen within a session.
    pub async fn session_videos(&self, session_id: &str) -> HashSet<i64> {
        let Some(conn) = &self.conn else {
            return HashSet::new();
        };
        let mut conn = conn.clone();

        let key = format!("{}:videos", session_id);
        match conn.smembers::<_, Vec<i64>>(&key).await {
            Ok(videos) => videos.into_iter().collect(),
            Err(e) => {
                warn!("Error reading session videos: {}", e);
                HashSet::new()
            }
        }
    }

    /// Drain one user's buffered activities into `activity_log`, deleting
    /// the buffer on success. Returns the number of rows inserted.
    pub async fn flush_user(&self, pool: &PgPool, user_id: i64) -> Result<u64> {
        let Some(conn) = &self.conn else {
            return Ok(0);
        };
        let mut conn = conn.clone();

        let activity_key = format!("{}{}", USER_ACTIVITY_PREFIX, user_id);
        let entries: Vec<String> = conn
            .lrange(&activity_key, 0, -1)
            .await
            .map_err(|e| Error::activity(e.to_string()))?;

        if entries.is_empty() {
            debug!("No activities to flush for user {}", user_id);
            return Ok(0);
        }

        let mut inserted = 0u64;
        for entry in &entries {
            let event: ActivityEvent = match serde_json::from_str(entry) {
                Ok(event) => event,
                Err(e) => {
                    warn!("Skipping unparseable activity entry: {}", e);
                    continue;
                }
            };

            let created_at = DateTime::parse_from_rfc3339(&event.timestamp)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now());

            let result = sqlx::query(
                r#"
                INSERT INTO activity_log
                    (log_name, description, subject_id, subject_type,
                     causer_id, causer_type, properties, url, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9)
                "#,
            )
            .bind(LOG_NAME)
            .bind(event.description())
            .bind(event.video_id)
            .bind(event.subject_type())
            .bind(event.user_id)
            .bind(CAUSER_TYPE)
            .bind(serde_json::to_value(&event)?)
            .bind(event.url())
            .bind(created_at)
            .execute(pool)
            .await;

            match result {
                Ok(_) => inserted += 1,
                Err(e) => {
                    error!("Error inserting activity row: {}", e);
                    continue;
                }
            }
        }

        conn.del::<_, ()>(&activity_key)
            .await
            .map_err(|e| Error::activity(e.to_string()))?;

        info!("Flushed {} activities for user {}", inserted, user_id);
        Ok(inserted)
    }

    /// Drain every pending user buffer. Returns the total rows inserted;
    /// individual failures are logged and skipped.
    pub async fn flush_all_pending(&self, pool: &PgPool) -> u64 {
        let Some(conn) = &self.conn else {
            return 0;
        };

        let pattern = format!("{}*", USER_ACTIVITY_PREFIX);
        let keys: Vec<String> = {
            let mut conn = conn.clone();
            let mut keys = Vec::new();
            match conn.scan_match::<_, String>(&pattern).await {
                Ok(mut iter) => {
                    while let Some(key) = iter.next_item().await {
                        keys.push(key);
                    }
                }
                Err(e) => {
                    warn!("Error scanning activity buffers: {}", e);
                    return 0;
                }
            }
            keys
        };

        let mut total = 0u64;
        for key in keys {
            let Some(user_id) = key
                .strip_prefix(USER_ACTIVITY_PREFIX)
                .and_then(|id| id.parse::<i64>().ok())
            else {
                continue;
            };

            match self.flush_user(pool, user_id).await {
                Ok(count) => total += count,
                Err(e) => warn!("Error flushing activities for user {}: {}", user_id, e),
            }
        }

        if total > 0 {
            info!("Total activities flushed: {}", total);
        }
        total
    }
}
