//! Catalog snapshot
//!
//! The process-wide, immutable view of items, flows, creators, interactions
//! and social connections, together with every derived layer the candidate
//! generators read: the skill embedding, the social graph and the precomputed
//! per-item feature scores.
//!
//! A snapshot is built once (at startup or on reload) and then shared by
//! `Arc`; request handlers never mutate it. Reload builds a complete new
//! snapshot off the hot path and swaps the pointer atomically — a failed
//! reload leaves the previous snapshot in place.

pub mod blacklist;
pub mod loader;

pub use blacklist::Blacklist;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::info;

use crate::config::EngineConfig;
use crate::database::{self, Database};
use crate::error::{Error, Result};
use crate::recommendation::embedding::SkillEmbedding;
use crate::recommendation::features::FeatureSet;
use crate::recommendation::social::SocialGraph;

/// A short-form creator video ("resume") as materialized at load time.
#[derive(Debug, Clone)]
pub struct Item {
    pub id: i64,
    pub creator_id: i64,
    pub video_url: String,
    pub creator_name: String,
    pub description: String,
    /// Canonicalized city; `Other-<country>` or `Unknown` when missing
    pub city: String,
    pub created_at: DateTime<Utc>,
    /// Whole days between `created_at` and the load timestamp
    pub days_since_creation: i64,
    pub views: i64,
    /// Mean of positive ranking values, clamped into [0, 5]
    pub avg_rating: f64,
    pub rating_count: i64,
    pub has_rating: bool,
    /// Accepted matches
    pub match_count: i64,
    /// Saves
    pub like_count: i64,
    pub exhibited_count: i64,
    /// Decoded once at load, capped at 5 entries
    pub skills: Vec<String>,
    /// Capped at 3 entries
    pub knowledges: Vec<String>,
    /// Capped at 3 entries
    pub tools: Vec<String>,
    /// Capped at 3 entries
    pub languages: Vec<String>,
}

/// A creator-posted campaign ("flow"/"challenge").
#[derive(Debug, Clone)]
pub struct Flow {
    pub id: i64,
    pub creator_id: i64,
    pub video_url: String,
    pub name: String,
    pub slug: String,
    pub description: String,
    pub image: String,
    pub city: String,
    pub created_at: DateTime<Utc>,
    pub days_since_creation: i64,
    pub creator_name: String,
    pub creator_slug: String,
    pub talent_type: String,
    pub interest_areas: Vec<String>,
    pub type_objectives: Vec<String>,
    pub status_at: Option<String>,
}

/// A platform user; creators own items and flows and are nodes of the
/// social graph.
#[derive(Debug, Clone)]
pub struct Creator {
    pub id: i64,
    pub name: String,
    pub city: String,
    pub country: String,
    pub created_at: Option<DateTime<Utc>>,
}

/// The interaction kinds collapsed into the unified history matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteractionKind {
    Rating,
    Save,
    Match,
    View,
    /// Synthesized from view counts when the catalog has no direct
    /// interactions
    ViewImplicit,
}

impl std::fmt::Display for InteractionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InteractionKind::Rating => write!(f, "rating"),
            InteractionKind::Save => write!(f, "save"),
            InteractionKind::Match => write!(f, "match"),
            InteractionKind::View => write!(f, "view"),
            InteractionKind::ViewImplicit => write!(f, "view_implicit"),
        }
    }
}

/// A single user-item interaction.
#[derive(Debug, Clone)]
pub struct Interaction {
    /// `None` for synthesized anonymous views
    pub user_id: Option<i64>,
    pub item_id: i64,
    pub rating: f64,
    pub kind: InteractionKind,
    pub created_at: Option<DateTime<Utc>>,
}

/// A directed, accepted social connection.
#[derive(Debug, Clone)]
pub struct Connection {
    pub from_user_id: i64,
    pub to_user_id: i64,
}

/// Per-user interaction history, kept in load order so preference sampling
/// is deterministic.
#[derive(Debug, Clone, Default)]
pub struct UserHistory {
    pub item_ids: Vec<i64>,
    pub seen: HashSet<i64>,
}

/// The immutable catalog snapshot plus derived layers.
pub struct CatalogSnapshot {
    pub items: Vec<Item>,
    pub flows: Vec<Flow>,
    pub creators: HashMap<i64, Creator>,
    pub interactions: Vec<Interaction>,
    pub blacklist: Blacklist,
    pub embedding: SkillEmbedding,
    pub social: SocialGraph,
    pub features: FeatureSet,
    pub loaded_at: DateTime<Utc>,

    item_index: HashMap<i64, usize>,
    flow_index: HashMap<i64, usize>,
    user_history: HashMap<i64, UserHistory>,
}

impl CatalogSnapshot {
    /// Assemble a snapshot from loaded rows, computing every derived layer.
    ///
    /// The loader and the test fixtures both funnel through here, so the
    /// in-memory invariants (rating clamp, day arithmetic, flow dedup, the
    /// implicit-interaction fallback) hold no matter where the rows came
    /// from.
    pub fn build(
        creators: Vec<Creator>,
        mut items: Vec<Item>,
        mut interactions: Vec<Interaction>,
        connections: Vec<Connection>,
        flows: Vec<Flow>,
        blacklist: Blacklist,
        now: DateTime<Utc>,
    ) -> Self {
        for item in &mut items {
            item.avg_rating = item.avg_rating.clamp(0.0, 5.0);
            item.days_since_creation = (now - item.created_at).num_days().max(0);
        }

        // Keep only the most recent flow per video URL. Rows arrive ordered
        // by created_at descending, so the first occurrence wins.
        let mut seen_urls = HashSet::new();
        let mut deduped = Vec::with_capacity(flows.len());
        for mut flow in flows {
            if seen_urls.insert(flow.video_url.clone()) {
                flow.days_since_creation = (now - flow.created_at).num_days().max(0);
                deduped.push(flow);
            }
        }
        let flows = deduped;

        // With no direct interactions, synthesize an implicit matrix from
        // view counts so downstream code paths stay well-defined.
        if interactions.is_empty() {
            interactions = synthesize_implicit_interactions(&items);
        }

        let item_index: HashMap<i64, usize> =
            items.iter().enumerate().map(|(i, it)| (it.id, i)).collect();
        let flow_index: HashMap<i64, usize> =
            flows.iter().enumerate().map(|(i, fl)| (fl.id, i)).collect();

        let mut user_history: HashMap<i64, UserHistory> = HashMap::new();
        for interaction in &interactions {
            if let Some(user_id) = interaction.user_id {
                let history = user_history.entry(user_id).or_default();
                if history.seen.insert(interaction.item_id) {
                    history.item_ids.push(interaction.item_id);
                }
            }
        }

        let creators: HashMap<i64, Creator> =
            creators.into_iter().map(|c| (c.id, c)).collect();

        let embedding = SkillEmbedding::build(&items);
        let social = SocialGraph::build(&connections);
        let features = FeatureSet::build(&items, &embedding);

        info!(
            "Catalog snapshot built: {} items, {} flows, {} creators, {} interactions, {} skills",
            items.len(),
            flows.len(),
            creators.len(),
            interactions.len(),
            embedding.skill_count(),
        );

        Self {
            items,
            flows,
            creators,
            interactions,
            blacklist,
            embedding,
            social,
            features,
            loaded_at: now,
            item_index,
            flow_index,
            user_history,
        }
    }

    pub fn item(&self, id: i64) -> Option<&Item> {
        self.item_index.get(&id).map(|&i| &self.items[i])
    }

    pub fn item_position(&self, id: i64) -> Option<usize> {
        self.item_index.get(&id).copied()
    }

    pub fn flow(&self, id: i64) -> Option<&Flow> {
        self.flow_index.get(&id).map(|&i| &self.flows[i])
    }

    /// Per-user interaction history, if the user has any.
    pub fn history(&self, user_id: i64) -> Option<&UserHistory> {
        self.user_history.get(&user_id)
    }

    /// True when the item's video URL is on the blacklist.
    pub fn is_blacklisted(&self, item_id: i64) -> bool {
        self.item(item_id)
            .map(|item| self.blacklist.contains(&item.video_url))
            .unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.flows.is_empty()
    }
}

fn synthesize_implicit_interactions(items: &[Item]) -> Vec<Interaction> {
    let mut interactions = Vec::new();
    for item in items {
        let count = item.views.clamp(0, 50);
        for _ in 0..count {
            interactions.push(Interaction {
                user_id: None,
                item_id: item.id,
                rating: 3.0,
                kind: InteractionKind::ViewImplicit,
                created_at: Some(item.created_at),
            });
        }
    }
    interactions
}

// ============================================================================
// City canonicalization
// ============================================================================

static CITY_CANONICAL: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("Bogotá", "Bogotá"),
        ("Bogotá D.C.", "Bogotá"),
        ("Bogota", "Bogotá"),
        ("bogota", "Bogotá"),
        ("Medellin", "Medellín"),
        ("medellin", "Medellín"),
        ("Cali", "Cali"),
        ("cali", "Cali"),
        ("Barranquilla", "Barranquilla"),
        ("barranquilla", "Barranquilla"),
        ("Bucaramanga", "Bucaramanga"),
        ("Distrito Federal", "CDMX"),
        ("Ciudad de México", "CDMX"),
        ("Nuevo Leon", "Monterrey"),
        ("Nuevo León", "Monterrey"),
    ])
});

/// Normalize a raw city value through the canonicalization table.
///
/// Empty cities become `Other-<country>` when a country is known, otherwise
/// `Unknown`. Cities not in the table pass through trimmed.
pub fn normalize_city(city: &str, country: &str) -> String {
    let city = city.trim();
    if city.is_empty() {
        let country = country.trim();
        if !country.is_empty() && country != "Unknown" {
            return format!("Other-{}", country);
        }
        return "Unknown".to_string();
    }

    CITY_CANONICAL
        .get(city)
        .map(|&canonical| canonical.to_string())
        .unwrap_or_else(|| city.to_string())
}

// ============================================================================
// Shared handle
// ============================================================================

/// Transient store errors during a load are retried before giving up.
const LOAD_MAX_RETRIES: u32 = 3;
const LOAD_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Shared, swappable reference to the current snapshot.
///
/// Readers clone the inner `Arc` under a short read lock; reload installs a
/// fully-built replacement under the write lock. A snapshot is never mutated
/// after install.
pub struct CatalogHandle {
    inner: RwLock<Option<Arc<CatalogSnapshot>>>,
}

impl CatalogHandle {
    /// An empty handle; the first request (or startup) loads inline.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(None),
        }
    }

    /// A handle pre-seeded with a snapshot (fixtures, mostly).
    pub fn with_snapshot(snapshot: CatalogSnapshot) -> Self {
        Self {
            inner: RwLock::new(Some(Arc::new(snapshot))),
        }
    }

    /// The current snapshot, if initialized.
    pub fn current(&self) -> Option<Arc<CatalogSnapshot>> {
        self.inner.read().expect("catalog lock poisoned").clone()
    }

    /// Install a snapshot, replacing any previous one atomically.
    pub fn install(&self, snapshot: CatalogSnapshot) -> Arc<CatalogSnapshot> {
        let snapshot = Arc::new(snapshot);
        *self.inner.write().expect("catalog lock poisoned") = Some(snapshot.clone());
        snapshot
    }

    /// Current snapshot, loading inline from the database when absent.
    pub async fn get_or_load(
        &self,
        db: &Database,
        config: &EngineConfig,
    ) -> Result<Arc<CatalogSnapshot>> {
        if let Some(snapshot) = self.current() {
            return Ok(snapshot);
        }

        info!("Catalog snapshot not initialized, loading inline");
        let snapshot = database::with_retry(
            || loader::load_snapshot(db.pool(), config),
            LOAD_MAX_RETRIES,
            LOAD_RETRY_DELAY,
        )
        .await
        .map_err(|e| Error::catalog_unavailable(e.to_string()))?;
        Ok(self.install(snapshot))
    }

    /// Rebuild the snapshot from the database and swap it in. On failure the
    /// previous snapshot stays in place and the error propagates.
    pub async fn reload(
        &self,
        db: &Database,
        config: &EngineConfig,
    ) -> Result<Arc<CatalogSnapshot>> {
        let snapshot = database::with_retry(
            || loader::load_snapshot(db.pool(), config),
            LOAD_MAX_RETRIES,
            LOAD_RETRY_DELAY,
        )
        .await
        .map_err(|e| Error::reload(e.to_string()))?;
        Ok(self.install(snapshot))
    }
}

impl Default for CatalogHandle {
    fn default() -> Self {
        Self::new()
    }
}
