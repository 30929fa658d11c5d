//! Per-item feature precompute and context extraction
//!
//! Two layers live here:
//!
//! 1. `FeatureSet` — engagement, temporal, quality, popularity, diversity and
//!    rarity scores plus the quality gate, computed once per snapshot across
//!    all items (rayon) and read by every candidate generator.
//! 2. The 18-column context matrix extracted per candidate set for bandit
//!    scoring, combining the precomputed scores with request-scoped user
//!    signals (skill similarity, extended match, city/social membership).

use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::Rng;
use rayon::prelude::*;

use crate::catalog::{CatalogSnapshot, Item};
use crate::recommendation::bandit::CONTEXT_DIM;
use crate::recommendation::embedding::SkillEmbedding;
use crate::recommendation::preferences::PreferenceView;

const NORM_EPSILON: f64 = 1e-6;

/// Precomputed numeric scores for one item.
#[derive(Debug, Clone, Default)]
pub struct ItemFeatures {
    pub engagement: f64,
    pub temporal: f64,
    pub boost_new: f64,
    pub quality: f64,
    pub popularity: f64,
    pub diversity_skills: f64,
    pub rarity_skills: f64,
    pub quality_gate: bool,
}

/// Feature scores for every item, parallel to the snapshot's item vector.
pub struct FeatureSet {
    by_index: Vec<ItemFeatures>,
}

impl FeatureSet {
    pub fn build(items: &[Item], embedding: &SkillEmbedding) -> Self {
        // Snapshot-wide bounds for the normalized log transforms.
        let (views_min, views_max) = log1p_bounds(items.iter().map(|i| i.views));
        let (match_min, match_max) = log1p_bounds(items.iter().map(|i| i.match_count));

        let by_index = items
            .par_iter()
            .map(|item| {
                let views_norm =
                    (log1p(item.views) - views_min) / (views_max - views_min + NORM_EPSILON);
                let match_norm =
                    (log1p(item.match_count) - match_min) / (match_max - match_min + NORM_EPSILON);
                let rating_norm = item.avg_rating / 5.0;

                let engagement = 0.35 * views_norm + 0.40 * rating_norm + 0.25 * match_norm;

                let temporal = (-(item.days_since_creation as f64) / 28.0).exp();
                let boost_new = if item.days_since_creation <= 30 { 1.5 } else { 1.0 };

                let rating_weight =
                    item.rating_count as f64 / (item.rating_count as f64 + 10.0);
                let quality =
                    0.7 * item.avg_rating * rating_weight + 0.3 * log1p(item.match_count);

                let popularity = 0.40 * log1p(item.views)
                    + 0.35 * item.avg_rating
                    + 0.25 * log1p(item.match_count);

                let diversity_skills = (item.skills.len()
                    + item.knowledges.len()
                    + item.tools.len()) as f64
                    / 15.0;

                let rarity_skills = if item.skills.is_empty() {
                    0.0
                } else {
                    let sum: f64 = item
                        .skills
                        .iter()
                        .map(|s| 1.0 / (embedding.frequency(s) as f64 + 1.0))
                        .sum();
                    100.0 * sum / item.skills.len() as f64
                };

                // New content gets a grace period before the engagement
                // thresholds apply.
                let quality_gate = item.avg_rating >= 3.0
                    || item.views >= 20
                    || item.match_count >= 2
                    || item.rating_count >= 2
                    || item.days_since_creation < 14;

                ItemFeatures {
                    engagement,
                    temporal,
                    boost_new,
                    quality,
                    popularity,
                    diversity_skills,
                    rarity_skills,
                    quality_gate,
                }
            })
            .collect();

        Self { by_index }
    }

    pub fn get(&self, item_index: usize) -> &ItemFeatures {
        &self.by_index[item_index]
    }

    pub fn len(&self) -> usize {
        self.by_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_index.is_empty()
    }
}

fn log1p(value: i64) -> f64 {
    (value as f64).ln_1p()
}

fn log1p_bounds(values: impl Iterator<Item = i64>) -> (f64, f64) {
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for value in values {
        let v = log1p(value);
        min = min.min(v);
        max = max.max(v);
    }
    if min.is_infinite() {
        (0.0, 0.0)
    } else {
        (min, max)
    }
}

// ============================================================================
// Request-scoped user/item signals
// ============================================================================

/// Blended skill similarity between a user and an item, in [0, 1].
///
/// 60% cosine between the unit skill vectors, 40% weighted overlap over the
/// user's skill histogram. Falls back to 0.5 when the user has no skill
/// vector and to 0.3 when the item carries no skills.
pub fn skill_similarity(
    embedding: &SkillEmbedding,
    prefs: &PreferenceView,
    item_id: i64,
) -> f64 {
    let Some(user_vector) = prefs.skill_vector.as_deref() else {
        return 0.5;
    };

    match embedding.cosine_with_item(user_vector, item_id) {
        Some(cosine) => {
            let overlap: f64 = embedding
                .item_skill_indices(item_id)
                .into_iter()
                .flatten()
                .filter_map(|&idx| embedding.skill_name(idx))
                .map(|skill| prefs.skill_weights.get(skill).copied().unwrap_or(0.0))
                .sum();
            (0.6 * cosine + 0.4 * overlap).clamp(0.0, 1.0)
        }
        None => 0.3,
    }
}

/// Attribute-overlap match score, capped at 100.
pub fn extended_match(prefs: &PreferenceView, item: &Item) -> f64 {
    let mut score = 0.0;
    score += 15.0 * count_overlap(&item.skills, &prefs.skills);
    score += 12.0 * count_overlap(&item.knowledges, &prefs.knowledges);
    score += 10.0 * count_overlap(&item.tools, &prefs.tools);
    score += 8.0 * count_overlap(&item.languages, &prefs.languages);
    score.min(100.0)
}

fn count_overlap(values: &[String], set: &std::collections::HashSet<String>) -> f64 {
    values.iter().filter(|v| set.contains(v.as_str())).count() as f64
}

/// Extract the 18-column context matrix for a candidate set.
///
/// `candidates` holds item indices into the snapshot. The last column is
/// per-candidate tie-breaking noise drawn from the request's generator.
pub fn context_matrix(
    snapshot: &CatalogSnapshot,
    candidates: &[usize],
    prefs: &PreferenceView,
    rng: &mut StdRng,
) -> DMatrix<f64> {
    let n = candidates.len();
    let mut matrix = DMatrix::zeros(n, CONTEXT_DIM);

    let max_rating_count = candidates
        .iter()
        .map(|&idx| snapshot.items[idx].rating_count)
        .max()
        .unwrap_or(0) as f64;
    let max_like_count = candidates
        .iter()
        .map(|&idx| snapshot.items[idx].like_count)
        .max()
        .unwrap_or(0) as f64;
    let max_exhibited = candidates
        .iter()
        .map(|&idx| snapshot.items[idx].exhibited_count)
        .max()
        .unwrap_or(0) as f64;

    for (row, &idx) in candidates.iter().enumerate() {
        let item = &snapshot.items[idx];
        let features = snapshot.features.get(idx);

        matrix[(row, 0)] = features.engagement;
        matrix[(row, 1)] = features.temporal * features.boost_new;
        matrix[(row, 2)] = features.quality;
        matrix[(row, 3)] = features.popularity;
        matrix[(row, 4)] = features.diversity_skills;
        matrix[(row, 5)] = skill_similarity(&snapshot.embedding, prefs, item.id);
        matrix[(row, 6)] = extended_match(prefs, item) / 100.0;
        matrix[(row, 7)] = if prefs.cities.contains(&item.city) { 1.0 } else { 0.0 };
        matrix[(row, 8)] = if prefs.social_neighborhood.contains(&item.creator_id) {
            1.0
        } else {
            0.0
        };
        matrix[(row, 9)] = log1p(item.views) / 10.0;
        matrix[(row, 10)] = item.avg_rating / 5.0;
        matrix[(row, 11)] = features.rarity_skills / 100.0;
        matrix[(row, 12)] = if features.quality_gate { 1.0 } else { 0.0 };
        matrix[(row, 13)] = prefs.social_influence;
        matrix[(row, 14)] = item.rating_count as f64 / (max_rating_count + 1.0);
        matrix[(row, 15)] = item.like_count as f64 / (max_like_count + 1.0);
        matrix[(row, 16)] = item.exhibited_count as f64 / (max_exhibited + 1.0);
        matrix[(row, 17)] = rng.gen_range(0.0..0.3);
    }

    matrix
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Blacklist, CatalogSnapshot};
    use chrono::{Duration, Utc};
    use rand::SeedableRng;

    fn item(id: i64, days_ago: i64) -> Item {
        Item {
            id,
            creator_id: id,
            video_url: format!("https://cdn.example.com/{}.mp4", id),
            creator_name: String::new(),
            description: String::new(),
            city: "Bogotá".to_string(),
            created_at: Utc::now() - Duration::days(days_ago),
            days_since_creation: days_ago,
            views: 0,
            avg_rating: 0.0,
            rating_count: 0,
            has_rating: false,
            match_count: 0,
            like_count: 0,
            exhibited_count: 0,
            skills: vec!["rust".to_string()],
            knowledges: vec![],
            tools: vec![],
            languages: vec![],
        }
    }

    #[test]
    fn test_quality_gate_thresholds() {
        let mut rated = item(1, 100);
        rated.avg_rating = 3.5;
        let mut viewed = item(2, 100);
        viewed.views = 25;
        let fresh = item(3, 5);
        let cold = item(4, 100);

        let items = vec![rated, viewed, fresh, cold];
        let embedding = SkillEmbedding::build(&items);
        let features = FeatureSet::build(&items, &embedding);

        assert!(features.get(0).quality_gate, "rated item passes");
        assert!(features.get(1).quality_gate, "viewed item passes");
        assert!(features.get(2).quality_gate, "fresh item gets amnesty");
        assert!(!features.get(3).quality_gate, "cold item fails");
    }

    #[test]
    fn test_boost_new_and_temporal_decay() {
        let items = vec![item(1, 10), item(2, 60)];
        let embedding = SkillEmbedding::build(&items);
        let features = FeatureSet::build(&items, &embedding);

        assert_eq!(features.get(0).boost_new, 1.5);
        assert_eq!(features.get(1).boost_new, 1.0);
        assert!(features.get(0).temporal > features.get(1).temporal);
    }

    #[test]
    fn test_engagement_normalization_bounds() {
        let mut popular = item(1, 50);
        popular.views = 10_000;
        popular.avg_rating = 5.0;
        popular.match_count = 100;
        let unpopular = item(2, 50);

        let items = vec![popular, unpopular];
        let embedding = SkillEmbedding::build(&items);
        let features = FeatureSet::build(&items, &embedding);

        assert!(features.get(0).engagement <= 1.0 + 1e-9);
        assert!(features.get(0).engagement > features.get(1).engagement);
        assert!(features.get(1).engagement >= 0.0);
    }

    #[test]
    fn test_rarity_rewards_uncommon_skills() {
        let mut common_a = item(1, 10);
        common_a.skills = vec!["rust".to_string()];
        let mut common_b = item(2, 10);
        common_b.skills = vec!["rust".to_string()];
        let mut rare = item(3, 10);
        rare.skills = vec!["fortran".to_string()];
        let mut skillless = item(4, 10);
        skillless.skills = vec![];

        let items = vec![common_a, common_b, rare, skillless];
        let embedding = SkillEmbedding::build(&items);
        let features = FeatureSet::build(&items, &embedding);

        assert!(features.get(2).rarity_skills > features.get(0).rarity_skills);
        assert_eq!(features.get(3).rarity_skills, 0.0);
    }

    #[test]
    fn test_skill_similarity_defaults() {
        let items = vec![item(1, 10), {
            let mut it = item(2, 10);
            it.skills = vec![];
            it
        }];
        let embedding = SkillEmbedding::build(&items);

        let no_vector = PreferenceView::empty();
        assert_eq!(skill_similarity(&embedding, &no_vector, 1), 0.5);

        let mut with_vector = PreferenceView::empty();
        with_vector.skill_vector = Some(embedding.item_vector(1));
        assert_eq!(skill_similarity(&embedding, &with_vector, 2), 0.3);
    }

    #[test]
    fn test_extended_match_caps_at_100() {
        let mut prefs = PreferenceView::empty();
        let mut it = item(1, 10);
        it.skills = (0..5).map(|i| format!("s{}", i)).collect();
        it.knowledges = (0..3).map(|i| format!("k{}", i)).collect();
        it.tools = (0..3).map(|i| format!("t{}", i)).collect();
        it.languages = (0..3).map(|i| format!("l{}", i)).collect();
        for s in &it.skills {
            prefs.skills.insert(s.clone());
        }
        for k in &it.knowledges {
            prefs.knowledges.insert(k.clone());
        }
        for t in &it.tools {
            prefs.tools.insert(t.clone());
        }
        for l in &it.languages {
            prefs.languages.insert(l.clone());
        }

        // 5*15 + 3*12 + 3*10 + 3*8 = 165, capped
        assert_eq!(extended_match(&prefs, &it), 100.0);
    }

    #[test]
    fn test_context_matrix_shape_and_noise_range() {
        let items = vec![item(1, 10), item(2, 20), item(3, 30)];
        let snapshot = CatalogSnapshot::build(
            vec![],
            items,
            vec![],
            vec![],
            vec![],
            Blacklist::default(),
            Utc::now(),
        );
        let prefs = PreferenceView::empty();
        let mut rng = StdRng::seed_from_u64(42);

        let matrix = context_matrix(&snapshot, &[0, 1, 2], &prefs, &mut rng);
        assert_eq!(matrix.nrows(), 3);
        assert_eq!(matrix.ncols(), CONTEXT_DIM);

        for row in 0..3 {
            let noise = matrix[(row, 17)];
            assert!((0.0..0.3).contains(&noise));
        }
    }
}
