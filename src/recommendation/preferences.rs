//! Per-request user preference extraction
//!
//! Summarizes a caller's past interactions into the transient view consumed
//! by the candidate generators: seen items, attribute unions over a sample of
//! the history, a normalized skill histogram and unit skill vector, cities,
//! and the social signals. Built per request and discarded with the response.

use std::collections::{HashMap, HashSet};

use crate::catalog::CatalogSnapshot;

/// How many history entries feed the attribute/skill aggregation.
const HISTORY_SAMPLE: usize = 80;

/// Request-scoped summary of a user's tastes.
#[derive(Debug, Clone, Default)]
pub struct PreferenceView {
    pub skills: HashSet<String>,
    pub knowledges: HashSet<String>,
    pub tools: HashSet<String>,
    pub languages: HashSet<String>,
    pub cities: HashSet<String>,
    /// Every item the user interacted with, not just the sample
    pub seen: HashSet<i64>,
    /// Skill histogram over the sample, normalized to sum to 1
    pub skill_weights: HashMap<String, f64>,
    /// Unit-normalized skill-count vector over the snapshot's universe
    pub skill_vector: Option<Vec<f64>>,
    pub social_neighborhood: HashSet<i64>,
    pub social_influence: f64,
}

impl PreferenceView {
    /// The view of a user with no history: everything empty, neutral scores.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Extract the view for `user_id` from the snapshot.
    pub fn extract(snapshot: &CatalogSnapshot, user_id: i64) -> Self {
        let Some(history) = snapshot.history(user_id) else {
            return Self::empty();
        };
        if history.item_ids.is_empty() {
            return Self::empty();
        }

        let mut view = Self {
            seen: history.seen.clone(),
            ..Self::default()
        };

        if let Some(neighborhood) = snapshot.social.neighborhood(user_id) {
            view.social_neighborhood = neighborhood.clone();
        }
        view.social_influence = snapshot.social.influence(user_id);

        let sample = &history.item_ids[..history.item_ids.len().min(HISTORY_SAMPLE)];

        let mut skill_counts: HashMap<String, usize> = HashMap::new();
        for &item_id in sample {
            let Some(item) = snapshot.item(item_id) else {
                continue;
            };

            for skill in &item.skills {
                view.skills.insert(skill.clone());
                *skill_counts.entry(skill.clone()).or_insert(0) += 1;
            }
            view.knowledges.extend(item.knowledges.iter().cloned());
            view.tools.extend(item.tools.iter().cloned());
            view.languages.extend(item.languages.iter().cloned());

            if !item.city.is_empty() && item.city != "Unknown" {
                view.cities.insert(item.city.clone());
            }
        }

        if !skill_counts.is_empty() {
            let total: usize = skill_counts.values().sum();
            view.skill_weights = skill_counts
                .iter()
                .map(|(skill, &count)| (skill.clone(), count as f64 / total as f64))
                .collect();
        }

        if !view.skills.is_empty() && snapshot.embedding.skill_count() > 0 {
            let mut vector = vec![0.0f64; snapshot.embedding.skill_count()];
            for (skill, &count) in &skill_counts {
                if let Some(idx) = snapshot.embedding.skill_index(skill) {
                    vector[idx] = count as f64;
                }
            }
            let norm: f64 = vector.iter().map(|v| v * v).sum::<f64>().sqrt();
            if norm > 0.0 {
                for value in &mut vector {
                    *value /= norm;
                }
                view.skill_vector = Some(vector);
            }
        }

        view
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Blacklist, Connection, Interaction, InteractionKind, Item};
    use chrono::{Duration, Utc};

    fn item(id: i64, creator: i64, city: &str, skills: &[&str]) -> Item {
        Item {
            id,
            creator_id: creator,
            video_url: format!("https://cdn.example.com/{}.mp4", id),
            creator_name: String::new(),
            description: String::new(),
            city: city.to_string(),
            created_at: Utc::now() - Duration::days(3),
            days_since_creation: 3,
            views: 0,
            avg_rating: 0.0,
            rating_count: 0,
            has_rating: false,
            match_count: 0,
            like_count: 0,
            exhibited_count: 0,
            skills: skills.iter().map(|s| s.to_string()).collect(),
            knowledges: vec![],
            tools: vec![],
            languages: vec![],
        }
    }

    fn rating(user: i64, item: i64) -> Interaction {
        Interaction {
            user_id: Some(user),
            item_id: item,
            rating: 4.0,
            kind: InteractionKind::Rating,
            created_at: None,
        }
    }

    fn snapshot(
        items: Vec<Item>,
        interactions: Vec<Interaction>,
        connections: Vec<Connection>,
    ) -> CatalogSnapshot {
        CatalogSnapshot::build(
            vec![],
            items,
            interactions,
            connections,
            vec![],
            Blacklist::default(),
            Utc::now(),
        )
    }

    #[test]
    fn test_empty_view_for_unknown_user() {
        let snap = snapshot(vec![item(1, 1, "Cali", &["rust"])], vec![rating(5, 1)], vec![]);
        let view = PreferenceView::extract(&snap, 99);

        assert!(view.seen.is_empty());
        assert!(view.skill_vector.is_none());
        assert_eq!(view.social_influence, 0.0);
    }

    #[test]
    fn test_seen_and_attributes_aggregate() {
        let items = vec![
            item(1, 10, "Cali", &["rust", "sql"]),
            item(2, 11, "Bogotá", &["rust"]),
            item(3, 12, "Unknown", &["design"]),
        ];
        let interactions = vec![rating(5, 1), rating(5, 2), rating(5, 3)];
        let snap = snapshot(items, interactions, vec![]);

        let view = PreferenceView::extract(&snap, 5);
        assert_eq!(view.seen.len(), 3);
        assert!(view.skills.contains("rust") && view.skills.contains("design"));
        // Unknown cities are dropped
        assert_eq!(view.cities.len(), 2);
        assert!(!view.cities.contains("Unknown"));
    }

    #[test]
    fn test_skill_weights_sum_to_one() {
        let items = vec![
            item(1, 10, "Cali", &["rust", "sql"]),
            item(2, 11, "Cali", &["rust"]),
        ];
        let snap = snapshot(items, vec![rating(5, 1), rating(5, 2)], vec![]);

        let view = PreferenceView::extract(&snap, 5);
        let total: f64 = view.skill_weights.values().sum();
        assert!((total - 1.0).abs() < 1e-9);
        // rust appears twice, sql once
        assert!(view.skill_weights["rust"] > view.skill_weights["sql"]);
    }

    #[test]
    fn test_skill_vector_is_unit_normalized() {
        let items = vec![item(1, 10, "Cali", &["rust", "sql"])];
        let snap = snapshot(items, vec![rating(5, 1)], vec![]);

        let view = PreferenceView::extract(&snap, 5);
        let vector = view.skill_vector.expect("vector present");
        let norm: f64 = vector.iter().map(|v| v * v).sum::<f64>().sqrt();
        assert!((norm - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_social_signals_wired_through() {
        let items = vec![item(1, 10, "Cali", &["rust"])];
        let connections = vec![
            Connection {
                from_user_id: 5,
                to_user_id: 10,
            },
            Connection {
                from_user_id: 5,
                to_user_id: 11,
            },
        ];
        let snap = snapshot(items, vec![rating(5, 1)], connections);

        let view = PreferenceView::extract(&snap, 5);
        assert!(view.social_neighborhood.contains(&10));
        assert!((view.social_influence - (3.0f64.ln() / 10.0)).abs() < 1e-12);
    }
}
