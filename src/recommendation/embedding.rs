//! Skill co-occurrence embedding
//!
//! Content-based similarity layer derived from the catalog: a row-normalized
//! skill co-occurrence matrix, L2-normalized per-item skill vectors and
//! per-skill frequencies for rarity scoring. Built once per snapshot.

use std::collections::HashMap;

use crate::catalog::Item;

/// Skill universe plus the derived matrices.
pub struct SkillEmbedding {
    skill_to_idx: HashMap<String, usize>,
    /// idx -> skill, sorted for stable indexing across identical snapshots
    skills: Vec<String>,
    /// Row-major N x N co-occurrence, each row summing to 1 (or all zeros)
    cooccurrence: Vec<f64>,
    /// Per-skill occurrence count across items
    counts: Vec<usize>,
    /// Per-item sorted skill indices; the item vector is the binary presence
    /// vector over the universe, L2-normalized
    item_skills: HashMap<i64, Vec<usize>>,
}

impl SkillEmbedding {
    pub fn build(items: &[Item]) -> Self {
        let mut universe: Vec<String> = items
            .iter()
            .flat_map(|item| item.skills.iter().cloned())
            .collect();
        universe.sort();
        universe.dedup();

        let skill_to_idx: HashMap<String, usize> = universe
            .iter()
            .enumerate()
            .map(|(idx, skill)| (skill.clone(), idx))
            .collect();
        let n = universe.len();

        let mut cooccurrence = vec![0.0f64; n * n];
        let mut counts = vec![0usize; n];
        let mut item_skills: HashMap<i64, Vec<usize>> = HashMap::with_capacity(items.len());

        for item in items {
            let mut indices: Vec<usize> = item
                .skills
                .iter()
                .filter_map(|skill| skill_to_idx.get(skill).copied())
                .collect();
            indices.sort_unstable();
            indices.dedup();

            for &idx in &indices {
                counts[idx] += 1;
            }

            // Unordered pairs including self: both directions incremented, so
            // the diagonal advances by 2 per item carrying the skill.
            for (pos, &a) in indices.iter().enumerate() {
                for &b in &indices[pos..] {
                    cooccurrence[a * n + b] += 1.0;
                    cooccurrence[b * n + a] += 1.0;
                }
            }

            item_skills.insert(item.id, indices);
        }

        // Row-normalize; all-zero rows stay zero.
        for row in 0..n {
            let sum: f64 = cooccurrence[row * n..(row + 1) * n].iter().sum();
            if sum > 0.0 {
                for value in &mut cooccurrence[row * n..(row + 1) * n] {
                    *value /= sum;
                }
            }
        }

        Self {
            skill_to_idx,
            skills: universe,
            cooccurrence,
            counts,
            item_skills,
        }
    }

    pub fn skill_count(&self) -> usize {
        self.skills.len()
    }

    pub fn skill_index(&self, skill: &str) -> Option<usize> {
        self.skill_to_idx.get(skill).copied()
    }

    pub fn skill_name(&self, idx: usize) -> Option<&str> {
        self.skills.get(idx).map(String::as_str)
    }

    /// Occurrence count of a skill across the snapshot's items.
    pub fn frequency(&self, skill: &str) -> usize {
        self.skill_index(skill)
            .map(|idx| self.counts[idx])
            .unwrap_or(0)
    }

    pub fn cooccurrence_row(&self, idx: usize) -> &[f64] {
        let n = self.skills.len();
        &self.cooccurrence[idx * n..(idx + 1) * n]
    }

    /// Sorted skill indices for an item; `None` when the item is unknown.
    pub fn item_skill_indices(&self, item_id: i64) -> Option<&[usize]> {
        self.item_skills.get(&item_id).map(Vec::as_slice)
    }

    /// Dense L2-normalized skill vector for an item. Norm is 1, or 0 when
    /// the item carries no known skills.
    pub fn item_vector(&self, item_id: i64) -> Vec<f64> {
        let mut vector = vec![0.0; self.skills.len()];
        if let Some(indices) = self.item_skills.get(&item_id) {
            if !indices.is_empty() {
                let weight = 1.0 / (indices.len() as f64).sqrt();
                for &idx in indices {
                    vector[idx] = weight;
                }
            }
        }
        vector
    }

    /// Cosine similarity between a unit-normalized user vector and an item's
    /// unit vector. `None` when the item has no skills (zero vector).
    pub fn cosine_with_item(&self, user_vector: &[f64], item_id: i64) -> Option<f64> {
        let indices = self.item_skills.get(&item_id)?;
        if indices.is_empty() {
            return None;
        }
        let weight = 1.0 / (indices.len() as f64).sqrt();
        let dot: f64 = indices
            .iter()
            .map(|&idx| user_vector.get(idx).copied().unwrap_or(0.0) * weight)
            .sum();
        Some(dot)
    }
}
