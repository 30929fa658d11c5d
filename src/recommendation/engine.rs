//! Feed assembly engine
//!
//! The online half of the recommendation core: per-slot candidate generators
//! ranked by the contextual bandits, and the assembler that walks the fixed
//! slot pattern while enforcing exclusion, blacklist and diversity rules.
//!
//! Everything here is CPU-bound over the catalog snapshot; the engine never
//! touches the database or the cache. All stochastic steps draw from the
//! request's seedable generator, so assembly is deterministic given
//! (snapshot, bandit state, user, exclusions, seed).

use rand::rngs::StdRng;
use rand::seq::index::{sample, sample_weighted};
use rand::Rng;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::catalog::CatalogSnapshot;
use crate::config::EngineConfig;
use crate::recommendation::bandit::{LinUcb, CONTEXT_DIM};
use crate::recommendation::features::context_matrix;
use crate::recommendation::metrics::{BanditMetrics, FeedMetrics, PerformanceTimer, PoolSizes};
use crate::recommendation::preferences::PreferenceView;

/// Feed length of every mixed response.
pub const FEED_SIZE: usize = 24;

/// The fixed 6-cell slot template.
pub const SLOT_PATTERN: [SlotKind; 6] = [
    SlotKind::Vmp,
    SlotKind::Au,
    SlotKind::Au,
    SlotKind::Vmp,
    SlotKind::Nu,
    SlotKind::Fw,
];

const MAX_SLOT_ATTEMPTS: usize = 150;
const CREATOR_WINDOW: usize = 12;
const MIN_SKILL_VARIETY: usize = 3;
const NEW_CONTENT_DAYS: i64 = 45;

const VMP_POOL_SIZE: usize = 110;
const NU_POOL_SIZE: usize = 95;
const AU_POOL_SIZE: usize = 170;
const FW_POOL_SIZE: usize = 40;
const EXPLORE_POOL_SIZE: usize = 75;

/// Slot kinds of the template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Vmp,
    Au,
    Nu,
    Fw,
}

impl SlotKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotKind::Vmp => "VMP",
            SlotKind::Au => "AU",
            SlotKind::Nu => "NU",
            SlotKind::Fw => "FW",
        }
    }
}

impl Serialize for SlotKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// What a feed entry carries: a resume (item) or a challenge (flow).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Resume,
    Challenge,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Resume => "resume",
            EntryKind::Challenge => "challenge",
        }
    }
}

impl Serialize for EntryKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// One accepted feed position.
#[derive(Debug, Clone, Serialize)]
pub struct FeedEntry {
    pub position: usize,
    pub item_id: i64,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    pub slot: SlotKind,
    pub video_url: String,
    pub creator_name: String,
    pub city: String,
    pub title: String,
    pub description: String,
    pub views: i64,
    pub rating: f64,
    pub days_old: i64,
}

/// Metrics for the flows-only entry point.
#[derive(Debug, Clone, Serialize)]
pub struct FlowsOnlyMetrics {
    pub total_flows: usize,
    pub execution_time: f64,
}

/// The recommendation engine: three bandits plus the assembly logic.
///
/// Bandit state persists across requests and catalog reloads; each category
/// serializes its readers and writers behind its own mutex with short
/// critical sections.
pub struct FeedEngine {
    bandit_vmp: Mutex<LinUcb>,
    bandit_au: Mutex<LinUcb>,
    bandit_nu: Mutex<LinUcb>,
}

impl FeedEngine {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            bandit_vmp: Mutex::new(LinUcb::new(CONTEXT_DIM, config.vmp.alpha, config.vmp.beta)),
            bandit_au: Mutex::new(LinUcb::new(CONTEXT_DIM, config.au.alpha, config.au.beta)),
            bandit_nu: Mutex::new(LinUcb::new(CONTEXT_DIM, config.nu.alpha, config.nu.beta)),
        }
    }

    /// Feed one observed (context, reward) pair back into a category's
    /// bandit. Reward delivery is the caller's responsibility; the engine
    /// only consumes what it is given.
    pub fn record_reward(&self, slot: SlotKind, context: &[f64], reward: f64) {
        let bandit = match slot {
            SlotKind::Vmp => &self.bandit_vmp,
            SlotKind::Au => &self.bandit_au,
            SlotKind::Nu => &self.bandit_nu,
            SlotKind::Fw => return,
        };
        match bandit.lock() {
            Ok(mut guard) => guard.update(context, reward),
            Err(_) => warn!("Bandit {} unavailable, dropping reward", slot.as_str()),
        }
    }

    pub fn bandit_metrics(&self) -> BanditMetrics {
        BanditMetrics {
            vmp: self.bandit_stats(&self.bandit_vmp),
            au: self.bandit_stats(&self.bandit_au),
            nu: self.bandit_stats(&self.bandit_nu),
        }
    }

    fn bandit_stats(&self, bandit: &Mutex<LinUcb>) -> crate::recommendation::bandit::BanditStats {
        match bandit.lock() {
            Ok(guard) => guard.stats(),
            Err(_) => crate::recommendation::bandit::BanditStats {
                mean_reward: 0.0,
                recent_mean_reward: 0.0,
                selections: 0,
            },
        }
    }

    /// Score a candidate set with one category's bandit, degrading to
    /// score-only ranking (zeros) if the bandit state is unusable.
    fn bandit_scores(
        &self,
        bandit: &Mutex<LinUcb>,
        contexts: &nalgebra::DMatrix<f64>,
        rng: &mut StdRng,
    ) -> Vec<f64> {
        match bandit.lock() {
            Ok(guard) => guard.score_batch(contexts, rng),
            Err(_) => {
                warn!("Bandit state unavailable, downgrading to score-only ranking");
                vec![0.0; contexts.nrows()]
            }
        }
    }

    // ========================================================================
    // Candidate generators
    // ========================================================================

    /// VMP: high-quality popular items behind the quality gate, with a
    /// retry that drops the gate when it empties the pool.
    fn generate_vmp(
        &self,
        snapshot: &CatalogSnapshot,
        excluded: &HashSet<i64>,
        used_creators: &HashSet<i64>,
        prefs: &PreferenceView,
        n: usize,
        rng: &mut StdRng,
    ) -> Vec<i64> {
        let mut candidates = filter_items(snapshot, excluded, used_creators, |idx| {
            snapshot.features.get(idx).quality_gate
        });
        if candidates.is_empty() {
            candidates = filter_items(snapshot, excluded, used_creators, |_| true);
        }
        if candidates.is_empty() {
            return Vec::new();
        }

        let contexts = context_matrix(snapshot, &candidates, prefs, rng);
        let ucb = self.bandit_scores(&self.bandit_vmp, &contexts, rng);

        let scores: Vec<f64> = candidates
            .iter()
            .enumerate()
            .map(|(row, &idx)| {
                let item = &snapshot.items[idx];
                let features = snapshot.features.get(idx);
                let mut score = ucb[row];
                score += features.engagement * 2.2;
                score += features.popularity * 1.6;
                score += features.quality * 1.8;
                if item.days_since_creation <= NEW_CONTENT_DAYS {
                    score += 1.4;
                }
                score
            })
            .collect();

        let top = top_k_desc(&scores, (n * 2).min(candidates.len()));

        // Weighted sampling without replacement over the clamped scores,
        // falling back to uniform when every weight is zero.
        let amount = n.min(top.len());
        let weights: Vec<f64> = top.iter().map(|&i| scores[i].max(0.0)).collect();

        let picked: Vec<usize> =
            match sample_weighted(rng, top.len(), |i| weights[i], amount) {
                Ok(indices) => indices.into_iter().collect(),
                Err(_) => sample(rng, top.len(), amount).into_iter().collect(),
            };

        picked
            .into_iter()
            .map(|i| snapshot.items[candidates[top[i]]].id)
            .collect()
    }

    /// AU: affinity to the user; skill similarity and extended match carry
    /// the heaviest weights.
    fn generate_au(
        &self,
        snapshot: &CatalogSnapshot,
        excluded: &HashSet<i64>,
        used_creators: &HashSet<i64>,
        prefs: &PreferenceView,
        n: usize,
        rng: &mut StdRng,
    ) -> Vec<i64> {
        let candidates = filter_items(snapshot, excluded, used_creators, |_| true);
        if candidates.is_empty() {
            return Vec::new();
        }

        let contexts = context_matrix(snapshot, &candidates, prefs, rng);
        let ucb = self.bandit_scores(&self.bandit_au, &contexts, rng);

        let scores: Vec<f64> = candidates
            .iter()
            .enumerate()
            .map(|(row, &idx)| {
                let item = &snapshot.items[idx];
                let features = snapshot.features.get(idx);
                let mut score = ucb[row];
                score += contexts[(row, 5)] * 3.5;
                score += contexts[(row, 6)] * 3.0;
                score += features.popularity * 1.1;
                score += features.quality * 1.4;
                score += features.temporal * 0.9;
                score += features.rarity_skills / 100.0 * 0.9;
                if item.days_since_creation <= NEW_CONTENT_DAYS {
                    score += 0.9;
                }
                score
            })
            .collect();

        top_k_desc(&scores, n.min(candidates.len()))
            .into_iter()
            .map(|i| snapshot.items[candidates[i]].id)
            .collect()
    }

    /// NU: recent content only, prioritizing diversity and rarity.
    fn generate_nu(
        &self,
        snapshot: &CatalogSnapshot,
        excluded: &HashSet<i64>,
        used_creators: &HashSet<i64>,
        prefs: &PreferenceView,
        n: usize,
        rng: &mut StdRng,
    ) -> Vec<i64> {
        let candidates = filter_items(snapshot, excluded, used_creators, |idx| {
            snapshot.items[idx].days_since_creation <= NEW_CONTENT_DAYS
        });
        if candidates.is_empty() {
            return Vec::new();
        }

        let contexts = context_matrix(snapshot, &candidates, prefs, rng);
        let ucb = self.bandit_scores(&self.bandit_nu, &contexts, rng);

        let scores: Vec<f64> = candidates
            .iter()
            .enumerate()
            .map(|(row, &idx)| {
                let features = snapshot.features.get(idx);
                ucb[row]
                    + features.temporal * 2.5
                    + features.diversity_skills * 1.8
                    + features.rarity_skills / 100.0 * 1.4
                    + features.boost_new * 0.8
                    + rng.gen_range(0.0..0.6)
            })
            .collect();

        let top = top_k_desc(&scores, (n * 2).min(candidates.len()));
        let picked: Vec<usize> = if top.len() > n {
            sample(rng, top.len(), n).into_iter().collect()
        } else {
            (0..top.len()).collect()
        };

        picked
            .into_iter()
            .map(|i| snapshot.items[candidates[top[i]]].id)
            .collect()
    }

    /// FW: flows ranked by recency plus random jitter.
    fn generate_fw(
        &self,
        snapshot: &CatalogSnapshot,
        excluded: &HashSet<i64>,
        used_creators: &HashSet<i64>,
        n: usize,
        rng: &mut StdRng,
    ) -> Vec<i64> {
        let candidates: Vec<usize> = snapshot
            .flows
            .iter()
            .enumerate()
            .filter(|(_, flow)| {
                !excluded.contains(&flow.id) && !used_creators.contains(&flow.creator_id)
            })
            .map(|(idx, _)| idx)
            .collect();
        if candidates.is_empty() {
            return Vec::new();
        }

        let scores: Vec<f64> = candidates
            .iter()
            .map(|&idx| {
                let flow = &snapshot.flows[idx];
                rng.gen_range(0.0..40.0)
                    + (60.0 - flow.days_since_creation as f64) / 60.0 * 60.0
            })
            .collect();

        top_k_desc(&scores, n.min(candidates.len()))
            .into_iter()
            .map(|i| snapshot.flows[candidates[i]].id)
            .collect()
    }

    /// EXPLORE: a uniform random sample of whatever remains. No scoring.
    fn generate_explore(
        &self,
        snapshot: &CatalogSnapshot,
        excluded: &HashSet<i64>,
        used_creators: &HashSet<i64>,
        n: usize,
        rng: &mut StdRng,
    ) -> Vec<i64> {
        let candidates = filter_items(snapshot, excluded, used_creators, |_| true);
        if candidates.is_empty() {
            return Vec::new();
        }

        let amount = n.min(candidates.len());
        sample(rng, candidates.len(), amount)
            .into_iter()
            .map(|i| snapshot.items[candidates[i]].id)
            .collect()
    }

    // ========================================================================
    // Assembly
    // ========================================================================

    /// Assemble the mixed feed for a user.
    ///
    /// `excluded_input` is the caller-supplied exclusion list; the user's own
    /// interaction history is always excluded on top of it.
    pub fn assemble_feed(
        &self,
        snapshot: &CatalogSnapshot,
        user_id: i64,
        excluded_input: &HashSet<i64>,
        include_flows: bool,
        rng: &mut StdRng,
    ) -> (Vec<FeedEntry>, FeedMetrics) {
        let timer = PerformanceTimer::new("assemble_feed");

        if snapshot.items.is_empty() && snapshot.flows.is_empty() {
            let mut metrics = FeedMetrics::empty(user_id, self.bandit_metrics());
            metrics.execution_time = timer.elapsed_secs();
            return (Vec::new(), metrics);
        }

        debug!("Assembling feed for user {}", user_id);
        let prefs = PreferenceView::extract(snapshot, user_id);

        let mut excluded: HashSet<i64> = prefs.seen.clone();
        excluded.extend(excluded_input.iter().copied());

        let no_creators = HashSet::new();

        let pool_vmp =
            self.generate_vmp(snapshot, &excluded, &no_creators, &prefs, VMP_POOL_SIZE, rng);
        let pool_nu =
            self.generate_nu(snapshot, &excluded, &no_creators, &prefs, NU_POOL_SIZE, rng);

        let mut excluded_for_au = excluded.clone();
        excluded_for_au.extend(pool_vmp.iter().copied());
        excluded_for_au.extend(pool_nu.iter().copied());
        let pool_au = self.generate_au(
            snapshot,
            &excluded_for_au,
            &no_creators,
            &prefs,
            AU_POOL_SIZE,
            rng,
        );

        let pool_fw = if include_flows {
            self.generate_fw(snapshot, &excluded, &no_creators, FW_POOL_SIZE, rng)
        } else {
            Vec::new()
        };

        let mut excluded_for_explore = excluded_for_au.clone();
        excluded_for_explore.extend(pool_au.iter().copied());
        let pool_explore = self.generate_explore(
            snapshot,
            &excluded_for_explore,
            &no_creators,
            EXPLORE_POOL_SIZE,
            rng,
        );

        debug!(
            "Pools generated - VMP: {}, NU: {}, AU: {}, FW: {}, EXPLORE: {}",
            pool_vmp.len(),
            pool_nu.len(),
            pool_au.len(),
            pool_fw.len(),
            pool_explore.len()
        );

        let pool_sizes = PoolSizes {
            vmp: pool_vmp.len(),
            nu: pool_nu.len(),
            au: pool_au.len(),
            flows: pool_fw.len(),
            explore: pool_explore.len(),
        };

        let mut feed: Vec<FeedEntry> = Vec::with_capacity(FEED_SIZE);
        let mut used_items: HashSet<i64> = HashSet::new();
        let mut used_skills: HashSet<String> = HashSet::new();
        let mut window_creators: HashSet<i64> = HashSet::new();
        let mut window_queue: Vec<i64> = Vec::new();

        let mut cursor_vmp = 0usize;
        let mut cursor_au = 0usize;
        let mut cursor_nu = 0usize;
        let mut cursor_fw = 0usize;
        let mut cursor_explore = 0usize;

        // Cycle the pattern until the feed is full or a whole cycle makes no
        // progress (every pool ran dry under the diversity rules).
        'assembly: loop {
            let cycle_start = feed.len();
            for slot in SLOT_PATTERN {
                if feed.len() >= FEED_SIZE {
                    break 'assembly;
                }

                // Sliding creator window: every 12 accepted entries, the
                // oldest 12 creators become eligible again.
                if !feed.is_empty()
                    && feed.len() % CREATOR_WINDOW == 0
                    && window_queue.len() >= CREATOR_WINDOW
                {
                    for creator in window_queue.drain(..CREATOR_WINDOW) {
                        window_creators.remove(&creator);
                    }
                }

                match slot {
                    SlotKind::Fw => {
                        // Flow slots have no fallback; a miss leaves the
                        // slot empty.
                        while cursor_fw < pool_fw.len() {
                            let flow_id = pool_fw[cursor_fw];
                            cursor_fw += 1;

                            if used_items.contains(&flow_id) {
                                continue;
                            }
                            let Some(flow) = snapshot.flow(flow_id) else {
                                continue;
                            };
                            if window_creators.contains(&flow.creator_id) {
                                continue;
                            }

                            used_items.insert(flow_id);
                            window_creators.insert(flow.creator_id);
                            window_queue.push(flow.creator_id);
                            feed.push(FeedEntry {
                                position: feed.len() + 1,
                                item_id: flow_id,
                                kind: EntryKind::Challenge,
                                slot: SlotKind::Fw,
                                video_url: flow.video_url.clone(),
                                creator_name: flow.creator_name.clone(),
                                city: flow.city.clone(),
                                title: flow.name.clone(),
                                description: truncate_chars(&flow.description, 100),
                                views: 0,
                                rating: 0.0,
                                days_old: flow.days_since_creation,
                            });
                            break;
                        }
                    }
                    SlotKind::Vmp | SlotKind::Au | SlotKind::Nu => {
                        let (pool, cursor, check_blacklist) = match slot {
                            SlotKind::Vmp => (&pool_vmp, &mut cursor_vmp, false),
                            SlotKind::Au => (&pool_au, &mut cursor_au, true),
                            SlotKind::Nu => (&pool_nu, &mut cursor_nu, true),
                            SlotKind::Fw => unreachable!(),
                        };

                        let mut accepted = walk_primary_pool(
                            snapshot,
                            pool,
                            cursor,
                            &used_items,
                            &window_creators,
                            &used_skills,
                            check_blacklist,
                        );
                        if accepted.is_none() {
                            accepted = walk_explore_pool(
                                snapshot,
                                &pool_explore,
                                &mut cursor_explore,
                                &used_items,
                                &window_creators,
                            );
                        }

                        if let Some(item_id) = accepted {
                            let item = snapshot
                                .item(item_id)
                                .expect("pool ids resolve within the snapshot");

                            used_items.insert(item_id);
                            used_skills.extend(item.skills.iter().cloned());
                            window_creators.insert(item.creator_id);
                            window_queue.push(item.creator_id);
                            feed.push(FeedEntry {
                                position: feed.len() + 1,
                                item_id,
                                kind: EntryKind::Resume,
                                slot,
                                video_url: item.video_url.clone(),
                                creator_name: item.creator_name.clone(),
                                city: item.city.clone(),
                                title: String::new(),
                                description: item.description.clone(),
                                views: item.views,
                                rating: item.avg_rating,
                                days_old: item.days_since_creation,
                            });
                        }
                    }
                }
            }

            if feed.len() >= FEED_SIZE || feed.len() == cycle_start {
                break;
            }
        }

        let metrics = self.build_metrics(
            snapshot,
            user_id,
            &prefs,
            excluded_input,
            &feed,
            &pool_vmp,
            &pool_nu,
            &pool_au,
            &pool_fw,
            &pool_explore,
            pool_sizes,
            timer.elapsed_secs(),
        );

        info!(
            "Feed generated for user {}: {} entries in {:.3}s",
            user_id, metrics.total_items, metrics.execution_time
        );

        (feed, metrics)
    }

    #[allow(clippy::too_many_arguments)]
    fn build_metrics(
        &self,
        snapshot: &CatalogSnapshot,
        user_id: i64,
        prefs: &PreferenceView,
        excluded_input: &HashSet<i64>,
        feed: &[FeedEntry],
        pool_vmp: &[i64],
        pool_nu: &[i64],
        pool_au: &[i64],
        pool_fw: &[i64],
        pool_explore: &[i64],
        pool_sizes: PoolSizes,
        execution_time: f64,
    ) -> FeedMetrics {
        let total_catalog = snapshot.items.len();
        let extra_excluded = excluded_input
            .iter()
            .filter(|id| !prefs.seen.contains(id))
            .count();
        let available_catalog = total_catalog
            .saturating_sub(prefs.seen.len())
            .saturating_sub(extra_excluded);

        let all_pools: HashSet<i64> = pool_vmp
            .iter()
            .chain(pool_nu)
            .chain(pool_au)
            .chain(pool_fw)
            .chain(pool_explore)
            .copied()
            .collect();

        let mut type_distribution: HashMap<String, usize> = HashMap::new();
        let mut creators: HashSet<i64> = HashSet::new();
        let mut skills: HashSet<&str> = HashSet::new();
        let mut resume_views = 0i64;
        let mut resume_rating = 0.0f64;
        let mut resume_count = 0usize;
        let mut new_content = 0usize;

        for entry in feed {
            *type_distribution
                .entry(entry.kind.as_str().to_string())
                .or_insert(0) += 1;
            if entry.days_old <= NEW_CONTENT_DAYS {
                new_content += 1;
            }
            match entry.kind {
                EntryKind::Resume => {
                    if let Some(item) = snapshot.item(entry.item_id) {
                        creators.insert(item.creator_id);
                        skills.extend(item.skills.iter().map(String::as_str));
                    }
                    resume_views += entry.views;
                    resume_rating += entry.rating;
                    resume_count += 1;
                }
                EntryKind::Challenge => {
                    if let Some(flow) = snapshot.flow(entry.item_id) {
                        creators.insert(flow.creator_id);
                    }
                }
            }
        }

        let feed_len = feed.len();
        FeedMetrics {
            request_id: uuid::Uuid::new_v4().to_string(),
            user_id,
            total_items: feed_len,
            type_distribution,
            unique_creators: creators.len(),
            avg_views: if resume_count > 0 {
                resume_views as f64 / resume_count as f64
            } else {
                0.0
            },
            avg_rating: if resume_count > 0 {
                resume_rating / resume_count as f64
            } else {
                0.0
            },
            execution_time,
            catalog_coverage: all_pools.len() as f64 / available_catalog.max(1) as f64 * 100.0,
            feed_coverage: feed_len as f64 / FEED_SIZE as f64 * 100.0,
            new_content_ratio: if feed_len > 0 {
                new_content as f64 / feed_len as f64 * 100.0
            } else {
                0.0
            },
            skill_diversity: skills.len() as f64 / (feed_len * 2).max(1) as f64 * 100.0,
            creator_diversity: if feed_len > 0 {
                creators.len() as f64 / feed_len as f64 * 100.0
            } else {
                0.0
            },
            total_catalog,
            available_catalog,
            pool_sizes,
            bandit_stats: self.bandit_metrics(),
        }
    }

    // ========================================================================
    // Flows-only feed
    // ========================================================================

    /// Rank flows by relevance for a user, excluding already-viewed flows
    /// (read by the caller from the activity store) and caller exclusions.
    ///
    /// When the user has exhausted every flow the history filter is dropped
    /// so the rotation restarts.
    pub fn flows_only_feed(
        &self,
        snapshot: &CatalogSnapshot,
        user_id: i64,
        viewed_flows: &HashSet<i64>,
        excluded_input: &HashSet<i64>,
        n: usize,
        rng: &mut StdRng,
    ) -> (Vec<FeedEntry>, FlowsOnlyMetrics) {
        let timer = PerformanceTimer::new("flows_only_feed");

        let not_blacklisted = |idx: &usize| -> bool {
            !snapshot
                .blacklist
                .contains(&snapshot.flows[*idx].video_url)
        };

        let mut candidates: Vec<usize> = (0..snapshot.flows.len())
            .filter(|&idx| {
                let flow = &snapshot.flows[idx];
                !viewed_flows.contains(&flow.id) && !excluded_input.contains(&flow.id)
            })
            .filter(not_blacklisted)
            .collect();

        if candidates.is_empty() {
            info!("User {} exhausted all flows, restarting rotation", user_id);
            candidates = (0..snapshot.flows.len()).filter(not_blacklisted).collect();
        }

        if candidates.is_empty() {
            return (
                Vec::new(),
                FlowsOnlyMetrics {
                    total_flows: 0,
                    execution_time: timer.elapsed_secs(),
                },
            );
        }

        let prefs = PreferenceView::extract(snapshot, user_id);

        let scores: Vec<f64> = candidates
            .iter()
            .map(|&idx| {
                let flow = &snapshot.flows[idx];
                let days = flow.days_since_creation as f64;
                let mut score = ((90.0 - days) / 90.0 * 30.0).max(0.0);
                if prefs.social_neighborhood.contains(&flow.creator_id) {
                    score += 30.0;
                } else {
                    score += rng.gen_range(0.0..20.0);
                }
                score
            })
            .collect();

        let feed: Vec<FeedEntry> = top_k_desc(&scores, n.min(candidates.len()))
            .into_iter()
            .enumerate()
            .map(|(pos, i)| {
                let flow = &snapshot.flows[candidates[i]];
                FeedEntry {
                    position: pos + 1,
                    item_id: flow.id,
                    kind: EntryKind::Challenge,
                    slot: SlotKind::Fw,
                    video_url: flow.video_url.clone(),
                    creator_name: flow.creator_name.clone(),
                    city: flow.city.clone(),
                    title: flow.name.clone(),
                    description: truncate_chars(&flow.description, 100),
                    views: 0,
                    rating: 0.0,
                    days_old: flow.days_since_creation,
                }
            })
            .collect();

        let metrics = FlowsOnlyMetrics {
            total_flows: feed.len(),
            execution_time: timer.elapsed_secs(),
        };
        info!(
            "Flows-only feed for user {}: {} flows in {:.3}s",
            user_id, metrics.total_flows, metrics.execution_time
        );

        (feed, metrics)
    }
}

// ============================================================================
// Assembly helpers
// ============================================================================

/// Items passing the exclusion and creator filters plus a pool-specific
/// predicate; returns snapshot indices in catalog order.
fn filter_items(
    snapshot: &CatalogSnapshot,
    excluded: &HashSet<i64>,
    used_creators: &HashSet<i64>,
    predicate: impl Fn(usize) -> bool,
) -> Vec<usize> {
    snapshot
        .items
        .iter()
        .enumerate()
        .filter(|(idx, item)| {
            !excluded.contains(&item.id)
                && !used_creators.contains(&item.creator_id)
                && predicate(*idx)
        })
        .map(|(idx, _)| idx)
        .collect()
}

/// Walk a primary pool for an acceptable item: creator outside the current
/// window, and either a new skill for the feed or fewer than three skills
/// used so far. AU and NU pools also recheck the blacklist here.
fn walk_primary_pool(
    snapshot: &CatalogSnapshot,
    pool: &[i64],
    cursor: &mut usize,
    used_items: &HashSet<i64>,
    window_creators: &HashSet<i64>,
    used_skills: &HashSet<String>,
    check_blacklist: bool,
) -> Option<i64> {
    let mut attempts = 0;
    while *cursor < pool.len() && attempts < MAX_SLOT_ATTEMPTS {
        let item_id = pool[*cursor];
        *cursor += 1;
        attempts += 1;

        if check_blacklist && snapshot.is_blacklisted(item_id) {
            continue;
        }
        if used_items.contains(&item_id) {
            continue;
        }
        let Some(item) = snapshot.item(item_id) else {
            continue;
        };
        if window_creators.contains(&item.creator_id) {
            continue;
        }

        let introduces_new_skill = item
            .skills
            .iter()
            .any(|skill| !used_skills.contains(skill));
        if introduces_new_skill || used_skills.len() < MIN_SKILL_VARIETY {
            return Some(item_id);
        }
    }
    None
}

/// EXPLORE fallback: creator novelty only, no skill rule, no blacklist
/// recheck.
fn walk_explore_pool(
    snapshot: &CatalogSnapshot,
    pool: &[i64],
    cursor: &mut usize,
    used_items: &HashSet<i64>,
    window_creators: &HashSet<i64>,
) -> Option<i64> {
    while *cursor < pool.len() {
        let item_id = pool[*cursor];
        *cursor += 1;

        if used_items.contains(&item_id) {
            continue;
        }
        let Some(item) = snapshot.item(item_id) else {
            continue;
        };
        if window_creators.contains(&item.creator_id) {
            continue;
        }
        return Some(item_id);
    }
    None
}

/// Indices of the top `k` scores, descending, ties broken by index for
/// determinism. Partial selection first so the common case avoids a full
/// sort.
fn top_k_desc(scores: &[f64], k: usize) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..scores.len()).collect();
    let k = k.min(indices.len());
    if k == 0 {
        return Vec::new();
    }

    let cmp = |a: &usize, b: &usize| -> Ordering {
        scores[*b]
            .partial_cmp(&scores[*a])
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.cmp(b))
    };

    if k < indices.len() {
        indices.select_nth_unstable_by(k - 1, cmp);
        indices.truncate(k);
    }
    indices.sort_unstable_by(cmp);
    indices
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_top_k_desc_orders_and_truncates() {
        let scores = [1.0, 5.0, 3.0, 5.0, 2.0];
        let top = top_k_desc(&scores, 3);
        // Ties broken by index: 1 before 3
        assert_eq!(top, vec![1, 3, 2]);
    }

    #[test]
    fn test_top_k_desc_handles_small_input() {
        let scores = [0.5, 0.1];
        assert_eq!(top_k_desc(&scores, 10), vec![0, 1]);
        assert!(top_k_desc(&scores, 0).is_empty());
        assert!(top_k_desc(&[], 5).is_empty());
    }

    #[test]
    fn test_truncate_chars_respects_boundaries() {
        assert_eq!(truncate_chars("héllo wörld", 5), "héllo");
        assert_eq!(truncate_chars("ok", 100), "ok");
    }
}
