//! End-to-end feed assembly scenarios over fixture-built snapshots.
//!
//! Each test injects a miniature catalog directly through
//! `CatalogSnapshot::build` and drives the engine with a seeded generator,
//! so every assertion is deterministic.

use chrono::{Duration, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{HashMap, HashSet};

use pitchfeed::catalog::{
    Blacklist, CatalogSnapshot, Connection, Creator, Flow, Interaction, InteractionKind, Item,
};
use pitchfeed::config::EngineConfig;
use pitchfeed::recommendation::engine::{EntryKind, FeedEngine, SlotKind};
use pitchfeed::recommendation::{FEED_SIZE, SLOT_PATTERN};

// ============================================================================
// Fixtures
// ============================================================================

fn fixture_item(id: i64, creator_id: i64, days_ago: i64) -> Item {
    Item {
        id,
        creator_id,
        video_url: format!("https://cdn.example.com/resume-{}.mp4", id),
        creator_name: format!("Creator {}", creator_id),
        description: format!("Resume {}", id),
        city: "Bogotá".to_string(),
        created_at: Utc::now() - Duration::days(days_ago),
        days_since_creation: days_ago,
        views: 30,
        avg_rating: 4.0,
        rating_count: 3,
        has_rating: true,
        match_count: 2,
        like_count: 1,
        exhibited_count: 1,
        skills: vec![format!("skill-{}", id), format!("skill-shared-{}", id % 7)],
        knowledges: vec![format!("knowledge-{}", id % 5)],
        tools: vec![format!("tool-{}", id % 4)],
        languages: vec!["es".to_string()],
    }
}

fn fixture_flow(id: i64, creator_id: i64, days_ago: i64) -> Flow {
    Flow {
        id,
        creator_id,
        video_url: format!("https://cdn.example.com/flow-{}.mp4", id),
        name: format!("Flow {}", id),
        slug: format!("flow-{}", id),
        description: "A campaign".to_string(),
        image: format!("https://cdn.example.com/flow-{}.jpg", id),
        city: "CDMX".to_string(),
        created_at: Utc::now() - Duration::days(days_ago),
        days_since_creation: days_ago,
        creator_name: format!("Creator {}", creator_id),
        creator_slug: format!("creator-{}", creator_id),
        talent_type: "innovators".to_string(),
        interest_areas: vec![],
        type_objectives: vec!["hire".to_string()],
        status_at: None,
    }
}

fn rating(user_id: i64, item_id: i64) -> Interaction {
    Interaction {
        user_id: Some(user_id),
        item_id,
        rating: 4.0,
        kind: InteractionKind::Rating,
        created_at: None,
    }
}

struct FixtureBuilder {
    items: Vec<Item>,
    flows: Vec<Flow>,
    interactions: Vec<Interaction>,
    connections: Vec<Connection>,
    blacklist: Blacklist,
}

impl FixtureBuilder {
    fn new() -> Self {
        Self {
            items: Vec::new(),
            flows: Vec::new(),
            interactions: Vec::new(),
            connections: Vec::new(),
            blacklist: Blacklist::default(),
        }
    }

    /// `count` items across `count` distinct creators, all recent enough for
    /// the NU pool.
    fn with_items(mut self, count: i64) -> Self {
        for id in 1..=count {
            self.items.push(fixture_item(id, 1000 + id, (id % 40) + 1));
        }
        self
    }

    fn with_flows(mut self, count: i64) -> Self {
        for id in 1..=count {
            self.flows.push(fixture_flow(5000 + id, 9000 + id, (id % 30) + 1));
        }
        self
    }

    fn build(self) -> CatalogSnapshot {
        let creators = self
            .items
            .iter()
            .map(|item| (item.creator_id, item.creator_name.clone()))
            .chain(
                self.flows
                    .iter()
                    .map(|flow| (flow.creator_id, flow.creator_name.clone())),
            )
            .collect::<HashMap<i64, String>>()
            .into_iter()
            .map(|(id, name)| Creator {
                id,
                name,
                city: "Bogotá".to_string(),
                country: "Colombia".to_string(),
                created_at: None,
            })
            .collect();

        CatalogSnapshot::build(
            creators,
            self.items,
            self.interactions,
            self.connections,
            self.flows,
            self.blacklist,
            Utc::now(),
        )
    }
}

fn engine() -> FeedEngine {
    FeedEngine::new(&EngineConfig::default())
}

fn seeded(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

// ============================================================================
// Scenarios
// ============================================================================

/// A cold user over a modest catalog still gets a full feed of resumes.
#[test]
fn cold_user_gets_full_resume_feed() {
    let snapshot = FixtureBuilder::new().with_items(30).build();
    let engine = engine();
    let mut rng = seeded(1);

    let (feed, metrics) =
        engine.assemble_feed(&snapshot, 1, &HashSet::new(), false, &mut rng);

    assert_eq!(feed.len(), FEED_SIZE);
    assert!(feed.iter().all(|entry| entry.kind == EntryKind::Resume));
    assert_eq!(metrics.total_items, FEED_SIZE);
    assert_eq!(metrics.type_distribution.get("resume"), Some(&FEED_SIZE));

    // Positions are monotonically assigned from 1
    for (idx, entry) in feed.iter().enumerate() {
        assert_eq!(entry.position, idx + 1);
    }
}

/// Caller-supplied exclusions never come back, and no item repeats.
#[test]
fn exclusions_are_honored_without_repeats() {
    let snapshot = FixtureBuilder::new().with_items(100).build();
    let engine = engine();
    let mut rng = seeded(2);

    let excluded: HashSet<i64> = HashSet::from([5, 7, 9]);
    let (feed, _) = engine.assemble_feed(&snapshot, 2, &excluded, false, &mut rng);

    assert_eq!(feed.len(), FEED_SIZE);

    let ids: Vec<i64> = feed.iter().map(|entry| entry.item_id).collect();
    let unique: HashSet<i64> = ids.iter().copied().collect();
    assert_eq!(ids.len(), unique.len(), "no repeats within a request");
    for id in [5, 7, 9] {
        assert!(!unique.contains(&id), "excluded id {} leaked into the feed", id);
    }
}

/// The user's own interaction history is excluded on top of the caller list.
#[test]
fn interaction_history_is_excluded() {
    let mut builder = FixtureBuilder::new().with_items(100);
    builder.interactions = vec![rating(2, 1), rating(2, 2), rating(2, 3)];
    let snapshot = builder.build();
    let engine = engine();
    let mut rng = seeded(3);

    let (feed, _) = engine.assemble_feed(&snapshot, 2, &HashSet::new(), false, &mut rng);

    let ids: HashSet<i64> = feed.iter().map(|entry| entry.item_id).collect();
    for seen in [1, 2, 3] {
        assert!(!ids.contains(&seen), "seen item {} resurfaced", seen);
    }
}

/// No creator repeats within any sliding 12-position window.
#[test]
fn creator_window_diversity_holds() {
    let snapshot = FixtureBuilder::new().with_items(120).with_flows(8).build();
    let engine = engine();
    let mut rng = seeded(4);

    let (feed, _) = engine.assemble_feed(&snapshot, 4, &HashSet::new(), true, &mut rng);
    assert_eq!(feed.len(), FEED_SIZE);

    let creators: Vec<i64> = feed
        .iter()
        .map(|entry| match entry.kind {
            EntryKind::Resume => snapshot.item(entry.item_id).unwrap().creator_id,
            EntryKind::Challenge => snapshot.flow(entry.item_id).unwrap().creator_id,
        })
        .collect();

    for window in creators.windows(12) {
        let distinct: HashSet<i64> = window.iter().copied().collect();
        assert_eq!(
            distinct.len(),
            window.len(),
            "creator repeated within a 12-item window: {:?}",
            window
        );
    }
}

/// With every pool well stocked, the first 24 slots follow the template
/// exactly.
#[test]
fn slot_pattern_is_respected_when_pools_are_full() {
    let snapshot = FixtureBuilder::new().with_items(400).with_flows(12).build();
    let engine = engine();
    let mut rng = seeded(5);

    let (feed, _) = engine.assemble_feed(&snapshot, 5, &HashSet::new(), true, &mut rng);
    assert_eq!(feed.len(), FEED_SIZE);

    for (idx, entry) in feed.iter().enumerate() {
        let expected = SLOT_PATTERN[idx % SLOT_PATTERN.len()];
        assert_eq!(
            entry.slot, expected,
            "slot {} carried {:?}, expected {:?}",
            idx, entry.slot, expected
        );
    }

    // FW slots carry challenges, everything else resumes
    for entry in &feed {
        match entry.slot {
            SlotKind::Fw => assert_eq!(entry.kind, EntryKind::Challenge),
            _ => assert_eq!(entry.kind, EntryKind::Resume),
        }
    }
}

/// A blacklisted item that only the AU pool would surface never reaches the
/// feed.
#[test]
fn blacklisted_item_never_appears() {
    let mut builder = FixtureBuilder::new().with_items(60);

    // Item 42: too old for NU, fails the quality gate for VMP, so only AU
    // (or nothing) can surface it. Its URL goes on the blacklist.
    let target = builder
        .items
        .iter_mut()
        .find(|item| item.id == 42)
        .unwrap();
    target.days_since_creation = 200;
    target.created_at = Utc::now() - Duration::days(200);
    target.views = 0;
    target.avg_rating = 0.0;
    target.rating_count = 0;
    target.match_count = 0;
    let blocked_url = target.video_url.clone();
    builder.blacklist = Blacklist::from_urls([blocked_url]);

    let snapshot = builder.build();
    let engine = engine();

    for seed in 0..5 {
        let mut rng = seeded(seed);
        let (feed, _) = engine.assemble_feed(&snapshot, 3, &HashSet::new(), false, &mut rng);
        assert!(
            feed.iter().all(|entry| entry.item_id != 42),
            "blacklisted item surfaced with seed {}",
            seed
        );
    }
}

/// Identical inputs and seed produce byte-identical feeds.
#[test]
fn assembly_is_deterministic_under_a_fixed_seed() {
    let run = || {
        let snapshot = FixtureBuilder::new().with_items(150).with_flows(10).build();
        let engine = engine();
        let mut rng = seeded(99);
        let (feed, _) = engine.assemble_feed(&snapshot, 6, &HashSet::from([4, 8]), true, &mut rng);
        serde_json::to_string(&feed).unwrap()
    };

    // Snapshots are rebuilt per run, so timestamps shift slightly; only the
    // day-resolution fields feed the engine, keeping output identical.
    assert_eq!(run(), run());
}

/// An empty catalog yields an empty feed with zeroed metrics, not an error.
#[test]
fn empty_catalog_yields_empty_feed() {
    let snapshot = FixtureBuilder::new().build();
    let engine = engine();
    let mut rng = seeded(7);

    let (feed, metrics) = engine.assemble_feed(&snapshot, 1, &HashSet::new(), true, &mut rng);
    assert!(feed.is_empty());
    assert_eq!(metrics.total_items, 0);
    assert_eq!(metrics.feed_coverage, 0.0);
    assert_eq!(metrics.total_catalog, 0);
}

/// Feed metrics reflect the assembled entries.
#[test]
fn metrics_reflect_the_feed() {
    let snapshot = FixtureBuilder::new().with_items(300).with_flows(10).build();
    let engine = engine();
    let mut rng = seeded(8);

    let (feed, metrics) = engine.assemble_feed(&snapshot, 9, &HashSet::new(), true, &mut rng);

    assert_eq!(metrics.total_items, feed.len());
    assert_eq!(metrics.feed_coverage, 100.0);
    assert_eq!(metrics.total_catalog, 300);
    assert!(metrics.unique_creators > 0);
    assert!(metrics.pool_sizes.vmp > 0);
    assert!(metrics.pool_sizes.flows > 0);
    assert!(metrics.avg_views > 0.0);
    // Every fixture item is at most 41 days old
    assert_eq!(metrics.new_content_ratio, 100.0);
}

// ============================================================================
// Flows-only path
// ============================================================================

/// Viewed and excluded flows are filtered; the rest come back ranked.
#[test]
fn flows_only_excludes_history_and_exclusions() {
    let snapshot = FixtureBuilder::new().with_flows(30).build();
    let engine = engine();
    let mut rng = seeded(10);

    let viewed: HashSet<i64> = HashSet::from([5001, 5002]);
    let excluded: HashSet<i64> = HashSet::from([5003]);

    let (feed, metrics) =
        engine.flows_only_feed(&snapshot, 3, &viewed, &excluded, FEED_SIZE, &mut rng);

    assert_eq!(feed.len(), FEED_SIZE.min(27));
    assert_eq!(metrics.total_flows, feed.len());
    for blocked in [5001, 5002, 5003] {
        assert!(
            feed.iter().all(|entry| entry.item_id != blocked),
            "flow {} should have been excluded",
            blocked
        );
    }
    assert!(feed.iter().all(|entry| entry.kind == EntryKind::Challenge));
}

/// Once every flow is seen, the rotation restarts instead of going empty.
#[test]
fn flows_only_restarts_when_exhausted() {
    let snapshot = FixtureBuilder::new().with_flows(5).build();
    let engine = engine();
    let mut rng = seeded(11);

    let viewed: HashSet<i64> = (5001..=5005).collect();
    let (feed, _) =
        engine.flows_only_feed(&snapshot, 3, &viewed, &HashSet::new(), FEED_SIZE, &mut rng);

    assert_eq!(feed.len(), 5);
}

/// Flow creators inside the caller's social neighborhood outrank strangers.
#[test]
fn flows_only_prefers_social_neighborhood() {
    let mut builder = FixtureBuilder::new().with_items(1).with_flows(40);
    // User 3 interacted once (so a preference view exists) and is connected
    // to the creator of flow 5040, the oldest flow in the fixture.
    builder.interactions = vec![rating(3, 1)];
    builder.connections = vec![Connection {
        from_user_id: 3,
        to_user_id: 9040,
    }];
    let snapshot = builder.build();
    let engine = engine();

    // Recency gives at most 30 points and strangers at most 20 random ones,
    // so the +30 connection bonus keeps the connected flow in the feed
    // across seeds.
    for seed in 0..5 {
        let mut rng = seeded(seed);
        let (feed, _) = engine.flows_only_feed(
            &snapshot,
            3,
            &HashSet::new(),
            &HashSet::new(),
            FEED_SIZE,
            &mut rng,
        );
        assert!(
            feed.iter().any(|entry| entry.item_id == 5040),
            "connected creator's flow missing with seed {}",
            seed
        );
    }
}

// ============================================================================
// Additional invariants
// ============================================================================

/// With fewer creators than feed positions, creators may return only after
/// the 12-item window slides past them.
#[test]
fn creators_reused_only_after_window_slides() {
    let mut builder = FixtureBuilder::new();
    for id in 1..=120 {
        builder
            .items
            .push(fixture_item(id, 1000 + (id % 18), (id % 40) + 1));
    }
    let snapshot = builder.build();
    let engine = engine();
    let mut rng = seeded(13);

    let (feed, _) = engine.assemble_feed(&snapshot, 8, &HashSet::new(), false, &mut rng);
    assert_eq!(feed.len(), FEED_SIZE);

    let creators: Vec<i64> = feed
        .iter()
        .map(|entry| snapshot.item(entry.item_id).unwrap().creator_id)
        .collect();
    for window in creators.windows(12) {
        let distinct: HashSet<i64> = window.iter().copied().collect();
        assert_eq!(distinct.len(), window.len());
    }
}

/// Building a snapshot twice from the same rows yields identical item counts
/// and quality-gate flags.
#[test]
fn rebuild_from_same_rows_is_idempotent() {
    let build = || FixtureBuilder::new().with_items(80).with_flows(6).build();

    let first = build();
    let second = build();

    assert_eq!(first.items.len(), second.items.len());
    assert_eq!(first.flows.len(), second.flows.len());
    for idx in 0..first.items.len() {
        assert_eq!(
            first.features.get(idx).quality_gate,
            second.features.get(idx).quality_gate,
            "quality gate flipped for item index {}",
            idx
        );
    }
}

/// The reward channel feeds the per-category bandit and shows up in its
/// stats.
#[test]
fn recorded_rewards_reach_the_bandit() {
    let engine = engine();

    let mut context = vec![0.0; 18];
    context[0] = 1.0;
    for _ in 0..5 {
        engine.record_reward(SlotKind::Vmp, &context, 1.0);
    }
    // FW carries no bandit; this must be a no-op
    engine.record_reward(SlotKind::Fw, &context, 1.0);

    let stats = engine.bandit_metrics();
    assert_eq!(stats.vmp.selections, 5);
    assert!((stats.vmp.mean_reward - 1.0).abs() < 1e-9);
    assert_eq!(stats.au.selections, 0);
    assert_eq!(stats.nu.selections, 0);
}
