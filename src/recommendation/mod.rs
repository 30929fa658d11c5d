//! Recommendation Module
//!
//! Generates the interleaved talent feed for TalentPitch users.
//!
//! ## Architecture
//!
//! 1. **Embedding** - Skill co-occurrence matrix and per-item skill vectors
//! 2. **Social** - User adjacency graph with log-scaled influence scores
//! 3. **Features** - Precomputed per-item scores plus the 18-dim bandit context
//! 4. **Preferences** - Per-request summary of the caller's interaction history
//! 5. **Bandit** - LinUCB contextual bandits, one per scoring category
//! 6. **Engine** - Candidate pools, slot-pattern assembly and diversity rules
//!
//! ## Feed shape
//!
//! The mixed feed interleaves resumes and flows over the fixed 6-slot
//! template VMP-AU-AU-VMP-NU-FW, repeated until 24 positions are filled:
//!
//! - **VMP**: high-quality popular items behind a quality gate
//! - **AU**: content similarity and social affinity to the caller
//! - **NU**: recent content (<= 45 days) with diversity and rarity boosts
//! - **FW**: creator-posted flows, recency-ranked
//! - **EXPLORE**: uniform random fallback when a primary pool runs dry
//!
//! No creator repeats within any sliding 12-item window, and each accepted
//! item must widen the feed's skill variety until three distinct skills are
//! present.

pub mod bandit;
pub mod embedding;
pub mod engine;
pub mod features;
pub mod metrics;
pub mod preferences;
pub mod social;

// Re-export the types that are actually used externally
pub use bandit::{BanditStats, LinUcb};
pub use engine::{EntryKind, FeedEngine, FeedEntry, SlotKind, FEED_SIZE, SLOT_PATTERN};
pub use metrics::FeedMetrics;
pub use preferences::PreferenceView;
