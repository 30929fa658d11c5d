//! Feed metrics and performance monitoring
//!
//! Every assembled feed carries a metrics block for quality monitoring:
//! distribution, diversity, coverage and bandit performance. The analyzer
//! utilities are used selectively during profiling and alerting.

use serde::Serialize;
use std::collections::HashMap;
use std::time::Instant;

use crate::recommendation::bandit::BanditStats;

/// Pool sizes produced for one request.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolSizes {
    pub vmp: usize,
    pub nu: usize,
    pub au: usize,
    pub flows: usize,
    pub explore: usize,
}

/// Bandit performance per category.
#[derive(Debug, Clone, Serialize)]
pub struct BanditMetrics {
    pub vmp: BanditStats,
    pub au: BanditStats,
    pub nu: BanditStats,
}

/// Metrics for a single assembled feed.
#[derive(Debug, Clone, Serialize)]
pub struct FeedMetrics {
    pub request_id: String,
    pub user_id: i64,

    pub total_items: usize,
    pub type_distribution: HashMap<String, usize>,
    pub unique_creators: usize,
    /// Over non-flow entries
    pub avg_views: f64,
    /// Over non-flow entries
    pub avg_rating: f64,
    pub execution_time: f64,

    /// Union of all pool ids over the available catalog, percent
    pub catalog_coverage: f64,
    /// Accepted items over the requested count, percent
    pub feed_coverage: f64,
    /// Share of entries at most 45 days old, percent
    pub new_content_ratio: f64,
    /// Distinct skills over 2x feed length, percent
    pub skill_diversity: f64,
    /// Distinct creators over feed length, percent
    pub creator_diversity: f64,

    pub total_catalog: usize,
    pub available_catalog: usize,
    pub pool_sizes: PoolSizes,
    pub bandit_stats: BanditMetrics,
}

impl FeedMetrics {
    pub fn empty(user_id: i64, bandit_stats: BanditMetrics) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            user_id,
            total_items: 0,
            type_distribution: HashMap::new(),
            unique_creators: 0,
            avg_views: 0.0,
            avg_rating: 0.0,
            execution_time: 0.0,
            catalog_coverage: 0.0,
            feed_coverage: 0.0,
            new_content_ratio: 0.0,
            skill_diversity: 0.0,
            creator_diversity: 0.0,
            total_catalog: 0,
            available_catalog: 0,
            pool_sizes: PoolSizes::default(),
            bandit_stats,
        }
    }
}

/// Performance timer for tracking operation duration
pub struct PerformanceTimer {
    start: Instant,
    label: String,
}

impl PerformanceTimer {
    pub fn new(label: &str) -> Self {
        Self {
            start: Instant::now(),
            label: label.to_string(),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    pub fn log_if_slow(&self, threshold_ms: u64) {
        let elapsed = self.elapsed_ms();
        if elapsed > threshold_ms {
            tracing::warn!(
                "Slow operation: {} took {}ms (threshold: {}ms)",
                self.label,
                elapsed,
                threshold_ms
            );
        }
    }
}

impl Drop for PerformanceTimer {
    fn drop(&mut self) {
        let elapsed = self.elapsed_ms();
        tracing::debug!("{} completed in {}ms", self.label, elapsed);
    }
}

/// Feed quality analyzer
pub struct QualityAnalyzer;

impl QualityAnalyzer {
    /// Detect potential issues with an assembled feed
    pub fn detect_issues(metrics: &FeedMetrics) -> Vec<String> {
        let mut issues = Vec::new();

        if metrics.total_items > 0 && metrics.creator_diversity < 50.0 {
            issues.push(format!(
                "Low creator diversity: {:.1}%",
                metrics.creator_diversity
            ));
        }

        if metrics.execution_time > 0.2 {
            issues.push(format!("Slow response: {:.3}s", metrics.execution_time));
        }

        if metrics.total_items > 0 && metrics.feed_coverage < 100.0 {
            issues.push(format!("Short feed: {:.1}% coverage", metrics.feed_coverage));
        }

        let thin_pools = metrics.pool_sizes.vmp + metrics.pool_sizes.au + metrics.pool_sizes.nu;
        if metrics.total_items > 0 && thin_pools < metrics.total_items * 2 {
            issues.push("Too few candidates for quality filtering".to_string());
        }

        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats() -> BanditMetrics {
        let zero = BanditStats {
            mean_reward: 0.0,
            recent_mean_reward: 0.0,
            selections: 0,
        };
        BanditMetrics {
            vmp: zero.clone(),
            au: zero.clone(),
            nu: zero,
        }
    }

    #[test]
    fn test_empty_metrics_are_zeroed() {
        let metrics = FeedMetrics::empty(7, stats());
        assert_eq!(metrics.total_items, 0);
        assert_eq!(metrics.feed_coverage, 0.0);
        assert!(metrics.type_distribution.is_empty());
    }

    #[test]
    fn test_detect_issues() {
        let mut metrics = FeedMetrics::empty(7, stats());
        metrics.total_items = 24;
        metrics.creator_diversity = 30.0;
        metrics.execution_time = 0.5;
        metrics.feed_coverage = 75.0;
        metrics.pool_sizes = PoolSizes {
            vmp: 10,
            nu: 5,
            au: 5,
            flows: 0,
            explore: 0,
        };

        let issues = QualityAnalyzer::detect_issues(&metrics);
        assert!(issues.iter().any(|i| i.contains("Low creator diversity")));
        assert!(issues.iter().any(|i| i.contains("Slow response")));
        assert!(issues.iter().any(|i| i.contains("Short feed")));
        assert!(issues.iter().any(|i| i.contains("Too few candidates")));
    }

    #[test]
    fn test_healthy_feed_has_no_issues() {
        let mut metrics = FeedMetrics::empty(7, stats());
        metrics.total_items = 24;
        metrics.creator_diversity = 100.0;
        metrics.execution_time = 0.05;
        metrics.feed_coverage = 100.0;
        metrics.pool_sizes = PoolSizes {
            vmp: 110,
            nu: 95,
            au: 170,
            flows: 40,
            explore: 75,
        };

        assert!(QualityAnalyzer::detect_issues(&metrics).is_empty());
    }
}
