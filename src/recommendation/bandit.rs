//! Contextual bandit with adaptive exploration
//!
//! A LinUCB learner over the 18-dimensional candidate context. One instance
//! runs per scoring category (VMP, AU, NU), each learning independently from
//! observed rewards. Exploration adapts to the variance of recent rewards:
//! a flat bonus while the bandit is cold, then variance-scaled jitter.
//!
//! The ridge matrices are small (18x18) dense `nalgebra` types; the inverse
//! is recomputed after every update with a small regularizer, so a singular
//! matrix is not expected. If the inversion fails anyway the previous
//! inverse is kept and the degradation is logged at warn.

use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::Rng;
use serde::Serialize;
use tracing::warn;

/// Context vector width shared by every generator.
pub const CONTEXT_DIM: usize = 18;

const RIDGE_LAMBDA: f64 = 1e-3;
const HISTORY_MAX: usize = 1000;
const HISTORY_TRIM: usize = 500;
const COLD_START_REWARDS: usize = 10;
const COLD_START_BONUS: f64 = 0.7;
const REWARD_WINDOW: usize = 50;
const VARIANCE_SCALE: f64 = 1.3;

/// Performance counters for a single bandit.
#[derive(Debug, Clone, Serialize)]
pub struct BanditStats {
    pub mean_reward: f64,
    pub recent_mean_reward: f64,
    pub selections: usize,
}

/// Linear UCB learner with ridge regression state.
pub struct LinUcb {
    alpha: f64,
    beta: f64,
    dim: usize,
    a: DMatrix<f64>,
    b: DVector<f64>,
    theta: DVector<f64>,
    a_inv: DMatrix<f64>,
    rewards: Vec<f64>,
    contexts: Vec<DVector<f64>>,
}

impl LinUcb {
    pub fn new(dim: usize, alpha: f64, beta: f64) -> Self {
        Self {
            alpha,
            beta,
            dim,
            a: DMatrix::identity(dim, dim),
            b: DVector::zeros(dim),
            theta: DVector::zeros(dim),
            a_inv: DMatrix::identity(dim, dim),
            rewards: Vec::new(),
            contexts: Vec::new(),
        }
    }

    /// Score a batch of contexts (rows of `contexts`):
    /// expected reward + UCB uncertainty + adaptive exploration bonus.
    pub fn score_batch(&self, contexts: &DMatrix<f64>, rng: &mut StdRng) -> Vec<f64> {
        let n = contexts.nrows();
        if n == 0 {
            return Vec::new();
        }
        debug_assert_eq!(contexts.ncols(), self.dim);

        let expected = contexts * &self.theta;
        let xa = contexts * &self.a_inv;

        let bonus = self.adaptive_bonus(n, rng);

        (0..n)
            .map(|i| {
                let variance = xa.row(i).dot(&contexts.row(i)).max(0.0);
                expected[i] + self.alpha * variance.sqrt() + bonus[i]
            })
            .collect()
    }

    fn adaptive_bonus(&self, n: usize, rng: &mut StdRng) -> Vec<f64> {
        if self.rewards.len() < COLD_START_REWARDS {
            return vec![COLD_START_BONUS; n];
        }

        let window_start = self.rewards.len().saturating_sub(REWARD_WINDOW);
        let window = &self.rewards[window_start..];
        let mean = window.iter().sum::<f64>() / window.len() as f64;
        let variance =
            window.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / window.len() as f64;

        let factor = self.beta * variance * VARIANCE_SCALE;
        (0..n).map(|_| factor * rng.gen::<f64>()).collect()
    }

    /// Fold one observed (context, reward) pair into the ridge state.
    pub fn update(&mut self, context: &[f64], reward: f64) {
        debug_assert_eq!(context.len(), self.dim);
        let x = DVector::from_column_slice(context);

        self.a += &x * x.transpose();
        self.b += reward * &x;

        let ridge = &self.a + DMatrix::identity(self.dim, self.dim) * RIDGE_LAMBDA;
        match ridge.try_inverse() {
            Some(inverse) => self.a_inv = inverse,
            None => {
                // Should be unreachable with the regularizer in place; keep
                // the previous inverse rather than poisoning the state.
                warn!("Bandit ridge matrix not invertible, keeping previous inverse");
            }
        }
        self.theta = &self.a_inv * &self.b;

        self.rewards.push(reward);
        self.contexts.push(x);

        if self.rewards.len() > HISTORY_MAX {
            let keep_from = self.rewards.len() - HISTORY_TRIM;
            self.rewards.drain(..keep_from);
            self.contexts.drain(..keep_from);
        }
    }

    /// Expected reward X·θ for a single context (no exploration terms).
    pub fn predicted_reward(&self, context: &[f64]) -> f64 {
        context
            .iter()
            .zip(self.theta.iter())
            .map(|(x, t)| x * t)
            .sum()
    }

    pub fn stats(&self) -> BanditStats {
        if self.rewards.is_empty() {
            return BanditStats {
                mean_reward: 0.0,
                recent_mean_reward: 0.0,
                selections: 0,
            };
        }

        let mean = self.rewards.iter().sum::<f64>() / self.rewards.len() as f64;
        let window_start = self.rewards.len().saturating_sub(REWARD_WINDOW);
        let window = &self.rewards[window_start..];
        let recent = window.iter().sum::<f64>() / window.len() as f64;

        BanditStats {
            mean_reward: mean,
            recent_mean_reward: recent,
            selections: self.rewards.len(),
        }
    }

    pub fn history_len(&self) -> usize {
        self.rewards.len()
    }
}
